//! Origin URL resolution for incoming requests.

use std::net::SocketAddr;

use hyper::header::HOST;
use hyper::Request;

/// Work out the origin URL a request is asking for.
///
/// Absolute-form targets (`GET http://host/path HTTP/1.1`, as sent to a
/// forward proxy) are used as they are. Origin-form targets are joined onto the
/// configured origin, or onto the `Host` header when no origin is configured.
pub fn resolve<B>(
    req: &Request<B>,
    origin: Option<&str>,
    local_addr: SocketAddr,
) -> Result<String, &'static str> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.to_string());
    }

    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());

    if let Some(origin) = origin {
        return Ok(format!("{}{}", origin.trim_end_matches('/'), path_and_query));
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or("missing Host header")?;

    if points_at(host, local_addr) {
        return Err("no origin configured for direct requests");
    }

    Ok(format!("http://{}{}", host, path_and_query))
}

/// Whether `host` names this listener, which would make us proxy to ourselves.
fn points_at(host: &str, local_addr: SocketAddr) -> bool {
    let port = local_addr.port();
    host == local_addr.to_string()
        || host == format!("localhost:{}", port)
        || (local_addr.ip().is_unspecified() && host.ends_with(&format!(":{}", port)))
}
