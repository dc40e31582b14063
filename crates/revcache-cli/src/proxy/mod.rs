//! HTTP listener in front of the cache engine.
//!
//! hyper http1 with TokioIo, one task per connection. Only GET and HEAD are
//! proxied; hyper drops the body of HEAD responses itself.

pub mod response;
pub mod target;

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderMap, ACCEPT, ACCEPT_LANGUAGE, ORIGIN, REFERER, USER_AGENT};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use revcache_core::{CacheEngine, LookupOptions, ResourceRequest};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Shared listener state
pub struct ProxyState {
    pub engine: Arc<CacheEngine>,
    /// Base URL origin-form requests are resolved against.
    pub origin: Option<String>,
    pub local_addr: SocketAddr,
}

impl ProxyState {
    pub fn new(engine: Arc<CacheEngine>, origin: Option<String>, local_addr: SocketAddr) -> Self {
        Self {
            engine,
            origin,
            local_addr,
        }
    }
}

/// Accept connections until `shutdown` resolves.
///
/// Connections already accepted keep running on their own tasks.
pub async fn serve<F>(listener: TcpListener, state: Arc<ProxyState>, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()>,
{
    info!(addr = %listener.local_addr()?, "proxy listening");
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => {
                info!("shutdown requested, no longer accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };

                let io = TokioIo::new(stream);
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle(req, state).await }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(peer = %peer, error = %e, "connection closed with error");
                    }
                });
            }
        }
    }
}

/// Serve one request.
pub async fn handle<B>(req: Request<B>, state: Arc<ProxyState>) -> Result<Response<Full<Bytes>>, Infallible> {
    if !matches!(*req.method(), Method::GET | Method::HEAD) {
        return Ok(response::plain(
            StatusCode::METHOD_NOT_ALLOWED,
            "only GET and HEAD are supported",
        ));
    }

    let target = match target::resolve(&req, state.origin.as_deref(), state.local_addr) {
        Ok(target) => target,
        Err(reason) => return Ok(response::plain(StatusCode::BAD_REQUEST, reason)),
    };

    let resource = match ResourceRequest::parse(&target) {
        Ok(resource) => resource,
        Err(e) => return Ok(response::from_error(&e)),
    };

    let engine = &state.engine;
    // A blob whose size disagrees with the index is refetched unconditionally.
    let force_refresh = engine.length_mismatch(&resource.key).await;
    let opts = LookupOptions::default()
        .with_force_refresh(force_refresh)
        .with_headers(forwarded_headers(req.headers()));

    let response = match engine.resolve(&resource, &opts).await {
        Ok(resolved) => {
            let invalidated = engine.policy().is_invalidated(&resolved.key);
            debug!(
                key = %resolved.key,
                status = resolved.status,
                route = ?resolved.route,
                disposition = ?resolved.disposition,
                "resolved"
            );
            response::assemble(resolved, invalidated)
        }
        Err(e) => {
            warn!(url = %target, error = %e, "request failed");
            response::from_error(&e)
        }
    };

    Ok(response)
}

/// Client headers passed on to the origin. Anything that could change the
/// stored representation (encodings, ranges, cookies) stays behind.
fn forwarded_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for name in [USER_AGENT, REFERER, ACCEPT, ACCEPT_LANGUAGE, ORIGIN] {
        for value in headers.get_all(&name) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}
