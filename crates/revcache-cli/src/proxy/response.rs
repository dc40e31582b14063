//! Response assembly from engine results.

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_TYPE, LAST_MODIFIED};
use hyper::{Response, StatusCode};
use revcache_core::{CacheEntry, CacheError, Disposition, Resolved, Route};

/// Cache-Control for resources that must not be cached downstream.
pub const NO_STORE: &str = "no-cache, no-store, must-revalidate";

/// Cache-Control when the origin gave none.
pub const LONG_LIVED: &str = "public, max-age=31536000";

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

/// Content type guessed from the key's extension.
pub fn content_type(key: &str) -> &'static str {
    let ext = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "json" => "application/json",
        "js" => "application/javascript",
        "css" => "text/css",
        "html" | "htm" => "text/html; charset=utf-8",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "m4a" => "audio/mp4",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        _ => "application/octet-stream",
    }
}

/// Cache-Control sent to the client.
pub fn cache_control(invalidated: bool, entry: Option<&CacheEntry>) -> &str {
    if invalidated {
        return NO_STORE;
    }
    entry
        .and_then(|e| e.cache_control.as_deref())
        .unwrap_or(LONG_LIVED)
}

/// `X-Cache` value describing how the request was satisfied.
pub fn x_cache(route: Route, disposition: Disposition) -> &'static str {
    match (route, disposition) {
        (Route::Hit, _) => "HIT",
        (_, Disposition::StaleFallback) => "STALE",
        (Route::Revalidate, Disposition::Served) => "REVALIDATED",
        (Route::Fetch, Disposition::Served) => "MISS",
        (_, Disposition::NotModifiedPassthrough | Disposition::ErrorPassthrough) => "PASS",
        (_, Disposition::GatewayFailure) => "ERROR",
    }
}

/// Build the client response for a resolved request.
pub fn assemble(resolved: Resolved, invalidated: bool) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(resolved.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::new(Full::new(resolved.contents.unwrap_or_default()));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    headers.insert(
        X_CACHE,
        HeaderValue::from_static(x_cache(resolved.route, resolved.disposition)),
    );

    if !status.is_success() {
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(NO_STORE));
        return response;
    }

    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type(resolved.key.as_str())),
    );

    let entry = resolved.entry.as_ref();
    let control = cache_control(invalidated, entry);
    // Origin-supplied values that are not valid header text are dropped.
    if let Ok(value) = HeaderValue::from_str(control) {
        headers.insert(CACHE_CONTROL, value);
    }
    if let Some(value) = entry
        .and_then(|e| e.last_modified.as_deref())
        .and_then(|lm| HeaderValue::from_str(lm).ok())
    {
        headers.insert(LAST_MODIFIED, value);
    }

    response
}

/// Response for an engine error: upstream statuses keep their body.
pub fn from_error(err: &CacheError) -> Response<Full<Bytes>> {
    match err {
        CacheError::Upstream { status, body } => {
            let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = Response::new(Full::new(body.clone()));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(X_CACHE, HeaderValue::from_static("ERROR"));
            response
                .headers_mut()
                .insert(CACHE_CONTROL, HeaderValue::from_static(NO_STORE));
            response
        }
        _ => plain(
            StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            &err.to_string(),
        ),
    }
}

/// Short text response generated by the proxy itself.
pub fn plain(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(format!("{}\n", message))));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}
