use axum::{
    body::Body,
    http::{Request, Uri},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use tracing::Span;

pub async fn enrich_current_span_middleware(req: Request<Body>, next: Next) -> Response {
    let uri: &Uri = req.uri();

    let host = req
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("UNKNOWN");

    let current_span = Span::current();

    current_span.record("http.uri", uri.path());
    current_span.record("http.host", host);
    if let Some(query) = uri.query() {
        current_span.record("http.query", query);
    }

    next.run(req).await
}

/// Redirect `/api/flows/x/` to `/api/flows/x`, keeping the query string.
pub async fn strip_trailing_slash(req: Request<Body>, next: Next) -> Response {
    match without_trailing_slash(req.uri()) {
        Some(target) => Redirect::permanent(&target).into_response(),
        None => next.run(req).await,
    }
}

fn without_trailing_slash(uri: &Uri) -> Option<String> {
    let path = uri.path().strip_suffix('/').filter(|p| !p.is_empty())?;
    Some(match uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_string(),
    })
}
