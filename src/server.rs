//! HTTP adapter: routes `GET /processed/...` to the [`Processor`].
//!
//! Generation is blocking work (decode, resize, encode, lock polling), so
//! each request runs the processor on tokio's blocking pool. Outcomes map to
//! statuses as follows:
//!
//! | Outcome | Status |
//! |---|---|
//! | Served artifact | 200 with the artifact's `Content-Type` |
//! | Malformed path, missing or unreadable original | 404 |
//! | Produce lock still held after the retry budget | 503 + `Retry-After` |
//! | Recursive generation of the same variant | 508 |
//! | Anything else | 500 |

use crate::imaging::ImageBackend;
use crate::processor::{ProcessError, Processor};
use crate::request::SkipFormats;
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::get,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Body of a 503.
pub const BUSY_MESSAGE: &str = "Image is currently being processed";

/// Build the router for a processor.
pub fn router<B>(processor: Arc<Processor<B>>) -> Router
where
    B: ImageBackend + Send + 'static,
{
    Router::new()
        .route("/health", get(health))
        .route("/processed/{*path}", get(processed::<B>))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(processor)
}

/// Bind `addr` and serve until Ctrl-C.
pub async fn serve<B>(processor: Arc<Processor<B>>, addr: SocketAddr) -> std::io::Result<()>
where
    B: ImageBackend + Send + 'static,
{
    let app = router(processor);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("variant-forge listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Could not install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

async fn health() -> &'static str {
    "ok"
}

async fn not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

async fn processed<B>(State(processor): State<Arc<Processor<B>>>, uri: Uri) -> Response
where
    B: ImageBackend + Send + 'static,
{
    let skip = SkipFormats::from_query(uri.query());
    let path = match urlencoding::decode(uri.path()) {
        Ok(path) => path.into_owned(),
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };

    let outcome =
        tokio::task::spawn_blocking(move || processor.handle_path(&path, skip)).await;

    match outcome {
        Ok(Ok(served)) => (
            [(header::CONTENT_TYPE, served.content_type())],
            Body::from(served.body),
        )
            .into_response(),
        Ok(Err(e)) => error_response(&uri, e),
        Err(join_error) => {
            tracing::error!(uri = %uri, error = %join_error, "Processor task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn error_response(uri: &Uri, error: ProcessError) -> Response {
    let status =
        StatusCode::from_u16(error.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match status {
        StatusCode::NOT_FOUND => {
            tracing::debug!(uri = %uri, error = %error, "Variant not found");
            status.into_response()
        }
        StatusCode::SERVICE_UNAVAILABLE => {
            tracing::info!(uri = %uri, "Variant busy, asking client to retry");
            (status, [(header::RETRY_AFTER, "1")], BUSY_MESSAGE).into_response()
        }
        _ => {
            tracing::error!(uri = %uri, error = %error, "Variant generation failed");
            status.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::backend::tests::MockBackend;
    use crate::lock::{Gate, MemoryLocks};
    use crate::store::VariantStore;
    use crate::test_helpers::TestSite;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(site: &TestSite, gate: Gate) -> Router {
        let processor = Processor::new(
            MockBackend::with_source(100, 100),
            site.public(),
            VariantStore::new(site.cache()),
            gate,
        );
        router(Arc::new(processor))
    }

    fn memory_gate(attempts: u32) -> Gate {
        Gate::new(Arc::new(MemoryLocks::new()), attempts, Duration::from_millis(5))
    }

    async fn fetch(app: Router, uri: &str) -> Response {
        let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
        app.oneshot(req).await.unwrap()
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        resp.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    fn content_type(resp: &Response) -> &str {
        resp.headers()[header::CONTENT_TYPE].to_str().unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let site = TestSite::new();
        let resp = fetch(app(&site, memory_gate(1)), "/health").await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn serves_preferred_sibling() {
        let site = TestSite::new();
        site.add_jpeg("images/photo.jpg", 8, 8);

        let resp = fetch(app(&site, memory_gate(10)), "/processed/images/photo.w50.jpg").await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(content_type(&resp), "image/avif");
        assert_eq!(body_bytes(resp).await, b"avif:50x50:q100");
    }

    #[tokio::test]
    async fn skip_query_changes_served_format() {
        let site = TestSite::new();
        site.add_jpeg("photo.png", 8, 8);

        let resp = fetch(
            app(&site, memory_gate(10)),
            "/processed/photo.w50.png?skipAvif=1&skipWebP=1",
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(content_type(&resp), "image/png");
        assert_eq!(site.cached_files(), vec!["photo.w50.png"]);
    }

    #[tokio::test]
    async fn percent_encoded_paths_are_decoded() {
        let site = TestSite::new();
        site.add_jpeg("my photos/sun set.jpg", 8, 8);

        let resp = fetch(
            app(&site, memory_gate(10)),
            "/processed/my%20photos/sun%20set.w20.jpg?skipAvif=1",
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(content_type(&resp), "image/webp");
        assert!(site.cache().join("my photos/sun set.w20.jpg").exists());
    }

    #[tokio::test]
    async fn missing_original_is_404() {
        let site = TestSite::new();
        let resp = fetch(app(&site, memory_gate(10)), "/processed/nope.w50.jpg").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert!(site.cached_files().is_empty());
    }

    #[tokio::test]
    async fn malformed_and_unrouted_paths_are_404() {
        let site = TestSite::new();
        let app = app(&site, memory_gate(10));
        for uri in ["/processed/photo.jpg", "/processed/../x.w1.jpg", "/elsewhere"] {
            let resp = fetch(app.clone(), uri).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn oversized_request_is_404_and_server_keeps_serving() {
        let site = TestSite::new();
        site.add_jpeg("p.jpg", 8, 8);
        let app = app(&site, memory_gate(10));

        let resp = fetch(app.clone(), "/processed/p.w4000000000h4000000000.jpg").await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = fetch(app, "/processed/p.w50.jpg").await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webp_request_is_served_as_webp() {
        let site = TestSite::new();
        site.add_jpeg("photo.webp", 8, 8);

        let resp = fetch(app(&site, memory_gate(10)), "/processed/photo.w80h40q75m1.webp").await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(content_type(&resp), "image/webp");
        assert!(site.cache().join("photo.w80h40q75m1.webp.avif").exists());
    }

    #[tokio::test]
    async fn held_lock_is_503_with_retry_after() {
        let site = TestSite::new();
        site.add_jpeg("p.jpg", 8, 8);
        let gate = memory_gate(3);
        let _held = gate.acquire("/processed/p.w50.jpg-process").unwrap();

        let resp = fetch(app(&site, gate.clone()), "/processed/p.w50.jpg").await;

        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "1");
        assert_eq!(body_bytes(resp).await, BUSY_MESSAGE.as_bytes());
        assert!(site.cached_files().is_empty());
    }
}
