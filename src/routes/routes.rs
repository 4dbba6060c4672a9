//! Defines routes for the drop store API.
//!
//! ## Structure
//! - **Object endpoints**
//!   - `POST    /api`               — upload (multipart, one file field)
//!   - `GET     /api?id=..&info`    — metadata, plus zip listing for archives
//!   - `GET     /api?id=..`         — download
//!   - `OPTIONS /api`               — CORS preflight, 204
//!
//! - **Probes**
//!   - `GET /healthz`, `GET /readyz`
//!
//! Every response allows any origin.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        object_handlers::{X_FILENAME, get_object, upload_object},
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    extract::{DefaultBodyLimit, Request},
    http::{Method, StatusCode, header},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Build and return the router for all API routes.
///
/// The router carries shared state (`StorageService`) to all handlers.
/// Upload size is enforced by the object store while streaming, so axum's
/// default body cap is lifted.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/api", post(upload_object).get(get_object))
        .layer(DefaultBodyLimit::disable())
}

/// Fully layered application with state attached.
pub fn app(service: StorageService) -> Router {
    routes()
        .layer(cors_layer())
        .layer(middleware::from_fn(preflight_no_content))
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

/// The CORS layer answers every `OPTIONS` itself with an empty 200; report
/// those as 204.
async fn preflight_no_content(request: Request, next: Next) -> Response {
    let is_preflight = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;
    if is_preflight && response.status() == StatusCode::OK {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([
            header::CONTENT_DISPOSITION,
            header::CONTENT_LENGTH,
            header::ETAG,
            X_FILENAME,
        ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::AppConfig,
        models::record::ObjectRecord,
        services::{metadata::JsonMetadataStore, object_store::ObjectStore},
    };
    use axum::{
        body::{Body, to_bytes},
        http::Request,
    };
    use bytes::Bytes;
    use chrono::{Duration, Utc};
    use futures::stream;
    use serde_json::Value;
    use std::{io, sync::Arc};
    use tempfile::TempDir;
    use tower::ServiceExt;

    const BOUNDARY: &str = "X-DROP-STORE-BOUNDARY";

    struct TestApp {
        dir: TempDir,
        service: StorageService,
        router: Router,
    }

    async fn test_app(max_upload_bytes: u64) -> TestApp {
        let dir = TempDir::new().unwrap();
        let mut cfg = AppConfig::for_root(dir.path());
        cfg.max_upload_bytes = max_upload_bytes;
        let metadata = Arc::new(JsonMetadataStore::open(&cfg.metadata_dir).await.unwrap());
        let service = StorageService::new(&cfg, metadata);
        TestApp {
            dir,
            router: app(service.clone()),
            service,
        }
    }

    fn multipart_body(filename: &str, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(b"Content-Disposition: form-data; name=\"note\"\r\n\r\nhello\r\n");
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n",
                filename
            )
            .as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(payload);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload_request(filename: &str, payload: &[u8]) -> Request<Body> {
        Request::post("/api")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(filename, payload)))
            .unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::get(uri)
            .header(header::ORIGIN, "https://elsewhere.example")
            .body(Body::empty())
            .unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> Response<Body> {
        router.clone().oneshot(request).await.unwrap()
    }

    async fn json(response: Response<Body>) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn upload(app: &TestApp, filename: &str, payload: &[u8]) -> Value {
        let response = send(&app.router, upload_request(filename, payload)).await;
        assert_eq!(response.status(), StatusCode::OK);
        json(response).await
    }

    #[tokio::test]
    async fn upload_info_download_round_trip() {
        let app = test_app(1024 * 1024).await;
        let payload = b"hello from the drop store".to_vec();

        let uploaded = upload(&app, "greeting.txt", &payload).await;
        assert_eq!(uploaded["success"], true);
        let id = uploaded["data"]["id"].as_str().unwrap().to_string();
        assert_eq!(id.len(), 12);
        assert_eq!(uploaded["data"]["filename"], "greeting.txt");
        assert_eq!(uploaded["data"]["size"], payload.len() as u64);
        assert_eq!(uploaded["data"]["downloadUrl"], format!("/api?id={}", id));

        let response = send(&app.router, get_request(&format!("/api?id={}&info", id))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let info = json(response).await;
        assert_eq!(info["data"]["size"], payload.len() as u64);
        assert_eq!(info["data"]["isZip"], false);
        assert!(info["data"].get("zipContents").is_none());
        let uploaded_at: chrono::DateTime<Utc> =
            serde_json::from_value(info["data"]["uploadedAt"].clone()).unwrap();
        let expires_at: chrono::DateTime<Utc> =
            serde_json::from_value(info["data"]["expiresAt"].clone()).unwrap();
        assert_eq!(expires_at - uploaded_at, Duration::hours(48));

        let response = send(&app.router, get_request(&format!("/api?id={}", id))).await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(headers[header::CONTENT_LENGTH], payload.len().to_string().as_str());
        assert_eq!(headers[header::CONTENT_TYPE], "application/octet-stream");
        assert_eq!(headers[X_FILENAME], "greeting.txt");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.as_ref(), payload.as_slice());
    }

    #[tokio::test]
    async fn zip_info_lists_entries() {
        use std::io::Write;
        use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

        let app = test_app(1024 * 1024).await;
        let mut writer = ZipWriter::new(io::Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        writer.add_directory("docs/", options).unwrap();
        writer.start_file("docs/readme.md", options).unwrap();
        writer.write_all(b"# hi").unwrap();
        let archive = writer.finish().unwrap().into_inner();

        let uploaded = upload(&app, "bundle.zip", &archive).await;
        let id = uploaded["data"]["id"].as_str().unwrap();

        let request = get_request(&format!("/api?id={}&info=1", id));
        let info = json(send(&app.router, request).await).await;
        assert_eq!(info["data"]["isZip"], true);
        assert_eq!(info["data"]["zipTruncated"], false);
        assert_eq!(
            info["data"]["zipContents"],
            serde_json::json!([{ "name": "docs/readme.md", "size": 4 }])
        );
    }

    #[tokio::test]
    async fn oversized_upload_is_413_and_leaves_nothing() {
        let app = test_app(16).await;

        let response = send(&app.router, upload_request("exact.bin", &[7u8; 16])).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(&app.router, upload_request("over.bin", &[7u8; 17])).await;
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = json(response).await;
        assert_eq!(body["success"], false);
        assert!(body["error"].is_string());

        assert_eq!(app.service.objects.list_files().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn bad_uploads_are_400() {
        let app = test_app(1024).await;

        let not_multipart = Request::post("/api")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let response = send(&app.router, not_multipart).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["success"], false);

        let mut no_file = Vec::new();
        no_file.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        no_file.extend_from_slice(b"Content-Disposition: form-data; name=\"note\"\r\n\r\nhi\r\n");
        no_file.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        let request = Request::post("/api")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(no_file))
            .unwrap();
        let response = send(&app.router, request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json(response).await["error"], "no file uploaded");

        let response = send(&app.router, upload_request("empty.txt", b"")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_and_invalid_ids() {
        let app = test_app(1024).await;

        let response = send(&app.router, get_request("/api?id=0123456789ab&info")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(json(response).await["error"], "file not found");

        let response = send(&app.router, get_request("/api?id=0123456789ab")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"file not found");

        let response = send(&app.router, get_request("/api?id=%2F%2E%2E&info")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let response = send(&app.router, get_request("/api")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    /// Commit an object whose TTL ran out one second ago.
    async fn plant_expired(app: &TestApp, id: &str) {
        let location = ObjectStore::location_for(id, "old.txt");
        let chunks: Vec<io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"old"))];
        let written = app
            .service
            .objects
            .write_stream(&location, stream::iter(chunks))
            .await
            .unwrap();
        let record = ObjectRecord::new(
            id.into(),
            "old.txt".into(),
            location,
            written.size_bytes,
            written.etag,
            Utc::now() - Duration::hours(48) - Duration::seconds(1),
            Duration::hours(48),
        );
        app.service.metadata.put(&record).await.unwrap();
    }

    #[tokio::test]
    async fn expired_object_is_410() {
        let app = test_app(1024).await;
        let id = "c0ffee000001";
        plant_expired(&app, id).await;

        let response = send(&app.router, get_request(&format!("/api?id={}&info", id))).await;
        assert_eq!(response.status(), StatusCode::GONE);
        assert_eq!(json(response).await["error"], "file has expired");
        assert!(app.service.metadata.get(id).await.unwrap().is_none());
        assert!(app.service.objects.list_files().await.unwrap().is_empty());

        let response = send(&app.router, get_request(&format!("/api?id={}", id))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn expired_download_is_410_plain_text() {
        let app = test_app(1024).await;
        let id = "c0ffee000002";
        plant_expired(&app, id).await;

        let response = send(&app.router, get_request(&format!("/api?id={}", id))).await;
        assert_eq!(response.status(), StatusCode::GONE);
        assert!(
            response.headers()[header::CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"file has expired");
        assert!(app.service.objects.list_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn preflight_is_no_content() {
        let app = test_app(1024).await;
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api")
            .body(Body::empty())
            .unwrap();
        let response = send(&app.router, request).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api")
            .header(header::ORIGIN, "https://elsewhere.example")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = send(&app.router, request).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        let allowed = response.headers()[header::ACCESS_CONTROL_ALLOW_METHODS]
            .to_str()
            .unwrap()
            .to_string();
        assert!(allowed.contains("POST"));
    }

    #[tokio::test]
    async fn probes_report_ok() {
        let app = test_app(1024).await;

        let response = send(&app.router, get_request("/healthz")).await;
        assert_eq!(response.status(), StatusCode::OK);

        tokio::fs::create_dir_all(app.service.objects.root()).await.unwrap();
        let response = send(&app.router, get_request("/readyz")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json(response).await;
        assert_eq!(body["checks"]["metadata"]["ok"], true);
        assert_eq!(body["checks"]["disk"]["ok"], true);
    }

    #[tokio::test]
    async fn failed_readiness_hides_details() {
        let app = test_app(1024).await;
        let meta_dir = app.dir.path().join("meta");
        tokio::fs::remove_dir_all(&meta_dir).await.unwrap();

        let response = send(&app.router, get_request("/readyz")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = json(response).await;
        assert_eq!(body["status"], "error");
        assert_eq!(body["checks"]["metadata"]["ok"], false);
        assert_eq!(
            body["checks"]["metadata"]["error"],
            "metadata backend unavailable"
        );
        let rendered = body.to_string();
        assert!(!rendered.contains(meta_dir.to_string_lossy().as_ref()));
        assert!(!rendered.contains("No such file"));
    }
}
