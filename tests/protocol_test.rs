//! End-to-end protocol tests driving the router in memory.

use axum::{
    body::{to_bytes, Body},
    http::{request::Builder, Request, StatusCode},
    response::Response,
    Router,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tower::ServiceExt;

use tus_store::{
    config::{AppConfig, Disposition},
    routes::routes::routes,
    services::{
        chunk_store::{run_migrations, SqliteChunkStore},
        hooks::NoopHooks,
    },
    state::AppState,
};

struct TestApp {
    router: Router,
}

impl TestApp {
    async fn new(chunk_size: usize) -> Self {
        Self::build(chunk_size, None, None).await
    }

    async fn with_max_size(chunk_size: usize, max_size: u64) -> Self {
        Self::build(chunk_size, Some(max_size), None).await
    }

    async fn with_redirect(chunk_size: usize, template: &str) -> Self {
        Self::build(chunk_size, None, Some(template.to_string())).await
    }

    async fn build(
        chunk_size: usize,
        max_size: Option<u64>,
        redirect_download: Option<String>,
    ) -> Self {
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("failed to open in-memory database");
        run_migrations(&db).await.expect("failed to run migrations");

        let config = AppConfig {
            host: "127.0.0.1".into(),
            port: 0,
            database_url: "sqlite::memory:".into(),
            chunk_size,
            max_size,
            expiration_secs: 3600,
            sweep_interval_secs: 3600,
            disposition: Disposition::Attachment,
            redirect_download,
            request_origins: vec!["https://app.example".into()],
        };
        let store = Arc::new(SqliteChunkStore::new(db.clone(), chunk_size, max_size));
        let state = AppState::new(store, db, config, Arc::new(NoopHooks));
        Self {
            router: routes(state),
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("request failed")
    }
}

fn tus(builder: Builder) -> Builder {
    builder.header("Tus-Resumable", "1.0.0")
}

fn header<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("failed to read body")
        .to_vec()
}

/// POST an upload and return its uid from the Location header.
async fn create(app: &TestApp, builder: Builder) -> String {
    let response = app.send(builder.body(Body::empty()).unwrap()).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    header(&response, "location")
        .expect("missing Location header")
        .trim_start_matches('/')
        .to_string()
}

async fn create_with_length(app: &TestApp, length: u64) -> String {
    create(
        app,
        tus(Request::builder().method("POST").uri("/"))
            .header("Upload-Length", length.to_string()),
    )
    .await
}

async fn patch(app: &TestApp, uid: &str, offset: u64, data: &[u8]) -> Response {
    let request = tus(Request::builder().method("PATCH").uri(format!("/{uid}")))
        .header("Content-Type", "application/offset+octet-stream")
        .header("Upload-Offset", offset.to_string())
        .header("Content-Length", data.len().to_string())
        .body(Body::from(data.to_vec()))
        .unwrap();
    app.send(request).await
}

async fn head(app: &TestApp, uid: &str) -> Response {
    let request = tus(Request::builder().method("HEAD").uri(format!("/{uid}")))
        .body(Body::empty())
        .unwrap();
    app.send(request).await
}

async fn download(app: &TestApp, uid: &str, range: Option<&str>) -> Response {
    let mut builder = Request::builder().method("GET").uri(format!("/{uid}"));
    if let Some(range) = range {
        builder = builder.header("Range", range);
    }
    app.send(builder.body(Body::empty()).unwrap()).await
}

#[tokio::test]
async fn small_upload_single_patch() {
    let app = TestApp::new(1024).await;
    let uid = create_with_length(&app, 5).await;

    let response = patch(&app, &uid, 0, b"hello").await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), Some("5"));
    assert!(header(&response, "upload-expires").is_some());

    let response = head(&app, &uid).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), Some("5"));
    assert_eq!(header(&response, "upload-length"), Some("5"));
    assert_eq!(header(&response, "cache-control"), Some("no-store"));

    let response = download(&app, &uid, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "accept-ranges"), Some("bytes"));
    assert_eq!(header(&response, "content-length"), Some("5"));
    assert_eq!(
        header(&response, "etag"),
        Some(format!("W/\"{uid}\"").as_str())
    );
    assert_eq!(body_bytes(response).await, b"hello");
}

#[tokio::test]
async fn resume_after_offset_conflict() {
    let app = TestApp::new(1024).await;
    let uid = create_with_length(&app, 11).await;

    assert_eq!(
        patch(&app, &uid, 0, b"hello").await.status(),
        StatusCode::NO_CONTENT
    );
    // replay at the stale offset loses
    assert_eq!(
        patch(&app, &uid, 0, b" world").await.status(),
        StatusCode::CONFLICT
    );
    assert_eq!(
        patch(&app, &uid, 5, b" world").await.status(),
        StatusCode::NO_CONTENT
    );

    let response = download(&app, &uid, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"hello world");
}

#[tokio::test]
async fn concatenation_consumes_partials() {
    let app = TestApp::new(3).await;

    let mut parts = Vec::new();
    for data in [&b"hel"[..], b"lo ", b"wor", b"ld"] {
        let uid = create(
            &app,
            tus(Request::builder().method("POST").uri("/"))
                .header("Upload-Length", data.len().to_string())
                .header("Upload-Concat", "partial"),
        )
        .await;
        assert_eq!(
            patch(&app, &uid, 0, data).await.status(),
            StatusCode::NO_CONTENT
        );
        parts.push(uid);
    }

    let refs = parts
        .iter()
        .map(|uid| format!("/{uid}"))
        .collect::<Vec<_>>()
        .join(" ");
    let final_uid = create(
        &app,
        tus(Request::builder().method("POST").uri("/"))
            .header("Upload-Concat", format!("final;{refs}")),
    )
    .await;

    let response = head(&app, &final_uid).await;
    assert_eq!(header(&response, "upload-offset"), Some("11"));
    assert_eq!(header(&response, "upload-length"), Some("11"));
    assert!(header(&response, "upload-concat")
        .is_some_and(|v| v.starts_with("final;")));

    let response = download(&app, &final_uid, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"hello world");

    // consumed parts are gone
    for uid in &parts {
        assert_eq!(head(&app, uid).await.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            download(&app, uid, None).await.status(),
            StatusCode::NOT_FOUND
        );
    }
}

#[tokio::test]
async fn concat_rejects_unfinished_partial() {
    let app = TestApp::new(3).await;
    let uid = create(
        &app,
        tus(Request::builder().method("POST").uri("/"))
            .header("Upload-Length", "6")
            .header("Upload-Concat", "partial"),
    )
    .await;
    assert_eq!(
        patch(&app, &uid, 0, b"hel").await.status(),
        StatusCode::NO_CONTENT
    );

    let request = tus(Request::builder().method("POST").uri("/"))
        .header("Upload-Concat", format!("final;/{uid}"))
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn range_download() {
    let app = TestApp::new(3).await;
    let uid = create_with_length(&app, 11).await;
    patch(&app, &uid, 0, b"hello world").await;

    let response = download(&app, &uid, Some("bytes=6-10")).await;
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(header(&response, "content-range"), Some("bytes 6-10/11"));
    assert_eq!(header(&response, "content-length"), Some("5"));
    assert_eq!(body_bytes(response).await, b"world");

    let response = download(&app, &uid, Some("bytes=42-")).await;
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(header(&response, "content-range"), Some("bytes */11"));

    // malformed ranges fall back to the full body
    let response = download(&app, &uid, Some("bytes=nope")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_bytes(response).await, b"hello world");
}

#[tokio::test]
async fn checksum_mismatch_rejects_the_write() {
    let app = TestApp::new(1024).await;
    let uid = create_with_length(&app, 5).await;

    let request = tus(Request::builder().method("PATCH").uri(format!("/{uid}")))
        .header("Content-Type", "application/offset+octet-stream")
        .header("Upload-Offset", "0")
        .header("Upload-Checksum", "sha1 aaaaaaaaaaaaaaaaaaaaaaaaaaa=")
        .body(Body::from(&b"hello"[..]))
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status().as_u16(), 460);

    // the rejected write left no trace
    let response = head(&app, &uid).await;
    assert_eq!(header(&response, "upload-offset"), Some("0"));

    // and the correct digest goes through
    let request = tus(Request::builder().method("PATCH").uri(format!("/{uid}")))
        .header("Content-Type", "application/offset+octet-stream")
        .header("Upload-Offset", "0")
        .header("Upload-Checksum", "sha1 qvTGHdzF6KLavt4PO0gs2a6pQ00=")
        .body(Body::from(&b"hello"[..]))
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), Some("5"));
}

#[tokio::test]
async fn unsupported_checksum_algorithm_is_rejected() {
    let app = TestApp::new(1024).await;
    let uid = create_with_length(&app, 5).await;

    let request = tus(Request::builder().method("PATCH").uri(format!("/{uid}")))
        .header("Content-Type", "application/offset+octet-stream")
        .header("Upload-Offset", "0")
        .header("Upload-Checksum", "sha3 qvTGHdzF6KLavt4PO0gs2a6pQ00=")
        .body(Body::from(&b"hello"[..]))
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn uneven_chunk_is_rejected() {
    let app = TestApp::new(1024).await;
    let uid = create_with_length(&app, 10).await;

    // first write pins the chunk size at 3
    assert_eq!(
        patch(&app, &uid, 0, b"hel").await.status(),
        StatusCode::NO_CONTENT
    );
    // a 2-byte block that is not terminal breaks the alignment
    let response = patch(&app, &uid, 3, b"wo").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = head(&app, &uid).await;
    assert_eq!(header(&response, "upload-offset"), Some("3"));
}

#[tokio::test]
async fn options_advertises_capabilities() {
    let app = TestApp::new(1024).await;
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/")
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "tus-version"), Some("1.0.0"));
    let extensions = header(&response, "tus-extension").unwrap();
    for extension in [
        "creation",
        "creation-defer-length",
        "termination",
        "expiration",
        "concatenation",
        "checksum",
    ] {
        assert!(extensions.contains(extension), "missing {extension}");
    }
    assert_eq!(
        header(&response, "tus-checksum-algorithm"),
        Some("sha1,sha256,sha384,sha512,md5,crc32")
    );
}

#[tokio::test]
async fn version_check_enforced() {
    let app = TestApp::new(1024).await;
    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header("Upload-Length", "5")
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
    assert_eq!(header(&response, "tus-version"), Some("1.0.0"));

    let request = Request::builder()
        .method("POST")
        .uri("/")
        .header("Tus-Resumable", "0.2.2")
        .header("Upload-Length", "5")
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
}

#[tokio::test]
async fn missing_upload_is_404() {
    let app = TestApp::new(1024).await;
    assert_eq!(head(&app, "missing").await.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        download(&app, "missing", None).await.status(),
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn creation_requires_a_length() {
    let app = TestApp::new(1024).await;
    let request = tus(Request::builder().method("POST").uri("/"))
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = tus(Request::builder().method("POST").uri("/"))
        .header("Upload-Length", "-3")
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn deferred_length_adopted_on_patch() {
    let app = TestApp::new(1024).await;
    let uid = create(
        &app,
        tus(Request::builder().method("POST").uri("/")).header("Upload-Defer-Length", "1"),
    )
    .await;

    let response = head(&app, &uid).await;
    assert_eq!(header(&response, "upload-defer-length"), Some("1"));
    assert_eq!(header(&response, "upload-length"), None);

    let request = tus(Request::builder().method("PATCH").uri(format!("/{uid}")))
        .header("Content-Type", "application/offset+octet-stream")
        .header("Upload-Offset", "0")
        .header("Upload-Length", "5")
        .body(Body::from(&b"hello"[..]))
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = head(&app, &uid).await;
    assert_eq!(header(&response, "upload-length"), Some("5"));
    assert_eq!(header(&response, "upload-offset"), Some("5"));
    assert_eq!(header(&response, "upload-defer-length"), None);
}

#[tokio::test]
async fn patch_content_type_is_mandatory() {
    let app = TestApp::new(1024).await;
    let uid = create_with_length(&app, 5).await;

    let request = tus(Request::builder().method("PATCH").uri(format!("/{uid}")))
        .header("Content-Type", "text/plain")
        .header("Upload-Offset", "0")
        .body(Body::from(&b"hello"[..]))
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn finished_upload_refuses_more_data() {
    let app = TestApp::new(1024).await;
    let uid = create_with_length(&app, 5).await;
    patch(&app, &uid, 0, b"hello").await;

    let response = patch(&app, &uid, 5, b"more").await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn body_past_declared_length_is_413() {
    let app = TestApp::new(1024).await;
    let uid = create_with_length(&app, 5).await;

    let response = patch(&app, &uid, 0, b"hello world").await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn max_size_rejects_creation() {
    let app = TestApp::with_max_size(1024, 8).await;
    let request = tus(Request::builder().method("POST").uri("/"))
        .header("Upload-Length", "9")
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn terminate_removes_the_upload() {
    let app = TestApp::new(1024).await;
    let uid = create_with_length(&app, 5).await;
    patch(&app, &uid, 0, b"hello").await;

    let request = tus(Request::builder().method("DELETE").uri(format!("/{uid}")))
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(head(&app, &uid).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn method_override_rewrites_the_verb() {
    let app = TestApp::new(1024).await;
    let uid = create_with_length(&app, 5).await;

    let request = tus(Request::builder().method("POST").uri(format!("/{uid}")))
        .header("X-HTTP-Method-Override", "PATCH")
        .header("Content-Type", "application/offset+octet-stream")
        .header("Upload-Offset", "0")
        .body(Body::from(&b"hello"[..]))
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset"), Some("5"));
}

#[tokio::test]
async fn cors_reflects_allow_listed_origins() {
    let app = TestApp::new(1024).await;

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/")
        .header("Origin", "https://app.example")
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(
        header(&response, "access-control-allow-origin"),
        Some("https://app.example")
    );
    assert!(header(&response, "access-control-allow-methods")
        .is_some_and(|v| v.contains("PATCH")));
    assert_eq!(header(&response, "access-control-max-age"), Some("86400"));

    let uid = create_with_length(&app, 5).await;
    let request = tus(Request::builder().method("HEAD").uri(format!("/{uid}")))
        .header("Origin", "https://app.example")
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert!(header(&response, "access-control-expose-headers")
        .is_some_and(|v| v.contains("Upload-Offset")));

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/")
        .header("Origin", "https://evil.example")
        .body(Body::empty())
        .unwrap();
    let response = app.send(request).await;
    assert_eq!(header(&response, "access-control-allow-origin"), None);
}

#[tokio::test]
async fn redirect_download_when_configured() {
    let app = TestApp::with_redirect(1024, "https://cdn.example/{uid}").await;
    let uid = create_with_length(&app, 5).await;
    patch(&app, &uid, 0, b"hello").await;

    let response = download(&app, &uid, None).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        header(&response, "location"),
        Some(format!("https://cdn.example/{uid}").as_str())
    );
}

#[tokio::test]
async fn download_disposition_uses_stored_filename() {
    let app = TestApp::new(1024).await;
    let uid = create(
        &app,
        tus(Request::builder().method("POST").uri("/"))
            .header("Upload-Length", "5")
            // filename hello.txt, content_type text/plain
            .header(
                "Upload-Metadata",
                "filename aGVsbG8udHh0,content_type dGV4dC9wbGFpbg==",
            ),
    )
    .await;
    patch(&app, &uid, 0, b"hello").await;

    let response = download(&app, &uid, None).await;
    assert_eq!(header(&response, "content-type"), Some("text/plain"));
    assert_eq!(
        header(&response, "content-disposition"),
        Some("attachment; filename=\"hello.txt\"")
    );
}
