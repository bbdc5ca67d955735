//! HTTP surface tests, driving the router in-process with `tower::ServiceExt`.

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::sqlite_gateway;
use http_body_util::BodyExt;
use serde_json::{Value as JsonValue, json};
use std::sync::Arc;
use tempfile::TempDir;
use tenant_mux::transport::http::{HttpTransport, REQUEST_ID_HEADER};
use tower::ServiceExt;

async fn router(dir: &TempDir) -> Router {
    let gateway = Arc::new(sqlite_gateway(dir.path(), &["acme", "globex"]).await);
    HttpTransport::new(gateway, "127.0.0.1", 0).router()
}

fn request(method: &str, uri: &str, tenant: Option<&str>, body: Option<JsonValue>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(tenant) = tenant {
        builder = builder.header("x-tenant-id", tenant);
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, JsonValue) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        JsonValue::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn product(sku: &str) -> JsonValue {
    json!({ "name": "Widget", "price": 9.5, "sku": sku })
}

#[tokio::test]
async fn test_health() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(&dir).await;

    let (status, body) = send(&app, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["multiplexer"]["open_handles"], 0);
    assert!(body["handles"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_and_unknown_tenant() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(&dir).await;

    let (status, body) = send(&app, request("GET", "/collections/product", None, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "missing_tenant_identifier");

    let (status, _) = send(&app, request("GET", "/collections/product", Some("  "), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) =
        send(&app, request("GET", "/collections/product", Some("initech"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "unknown_tenant");
}

#[tokio::test]
async fn test_unknown_schema() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(&dir).await;

    let (status, body) =
        send(&app, request("GET", "/collections/invoice", Some("acme"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "schema_not_found");
}

#[tokio::test]
async fn test_unknown_schema_opens_no_connection() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(sqlite_gateway(dir.path(), &["acme"]).await);
    let app = HttpTransport::new(Arc::clone(&gateway), "127.0.0.1", 0).router();

    let (status, _) =
        send(&app, request("GET", "/collections/invoice/123", Some("acme"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(gateway.stats().opens_started, 0);
    assert!(gateway.multiplexer().peek("acme").is_none());
}

#[tokio::test]
async fn test_document_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(&dir).await;

    let (status, body) = send(
        &app,
        request("POST", "/collections/product", Some("acme"), Some(product("W-1"))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["description"], "");

    let uri = format!("/collections/product/{}", id);
    let (status, body) = send(&app, request("GET", &uri, Some("acme"), None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["sku"], "W-1");

    let (status, body) = send(
        &app,
        request("PATCH", &uri, Some("acme"), Some(json!({ "price": 12.0 }))),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["price"], 12.0);

    let (status, body) = send(
        &app,
        request("GET", "/collections/product?sku=W-1", Some("acme"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);

    let (status, _) = send(&app, request("DELETE", &uri, Some("acme"), None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, request("GET", &uri, Some("acme"), None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "record_not_found");
}

#[tokio::test]
async fn test_documents_do_not_leak_across_tenants() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(&dir).await;

    let (_, body) = send(
        &app,
        request("POST", "/collections/product", Some("acme"), Some(product("W-1"))),
    )
    .await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &app,
        request("GET", &format!("/collections/product/{}", id), Some("globex"), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = send(&app, request("GET", "/collections/product", Some("globex"), None)).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_rejected_input() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(&dir).await;

    let (status, body) = send(
        &app,
        request("POST", "/collections/product", Some("acme"), Some(json!([1, 2]))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_input");

    let (status, _) = send(
        &app,
        request("GET", "/collections/product?colour=red", Some("acme"), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Duplicate unique value
    send(
        &app,
        request("POST", "/collections/product", Some("acme"), Some(product("W-1"))),
    )
    .await;
    let (status, body) = send(
        &app,
        request("POST", "/collections/product", Some("acme"), Some(product("W-1"))),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "database_error");
}

#[tokio::test]
async fn test_request_id_echoed() {
    let dir = tempfile::tempdir().unwrap();
    let app = router(&dir).await;

    let req = Request::builder()
        .uri("/collections/product")
        .header("x-tenant-id", "acme")
        .header(REQUEST_ID_HEADER, "req-42")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(req).await.unwrap();
    assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-42");

    // Generated when absent, on errors too
    let response = app
        .clone()
        .oneshot(request("GET", "/collections/product", None, None))
        .await
        .unwrap();
    assert!(response.headers().contains_key(REQUEST_ID_HEADER));
}

#[tokio::test]
async fn test_handle_released_after_request() {
    let dir = tempfile::tempdir().unwrap();
    let gateway = Arc::new(sqlite_gateway(dir.path(), &["acme"]).await);
    let app = HttpTransport::new(Arc::clone(&gateway), "127.0.0.1", 0).router();

    let (status, _) = send(&app, request("GET", "/collections/lead", Some("acme"), None)).await;
    assert_eq!(status, StatusCode::OK);

    let handle = gateway.multiplexer().peek("acme").unwrap();
    assert_eq!(handle.ref_count(), 0);
}
