use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use arrears::hash::Hash;
use arrears_server::config::Config;
use arrears_server::{router, StateInner};

const PORTFOLIO: &str = "\
LoanID,FieldOfficer,Arrears
L-1,Mensah,10
L-2,Adjei,20
L-3,Owusu,30
L-4,Adjei,40
L-5,Mensah,50
";

async fn app_with(config: Config) -> Router {
    router(StateInner::new(config).await.unwrap())
}

async fn app() -> Router {
    app_with(Config::default()).await
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();

    let body = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };

    (status, headers, body)
}

fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn put_chunk(session_id: &str, n: u32, data: &'static [u8], hash: Option<Hash>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(Method::PUT)
        .uri(format!("/_api/v1/uploads/{}/chunks/{}", session_id, n));

    if let Some(hash) = hash {
        builder = builder.header("X-Arrears-Chunk-Hash", hash.to_typed_base16());
    }

    builder.body(Body::from(data)).unwrap()
}

async fn initiate(app: &Router, total_size: usize, total_chunks: u32) -> String {
    let (status, _, body) = call(
        app,
        json_request(
            Method::POST,
            "/_api/v1/uploads",
            json!({
                "filename": "portfolio.csv",
                "total_size": total_size,
                "total_chunks": total_chunks,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{}", body);

    body["data"]["session_id"].as_str().unwrap().to_string()
}

/// Uploads a portfolio in one chunk and waits until its report is ready.
async fn finished_operation(app: &Router, portfolio: String, report: &str) -> String {
    let session_id = initiate(app, portfolio.len(), 1).await;

    let chunk = Request::builder()
        .method(Method::PUT)
        .uri(format!("/_api/v1/uploads/{}/chunks/1", session_id))
        .body(Body::from(portfolio))
        .unwrap();
    let (status, _, body) = call(app, chunk).await;
    assert_eq!(status, StatusCode::OK, "{}", body);

    let (status, _, body) = call(
        app,
        json_request(
            Method::POST,
            &format!("/_api/v1/uploads/{}/complete", session_id),
            json!({ "report": report }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", body);
    let operation_id = body["data"]["operation_id"].as_str().unwrap().to_string();

    let operation_uri = format!("/_api/v1/operations/{}", operation_id);
    for _ in 0..100 {
        let (status, _, _) = call(app, get(&operation_uri)).await;
        if status == StatusCode::OK {
            return operation_id;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    panic!("Operation {} did not finish", operation_id);
}

fn large_portfolio(rows: usize) -> String {
    let mut portfolio = String::from("LoanID,FieldOfficer,Arrears\n");
    for i in 1..=rows {
        let officer = ["Mensah", "Adjei", "Owusu"][i % 3];
        portfolio.push_str(&format!("L-{},{},{}\n", i, officer, i * 10));
    }
    portfolio
}

#[tokio::test]
async fn test_full_flow() {
    let app = app().await;
    let data = PORTFOLIO.as_bytes();
    let session_id = initiate(&app, data.len(), 2).await;

    let (status, _, body) = call(
        &app,
        put_chunk(&session_id, 2, &data[50..], Some(Hash::sha256_from_bytes(&data[50..]))),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["chunks_received"], 1);
    assert_eq!(body["data"]["chunks_remaining"], 1);
    assert_eq!(body["data"]["percentage"], 50.0);

    let (status, _, body) = call(&app, get(&format!("/_api/v1/uploads/{}", session_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "OPEN");
    assert_eq!(body["data"]["missing_chunks"], json!([1]));

    let (status, _, _) = call(&app, put_chunk(&session_id, 1, &data[..50], None)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = call(
        &app,
        json_request(
            Method::POST,
            &format!("/_api/v1/uploads/{}/complete", session_id),
            json!({ "report": "arrange_dues" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED, "{}", body);
    assert_eq!(body["data"]["size"], data.len());
    assert_eq!(
        body["data"]["sha256"],
        Hash::sha256_from_bytes(data).to_typed_base16()
    );
    let operation_id = body["data"]["operation_id"].as_str().unwrap().to_string();

    let progress_uri = format!("/_api/v1/operations/{}/progress?wait=2", operation_id);
    let mut completed = false;
    for _ in 0..20 {
        let (status, _, body) = call(&app, get(&progress_uri)).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert!(!body["data"]["failed"].as_bool().unwrap(), "{}", body);

        if body["data"]["completed"].as_bool().unwrap() {
            assert_eq!(body["data"]["percentage"], 100.0);
            completed = true;
            break;
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(completed);

    let results_uri = format!("/_api/v1/operations/{}/results", operation_id);
    let (status, _, body) = call(
        &app,
        get(&format!("{}?limit=2&fields=LoanID,FieldOfficer", results_uri)),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let page = &body["data"];
    assert_eq!(page["items"].as_array().unwrap().len(), 2);
    assert_eq!(page["items"][0], json!({ "LoanID": "L-2", "FieldOfficer": "Adjei" }));
    assert_eq!(page["pagination"]["has_more"], true);
    assert_eq!(page["pagination"]["total_count"], 5);
    assert_eq!(page["summary"]["totals"]["Arrears"], 150.0);

    let cursor = page["pagination"]["next_cursor"].as_str().unwrap();
    let (status, _, body) = call(
        &app,
        get(&format!("{}?limit=10&cursor={}", results_uri, cursor)),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 3);
    assert_eq!(body["data"]["pagination"]["has_more"], false);
    assert_eq!(body["data"]["pagination"]["next_cursor"], Value::Null);

    let (status, _, body) = call(&app, get(&format!("/_api/v1/operations/{}", operation_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["report"], "arrange_dues");
    assert_eq!(body["data"]["row_count"], 5);
}

#[tokio::test]
async fn test_envelope_and_correlation_id() {
    let app = app().await;

    let request = Request::builder()
        .uri("/health")
        .header("X-Correlation-Id", "mobile-42")
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers["x-correlation-id"], "mobile-42");
    assert_eq!(body["success"], true);
    assert_eq!(body["correlation_id"], "mobile-42");
    assert_eq!(body["data"]["status"], "ok");
    assert!(body["timestamp"].is_string());

    let (status, headers, body) = call(&app, get("/_api/v1/operations/unknown/progress")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert_eq!(
        body["error"]["correlation_id"],
        headers["x-correlation-id"].to_str().unwrap()
    );
}

#[tokio::test]
async fn test_protocol_errors() {
    let app = app().await;
    let session_id = initiate(&app, 100, 2).await;
    let complete_uri = format!("/_api/v1/uploads/{}/complete", session_id);

    let (status, _, body) = call(&app, put_chunk(&session_id, 3, b"x", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "OUT_OF_RANGE");

    let (status, _, body) = call(
        &app,
        put_chunk(&session_id, 1, b"AAA", Some(Hash::sha256_from_bytes(b"BBB"))),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "INTEGRITY_ERROR");

    call(&app, put_chunk(&session_id, 1, b"LoanID\n", None)).await;
    let (status, _, body) = call(
        &app,
        json_request(Method::POST, &complete_uri, json!({ "report": "arrange_dues" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "INCOMPLETE");

    call(&app, put_chunk(&session_id, 2, b"L-1\n", None)).await;

    let (status, _, body) = call(
        &app,
        json_request(Method::POST, &complete_uri, json!({ "report": "not_a_report" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (status, _, _) = call(
        &app,
        json_request(Method::POST, &complete_uri, json!({ "report": "arrange_dues" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, body) = call(
        &app,
        json_request(Method::POST, &complete_uri, json!({ "report": "arrange_dues" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "ALREADY_COMPLETED");

    let delete = Request::builder()
        .method(Method::DELETE)
        .uri(format!("/_api/v1/uploads/{}", session_id))
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = call(&app, delete).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_invalid_requests() {
    let mut config = Config::default();
    config.chunked_upload.max_chunk_size = 4;
    let app = app_with(config).await;

    let (status, _, body) = call(
        &app,
        json_request(
            Method::POST,
            "/_api/v1/uploads",
            json!({ "filename": "../secrets.csv", "total_size": 4, "total_chunks": 1 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let session_id = initiate(&app, 8, 2).await;
    let (status, _, body) = call(&app, put_chunk(&session_id, 1, b"too large", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _, body) = call(
        &app,
        get("/_api/v1/operations/unknown/results?cursor=not-a-cursor"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND, "{}", body);

    let (status, _, body) = call(
        &app,
        Request::builder()
            .method(Method::POST)
            .uri("/_api/v1/uploads")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_bad_cursor_is_rejected() {
    let app = app().await;
    let operation_id = finished_operation(&app, PORTFOLIO.to_string(), "mtd_unpaid_dues").await;
    let results_uri = format!("/_api/v1/operations/{}/results", operation_id);

    let (status, _, _) = call(&app, get(&results_uri)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, body) = call(&app, get(&format!("{}?cursor=not-a-cursor", results_uri))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_CURSOR");
}

#[tokio::test]
async fn test_out_of_range_limits_are_clamped() {
    let app = app().await;
    let operation_id = finished_operation(&app, PORTFOLIO.to_string(), "arrange_dues").await;
    let results_uri = format!("/_api/v1/operations/{}/results", operation_id);

    for limit in ["-1", "0", "-9223372036854775808"] {
        let (status, _, body) = call(&app, get(&format!("{}?limit={}", results_uri, limit))).await;
        assert_eq!(status, StatusCode::OK, "limit={}: {}", limit, body);
        assert_eq!(body["data"]["pagination"]["limit"], 1);
        assert_eq!(body["data"]["items"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"]["pagination"]["has_more"], true);
    }

    let (status, _, body) = call(&app, get(&format!("{}?limit=100000", results_uri))).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["pagination"]["limit"], 100);

    let (status, _, body) = call(&app, get(&format!("{}?limit=many", results_uri))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_result_pages_revalidate_with_etag() {
    let app = app().await;
    let operation_id = finished_operation(&app, PORTFOLIO.to_string(), "arrange_dues").await;
    let page_uri = format!("/_api/v1/operations/{}/results?limit=2", operation_id);

    let (status, headers, body) = call(&app, get(&page_uri)).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    let etag = headers[header::ETAG].to_str().unwrap().to_string();
    assert!(etag.starts_with('"'));

    let (_, again, _) = call(&app, get(&page_uri)).await;
    assert_eq!(again[header::ETAG], etag.as_str());

    let revalidate = Request::builder()
        .uri(&page_uri)
        .header(header::IF_NONE_MATCH, &etag)
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = call(&app, revalidate).await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
    assert_eq!(headers[header::ETAG], etag.as_str());
    assert_eq!(body, Value::Null);

    // Another page size is another representation.
    let other = Request::builder()
        .uri(format!("/_api/v1/operations/{}/results?limit=3", operation_id))
        .header(header::IF_NONE_MATCH, &etag)
        .body(Body::empty())
        .unwrap();
    let (status, headers, body) = call(&app, other).await;
    assert_eq!(status, StatusCode::OK);
    assert_ne!(headers[header::ETAG], etag.as_str());
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_large_responses_are_compressed() {
    let app = app().await;
    let operation_id = finished_operation(&app, large_portfolio(60), "arrange_dues").await;
    let results_uri = format!("/_api/v1/operations/{}/results?limit=50", operation_id);

    for encoding in ["gzip", "br"] {
        let request = Request::builder()
            .uri(&results_uri)
            .header(header::ACCEPT_ENCODING, encoding)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_ENCODING], encoding);
    }

    let (status, headers, body) = call(&app, get(&results_uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get(header::CONTENT_ENCODING).is_none());
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 50);

    let small = Request::builder()
        .uri("/health")
        .header(header::ACCEPT_ENCODING, "gzip")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = call(&app, small).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get(header::CONTENT_ENCODING).is_none());
}

#[tokio::test]
async fn test_evicted_progress_points_to_result() {
    let mut config = Config::default();
    config.progress.retention_secs = 0;
    let state = StateInner::new(config).await.unwrap();
    let app = router(state.clone());

    let operation_id = finished_operation(&app, PORTFOLIO.to_string(), "arrange_dues").await;
    let progress_uri = format!("/_api/v1/operations/{}/progress?wait=2", operation_id);

    let (status, _, body) = call(&app, get(&progress_uri)).await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["data"]["completed"], true);

    state.progress.evict_expired();

    let (status, _, body) = call(&app, get(&progress_uri)).await;
    assert_eq!(status, StatusCode::NOT_FOUND, "{}", body);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert_eq!(body["error"]["details"]["result_available"], true);

    let (status, _, body) = call(&app, get("/_api/v1/operations/unknown/progress")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].get("details").map_or(true, Value::is_null));
}
