//! Remote client behaviour against a mock ESI server
use std::time::{Duration, Instant};

use market_store::infrastructure::config::EsiConfig;
use market_store::infrastructure::{EsiClient, EsiRequest, EsiResponse, FetchError};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const HISTORY_PATH: &str = "/markets/10000002/history";

fn config(server: &MockServer) -> EsiConfig {
    EsiConfig {
        base_url: server.uri(),
        overload_cooldown_secs: 0,
        fallback_cooldown_secs: 0,
        ..EsiConfig::default()
    }
}

fn history_request(attempts: u32) -> EsiRequest {
    EsiRequest::get("/markets/10000002/history?type_id=34").with_attempts(attempts)
}

fn history_body() -> serde_json::Value {
    json!([
        {"date": "2025-01-01", "average": 5.0, "highest": 6.0, "lowest": 4.0, "order_count": 10, "volume": 100},
        {"date": "2025-01-02", "average": 5.5, "highest": 6.5, "lowest": 4.5, "order_count": 12, "volume": 80}
    ])
}

async fn fetch(client: &EsiClient, request: &EsiRequest) -> Result<EsiResponse<serde_json::Value>, FetchError> {
    client.fetch(request, &CancellationToken::new()).await
}

#[tokio::test]
async fn successful_fetch_decodes_body_and_pages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(HISTORY_PATH))
        .and(query_param("type_id", "34"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(history_body())
                .insert_header("X-Pages", "3"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = EsiClient::new(&config(&server)).unwrap();
    let response = fetch(&client, &history_request(5)).await.unwrap();

    assert_eq!(response.data, history_body());
    assert_eq!(response.pages, Some(3));
    assert_eq!(client.semaphore().in_use(), 0);
}

#[tokio::test]
async fn absurd_page_header_is_ignored() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(HISTORY_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .insert_header("X-Pages", "999999"),
        )
        .mount(&server)
        .await;

    let client = EsiClient::new(&config(&server)).unwrap();
    let response = fetch(&client, &history_request(1)).await.unwrap();
    assert_eq!(response.pages, None);
}

#[tokio::test]
async fn error_limit_waits_for_reset_hint_then_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(HISTORY_PATH))
        .respond_with(
            ResponseTemplate::new(420)
                .set_body_json(json!({"error": "Error limited"}))
                .insert_header("X-Esi-Error-Limit-Reset", "1"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(HISTORY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body()))
        .mount(&server)
        .await;

    let client = EsiClient::new(&config(&server)).unwrap();
    let started = Instant::now();
    let response = fetch(&client, &history_request(5)).await.unwrap();

    assert_eq!(response.data, history_body());
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn error_limit_holds_back_other_callers_of_the_same_client() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(HISTORY_PATH))
        .respond_with(
            ResponseTemplate::new(420)
                .set_body_json(json!({"error": "Error limited"}))
                .insert_header("X-Esi-Error-Limit-Reset", "1"),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body()))
        .mount(&server)
        .await;

    let client = EsiClient::new(&config(&server)).unwrap();
    let started = Instant::now();
    let limited_request = history_request(5);
    let limited = fetch(&client, &limited_request);
    let bystander = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let request = EsiRequest::get("/markets/10000043/history?type_id=34").with_attempts(1);
        let response = fetch(&client, &request).await;
        (response, started.elapsed())
    };
    let (limited, (bystander, waited)) = tokio::join!(limited, bystander);

    assert_eq!(limited.unwrap().data, history_body());
    assert_eq!(bystander.unwrap().data, history_body());
    assert!(waited >= Duration::from_secs(1));
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn overload_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(HISTORY_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(HISTORY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body()))
        .mount(&server)
        .await;

    let client = EsiClient::new(&config(&server)).unwrap();
    assert!(fetch(&client, &history_request(5)).await.is_ok());
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn upstream_timeout_waits_for_body_hint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(HISTORY_PATH))
        .respond_with(
            ResponseTemplate::new(504).set_body_json(json!({"error": "Timeout contacting tranquility", "timeout": 1})),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(HISTORY_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body()))
        .mount(&server)
        .await;

    let client = EsiClient::new(&config(&server)).unwrap();
    let started = Instant::now();
    assert!(fetch(&client, &history_request(5)).await.is_ok());
    assert!(started.elapsed() >= Duration::from_secs(1));
}

#[tokio::test]
async fn semantic_not_found_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(HISTORY_PATH))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "Type not found!"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = EsiClient::new(&config(&server)).unwrap();
    match fetch(&client, &history_request(5)).await {
        Err(FetchError::Remote { code, message }) => {
            assert_eq!(code, 404);
            assert_eq!(message, "Type not found!");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn exhausted_attempts_return_the_last_cause() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(HISTORY_PATH))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let client = EsiClient::new(&config(&server)).unwrap();
    let result = fetch(&client, &history_request(3)).await;
    assert!(matches!(result, Err(FetchError::ServerOverloaded { status: 500 })));
}

#[tokio::test]
async fn zero_attempts_never_call_the_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(history_body()))
        .expect(0)
        .mount(&server)
        .await;

    let client = EsiClient::new(&config(&server)).unwrap();
    assert!(matches!(
        fetch(&client, &history_request(0)).await,
        Err(FetchError::NoAttemptsLeft)
    ));
}

#[tokio::test]
async fn cancellation_interrupts_an_inflight_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(HISTORY_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(history_body())
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;

    let client = EsiClient::new(&config(&server)).unwrap();
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
    }

    let started = Instant::now();
    let result: Result<EsiResponse<serde_json::Value>, _> = client.fetch(&history_request(5), &cancel).await;
    assert!(matches!(result, Err(FetchError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(client.semaphore().in_use(), 0);
}

#[tokio::test]
async fn cancellation_interrupts_a_cooldown_wait() {
    let server = MockServer::start().await;
    let client = EsiClient::new(&config(&server)).unwrap();
    client.cooldown().declare(Duration::from_secs(60));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result: Result<EsiResponse<serde_json::Value>, _> = client.fetch(&history_request(5), &cancel).await;
    assert!(matches!(result, Err(FetchError::Cancelled)));
    assert!(server.received_requests().await.unwrap().is_empty());
}
