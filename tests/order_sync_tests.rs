//! Paginated order book download into the active work set
use std::sync::Arc;
use std::time::Duration;

use market_store::application::{OrderSync, SyncError};
use market_store::domain::{MarketStore, WorkUnit};
use market_store::infrastructure::config::{EsiConfig, OrderConfig};
use market_store::infrastructure::{DatabaseConnection, EsiClient, SqliteStore};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const JITA: i64 = 10000002;
const AMARR: i64 = 10000043;

fn order(order_id: i64, type_id: i64, range: &str) -> Value {
    json!({
        "duration": 90,
        "is_buy_order": order_id % 2 == 0,
        "issued": "2025-01-01T12:00:00Z",
        "location_id": 60003760,
        "min_volume": 1,
        "order_id": order_id,
        "price": 4.5,
        "range": range,
        "system_id": 30000142,
        "type_id": type_id,
        "volume_remain": 10,
        "volume_total": 10
    })
}

async fn mount_page(server: &MockServer, region_id: i64, page: u32, pages: u32, body: Value) {
    Mock::given(method("GET"))
        .and(path(format!("/markets/{region_id}/orders")))
        .and(query_param("order_type", "all"))
        .and(query_param("page", page.to_string()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(body)
                .insert_header("X-Pages", pages.to_string()),
        )
        .expect(1)
        .mount(server)
        .await;
}

async fn setup(server: &MockServer, regions: Vec<i64>) -> (OrderSync, Arc<SqliteStore>) {
    let db = DatabaseConnection::in_memory().await.unwrap();
    db.migrate().await.unwrap();
    let store = Arc::new(SqliteStore::new(db.pool().clone(), Duration::from_secs(5)));

    let esi = EsiConfig {
        base_url: server.uri(),
        overload_cooldown_secs: 0,
        fallback_cooldown_secs: 0,
        ..EsiConfig::default()
    };
    let config = OrderConfig {
        regions,
        workers: 2,
        fetch_attempts: 1,
        ..OrderConfig::default()
    };
    let sync = OrderSync::new(EsiClient::new(&esi).unwrap(), store.clone(), config);
    (sync, store)
}

#[tokio::test]
async fn every_page_of_every_region_is_stored() {
    let server = MockServer::start().await;
    mount_page(&server, JITA, 1, 3, json!([order(1, 34, "region"), order(2, 35, "station")])).await;
    mount_page(&server, JITA, 2, 3, json!([order(3, 34, "5")])).await;
    mount_page(&server, JITA, 3, 3, json!([order(4, 36, "solarsystem")])).await;
    mount_page(&server, AMARR, 1, 1, json!([order(5, 34, "region")])).await;

    let (sync, store) = setup(&server, vec![JITA, AMARR]).await;
    let report = sync.download(&CancellationToken::new()).await.unwrap();

    assert_eq!(report.regions, 2);
    assert_eq!(report.orders, 5);
    assert_eq!(report.new_markets, 4);
    assert_eq!(
        store.active_market_chunk(0, 10).await.unwrap(),
        vec![
            WorkUnit::new(34, JITA),
            WorkUnit::new(34, AMARR),
            WorkUnit::new(35, JITA),
            WorkUnit::new(36, JITA),
        ]
    );
}

#[tokio::test]
async fn failing_page_fails_the_download_and_stores_nothing() {
    let server = MockServer::start().await;
    mount_page(&server, JITA, 1, 2, json!([order(1, 34, "region")])).await;
    Mock::given(method("GET"))
        .and(path(format!("/markets/{JITA}/orders")))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "Undefined 404 response"})))
        .mount(&server)
        .await;

    let (sync, store) = setup(&server, vec![JITA]).await;
    let result = sync.download(&CancellationToken::new()).await;

    assert!(matches!(result, Err(SyncError::Fetch(_))));
    assert_eq!(store.count_active_markets().await.unwrap(), 0);
}

#[tokio::test]
async fn invalid_order_fails_its_region() {
    let server = MockServer::start().await;
    mount_page(&server, JITA, 1, 1, json!([order(1, 34, "constellation")])).await;

    let (sync, _store) = setup(&server, vec![JITA]).await;
    let result = sync.fetch_region(JITA, &CancellationToken::new()).await;
    assert!(matches!(result, Err(SyncError::Data(_))));
}

#[tokio::test]
async fn missing_page_header_means_a_single_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/markets/{AMARR}/orders")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([order(9, 34, "1")])))
        .expect(1)
        .mount(&server)
        .await;

    let (sync, _store) = setup(&server, vec![AMARR]).await;
    let orders = sync.fetch_region(AMARR, &CancellationToken::new()).await.unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].range, "1 Jumps");
    assert_eq!(orders[0].region_id, AMARR);
}
