//! Latitude client against a mock HTTP server.

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gpu_race::latitude::Latitude;
use gpu_race::providers::{
    CreateOptions, OfferFilter, OfferSearch, ProviderError, ProvisioningApi, RemoteState,
};

fn plans() -> serde_json::Value {
    json!({
        "data": [
            {
                "id": "plan_h100",
                "attributes": {
                    "name": "vm.h100.small",
                    "stock_level": "medium",
                    "regions": [{
                        "name": "United States",
                        "available": ["NYC", "DAL"],
                        "pricing": { "USD": { "hour": 1.66 } }
                    }]
                }
            },
            {
                "id": "plan_l40s",
                "attributes": {
                    "name": "vm.l40s.small",
                    "stock_level": "high",
                    "regions": [{
                        "name": "Brazil",
                        "available": ["SAO"],
                        "pricing": { "USD": { "hour": 0.74 } }
                    }]
                }
            },
            {
                "id": "plan_a100",
                "attributes": {
                    "name": "vm.a100.small",
                    "stock_level": "unavailable",
                    "regions": [{
                        "name": "United States",
                        "available": ["NYC"],
                        "pricing": { "USD": { "hour": 1.20 } }
                    }]
                }
            }
        ]
    })
}

fn vm(id: &str, status: &str) -> serde_json::Value {
    json!({
        "data": {
            "id": id,
            "attributes": {
                "name": "gpu-race-1234abcd",
                "status": status,
                "created_at": "2025-01-01T00:00:00Z",
                "credentials": { "username": "ubuntu", "host": "10.0.0.7" }
            }
        }
    })
}

fn provider(server: &MockServer) -> Latitude {
    Latitude::with_base_url("test-key", "proj_1", server.uri()).unwrap()
}

#[tokio::test]
async fn test_search_expands_plans_into_ranked_offers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/plans/virtual_machines"))
        .and(header("Authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(plans()))
        .mount(&server)
        .await;

    let offers = provider(&server)
        .search(&OfferFilter::default(), &[])
        .await
        .unwrap();

    let ids: Vec<_> = offers.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["plan_l40s@SAO", "plan_h100@NYC", "plan_h100@DAL"]);

    let l40s = &offers[0];
    assert_eq!(l40s.gpu_model, "L40S");
    assert_eq!(l40s.vram_gb, 48);
    assert_eq!(l40s.region, "SAO");
    assert!((l40s.price_per_hour - 0.74).abs() < f64::EPSILON);
    assert!((l40s.reliability - 0.95).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_search_applies_filter_and_exclusions() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/plans/virtual_machines"))
        .respond_with(ResponseTemplate::new(200).set_body_json(plans()))
        .mount(&server)
        .await;

    let filter = OfferFilter {
        gpu_model: Some("h100".to_string()),
        ..OfferFilter::default()
    };
    let offers = provider(&server)
        .search(&filter, &["plan_h100@NYC".to_string()])
        .await
        .unwrap();

    let ids: Vec<_> = offers.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["plan_h100@DAL"]);
}

#[tokio::test]
async fn test_create_sends_plan_and_site() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/virtual_machines"))
        .and(body_partial_json(json!({
            "data": {
                "type": "virtual_machines",
                "attributes": { "plan": "plan_h100", "site": "DAL", "project": "proj_1" }
            }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(vm("vm_1", "Scheduling")))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/plans/virtual_machines"))
        .respond_with(ResponseTemplate::new(200).set_body_json(plans()))
        .mount(&server)
        .await;

    let latitude = provider(&server);
    let offers = latitude.search(&OfferFilter::default(), &[]).await.unwrap();
    let offer = offers.iter().find(|o| o.id == "plan_h100@DAL").unwrap();

    let created = latitude
        .create_instance(offer, &CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(created.instance.id, "vm_1");
    assert_eq!(created.initial, RemoteState::Creating);
    assert_eq!(created.instance.host.as_deref(), Some("10.0.0.7"));
}

#[tokio::test]
async fn test_create_conflict_is_offer_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/plans/virtual_machines"))
        .respond_with(ResponseTemplate::new(200).set_body_json(plans()))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/virtual_machines"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "errors": [{ "code": "conflict", "title": "Plan out of stock" }]
        })))
        .mount(&server)
        .await;

    let latitude = provider(&server);
    let offers = latitude.search(&OfferFilter::default(), &[]).await.unwrap();
    let err = latitude
        .create_instance(&offers[0], &CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::OfferUnavailable(ref id) if id == "plan_l40s@SAO"));
}

#[tokio::test]
async fn test_status_mapping_and_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/virtual_machines/vm_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(vm("vm_1", "Configuring network")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/virtual_machines/vm_2"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let latitude = provider(&server);
    assert!(latitude.reports_initializing());

    let status = latitude.get_status("vm_1").await.unwrap();
    assert_eq!(status.state, RemoteState::Initializing);
    assert_eq!(status.detail.as_deref(), Some("Configuring network"));
    assert_eq!(
        status.instance.and_then(|i| i.username).as_deref(),
        Some("ubuntu")
    );

    let err = latitude.get_status("vm_2").await.unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_destroy_treats_missing_as_deleted() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/virtual_machines/vm_gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/virtual_machines/vm_stuck"))
        .respond_with(ResponseTemplate::new(500).set_body_string("try later"))
        .mount(&server)
        .await;

    let latitude = provider(&server);
    latitude.destroy_instance("vm_gone").await.unwrap();
    let err = latitude.destroy_instance("vm_stuck").await.unwrap_err();
    assert!(matches!(err, ProviderError::Api { status: 500, .. }));
}
