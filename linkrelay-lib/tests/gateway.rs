use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use linkrelay_lib::{
    AdmissionConfig, CallerId, ConfigStore, EndpointConfig, FailureKind, ForwardOutcome,
    ForwardRequest, ForwardStatus, GatewayBuilder, GatewayConfig, LoginCheck, MemoryConfigStore,
    MemoryOutcomeSink, OutcomeSink, ProbeClassification, RateLimitConfig,
};
use pretty_assertions::assert_eq;
use secrecy::SecretString;
use test_utils::{accepting_downstream, login_protected_downstream, mock_server};

const LINK: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

struct Fixture {
    store: Arc<MemoryConfigStore>,
    sink: Arc<MemoryOutcomeSink>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryConfigStore::new()),
            sink: Arc::new(MemoryOutcomeSink::new()),
        }
    }

    async fn configure(&self, caller: CallerId, address: &str, password: Option<&str>) {
        let config = EndpointConfig::new(address, password.map(SecretString::from)).unwrap();
        assert!(self.store.save_endpoint_config(caller, config).await);
    }

    fn gateway(&self, config: GatewayConfig) -> linkrelay_lib::ForwardingGateway {
        GatewayBuilder::builder()
            .config(config)
            .config_store(self.store.clone())
            .outcome_sink(self.sink.clone())
            .build()
            .gateway()
    }
}

#[tokio::test]
async fn test_forward_is_recorded() {
    let mock_server = accepting_downstream!("queued");
    let fixture = Fixture::new();
    fixture.configure(1, &mock_server.uri(), None).await;
    let gateway = fixture.gateway(GatewayConfig::default());

    let outcome = gateway.forward(1, LINK).await;

    assert!(outcome.is_success(), "{outcome}");
    assert_eq!(outcome.message(), "queued");

    let records = fixture.sink.records_for(1);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].link, LINK);
    assert_eq!(records[0].status, ForwardStatus::Success);
    assert_eq!(fixture.sink.stats_for(1).successful, 1);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_login_protected_downstream() {
    let mock_server = login_protected_downstream!("hunter2");
    let fixture = Fixture::new();
    fixture.configure(1, &mock_server.uri(), Some("hunter2")).await;
    let gateway = fixture.gateway(GatewayConfig::default());

    let outcome = gateway.forward(1, LINK).await;

    assert!(outcome.is_success(), "{outcome}");
    assert!(outcome.retried_after_login());
    assert_eq!(outcome.message(), "task added");
}

#[tokio::test]
async fn test_wrong_password() {
    let mock_server = login_protected_downstream!("hunter2");
    let fixture = Fixture::new();
    fixture.configure(1, &mock_server.uri(), Some("letmein")).await;
    let gateway = fixture.gateway(GatewayConfig::default());

    let outcome = gateway.forward(1, LINK).await;
    assert_eq!(outcome.failure(), Some(FailureKind::AuthenticationRequired));
    assert_eq!(fixture.sink.stats_for(1).failed, 1);

    let report = gateway.test_connection(1).await.unwrap();
    assert_eq!(report.result.classification, ProbeClassification::Ok);
    assert_eq!(report.login, Some(LoginCheck::Failed));
}

#[tokio::test]
async fn test_probe_with_valid_password() {
    let mock_server = login_protected_downstream!("hunter2");
    let fixture = Fixture::new();
    fixture.configure(1, &mock_server.uri(), Some("hunter2")).await;
    let gateway = fixture.gateway(GatewayConfig::default());

    let report = gateway.test_connection(1).await.unwrap();

    assert_eq!(report.login, Some(LoginCheck::Succeeded));
    assert_eq!(report.message(), "Connection ok, login succeeded");
}

#[tokio::test]
async fn test_endpoint_is_read_on_every_call() {
    let first = accepting_downstream!("first");
    let second = accepting_downstream!("second");
    let fixture = Fixture::new();
    let gateway = fixture.gateway(GatewayConfig::default());

    fixture.configure(1, &first.uri(), None).await;
    assert_eq!(gateway.forward(1, LINK).await.message(), "first");

    fixture.configure(1, &second.uri(), None).await;
    assert_eq!(gateway.forward(1, LINK).await.message(), "second");
}

#[tokio::test]
async fn test_rate_limit_is_per_caller() {
    let mock_server = accepting_downstream!("queued");
    let fixture = Fixture::new();
    fixture.configure(1, &mock_server.uri(), None).await;
    fixture.configure(2, &mock_server.uri(), None).await;
    let gateway = fixture.gateway(GatewayConfig {
        rate_limit: RateLimitConfig {
            max_requests: 3,
            ..RateLimitConfig::default()
        },
        ..GatewayConfig::default()
    });

    for _ in 0..3 {
        assert!(gateway.forward(1, LINK).await.is_success());
    }
    let outcome = gateway.forward(1, LINK).await;
    assert_eq!(outcome.failure(), Some(FailureKind::RateLimited));
    assert!(gateway.forward(2, LINK).await.is_success());

    // Throttled submissions are not recorded
    assert_eq!(fixture.sink.records_for(1).len(), 3);
    assert_eq!(gateway.stats().rate_limited, 1);
}

#[tokio::test]
async fn test_concurrent_submissions_are_bounded() {
    const CALLERS: u64 = 12;

    let mock_server = mock_server!(
        200,
        set_body_json(serde_json::json!({"success": true})),
        set_delay(Duration::from_millis(200))
    );
    let endpoint = EndpointConfig::new(&mock_server.uri(), None).unwrap();
    let gateway = Fixture::new().gateway(GatewayConfig {
        admission: AdmissionConfig {
            max_in_flight: 4,
            max_per_caller: 4,
            overload_percent: 100,
        },
        ..GatewayConfig::default()
    });

    let requests: Vec<_> = (0..CALLERS)
        .map(|caller| ForwardRequest::new(caller, LINK))
        .collect();
    let outcomes = futures::future::join_all(
        requests
            .iter()
            .map(|request| gateway.submit(request, &endpoint)),
    )
    .await;

    let succeeded = outcomes.iter().filter(|outcome| outcome.is_success()).count();
    let denied = outcomes
        .iter()
        .filter(|outcome| outcome.failure() == Some(FailureKind::AdmissionDenied))
        .count();
    assert_eq!(succeeded, 4);
    assert_eq!(denied, 8);

    let stats = gateway.admission_stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.total, 4);
    assert_eq!(stats.rejected, 8);
}

#[tokio::test]
async fn test_cancelled_submission_frees_its_slot() {
    let mock_server = mock_server!(
        200,
        set_body_json(serde_json::json!({"success": true})),
        set_delay(Duration::from_secs(5))
    );
    let endpoint = EndpointConfig::new(&mock_server.uri(), None).unwrap();
    let fixture = Fixture::new();
    let gateway = fixture.gateway(GatewayConfig::default());

    let request = ForwardRequest::new(1, LINK);
    let result = tokio::time::timeout(
        Duration::from_millis(100),
        gateway.submit(&request, &endpoint),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(gateway.admission().in_flight(), 0);
    assert_eq!(gateway.admission().in_flight_for(1), 0);
    assert!(fixture.sink.is_empty());
}

/// Panics while recording, after the admission slot was granted
struct PanickingSink;

#[async_trait]
impl OutcomeSink for PanickingSink {
    async fn record_outcome(&self, _caller: CallerId, _link: &str, _outcome: &ForwardOutcome) {
        panic!("storage unavailable");
    }

    async fn increment_stats(&self, _caller: CallerId, _success: bool) {}
}

#[tokio::test]
async fn test_panicking_sink_frees_its_slot() {
    let mock_server = accepting_downstream!("queued");
    let endpoint = EndpointConfig::new(&mock_server.uri(), None).unwrap();
    let gateway = Arc::new(
        GatewayBuilder::builder()
            .outcome_sink(Arc::new(PanickingSink))
            .build()
            .gateway(),
    );

    let task = {
        let gateway = Arc::clone(&gateway);
        let endpoint = endpoint.clone();
        tokio::spawn(async move {
            gateway
                .submit(&ForwardRequest::new(1, LINK), &endpoint)
                .await
        })
    };

    assert!(task.await.unwrap_err().is_panic());
    assert_eq!(gateway.admission().in_flight(), 0);
    assert_eq!(gateway.admission_stats().errors, 1);
}

#[tokio::test]
async fn test_unreachable_endpoint() {
    let fixture = Fixture::new();
    fixture.configure(1, "http://127.0.0.1:1", None).await;
    let gateway = fixture.gateway(GatewayConfig::default());

    let report = gateway.test_connection(1).await.unwrap();
    assert_eq!(
        report.result.classification,
        ProbeClassification::Unreachable
    );

    let outcome = gateway.forward(1, LINK).await;
    assert!(matches!(
        outcome.failure(),
        Some(FailureKind::TransientNetworkError(_))
    ));
    assert_eq!(fixture.sink.stats_for(1).failed, 1);
}
