use std::collections::BTreeMap;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use backend_registry::{
    BackendCapability, BackendFailure, BackendRegistry, Error, ExecutionBackend, Operation, RoutingConfig,
};
use error_handling_rs::CancellationToken;

struct EchoBackend {
    name: String,
    calls: AtomicUsize,
}

impl EchoBackend {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ExecutionBackend for EchoBackend {
    async fn execute(
        &self,
        operation_kind: &str,
        _parameters: &BTreeMap<String, String>,
        _context: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> Result<String, BackendFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("{}:{}", self.name, operation_kind))
    }
}

struct FailingBackend {
    kind: &'static str,
}

#[async_trait]
impl ExecutionBackend for FailingBackend {
    async fn execute(
        &self,
        _operation_kind: &str,
        _parameters: &BTreeMap<String, String>,
        _context: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> Result<String, BackendFailure> {
        Err(BackendFailure::new(self.kind, "upstream unavailable"))
    }
}

struct SlowBackend {
    delay: Duration,
}

#[async_trait]
impl ExecutionBackend for SlowBackend {
    async fn execute(
        &self,
        _operation_kind: &str,
        _parameters: &BTreeMap<String, String>,
        _context: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> Result<String, BackendFailure> {
        tokio::time::sleep(self.delay).await;
        Ok("late".to_string())
    }
}

fn summarize(timeout_ms: u64) -> Operation {
    Operation::new("summarize", Duration::from_millis(timeout_ms)).with_parameter("text", "hello")
}

#[test]
fn test_route_prefers_higher_score() {
    let registry = BackendRegistry::default();
    registry
        .declare("small", BackendCapability::new("summarize").with_scores(0.5, 0.5))
        .unwrap();
    registry
        .declare("large", BackendCapability::new("summarize").with_scores(0.9, 0.9))
        .unwrap();

    assert_eq!(registry.route(&summarize(100)).unwrap(), "large");
}

#[test]
fn test_route_is_stable_under_equal_scores() {
    for cache_enabled in [true, false] {
        let registry = BackendRegistry::new(RoutingConfig {
            cache_enabled,
            ..RoutingConfig::default()
        });
        for id in ["alpha", "beta", "gamma"] {
            registry
                .declare(id, BackendCapability::new("summarize").with_scores(0.7, 0.7))
                .unwrap();
        }

        for _ in 0..20 {
            assert_eq!(registry.route(&summarize(100)).unwrap(), "alpha");
        }
    }
}

#[test]
fn test_route_checks_required_keys_in_parameters_and_context() {
    let registry = BackendRegistry::default();
    registry
        .declare("search", BackendCapability::new("lookup").requires("query"))
        .unwrap();

    let bare = Operation::new("lookup", Duration::from_secs(1));
    assert!(matches!(registry.route(&bare), Err(Error::Routing { .. })));

    let mut context = BTreeMap::new();
    context.insert("query".to_string(), "rust".to_string());
    let with_context = Operation::new("lookup", Duration::from_secs(1)).with_context(context);
    assert_eq!(registry.route(&with_context).unwrap(), "search");

    let unknown = Operation::new("translate", Duration::from_secs(1));
    match registry.route(&unknown) {
        Err(Error::Routing { operation, reason }) => {
            assert_eq!(operation, "translate");
            assert!(reason.contains("no backend declares"));
        }
        other => panic!("expected routing error, got {:?}", other),
    }
}

#[test]
fn test_declare_rejects_invalid_scores() {
    let registry = BackendRegistry::default();
    let result = registry.declare("b", BackendCapability::new("summarize").with_scores(1.5, 0.5));
    assert!(matches!(result, Err(Error::Configuration(_))));
}

#[tokio::test]
async fn test_execute_updates_metrics_and_scores() {
    let registry = BackendRegistry::default();
    let echo = EchoBackend::new("llm");
    registry.register_backend("llm", echo.clone());
    registry
        .declare("llm", BackendCapability::new("summarize").with_scores(0.8, 0.6))
        .unwrap();

    let response = registry.execute(&summarize(1000), None).await.unwrap();
    assert_eq!(response.backend_id, "llm");
    assert_eq!(response.output, "llm:summarize");
    assert!(response.failed_backends.is_empty());

    let metrics = registry.metrics("llm").unwrap();
    assert_eq!(metrics.attempts, 1);
    assert_eq!(metrics.successes, 1);
    assert_eq!(metrics.error_rate, 0.0);
    assert!(metrics.last_used.is_some());

    let capability = &registry.capabilities()[0];
    assert_eq!(capability.reliability_score, 1.0);
    assert!(capability.performance_score > 0.8);
}

#[tokio::test]
async fn test_execute_falls_back_in_order() {
    let registry = BackendRegistry::default();
    registry.register_backend("primary", Arc::new(FailingBackend { kind: "BackendError" }));
    registry.register_backend("secondary", EchoBackend::new("secondary"));
    registry
        .declare("primary", BackendCapability::new("summarize").with_scores(0.9, 0.9))
        .unwrap();

    let operation = summarize(1000).with_fallback_backends(vec!["secondary".to_string()]);
    let response = registry.execute(&operation, None).await.unwrap();

    assert_eq!(response.backend_id, "secondary");
    assert_eq!(response.failed_backends, vec!["primary".to_string()]);
    assert_eq!(registry.metrics("primary").unwrap().failures, 1);
    assert_eq!(registry.metrics("secondary").unwrap().successes, 1);
}

#[tokio::test]
async fn test_execute_reports_last_failure_when_all_fail() {
    let registry = BackendRegistry::default();
    registry.register_backend("a", Arc::new(FailingBackend { kind: "BackendError" }));
    registry.register_backend("b", Arc::new(FailingBackend { kind: "RateLimitError" }));
    registry.declare("a", BackendCapability::new("summarize")).unwrap();

    let operation = summarize(1000).with_fallback_backends(vec!["b".to_string()]);
    match registry.execute(&operation, None).await {
        Err(Error::Backend { backend, kind, message }) => {
            assert_eq!(backend, "b");
            assert_eq!(kind, "RateLimitError");
            assert!(message.contains("a: BackendError"));
        }
        other => panic!("expected backend error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unhealthy_fallback_is_skipped() {
    let registry = BackendRegistry::default();
    registry.register_backend("a", Arc::new(FailingBackend { kind: "BackendError" }));
    registry.register_backend("b", Arc::new(FailingBackend { kind: "BackendError" }));
    registry.register_backend("c", EchoBackend::new("c"));
    registry.declare("a", BackendCapability::new("summarize")).unwrap();

    let operation = summarize(1000).with_fallback_backends(vec!["b".to_string(), "c".to_string()]);

    let first = registry.execute(&operation, None).await.unwrap();
    assert_eq!(first.failed_backends, vec!["a".to_string(), "b".to_string()]);
    assert!(!registry.is_healthy("b"));

    let second = registry.execute(&operation, None).await.unwrap();
    assert_eq!(second.backend_id, "c");
    assert_eq!(second.failed_backends, vec!["a".to_string()]);
    assert_eq!(registry.metrics("b").unwrap().attempts, 1);
}

#[tokio::test]
async fn test_cached_route_invalidated_when_backend_turns_unhealthy() {
    let registry = BackendRegistry::default();
    registry.register_backend("fast", Arc::new(FailingBackend { kind: "BackendError" }));
    registry.register_backend("steady", EchoBackend::new("steady"));
    registry
        .declare("fast", BackendCapability::new("summarize").with_scores(0.95, 0.95))
        .unwrap();
    registry
        .declare("steady", BackendCapability::new("summarize").with_scores(0.4, 0.4))
        .unwrap();

    assert_eq!(registry.route(&summarize(1000)).unwrap(), "fast");
    assert!(registry.execute(&summarize(1000), None).await.is_err());
    assert!(!registry.is_healthy("fast"));

    assert_eq!(registry.route(&summarize(1000)).unwrap(), "steady");
}

#[tokio::test(start_paused = true)]
async fn test_timeout_is_a_backend_error() {
    let registry = BackendRegistry::default();
    registry.register_backend(
        "slow",
        Arc::new(SlowBackend {
            delay: Duration::from_secs(5),
        }),
    );
    registry.declare("slow", BackendCapability::new("summarize")).unwrap();

    match registry.execute(&summarize(50), None).await {
        Err(err @ Error::Backend { .. }) => assert_eq!(err.kind_name(), "TimeoutError"),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(registry.metrics("slow").unwrap().failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_abandons_in_flight_call() {
    let registry = Arc::new(BackendRegistry::default());
    registry.register_backend(
        "slow",
        Arc::new(SlowBackend {
            delay: Duration::from_secs(30),
        }),
    );
    registry.declare("slow", BackendCapability::new("summarize")).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let result = registry.execute(&summarize(60_000), Some(&cancel)).await;
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(registry.metrics("slow").unwrap().attempts, 0);
}

#[tokio::test]
async fn test_health_report_in_registration_order() {
    let registry = BackendRegistry::default();
    registry.register_backend("bad", Arc::new(FailingBackend { kind: "BackendError" }));
    registry.register_backend("good", EchoBackend::new("good"));
    registry.declare("bad", BackendCapability::new("summarize")).unwrap();

    let _ = registry.execute(&summarize(1000), None).await;

    let report = registry.health_report();
    let ids: Vec<&str> = report.iter().map(|h| h.backend_id.as_str()).collect();
    assert_eq!(ids, vec!["bad", "good"]);
    assert!(!report[0].healthy);
    assert!(report[1].healthy);
    assert!(!registry.is_healthy("unknown"));
}

#[tokio::test]
async fn test_load_declarations_from_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        "[[capability]]\nbackend = \"llm\"\noperation = \"summarize\"\nrequired_keys = [\"text\"]\n\n\
         [[capability]]\nbackend = \"llm\"\noperation = \"translate\"\nperformance_score = 0.8"
    )
    .unwrap();

    let registry = BackendRegistry::default();
    assert_eq!(registry.load_declarations(file.path()).await.unwrap(), 2);
    assert_eq!(registry.route(&summarize(100)).unwrap(), "llm");
    assert_eq!(registry.capabilities().len(), 2);
}
