use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use finpulse_ai::{AiError, AnalysisProvider, AnalysisRequest, AnalysisResult};
use finpulse_resilience::{BreakerError, CircuitBreaker, RetryPolicy, TtlCache, retry_with_backoff};

/// Error from [`GuardedAnalyzer::analyze`]: an open circuit or the provider's
/// own failure.
pub type AnalyzeError = BreakerError<AiError>;

/// Default freshness for cached analyses.
pub const DEFAULT_ANALYSIS_TTL: Duration = Duration::from_secs(60 * 60);

/// Cache, then circuit breaker, then retry, around one LLM provider.
///
/// A cache hit never touches the breaker, so an open circuit still serves
/// fresh cached insights.
pub struct GuardedAnalyzer {
    provider: Arc<dyn AnalysisProvider>,
    cache: Arc<TtlCache>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    ttl: Duration,
}

impl GuardedAnalyzer {
    pub fn new(
        provider: Arc<dyn AnalysisProvider>,
        cache: Arc<TtlCache>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            provider,
            cache,
            breaker,
            retry: RetryPolicy::default(),
            ttl: DEFAULT_ANALYSIS_TTL,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalyzeError> {
        request.validate().map_err(BreakerError::Inner)?;

        let key = request.cache_key();
        let provider = &self.provider;
        let retry = &self.retry;

        debug!(provider = provider.name(), key = %key, "analysis requested");
        self.cache
            .get_or_insert_with(&key, self.ttl, || {
                self.breaker
                    .execute(|| retry_with_backoff(retry, move || provider.analyze(request)))
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use finpulse_ai::AnalysisKind;
    use finpulse_core::TenantId;
    use finpulse_resilience::{CircuitBreakerConfig, CircuitState, ManualClock};

    use super::*;

    /// Replays scripted responses, then succeeds.
    #[derive(Default)]
    struct ScriptedProvider {
        script: Mutex<VecDeque<Result<AnalysisResult, AiError>>>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn failing_with(errors: Vec<AiError>) -> Self {
            Self {
                script: Mutex::new(errors.into_iter().map(Err).collect()),
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl AnalysisProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "llm"
        }

        async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| {
                Ok(AnalysisResult::new(format!("{} looks healthy", request.kind), 0.9, 0.8))
            })
        }
    }

    struct Harness {
        analyzer: GuardedAnalyzer,
        provider: Arc<ScriptedProvider>,
        breaker: Arc<CircuitBreaker>,
        clock: Arc<ManualClock>,
    }

    fn harness(provider: ScriptedProvider) -> Harness {
        let clock = Arc::new(ManualClock::starting_now());
        let provider = Arc::new(provider);
        let cache = Arc::new(TtlCache::with_clock("ai-analysis", clock.clone()));
        let breaker = Arc::new(CircuitBreaker::with_clock(
            "llm",
            CircuitBreakerConfig::default().with_failure_threshold(2),
            clock.clone(),
        ));
        let analyzer = GuardedAnalyzer::new(provider.clone(), cache, breaker.clone()).with_retry(
            RetryPolicy::new(3)
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(20)),
        );
        Harness {
            analyzer,
            provider,
            breaker,
            clock,
        }
    }

    fn request(revenue: f64) -> AnalysisRequest {
        AnalysisRequest::new(
            "0190f5a4-0000-7000-8000-000000000001".parse::<TenantId>().unwrap(),
            AnalysisKind::Summary,
        )
        .with_metric("revenue", revenue)
    }

    #[tokio::test(start_paused = true)]
    async fn near_duplicate_requests_are_served_from_cache() {
        let h = harness(ScriptedProvider::default());

        let first = h.analyzer.analyze(&request(12_340.17)).await.unwrap();
        let second = h.analyzer.analyze(&request(12_389.90)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(h.provider.calls(), 1);

        h.clock.advance(DEFAULT_ANALYSIS_TTL + Duration::from_secs(1));
        h.analyzer.analyze(&request(12_340.17)).await.unwrap();
        assert_eq!(h.provider.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_provider_errors_are_retried_inside_one_breaker_call() {
        let h = harness(ScriptedProvider::failing_with(vec![
            AiError::provider(503, "overloaded"),
            AiError::Timeout,
        ]));

        h.analyzer.analyze(&request(1_000.0)).await.unwrap();

        assert_eq!(h.provider.calls(), 3);
        assert_eq!(h.breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn open_circuit_fails_fast_without_calling_the_provider() {
        let h = harness(ScriptedProvider::failing_with(vec![
            AiError::MissingCredentials,
            AiError::MissingCredentials,
        ]));

        // Fatal errors are not retried but still count against the breaker.
        let a = h.analyzer.analyze(&request(5_000.0)).await;
        assert!(matches!(a, Err(BreakerError::Inner(AiError::MissingCredentials))));
        let b = h.analyzer.analyze(&request(6_000.0)).await;
        assert!(matches!(b, Err(BreakerError::Inner(AiError::MissingCredentials))));
        assert_eq!(h.breaker.state(), CircuitState::Open);

        let calls = h.provider.calls();
        let err = h.analyzer.analyze(&request(7_000.0)).await.unwrap_err();
        assert!(err.is_open());
        assert_eq!(h.provider.calls(), calls);
    }

    #[tokio::test]
    async fn cached_result_survives_an_open_circuit() {
        let h = harness(ScriptedProvider::default());
        let cached = h.analyzer.analyze(&request(5_000.0)).await.unwrap();

        // Trip the breaker directly.
        for _ in 0..2 {
            let _ = h
                .breaker
                .execute(|| async { Err::<(), _>(AiError::provider(500, "down")) })
                .await;
        }
        assert_eq!(h.breaker.state(), CircuitState::Open);

        assert_eq!(h.analyzer.analyze(&request(5_010.0)).await.unwrap(), cached);
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_the_provider() {
        let h = harness(ScriptedProvider::default());
        let err = h.analyzer.analyze(&request(f64::INFINITY)).await.unwrap_err();

        assert!(matches!(err, BreakerError::Inner(AiError::InvalidInput(_))));
        assert_eq!(h.provider.calls(), 0);
    }
}
