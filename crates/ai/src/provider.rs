use crate::request::AnalysisRequest;
use crate::result::{AiError, AnalysisResult};

/// A metered LLM backend.
///
/// Implementations make exactly one upstream call per `analyze` and report
/// failures as [`AiError`] so callers can classify them for retry and
/// breaker accounting.
#[async_trait::async_trait]
pub trait AnalysisProvider: Send + Sync {
    /// Dependency name used for the circuit breaker and in logs.
    fn name(&self) -> &str;

    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AiError>;
}
