//! Remote text enrichment.
//!
//! Enrichment is optional: it can be switched off per run, and a failure
//! here never halts the pipeline. Its output is informational unless the
//! run asks for it to feed translation.

#[cfg(feature = "http")]
pub mod gemini;
pub mod stub;

#[cfg(feature = "http")]
pub use gemini::{GeminiClient, GeminiConfig};
pub use stub::StubEnricher;

use serde::{Deserialize, Serialize};

use crate::error::StageResult;

/// Processed text plus whatever structured output the service returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrichment {
    pub text: String,
    #[serde(default)]
    pub raw: serde_json::Value,
}

pub trait EnrichmentClient: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with `RateLimited` / `NetworkTimeout` (retryable) or `AuthError`.
    fn enrich(&self, text: &str) -> StageResult<Enrichment>;
}
