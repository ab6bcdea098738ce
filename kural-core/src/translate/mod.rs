//! Text translation contract.

#[cfg(feature = "http")]
pub mod libre;
pub mod stub;

#[cfg(feature = "http")]
pub use libre::{LibreConfig, LibreTranslator};
pub use stub::StubTranslator;

use crate::error::StageResult;

pub trait Translator: Send + Sync {
    fn name(&self) -> &str;

    /// Fails with `UnsupportedLanguage` (terminal) or `ServiceUnavailable` (retryable).
    fn translate(&self, text: &str, target_language: &str) -> StageResult<String>;
}
