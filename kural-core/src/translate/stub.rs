use std::time::Duration;

use parking_lot::Mutex;

use super::Translator;
use crate::error::{ErrorKind, StageError, StageResult};
use crate::scripted::Script;

/// Tags text with the target language; records every input it was given.
#[derive(Debug, Default)]
pub struct StubTranslator {
    script: Script,
    supported: Option<Vec<String>>,
    inputs: Mutex<Vec<String>>,
}

impl StubTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failures(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.script = self.script.failures(kinds);
        self
    }

    pub fn always_failing(mut self, kind: ErrorKind) -> Self {
        self.script = self.script.always(kind);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.script = self.script.delay(delay);
        self
    }

    /// Restrict accepted target codes.
    pub fn with_languages(mut self, codes: &[&str]) -> Self {
        self.supported = Some(codes.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn calls(&self) -> usize {
        self.script.calls()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }
}

impl Translator for StubTranslator {
    fn name(&self) -> &str {
        "stub"
    }

    fn translate(&self, text: &str, target_language: &str) -> StageResult<String> {
        self.inputs.lock().push(text.to_string());
        self.script.step("stub translator")?;
        if let Some(supported) = &self.supported {
            if !supported.iter().any(|c| c == target_language) {
                return Err(StageError::new(
                    ErrorKind::UnsupportedLanguage,
                    format!("stub translator has no '{target_language}'"),
                ));
            }
        }
        Ok(format!("[{target_language}] {text}"))
    }
}
