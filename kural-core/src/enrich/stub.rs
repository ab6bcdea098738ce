use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use super::{Enrichment, EnrichmentClient};
use crate::error::{ErrorKind, StageResult};
use crate::scripted::Script;

/// Prefixes the input with a marker so tests can tell enriched text apart.
#[derive(Debug, Default)]
pub struct StubEnricher {
    script: Script,
    inputs: Mutex<Vec<String>>,
}

impl StubEnricher {
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

    pub fn calls(&self) -> usize {
        self.script.calls()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().clone()
    }
}

impl EnrichmentClient for StubEnricher {
    fn name(&self) -> &str {
        "stub"
    }

    fn enrich(&self, text: &str) -> StageResult<Enrichment> {
        self.inputs.lock().push(text.to_string());
        self.script.step("stub enricher")?;
        Ok(Enrichment {
            text: format!("[enriched] {text}"),
            raw: json!({ "finishReason": "STOP" }),
        })
    }
}
