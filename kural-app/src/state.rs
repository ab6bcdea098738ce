//! Host state: settings, the shared ledger and the orchestrator built from them.
//!
//! Built once on the main thread before the Tokio runtime starts, because the
//! blocking HTTP clients inside the native collaborators own a runtime of
//! their own and must not be created (or dropped) from async context.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use kural_core::audio::{AudioNormalizer, AutoNormalizer, FfmpegNormalizer, WavNormalizer};
use kural_core::enrich::{GeminiClient, GeminiConfig};
use kural_core::inference::{WhisperCliConfig, WhisperCliTranscriber};
use kural_core::synth::{EspeakConfig, EspeakSynthesizer};
use kural_core::translate::{LibreConfig, LibreTranslator};
use kural_core::{Collaborators, Orchestrator, RunOptions, SqliteLedger, StageLedger};
use tracing::{info, warn};

use crate::settings::AppSettings;

pub struct AppState {
    pub settings: AppSettings,
    pub ledger: Arc<SqliteLedger>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn build(settings: AppSettings) -> anyhow::Result<Self> {
        let ledger_path = settings.ledger_path();
        let ledger = Arc::new(
            SqliteLedger::new(ledger_path.clone())
                .with_context(|| format!("opening ledger at {}", ledger_path.display()))?,
        );
        let collaborators = build_collaborators(&settings)?;
        let shared: Arc<dyn StageLedger> = ledger.clone();
        let orchestrator = Arc::new(Orchestrator::new(
            settings.engine_config(),
            collaborators,
            shared,
        ));
        info!(
            backend = %settings.backend,
            normalizer = %settings.normalizer,
            ledger = %ledger_path.display(),
            "kural host ready"
        );
        Ok(Self {
            settings,
            ledger,
            orchestrator,
        })
    }

    /// Run options for one input, from settings overlaid by CLI flags.
    pub fn base_options(&self, output_dir: Option<PathBuf>) -> RunOptions {
        RunOptions::new(output_dir.unwrap_or_else(|| self.settings.output_dir()))
            .target_language(&self.settings.target_language)
            .enrichment(self.settings.enrichment_enabled)
            .translate_enriched(self.settings.translate_enriched)
    }
}

fn build_collaborators(settings: &AppSettings) -> anyhow::Result<Collaborators> {
    if settings.backend == "stub" {
        warn!("using stub collaborators; outputs are placeholders");
        return Ok(Collaborators::stubs());
    }

    let normalizer: Arc<dyn AudioNormalizer> = match settings.normalizer.as_str() {
        "ffmpeg" => Arc::new(FfmpegNormalizer::new(settings.ffmpeg_binary.clone())),
        "wav" => Arc::new(WavNormalizer::new()),
        _ => Arc::new(AutoNormalizer::new(settings.ffmpeg_binary.clone())),
    };

    let model = settings
        .whisper_model
        .clone()
        .context("whisperModel must be set for the native backend (or set KURAL_WHISPER_MODEL)")?;
    let mut whisper = WhisperCliConfig::new(model);
    whisper.binary = settings.whisper_binary.clone();
    whisper.threads = settings.whisper_threads;

    let mut gemini = GeminiConfig::from_env();
    if let Some(key) = &settings.gemini_api_key {
        gemini.api_key = Some(key.clone());
    }
    if let Some(url) = &settings.gemini_api_url {
        gemini.url = url.clone();
    }
    if gemini.api_key.is_none() && settings.enrichment_enabled {
        warn!("no Gemini API key configured; enrichment will fail and runs end partially succeeded");
    }

    let translate = LibreConfig {
        url: settings.translate_url.clone(),
        api_key: settings.translate_api_key.clone(),
        ..LibreConfig::default()
    };

    let espeak = EspeakConfig {
        binary: settings.espeak_binary.clone(),
        ..EspeakConfig::default()
    };

    Ok(Collaborators {
        normalizer,
        transcriber: Arc::new(WhisperCliTranscriber::new(whisper)),
        enricher: Arc::new(GeminiClient::new(gemini).context("building Gemini client")?),
        translator: Arc::new(LibreTranslator::new(translate).context("building translate client")?),
        synthesizer: Arc::new(EspeakSynthesizer::new(espeak)),
    })
}
