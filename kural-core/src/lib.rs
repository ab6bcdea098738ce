//! # kural-core
//!
//! Staged speech relay engine: Tamil audio in, Tamil speech out.
//!
//! ## Architecture
//!
//! ```text
//! input file → Normalize → Transcribe → [Enrich] → Translate → Synthesize
//!                  │            │           │           │           │
//!                  └────────────┴─── StageLedger (sqlite) ──────────┘
//!                                           │
//!                              StageTransition → tracing / JSONL / broadcast
//! ```
//!
//! Every stage is a trait seam with a real adapter (ffmpeg or hound/rubato,
//! whisper-cli, Gemini, LibreTranslate, espeak-ng) and a deterministic stub.
//! The ledger makes a run resumable: succeeded stages are never re-invoked.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod engine;
pub mod enrich;
pub mod error;
pub mod events;
pub mod inference;
pub mod ledger;
pub mod process;
pub mod run;
pub mod scripted;
pub mod stage;
pub mod synth;
pub mod translate;

#[cfg(all(test, feature = "http"))]
mod fake_http;

// Convenience re-exports for downstream crates
pub use engine::{
    CancelToken, Collaborators, EngineConfig, Orchestrator, PipelineResult, RetryPolicy,
    RunOptions, StageFailure,
};
pub use error::{ErrorKind, KuralError, LedgerError, StageError};
pub use events::StageTransition;
pub use ledger::{MemoryLedger, SqliteLedger, StageLedger};
pub use run::{PipelineRun, RunId, RunStatus};
pub use stage::{Stage, StageRecord, StageStatus};
