//! Typed error hierarchy for the orchestration engine.
//!
//! `PipelineError` covers the eight-row error taxonomy from the spec: user
//! errors, transient phase errors, builder failures, quality-gate failures,
//! budget exhaustion, shutdown requests, store I/O errors, and Graph RAG
//! unavailability. Each variant maps to one exit-code class in `cmd`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid config, missing PRD, bad CLI args. Exit 1, before state creation.
    #[error("{0}")]
    UserError(String),

    /// MCP server timeout, network blip — retried with backoff before surfacing.
    #[error("transient error in phase {phase}: {message}")]
    TransientPhaseError { phase: String, message: String },

    /// A single builder subprocess failed; the fleet continues regardless.
    #[error("builder '{service}' failed: {message}")]
    BuilderFailure { service: String, message: String },

    /// Blocking violations remained after `max_fix_retries`.
    #[error("quality gate failed after {fix_attempts} fix attempt(s)")]
    QualityGateFailure { fix_attempts: u32 },

    /// `total_cost >= limit`. Always terminal.
    #[error("budget exceeded: total_cost={total_cost} limit={limit}")]
    BudgetExceeded {
        total_cost: rust_decimal::Decimal,
        limit: rust_decimal::Decimal,
    },

    /// A shutdown signal was received. Always terminal; exit 130.
    #[error("shutdown requested")]
    ShutdownRequested,

    /// Disk/DB write failure. The prior committed state is never lost.
    #[error("state store I/O error at {path}: {source}")]
    StoreIOError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no state found in {0}")]
    NoStateError(PathBuf),

    /// Any MCP/client error during Graph RAG use. Always a silent fallback,
    /// this variant exists so callers can log the cause before falling back.
    #[error("graph rag unavailable: {0}")]
    GraphRAGUnavailable(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Process exit code for this error, per the spec's CLI contract:
    /// 1 = user error, 2 = pipeline failure, 130 = interrupted.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::UserError(_) => 1,
            PipelineError::ShutdownRequested => 130,
            _ => 2,
        }
    }
}
