//! Typed failure modes of the retrieval and answering pipeline.
//!
//! Recoverable conditions (`StaleIndex`) are handled by pipeline branches;
//! invariant violations (`MalformedClaim`, `LoopBudgetExceeded`) abort the
//! run with full trace detail rather than best-efforting an answer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The active manifest no longer matches the live chunk store, or the
    /// configured embedding backend differs from the one the index was
    /// built with. Vector search refuses to serve results in this state.
    #[error("vector index is stale: {reason}")]
    StaleIndex { reason: String },

    /// A claim without citations reached the verifier boundary.
    #[error("claim '{claim_id}' has no citations")]
    MalformedClaim { claim_id: String },

    /// A second expansion or repair was requested. The orchestrator's
    /// budget counters make this unreachable; seeing it means an
    /// internal-consistency fault.
    #[error("loop budget exceeded at stage '{stage}'")]
    LoopBudgetExceeded { stage: String },
}
