use crate::types::OperationHandle;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why the bundler refused `eth_sendUserOperation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BundlerRejection {
    /// Fee fields below what the bundler (or the op it would replace) requires.
    Underpriced,
    /// The nonce was already used; another operation won the race.
    NonceTooLow,
    InvalidSignature,
    /// An `AAxx` validation failure from the EntryPoint simulation.
    EntrypointSimulation,
    Other,
}

impl fmt::Display for BundlerRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BundlerRejection::Underpriced => "underpriced",
            BundlerRejection::NonceTooLow => "nonce too low",
            BundlerRejection::InvalidSignature => "invalid signature",
            BundlerRejection::EntrypointSimulation => "entrypoint simulation",
            BundlerRejection::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transient network error: {0}")]
    TransientNetwork(String),

    #[error("simulation reverted: {}", reason.as_deref().unwrap_or("<no reason>"))]
    SimulationReverted { reason: Option<String> },

    #[error("sponsorship denied ({code}): {reason}")]
    SponsorshipDenied { code: String, reason: String },

    /// The paymaster could not be used at all (auth, wrong URL, protocol
    /// mismatch). Unlike a decline this never triggers self-pay fallback.
    #[error("paymaster unavailable: {0}")]
    PaymasterUnavailable(String),

    #[error("paymaster response alters caller-controlled field `{field}`")]
    PaymasterTamper { field: &'static str },

    #[error("bundler rejected user operation ({kind}): {message}")]
    BundlerRejected {
        kind: BundlerRejection,
        message: String,
    },

    #[error("no receipt after {waited:?}; the operation may still land")]
    ReceiptTimeout { waited: Duration },

    /// Local polling was stopped, or a cancellation replacement landed in
    /// place of the batch.
    #[error("cancelled by caller")]
    Cancelled,

    #[error("signing failed: {0}")]
    Signing(String),
}

impl ExecError {
    pub fn rejected(kind: BundlerRejection, message: impl Into<String>) -> Self {
        ExecError::BundlerRejected {
            kind,
            message: message.into(),
        }
    }

    /// Whether the orchestrator may take the retry edge for this error.
    ///
    /// `InvalidSignature` and `EntrypointSimulation` are not listed: each gets
    /// exactly one rebuild, which the orchestrator tracks itself.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecError::TransientNetwork(_) => true,
            ExecError::BundlerRejected { kind, .. } => matches!(
                kind,
                BundlerRejection::Underpriced | BundlerRejection::NonceTooLow
            ),
            _ => false,
        }
    }

    pub fn rejection(&self) -> Option<BundlerRejection> {
        match self {
            ExecError::BundlerRejected { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Failure of a whole `send_calls` invocation.
///
/// Carries the last handle the bundler gave us, so the caller can keep polling
/// independently and never has to guess whether something was sent.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct SendError {
    #[source]
    pub error: ExecError,
    pub handle: Option<OperationHandle>,
}

impl SendError {
    pub fn new(error: ExecError, handle: Option<OperationHandle>) -> Self {
        Self { error, handle }
    }
}
