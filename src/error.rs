//! Failure taxonomy for a provisioning run.
//!
//! Most code returns `anyhow::Result` with context attached at each layer.
//! [`ProvisionError`] marks the failures that change how a run ends:
//! precondition violations exit with code 2, everything else with code 1.
//! Best-effort step failures never surface here; the step runner logs and
//! records them instead.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Wrong privilege, missing parameter, missing mount point, missing tool.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A step's action (or its guard) failed; the phase stops here.
    #[error("step '{step}' failed: {message}")]
    StepFailed { step: String, message: String },

    /// The operator declined a confirmation prompt.
    #[error("aborted by operator")]
    Aborted,
}

impl ProvisionError {
    pub fn precondition(message: impl Into<String>) -> Self {
        ProvisionError::Precondition(message.into())
    }
}

/// Whether any error in the chain is a [`ProvisionError::Precondition`].
pub fn is_precondition(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<ProvisionError>(),
            Some(ProvisionError::Precondition(_))
        )
    })
}

/// Process exit code for a failed run.
pub fn exit_code(err: &anyhow::Error) -> u8 {
    if is_precondition(err) {
        2
    } else {
        1
    }
}
