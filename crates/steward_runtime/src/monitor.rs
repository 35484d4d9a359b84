//! Exit monitoring.
//!
//! Every launched unit of work ends with exactly one [`ExitNotice`] delivered to
//! its supervisor. The reason says whether the exit counts as a failure.

use serde::{Deserialize, Serialize};
use std::any::Any;
use steward_core::ChildId;

use crate::registry::WorkResult;

/// Why a unit of work ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Work returned successfully on its own
    Normal,
    /// Work returned after the supervisor asked it to stop
    Shutdown,
    /// Work failed or panicked
    Abnormal(String),
    /// Work was forcibly terminated
    Killed,
}

impl ExitReason {
    /// Whether this exit counts as a failure for restart decisions
    #[must_use]
    pub fn is_abnormal(&self) -> bool {
        matches!(self, Self::Abnormal(_) | Self::Killed)
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Shutdown => write!(f, "shutdown"),
            Self::Abnormal(reason) => write!(f, "abnormal: {}", reason),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Delivered to the supervisor when a launched child ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitNotice {
    /// Child that ended
    pub child: ChildId,
    /// Launch counter of the instance that ended
    pub incarnation: u64,
    /// Exit reason
    pub reason: ExitReason,
}

/// Turn the outcome of a unit of work into an exit reason.
///
/// `outcome` is the result of running the work under `catch_unwind`.
#[must_use]
pub fn classify(
    outcome: Result<WorkResult, Box<dyn Any + Send>>,
    shutdown_requested: bool,
) -> ExitReason {
    match outcome {
        Ok(Ok(())) if shutdown_requested => ExitReason::Shutdown,
        Ok(Ok(())) => ExitReason::Normal,
        Ok(Err(reason)) => ExitReason::Abnormal(reason),
        Err(payload) => ExitReason::Abnormal(format!("panicked: {}", panic_message(&payload))),
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
