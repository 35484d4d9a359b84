//! Steward Runtime
//!
//! Local execution for supervised children: a registry of named entry points,
//! a launcher that runs them as tasks, and exit classification.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod descriptor;
pub mod executor;
pub mod monitor;
pub mod registry;

pub use descriptor::StartDescriptor;
pub use executor::{
    ChildHandle, LaunchError, LaunchRequest, Launcher, LocalLauncher, RunningChild, ShutdownBudget,
};
pub use monitor::{classify, ExitNotice, ExitReason};
pub use registry::{EntryFn, EntryRegistry, RegistryError, WorkContext, WorkResult};
