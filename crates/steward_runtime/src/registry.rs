//! Entry point registry.
//!
//! Every member registers the same named entry points. A start descriptor picks
//! one by name, so descriptors can travel between members as plain data.

use futures::future::{BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use steward_core::{ChildId, MemberId};
use tokio_util::sync::CancellationToken;

/// Result returned by a unit of work. `Err` marks an abnormal exit.
pub type WorkResult = Result<(), String>;

/// A registered entry point
pub type EntryFn = Arc<dyn Fn(WorkContext) -> BoxFuture<'static, WorkResult> + Send + Sync>;

/// Context handed to a running unit of work
#[derive(Debug, Clone)]
pub struct WorkContext {
    /// Member running this instance
    pub member: MemberId,
    /// Child id
    pub child: ChildId,
    /// Launch counter of this child on this member
    pub incarnation: u64,
    /// Arguments from the start descriptor
    pub args: serde_json::Value,
    /// Cancelled when the supervisor asks the work to stop
    pub shutdown: CancellationToken,
}

impl WorkContext {
    /// Whether the supervisor has asked this work to stop
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once the supervisor asks this work to stop
    pub async fn shutdown_requested(&self) {
        self.shutdown.cancelled().await;
    }

    /// Decode the descriptor arguments
    ///
    /// # Errors
    ///
    /// Returns error if the arguments do not match `T`
    pub fn args_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.args.clone())
    }
}

/// Error from registry operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Entry already registered
    AlreadyRegistered { name: String },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRegistered { name } => write!(f, "Entry already registered: {}", name),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Registry of named entry points
#[derive(Clone, Default)]
pub struct EntryRegistry {
    entries: IndexMap<String, EntryFn>,
}

impl EntryRegistry {
    /// Create a new empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry point
    ///
    /// # Errors
    ///
    /// Returns error if the name is already taken
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, entry: F) -> Result<(), RegistryError>
    where
        F: Fn(WorkContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = WorkResult> + Send + 'static,
    {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::AlreadyRegistered { name });
        }

        let entry: EntryFn = Arc::new(move |ctx| entry(ctx).boxed());
        self.entries.insert(name, entry);
        Ok(())
    }

    /// Look up an entry point
    #[must_use]
    pub fn get(&self, name: &str) -> Option<EntryFn> {
        self.entries.get(name).cloned()
    }

    /// Check if an entry point exists
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of registered entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for EntryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryRegistry")
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
