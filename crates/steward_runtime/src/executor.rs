//! Launching and terminating units of work.
//!
//! The [`Launcher`] trait is the seam between supervision and execution. The
//! [`LocalLauncher`] runs entries from an [`EntryRegistry`] as tokio tasks, catches
//! panics, and reports every exit exactly once.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use steward_core::{ChildId, MemberId};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::descriptor::StartDescriptor;
use crate::monitor::{classify, ExitNotice, ExitReason};
use crate::registry::{EntryRegistry, WorkContext};

/// How long a child may take to stop after being asked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownBudget {
    /// Terminate immediately without asking
    BrutalKill,
    /// Ask, then force after the duration
    Timeout(Duration),
    /// Ask and wait however long it takes
    Infinity,
}

impl ShutdownBudget {
    /// Upper bound used to order drains. `Infinity` sorts last.
    #[must_use]
    pub fn limit(&self) -> Option<Duration> {
        match self {
            Self::BrutalKill => Some(Duration::ZERO),
            Self::Timeout(limit) => Some(*limit),
            Self::Infinity => None,
        }
    }
}

impl Default for ShutdownBudget {
    fn default() -> Self {
        Self::Timeout(Duration::from_secs(5))
    }
}

/// Opaque reference to a running child instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChildHandle {
    /// Member hosting the instance
    pub member: MemberId,
    /// Child id
    pub child: ChildId,
    /// Launch counter on that member
    pub incarnation: u64,
}

impl ChildHandle {
    /// Create a new handle
    #[must_use]
    pub fn new(member: MemberId, child: ChildId, incarnation: u64) -> Self {
        Self { member, child, incarnation }
    }
}

impl std::fmt::Display for ChildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.child, self.member.short(), self.incarnation)
    }
}

/// Everything a launcher needs to start one instance
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// Hosting member
    pub member: MemberId,
    /// Child id
    pub child: ChildId,
    /// Launch counter
    pub incarnation: u64,
    /// What to run
    pub descriptor: StartDescriptor,
    /// Where the exit notice goes
    pub exits: mpsc::UnboundedSender<ExitNotice>,
}

/// Launch failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LaunchError {
    /// No entry registered under this name
    #[error("unknown entry point: {entry}")]
    UnknownEntry { entry: String },

    /// Launcher no longer accepts work
    #[error("launcher closed")]
    Closed,
}

/// Starts units of work on this member
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start one instance
    ///
    /// # Errors
    ///
    /// Returns error if the descriptor cannot be launched
    async fn launch(&self, request: LaunchRequest) -> Result<RunningChild, LaunchError>;
}

/// Control side of a launched instance
#[derive(Debug, Clone)]
pub struct RunningChild {
    handle: ChildHandle,
    shutdown: CancellationToken,
    kill: CancellationToken,
    exited: watch::Receiver<Option<ExitReason>>,
}

impl RunningChild {
    /// Assemble from its parts. Launchers other than [`LocalLauncher`] use this.
    #[must_use]
    pub fn new(
        handle: ChildHandle,
        shutdown: CancellationToken,
        kill: CancellationToken,
        exited: watch::Receiver<Option<ExitReason>>,
    ) -> Self {
        Self { handle, shutdown, kill, exited }
    }

    /// Handle of this instance
    #[must_use]
    pub fn handle(&self) -> &ChildHandle {
        &self.handle
    }

    /// Whether the instance has ended
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.exited.borrow().is_some()
    }

    /// Wait for the instance to end
    pub async fn wait(&self) -> ExitReason {
        let mut exited = self.exited.clone();
        match exited.wait_for(Option::is_some).await {
            Ok(reason) => {
                let reason: Option<ExitReason> = (*reason).clone();
                reason.unwrap_or(ExitReason::Killed)
            }
            // Sender dropped without a value: the task died outside our control
            Err(_) => ExitReason::Killed,
        }
    }

    /// Stop the instance within `budget` and return its exit reason
    pub async fn terminate(&self, budget: ShutdownBudget) -> ExitReason {
        match budget {
            ShutdownBudget::BrutalKill => self.kill.cancel(),
            ShutdownBudget::Timeout(limit) => {
                self.shutdown.cancel();
                if tokio::time::timeout(limit, self.wait()).await.is_err() {
                    debug!("Child {} ignored shutdown for {:?}, killing", self.handle, limit);
                    self.kill.cancel();
                }
            }
            ShutdownBudget::Infinity => self.shutdown.cancel(),
        }
        self.wait().await
    }

    /// Terminate immediately
    pub async fn kill(&self) -> ExitReason {
        self.kill.cancel();
        self.wait().await
    }
}

/// Runs registered entries as tokio tasks on this process
#[derive(Debug, Clone)]
pub struct LocalLauncher {
    registry: Arc<EntryRegistry>,
}

impl LocalLauncher {
    /// Create a launcher over a registry
    #[must_use]
    pub fn new(registry: Arc<EntryRegistry>) -> Self {
        Self { registry }
    }

    /// Registry backing this launcher
    #[must_use]
    pub fn registry(&self) -> &EntryRegistry {
        &self.registry
    }
}

#[async_trait]
impl Launcher for LocalLauncher {
    async fn launch(&self, request: LaunchRequest) -> Result<RunningChild, LaunchError> {
        let LaunchRequest { member, child, incarnation, descriptor, exits } = request;

        let entry = self.registry.get(&descriptor.entry).ok_or_else(|| LaunchError::UnknownEntry {
            entry: descriptor.entry.clone(),
        })?;
        if exits.is_closed() {
            return Err(LaunchError::Closed);
        }

        let shutdown = CancellationToken::new();
        let kill = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(None);
        let handle = ChildHandle::new(member, child.clone(), incarnation);

        let ctx = WorkContext {
            member,
            child: child.clone(),
            incarnation,
            args: descriptor.args,
            shutdown: shutdown.clone(),
        };
        // The entry call itself runs inside the guarded future so a panic while
        // building the work is reported like any other panic.
        let work = async move { entry(ctx).await };

        let task_shutdown = shutdown.clone();
        let task_kill = kill.clone();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            let reason = tokio::select! {
                biased;
                () = task_kill.cancelled() => ExitReason::Killed,
                outcome = AssertUnwindSafe(work).catch_unwind() => {
                    classify(outcome, task_shutdown.is_cancelled())
                }
            };

            if reason.is_abnormal() {
                warn!("Child {} exited: {}", task_handle, reason);
            } else {
                debug!("Child {} exited: {}", task_handle, reason);
            }

            let _ = exited_tx.send(Some(reason.clone()));
            let _ = exits.send(ExitNotice { child, incarnation, reason });
        });

        Ok(RunningChild::new(handle, shutdown, kill, exited_rx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launcher() -> LocalLauncher {
        let mut registry = EntryRegistry::new();
        registry.register("noop", |_ctx| async { Ok(()) }).unwrap();
        registry.register("fail", |_ctx| async { Err("boom".to_string()) }).unwrap();
        registry
            .register("panic", |ctx: WorkContext| async move {
                if ctx.incarnation > 0 {
                    panic!("kaboom");
                }
                Ok(())
            })
            .unwrap();
        registry
            .register("cooperative", |ctx: WorkContext| async move {
                ctx.shutdown_requested().await;
                Ok(())
            })
            .unwrap();
        registry
            .register("stubborn", |_ctx| async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .unwrap();
        LocalLauncher::new(Arc::new(registry))
    }

    fn request(entry: &str, exits: &mpsc::UnboundedSender<ExitNotice>) -> LaunchRequest {
        LaunchRequest {
            member: MemberId::from_name("a"),
            child: ChildId::from("c"),
            incarnation: 1,
            descriptor: StartDescriptor::new(entry),
            exits: exits.clone(),
        }
    }

    #[tokio::test]
    async fn test_normal_exit_reports_notice() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let child = launcher().launch(request("noop", &tx)).await.unwrap();

        assert_eq!(child.wait().await, ExitReason::Normal);
        assert!(child.is_finished());

        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.child, ChildId::from("c"));
        assert_eq!(notice.incarnation, 1);
        assert_eq!(notice.reason, ExitReason::Normal);
    }

    #[tokio::test]
    async fn test_error_and_panic_are_abnormal() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let launcher = launcher();

        let failed = launcher.launch(request("fail", &tx)).await.unwrap();
        assert_eq!(failed.wait().await, ExitReason::Abnormal("boom".to_string()));

        let panicked = launcher.launch(request("panic", &tx)).await.unwrap();
        let reason = panicked.wait().await;
        assert!(reason.is_abnormal());
        assert!(reason.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_cooperative_shutdown() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let child = launcher().launch(request("cooperative", &tx)).await.unwrap();

        let reason = child.terminate(ShutdownBudget::Timeout(Duration::from_secs(1))).await;
        assert_eq!(reason, ExitReason::Shutdown);
    }

    #[tokio::test]
    async fn test_timeout_escalates_to_kill() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let child = launcher().launch(request("stubborn", &tx)).await.unwrap();

        let reason = child.terminate(ShutdownBudget::Timeout(Duration::from_millis(20))).await;
        assert_eq!(reason, ExitReason::Killed);
    }

    #[tokio::test]
    async fn test_brutal_kill() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let child = launcher().launch(request("cooperative", &tx)).await.unwrap();

        assert_eq!(child.terminate(ShutdownBudget::BrutalKill).await, ExitReason::Killed);
        assert_eq!(rx.recv().await.unwrap().reason, ExitReason::Killed);
    }

    #[tokio::test]
    async fn test_unknown_entry() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = launcher().launch(request("missing", &tx)).await.unwrap_err();
        assert_eq!(err, LaunchError::UnknownEntry { entry: "missing".to_string() });
    }

    #[test]
    fn test_budget_limit_order() {
        assert_eq!(ShutdownBudget::BrutalKill.limit(), Some(Duration::ZERO));
        assert_eq!(ShutdownBudget::default().limit(), Some(Duration::from_secs(5)));
        assert_eq!(ShutdownBudget::Infinity.limit(), None);
    }

    #[test]
    fn test_handle_display() {
        let handle = ChildHandle::new(MemberId::from_name("a"), ChildId::from("job"), 3);
        let shown = handle.to_string();
        assert!(shown.starts_with("job@"));
        assert!(shown.ends_with("#3"));
    }
}
