//! Local child table.
//!
//! Only the member running a child materialises a record for it. The table is
//! owned by the [`LocalSupervisor`](crate::supervisor::LocalSupervisor) and always
//! accessed under its lock.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use steward_core::ChildId;
use steward_runtime::{ChildHandle, ExitReason, RunningChild};
use tokio::time::Instant;

use crate::spec::{ChildKind, WorkerSpec};

/// Bound on restarts of one child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartIntensity {
    /// Restarts allowed inside the window
    pub max_restarts: u32,
    /// Window length in milliseconds
    pub within_ms: u64,
}

impl RestartIntensity {
    /// Create a new bound
    #[must_use]
    pub const fn new(max_restarts: u32, within_ms: u64) -> Self {
        Self { max_restarts, within_ms }
    }

    /// Window length
    #[must_use]
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.within_ms)
    }
}

impl Default for RestartIntensity {
    fn default() -> Self {
        Self::new(3, 5000)
    }
}

/// Where a record is in its lifecycle
#[derive(Debug, Clone)]
pub enum ChildPhase {
    /// Instance running
    Running(RunningChild),
    /// Instance being terminated
    Stopping(RunningChild),
    /// No instance; terminal until re-submitted
    Exited,
}

/// A locally owned child
#[derive(Debug, Clone)]
pub struct ChildRecord {
    /// Spec
    pub spec: WorkerSpec,
    /// Lifecycle phase
    pub phase: ChildPhase,
    /// Last exit reason, if any
    pub last_exit: Option<ExitReason>,
    restarts: VecDeque<Instant>,
}

impl ChildRecord {
    /// Create a record for a freshly launched child
    #[must_use]
    pub fn running(spec: WorkerSpec, child: RunningChild) -> Self {
        Self {
            spec,
            phase: ChildPhase::Running(child),
            last_exit: None,
            restarts: VecDeque::new(),
        }
    }

    /// Create a terminal record
    #[must_use]
    pub fn exited(spec: WorkerSpec, reason: ExitReason) -> Self {
        Self {
            spec,
            phase: ChildPhase::Exited,
            last_exit: Some(reason),
            restarts: VecDeque::new(),
        }
    }

    /// Running or stopping instance
    #[must_use]
    pub fn instance(&self) -> Option<&RunningChild> {
        match &self.phase {
            ChildPhase::Running(child) | ChildPhase::Stopping(child) => Some(child),
            ChildPhase::Exited => None,
        }
    }

    /// Handle of the running or stopping instance
    #[must_use]
    pub fn handle(&self) -> Option<&ChildHandle> {
        self.instance().map(RunningChild::handle)
    }

    /// Whether the record is in the running phase
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.phase, ChildPhase::Running(_))
    }

    /// Record a restart at `now`. Returns false if the intensity is exceeded.
    pub fn allow_restart(&mut self, intensity: &RestartIntensity, now: Instant) -> bool {
        let window = intensity.window();
        while self
            .restarts
            .front()
            .is_some_and(|at| now.saturating_duration_since(*at) > window)
        {
            self.restarts.pop_front();
        }
        if self.restarts.len() >= intensity.max_restarts as usize {
            return false;
        }
        self.restarts.push_back(now);
        true
    }

    /// Report for queries
    #[must_use]
    pub fn report(&self) -> ChildReport {
        ChildReport {
            id: self.spec.id.clone(),
            kind: self.spec.kind,
            handle: self.handle().cloned(),
        }
    }
}

/// One row of `which_children`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildReport {
    /// Child id
    pub id: ChildId,
    /// Worker or supervisor
    pub kind: ChildKind,
    /// Handle if running, `None` for terminal records
    pub handle: Option<ChildHandle>,
}

/// Result of `count_children`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildCounts {
    /// Known child ids
    pub specs: usize,
    /// Ids with a running instance
    pub active: usize,
    /// Ids of kind worker
    pub workers: usize,
    /// Ids of kind supervisor
    pub supervisors: usize,
}

impl ChildCounts {
    /// Tally a set of reports
    #[must_use]
    pub fn from_reports(reports: &[ChildReport]) -> Self {
        reports.iter().fold(Self::default(), |mut counts, report| {
            counts.specs += 1;
            if report.handle.is_some() {
                counts.active += 1;
            }
            match report.kind {
                ChildKind::Worker => counts.workers += 1,
                ChildKind::Supervisor => counts.supervisors += 1,
            }
            counts
        })
    }
}

/// Table of locally owned children
#[derive(Debug)]
pub struct ChildTable {
    records: IndexMap<ChildId, ChildRecord>,
    next_incarnation: u64,
}

impl ChildTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: IndexMap::new(),
            next_incarnation: 1,
        }
    }

    /// Allocate a launch counter
    pub fn next_incarnation(&mut self) -> u64 {
        let incarnation = self.next_incarnation;
        self.next_incarnation += 1;
        incarnation
    }

    /// Get a record
    #[must_use]
    pub fn get(&self, id: &ChildId) -> Option<&ChildRecord> {
        self.records.get(id)
    }

    /// Get a record mutably
    pub fn get_mut(&mut self, id: &ChildId) -> Option<&mut ChildRecord> {
        self.records.get_mut(id)
    }

    /// Insert or replace a record
    pub fn insert(&mut self, record: ChildRecord) {
        self.records.insert(record.spec.id.clone(), record);
    }

    /// Remove a record
    pub fn remove(&mut self, id: &ChildId) -> Option<ChildRecord> {
        self.records.shift_remove(id)
    }

    /// Check for a record
    #[must_use]
    pub fn contains(&self, id: &ChildId) -> bool {
        self.records.contains_key(id)
    }

    /// All records in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &ChildRecord> {
        self.records.values()
    }

    /// Drain every record
    pub fn drain(&mut self) -> Vec<ChildRecord> {
        self.records.drain(..).map(|(_, record)| record).collect()
    }

    /// Ids of records in the running phase
    #[must_use]
    pub fn running_ids(&self) -> Vec<ChildId> {
        self.records
            .values()
            .filter(|record| record.is_running())
            .map(|record| record.spec.id.clone())
            .collect()
    }

    /// Reports for every record
    #[must_use]
    pub fn reports(&self) -> Vec<ChildReport> {
        self.records.values().map(ChildRecord::report).collect()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl Default for ChildTable {
    fn default() -> Self {
        Self::new()
    }
}
