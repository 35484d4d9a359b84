//! Graceful and abrupt shutdown of a member.

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use steward_core::ChildId;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::membership::MemberStatus;
use crate::node::{Lifecycle, Node};
use crate::remote::StartReply;

/// What a graceful stop did with each local child
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Accepted by another member
    pub handed_off: Vec<ChildId>,
    /// Terminated and not restartable, or already terminal
    pub released: Vec<ChildId>,
    /// Restartable, but no member accepted it; left to failover
    pub dropped: Vec<ChildId>,
    /// Killed when the deadline passed
    pub forced: Vec<ChildId>,
    /// Whether the deadline passed
    pub timed_out: bool,
}

impl ShutdownReport {
    fn record(&mut self, drained: DrainResult) {
        match drained {
            DrainResult::HandedOff(id) => self.handed_off.push(id),
            DrainResult::Released(id) => self.released.push(id),
            DrainResult::Dropped(id) => self.dropped.push(id),
            DrainResult::Skipped => {}
        }
    }
}

enum DrainResult {
    HandedOff(ChildId),
    Released(ChildId),
    Dropped(ChildId),
    Skipped,
}

impl Node {
    /// Leave the cluster gracefully.
    ///
    /// Stops accepting work and announces `Leaving`, then terminates every
    /// local child concurrently within its shutdown budget, handing restartable
    /// ones to their new owner. Whatever still runs when the drain deadline
    /// passes is killed. Finally announces `Left` and stops the background
    /// tasks. Calling it again returns an empty report.
    ///
    /// The whole call finishes within `timeout`. The last
    /// `min(call_timeout, timeout / 2)` of it is kept for announcing `Left`;
    /// peers that miss the announcement find out through failure detection.
    pub async fn stop(&self, timeout: Duration) -> ShutdownReport {
        {
            let mut lifecycle = self.lifecycle.write().await;
            if *lifecycle != Lifecycle::Running {
                return ShutdownReport::default();
            }
            *lifecycle = Lifecycle::Leaving;
        }

        let deadline = Instant::now() + timeout;
        let drain_deadline = deadline - self.config.call_timeout().min(timeout / 2);
        info!("Member {} leaving", self.id.short());
        self.store.set_local_status(MemberStatus::Leaving).await;
        let _ = tokio::time::timeout_at(drain_deadline, self.gossip_round(true)).await;

        let mut report = ShutdownReport::default();
        let ids = self.supervisor.running_ids().await;
        {
            let mut drains: FuturesUnordered<_> = ids.iter().map(|id| self.drain_one(id)).collect();
            loop {
                match tokio::time::timeout_at(drain_deadline, drains.next()).await {
                    Ok(Some(drained)) => report.record(drained),
                    Ok(None) => break,
                    Err(_) => {
                        report.timed_out = true;
                        break;
                    }
                }
            }
        }

        report.forced = self.supervisor.kill_remaining().await;
        if report.timed_out {
            warn!(
                "Member {} stop timed out, killed {} children",
                self.id.short(),
                report.forced.len()
            );
        }

        self.store.set_local_status(MemberStatus::Left).await;
        let announce = deadline.max(Instant::now());
        if tokio::time::timeout_at(announce, self.gossip_round(true)).await.is_err() {
            warn!("Member {} could not announce its departure in time", self.id.short());
        }
        *self.lifecycle.write().await = Lifecycle::Stopped;
        self.background.cancel();

        info!(
            "Member {} left: {} handed off, {} released, {} dropped, {} forced",
            self.id.short(),
            report.handed_off.len(),
            report.released.len(),
            report.dropped.len(),
            report.forced.len()
        );
        report
    }

    async fn drain_one(&self, id: &ChildId) -> DrainResult {
        let drained = match self.supervisor.drain_child(id).await {
            Ok(Some(drained)) => drained,
            Ok(None) | Err(_) => return DrainResult::Skipped,
        };
        if !drained.handoff {
            return DrainResult::Released(id.clone());
        }

        let alive = self.store.alive().await;
        let owner = match self.config.placement.place(id, &alive) {
            Ok(owner) => owner,
            Err(e) => {
                warn!("No member to take {}: {}", id, e);
                return DrainResult::Dropped(id.clone());
            }
        };
        match self.client.handoff(owner, drained.spec).await {
            Ok(StartReply::Started(handle) | StartReply::AlreadyStarted(handle)) => {
                info!("Handed off {} to {}", id, handle);
                DrainResult::HandedOff(id.clone())
            }
            Ok(reply) => {
                warn!("Member {} refused {}: {:?}", owner.short(), id, reply);
                DrainResult::Dropped(id.clone())
            }
            Err(e) => {
                warn!("Handoff of {} to {} failed: {}", id, owner.short(), e);
                DrainResult::Dropped(id.clone())
            }
        }
    }

    /// Stop abruptly: kill every local child without handing anything off
    /// and stop the background tasks. Other members find out through failure
    /// detection, as if this member had crashed.
    pub async fn abort(&self) {
        *self.lifecycle.write().await = Lifecycle::Stopped;
        self.background.cancel();
        let killed = self.supervisor.kill_all().await;
        warn!("Member {} aborted, killed {} children", self.id.short(), killed);
    }
}
