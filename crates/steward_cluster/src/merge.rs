//! Duplicate resolution after clusters merge.
//!
//! Two partitions, or two clusters started independently, may each run an
//! instance of the same child id. Once their states merge, every member sees
//! all live running claims. The keeper is picked by rendezvous over the
//! claimants, a total order every member computes identically; the others
//! yield.

use std::collections::BTreeMap;
use steward_core::{ChildId, MemberId};

use crate::placement::place;
use crate::state::ClusterState;
use crate::table::ChildReport;

/// Locally running children that `local` must give up
#[must_use]
pub fn duplicate_losers(state: &ClusterState, local: MemberId, running: &[ChildId]) -> Vec<ChildId> {
    running
        .iter()
        .filter(|id| {
            let claimants: Vec<MemberId> = state
                .children
                .live_running(id, &state.members)
                .map(|claim| claim.member())
                .collect();
            if claimants.len() < 2 || !claimants.contains(&local) {
                return false;
            }
            place(id, &claimants).is_ok_and(|keeper| keeper != local)
        })
        .cloned()
        .collect()
}

/// Union of per-member child reports, one row per id.
///
/// A child reported running by several members is shown at the member the
/// duplicate resolver would keep. Terminal rows only fill ids nobody runs.
#[must_use]
pub fn union_reports(collected: Vec<(MemberId, Vec<ChildReport>)>) -> Vec<ChildReport> {
    let mut running: BTreeMap<ChildId, Vec<ChildReport>> = BTreeMap::new();
    let mut terminal: BTreeMap<ChildId, ChildReport> = BTreeMap::new();

    for (_, reports) in collected {
        for report in reports {
            if report.handle.is_some() {
                running.entry(report.id.clone()).or_default().push(report);
            } else {
                terminal.entry(report.id.clone()).or_insert(report);
            }
        }
    }

    let mut union: BTreeMap<ChildId, ChildReport> = BTreeMap::new();
    for (id, mut reports) in running {
        let claimants: Vec<MemberId> = reports
            .iter()
            .filter_map(|report| report.handle.as_ref().map(|handle| handle.member))
            .collect();
        let keeper = place(&id, &claimants).ok();
        let index = reports
            .iter()
            .position(|report| report.handle.as_ref().map(|handle| handle.member) == keeper)
            .unwrap_or(0);
        union.insert(id, reports.swap_remove(index));
    }
    for (id, report) in terminal {
        union.entry(id).or_insert(report);
    }
    union.into_values().collect()
}
