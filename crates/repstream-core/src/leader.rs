//! Leader consistency tracking
//!
//! The election layer reports the group's current leader; streaming loops
//! act upon the node's own copy of that identity. The two only diverge
//! between an election result and the node's explicit [`LeaderStatusTracker::sync`].

use crate::{Error, NodeId, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Identity of a leader
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaderId {
    /// Host the leader listens on
    pub host: String,
    /// Replication port
    pub port: u16,
    /// Node id
    pub node_id: NodeId,
}

impl LeaderId {
    /// Leader `node_id` at `host:port`
    pub fn new(host: impl Into<String>, port: u16, node_id: NodeId) -> Self {
        Self {
            host: host.into(),
            port,
            node_id,
        }
    }
}

impl fmt::Display for LeaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_id, self.host, self.port)
    }
}

/// Election proposal that elected a leader; larger is newer
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Proposal(pub u64);

/// Receives election results
pub trait LeaderListener: Send + Sync {
    /// A leader was elected under `proposal`
    fn leader_elected(&self, leader: LeaderId, proposal: Proposal);
}

#[derive(Debug, Default)]
struct Status {
    group: Option<(LeaderId, Proposal)>,
    node: Option<(LeaderId, Proposal)>,
}

fn describe(side: &Option<(LeaderId, Proposal)>) -> String {
    match side {
        Some((id, proposal)) => format!("{} (proposal {})", id, proposal.0),
        None => "none".to_string(),
    }
}

/// Group-side and node-side leader identity for one node
pub struct LeaderStatusTracker {
    node_id: NodeId,
    status: Mutex<Status>,
    in_sync: AtomicBool,
}

impl LeaderStatusTracker {
    /// Tracker for node `node_id`; no leader is known yet
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: Mutex::new(Status::default()),
            in_sync: AtomicBool::new(false),
        }
    }

    fn compute(&self, status: &Status) -> bool {
        let (Some((node, node_proposal)), Some((group, group_proposal))) =
            (&status.node, &status.group)
        else {
            return false;
        };
        if node != group {
            return false;
        }
        node.node_id == self.node_id || group_proposal <= node_proposal
    }

    fn recompute(&self, status: &Status) -> bool {
        let in_sync = self.compute(status);
        self.in_sync.store(in_sync, Ordering::Release);
        in_sync
    }

    /// Record the group's leader.
    ///
    /// Re-affirming the node's current leader under a newer proposal syncs
    /// immediately; any other identity leaves the node out of sync.
    pub fn set_group_leader(&self, leader: LeaderId, proposal: Proposal) {
        let mut status = self.status.lock();
        let same_leader = status
            .node
            .as_ref()
            .is_some_and(|(current, _)| *current == leader);
        status.group = Some((leader.clone(), proposal));
        if same_leader {
            status.node = Some((leader, proposal));
        }
        let in_sync = self.recompute(&status);
        debug!(
            "Group leader now {}, node leader {}, in sync: {}",
            describe(&status.group),
            describe(&status.node),
            in_sync
        );
    }

    /// Adopt the group's leader as the node's
    pub fn sync(&self) -> bool {
        let mut status = self.status.lock();
        status.node = status.group.clone();
        let in_sync = self.recompute(&status);
        info!(
            "Node {} synced to leader {}",
            self.node_id,
            describe(&status.node)
        );
        in_sync
    }

    /// Unlocked check; re-verify with [`Self::assert_in_sync`] before acting
    pub fn in_sync(&self) -> bool {
        self.in_sync.load(Ordering::Relaxed)
    }

    /// Fail with `LeaderObsolete` unless in sync, re-checking under the lock
    pub fn assert_in_sync(&self) -> Result<()> {
        if self.in_sync() {
            return Ok(());
        }
        let status = self.status.lock();
        if self.compute(&status) {
            return Ok(());
        }
        Err(Error::LeaderObsolete {
            node_leader: describe(&status.node),
            group_leader: describe(&status.group),
        })
    }

    /// Whether this node is the leader it last synced to
    pub fn is_node_leader(&self) -> bool {
        self.status
            .lock()
            .node
            .as_ref()
            .is_some_and(|(id, _)| id.node_id == self.node_id)
    }

    /// Leader the node is acting upon
    pub fn node_leader(&self) -> Option<(LeaderId, Proposal)> {
        self.status.lock().node.clone()
    }

    /// Leader the group reported last
    pub fn group_leader(&self) -> Option<(LeaderId, Proposal)> {
        self.status.lock().group.clone()
    }
}

impl LeaderListener for LeaderStatusTracker {
    fn leader_elected(&self, leader: LeaderId, proposal: Proposal) {
        self.set_group_leader(leader, proposal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn a() -> LeaderId {
        LeaderId::new("node-a", 5001, 1)
    }

    fn b() -> LeaderId {
        LeaderId::new("node-b", 5001, 2)
    }

    #[test]
    fn test_sync_transition() {
        let tracker = LeaderStatusTracker::new(2);
        assert!(!tracker.in_sync());
        assert!(tracker.assert_in_sync().is_err());

        tracker.set_group_leader(a(), Proposal(1));
        assert!(!tracker.in_sync());
        assert!(tracker.sync());
        assert!(tracker.in_sync());
        assert!(!tracker.is_node_leader());

        tracker.set_group_leader(b(), Proposal(2));
        assert!(!tracker.in_sync());
        match tracker.assert_in_sync() {
            Err(Error::LeaderObsolete { group_leader, .. }) => {
                assert!(group_leader.contains("node-b"));
            }
            other => panic!("unexpected {other:?}"),
        }

        tracker.sync();
        assert!(tracker.in_sync());
        assert!(tracker.is_node_leader());
    }

    #[test]
    fn test_same_leader_newer_proposal_stays_in_sync() {
        let tracker = LeaderStatusTracker::new(2);
        tracker.set_group_leader(a(), Proposal(1));
        tracker.sync();

        tracker.set_group_leader(a(), Proposal(5));
        assert!(tracker.in_sync());
        assert_eq!(tracker.node_leader(), Some((a(), Proposal(5))));
    }

    #[test]
    fn test_port_change_is_a_new_identity() {
        let tracker = LeaderStatusTracker::new(3);
        tracker.leader_elected(a(), Proposal(1));
        tracker.sync();
        tracker.leader_elected(LeaderId::new("node-a", 5002, 1), Proposal(2));
        assert!(!tracker.in_sync());
        assert_eq!(tracker.node_leader(), Some((a(), Proposal(1))));
    }
}
