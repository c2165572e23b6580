//! Quorum-based leader election
//!
//! Term counter plus voted-for per node, guarded by a single mutex. A
//! follower that hears no leader for a randomized election timeout makes
//! itself a candidate, votes for itself, and asks its peers; a strict
//! majority of the member set wins. Stale terms are rejected everywhere,
//! and a leader that cannot reach a majority steps down.

use crate::cluster::types::NodeId;
use rand::Rng;
use std::ops::Range;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug)]
struct ElectionState {
    term: u64,
    voted_for: Option<NodeId>,
    role: Role,
    leader: Option<NodeId>,
    last_leader_contact: Instant,
}

pub struct Election {
    local_id: NodeId,
    state: Mutex<ElectionState>,
}

impl Election {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            state: Mutex::new(ElectionState {
                term: 0,
                voted_for: None,
                role: Role::Follower,
                leader: None,
                last_leader_contact: Instant::now(),
            }),
        }
    }

    pub fn current_term(&self) -> u64 {
        self.state.lock().expect("election state poisoned").term
    }

    pub fn role(&self) -> Role {
        self.state.lock().expect("election state poisoned").role
    }

    pub fn leader(&self) -> Option<NodeId> {
        self.state.lock().expect("election state poisoned").leader.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.role() == Role::Leader
    }

    /// Time since the last accepted leader heartbeat.
    pub fn leader_silence(&self) -> Duration {
        self.state
            .lock()
            .expect("election state poisoned")
            .last_leader_contact
            .elapsed()
    }

    /// Randomized election timeout, resampled per attempt.
    pub fn random_timeout(range_ms: Range<u64>) -> Duration {
        let ms = rand::thread_rng().gen_range(range_ms);
        Duration::from_millis(ms)
    }

    /// A leader heartbeat arrived. Stale terms are rejected; an equal or
    /// newer term makes this node a follower of that leader.
    pub fn observe_leader(&self, term: u64, leader: &NodeId) -> bool {
        let mut state = self.state.lock().expect("election state poisoned");
        if term < state.term {
            debug!(
                "Rejecting stale leader heartbeat from {} (term {} < {})",
                leader, term, state.term
            );
            return false;
        }
        if term > state.term {
            state.term = term;
            state.voted_for = None;
        }
        if state.role != Role::Follower && state.leader.as_ref() != Some(leader) {
            info!("Yielding to leader {} at term {}", leader, term);
        }
        state.role = Role::Follower;
        state.leader = Some(leader.clone());
        state.last_leader_contact = Instant::now();
        true
    }

    /// Answer a RequestVote. Stale terms are refused; a higher term makes
    /// this node a follower with a fresh vote. Within a term the tie-break
    /// is deterministic: between two candidates the lower id wins, so a
    /// voter moves its vote to a lower-id rival — including away from its
    /// own candidacy. Once a leader is established for the term the vote
    /// is frozen; rivals are refused rather than risk a second winner.
    pub fn handle_request_vote(&self, candidate: &NodeId, term: u64) -> (bool, u64) {
        let mut state = self.state.lock().expect("election state poisoned");

        if term < state.term {
            return (false, state.term);
        }
        if term > state.term {
            state.term = term;
            state.voted_for = None;
            if state.role != Role::Follower {
                info!("Stepping down: higher term {} from {}", term, candidate);
                state.role = Role::Follower;
                state.leader = None;
            }
        }

        let current_vote = state.voted_for.clone();
        let granted = match current_vote {
            None => true,
            Some(ref voted) if voted == candidate => true,
            Some(_) if state.leader.is_some() => false,
            Some(ref voted) if candidate < voted => {
                if voted == &self.local_id && state.role == Role::Candidate {
                    info!("Yielding candidacy to lower-id candidate {}", candidate);
                    state.role = Role::Follower;
                } else {
                    info!("Moving term-{} vote from {} to lower-id {}", term, voted, candidate);
                }
                true
            }
            Some(_) => false,
        };

        if granted {
            state.voted_for = Some(candidate.clone());
            state.last_leader_contact = Instant::now();
        }
        (granted, state.term)
    }

    /// Become a candidate: bump the term, vote for self.
    /// Returns the new term.
    pub fn start_candidacy(&self) -> u64 {
        let mut state = self.state.lock().expect("election state poisoned");
        state.term += 1;
        state.role = Role::Candidate;
        state.voted_for = Some(self.local_id.clone());
        state.leader = None;
        info!("{} starting election for term {}", self.local_id, state.term);
        state.term
    }

    /// Promote to leader if still a candidate at `term`.
    pub fn become_leader(&self, term: u64) -> bool {
        let mut state = self.state.lock().expect("election state poisoned");
        if state.role == Role::Candidate && state.term == term {
            info!("{} elected leader at term {}", self.local_id, term);
            state.role = Role::Leader;
            state.leader = Some(self.local_id.clone());
            state.last_leader_contact = Instant::now();
            true
        } else {
            false
        }
    }

    /// Demote: lost the election or lost majority support.
    pub fn step_down(&self, term: u64) {
        let mut state = self.state.lock().expect("election state poisoned");
        if state.role != Role::Follower {
            warn!("{} stepping down at term {}", self.local_id, state.term);
        }
        if term > state.term {
            state.term = term;
            state.voted_for = None;
        }
        state.role = Role::Follower;
        if state.leader.as_deref() == Some(self.local_id.as_str()) {
            state.leader = None;
        }
    }
}
