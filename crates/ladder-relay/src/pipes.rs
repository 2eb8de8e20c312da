//! Exit-side bookkeeping of pipes requested by entry nodes.
//!
//! A pipe is identified by the entry node's code and the entry-side
//! terminus code. While the backend connect for it is outstanding the pipe
//! is "in progress"; once connected it is "established" and indexed by the
//! entry node so that losing the whole entry node tears all of them down.
//!
//! Teardown signals that arrive while a connect is still outstanding leave
//! an ignore marker. The connect outcome that later observes the marker
//! consumes it and is swallowed instead of being reported. A terminus code
//! can be reused by the entry node while an ignored attempt is still
//! outstanding, so both sets count attempts rather than flag them; any two
//! outstanding attempts for the same pair are interchangeable because each
//! is a fresh backend connection.

use std::collections::HashMap;

use ladder_proto::NodeCode;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PipeError {
    #[error("pipe {entry_node}/{entry_terminus} is not in progress")]
    NotInProgress {
        entry_node: NodeCode,
        entry_terminus: NodeCode,
    },

    #[error("pipe {entry_node}/{entry_terminus} is already established")]
    AlreadyEstablished {
        entry_node: NodeCode,
        entry_terminus: NodeCode,
    },
}

/// What a successful backend connect should turn into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Established {
    /// Report `PIPE_MADE`.
    Live,
    /// The entry side already gave up; close the backend quietly.
    Ignored,
}

/// Outcome of a `PIPE_FAIL` sent by the entry node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TheirFailure {
    /// Connect still outstanding; an ignore marker was left.
    Marked,
    /// Pipe was up; carries the exit-side terminus to close quietly.
    Established(NodeCode),
    /// Nothing left to undo.
    AlreadyResolved,
}

#[derive(Debug, Default)]
struct PeerPipes {
    in_progress: HashMap<NodeCode, u32>,
    ignored: HashMap<NodeCode, u32>,
    /// Entry terminus to exit terminus.
    established: HashMap<NodeCode, NodeCode>,
}

impl PeerPipes {
    fn is_empty(&self) -> bool {
        self.in_progress.is_empty() && self.ignored.is_empty() && self.established.is_empty()
    }

    fn count(map: &HashMap<NodeCode, u32>, key: NodeCode) -> u32 {
        map.get(&key).copied().unwrap_or(0)
    }

    /// Decrements a counter, returning false if it was already zero.
    fn take(map: &mut HashMap<NodeCode, u32>, key: NodeCode) -> bool {
        match map.get_mut(&key) {
            Some(n) if *n > 1 => {
                *n -= 1;
                true
            }
            Some(_) => {
                map.remove(&key);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct PipeTracker {
    peers: HashMap<NodeCode, PeerPipes>,
}

impl PipeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&mut self, entry_node: NodeCode) {
        if self.peers.get(&entry_node).is_some_and(PeerPipes::is_empty) {
            self.peers.remove(&entry_node);
        }
    }

    /// Records a `MAKE_PIPE` whose backend connect is about to start.
    pub fn link_attempt(
        &mut self,
        entry_node: NodeCode,
        entry_terminus: NodeCode,
    ) -> Result<(), PipeError> {
        let peer = self.peers.entry(entry_node).or_default();
        if peer.established.contains_key(&entry_terminus) {
            return Err(PipeError::AlreadyEstablished {
                entry_node,
                entry_terminus,
            });
        }
        *peer.in_progress.entry(entry_terminus).or_insert(0) += 1;
        Ok(())
    }

    /// Backend connect succeeded and was registered as `exit_terminus`.
    pub fn link_established(
        &mut self,
        entry_node: NodeCode,
        entry_terminus: NodeCode,
        exit_terminus: NodeCode,
    ) -> Result<Established, PipeError> {
        let not_in_progress = PipeError::NotInProgress {
            entry_node,
            entry_terminus,
        };
        let peer = self.peers.get_mut(&entry_node).ok_or(not_in_progress)?;
        if !PeerPipes::take(&mut peer.in_progress, entry_terminus) {
            return Err(not_in_progress);
        }
        let outcome = if PeerPipes::take(&mut peer.ignored, entry_terminus) {
            Established::Ignored
        } else {
            peer.established.insert(entry_terminus, exit_terminus);
            Established::Live
        };
        self.prune(entry_node);
        Ok(outcome)
    }

    /// Backend connect failed. Returns whether `PIPE_FAIL` must be sent.
    pub fn link_failed_our_end(
        &mut self,
        entry_node: NodeCode,
        entry_terminus: NodeCode,
    ) -> Result<bool, PipeError> {
        let not_in_progress = PipeError::NotInProgress {
            entry_node,
            entry_terminus,
        };
        let peer = self.peers.get_mut(&entry_node).ok_or(not_in_progress)?;
        if !PeerPipes::take(&mut peer.in_progress, entry_terminus) {
            return Err(not_in_progress);
        }
        let notify = !PeerPipes::take(&mut peer.ignored, entry_terminus);
        self.prune(entry_node);
        Ok(notify)
    }

    /// The entry node gave up on a pipe before it saw `PIPE_MADE`.
    pub fn link_failed_their_end(
        &mut self,
        entry_node: NodeCode,
        entry_terminus: NodeCode,
    ) -> TheirFailure {
        let Some(peer) = self.peers.get_mut(&entry_node) else {
            return TheirFailure::AlreadyResolved;
        };
        let outcome = if PeerPipes::count(&peer.in_progress, entry_terminus)
            > PeerPipes::count(&peer.ignored, entry_terminus)
        {
            *peer.ignored.entry(entry_terminus).or_insert(0) += 1;
            TheirFailure::Marked
        } else if let Some(exit_terminus) = peer.established.remove(&entry_terminus) {
            TheirFailure::Established(exit_terminus)
        } else {
            TheirFailure::AlreadyResolved
        };
        self.prune(entry_node);
        outcome
    }

    /// An established pipe ended; drops it from the per-entry index.
    pub fn link_lost(&mut self, entry_node: NodeCode, entry_terminus: NodeCode) -> bool {
        let removed = self
            .peers
            .get_mut(&entry_node)
            .and_then(|peer| peer.established.remove(&entry_terminus))
            .is_some();
        self.prune(entry_node);
        removed
    }

    /// The whole entry node vanished.
    ///
    /// Returns the exit-side termini of its established pipes and marks
    /// every outstanding attempt as ignored.
    pub fn links_lost(&mut self, entry_node: NodeCode) -> Vec<NodeCode> {
        let Some(peer) = self.peers.get_mut(&entry_node) else {
            return Vec::new();
        };
        let mut ours: Vec<NodeCode> = peer.established.drain().map(|(_, exit)| exit).collect();
        ours.sort_unstable();
        peer.ignored = peer.in_progress.clone();
        self.prune(entry_node);
        ours
    }

    pub fn in_progress(&self, entry_node: NodeCode, entry_terminus: NodeCode) -> bool {
        self.peers
            .get(&entry_node)
            .is_some_and(|p| p.in_progress.contains_key(&entry_terminus))
    }

    pub fn established(&self, entry_node: NodeCode, entry_terminus: NodeCode) -> Option<NodeCode> {
        self.peers
            .get(&entry_node)
            .and_then(|p| p.established.get(&entry_terminus).copied())
    }

    /// Number of entry nodes with any pipe state.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
