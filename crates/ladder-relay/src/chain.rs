//! Relay chain table.
//!
//! Maps a local terminus code to the two hops that reach the matching
//! terminus on the opposite boundary node: that node's code at the central
//! relay, then its terminus code. A chain exists exactly while the pipe is
//! established.

use std::collections::HashMap;
use std::fmt;

use ladder_proto::{CONTROL_CODE, NodeCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RelayChain {
    /// Opposite boundary node, as addressed by the central relay.
    pub node: NodeCode,
    /// Terminus code on the opposite boundary node.
    pub terminus: NodeCode,
}

impl RelayChain {
    pub fn new(node: NodeCode, terminus: NodeCode) -> Self {
        Self { node, terminus }
    }

    /// Destination chain for raw payload of this pipe.
    pub fn hops(&self) -> [NodeCode; 2] {
        [self.node, self.terminus]
    }

    /// Destination chain for control messages to the opposite boundary node.
    pub fn control_hops(&self) -> [NodeCode; 2] {
        [self.node, CONTROL_CODE]
    }
}

impl fmt::Display for RelayChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.node, self.terminus)
    }
}

#[derive(Debug, Default)]
pub struct RelayChainTable {
    chains: HashMap<NodeCode, RelayChain>,
}

impl RelayChainTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `chain` under `terminus`, returning the chain it displaced.
    pub fn insert(&mut self, terminus: NodeCode, chain: RelayChain) -> Option<RelayChain> {
        self.chains.insert(terminus, chain)
    }

    pub fn get(&self, terminus: NodeCode) -> Option<RelayChain> {
        self.chains.get(&terminus).copied()
    }

    pub fn remove(&mut self, terminus: NodeCode) -> Option<RelayChain> {
        self.chains.remove(&terminus)
    }

    pub fn contains(&self, terminus: NodeCode) -> bool {
        self.chains.contains_key(&terminus)
    }

    pub fn clear(&mut self) {
        self.chains.clear();
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_returns_inserted_chain_once() {
        let mut table = RelayChainTable::new();
        let chain = RelayChain::new(-1, -7);
        assert_eq!(table.insert(3, chain), None);
        assert_eq!(table.get(3), Some(chain));
        assert_eq!(table.remove(3), Some(chain));
        assert_eq!(table.remove(3), None);
        assert!(table.is_empty());
    }

    #[test]
    fn insert_reports_displaced_chain() {
        let mut table = RelayChainTable::new();
        table.insert(1, RelayChain::new(1, 1));
        assert_eq!(
            table.insert(1, RelayChain::new(1, 2)),
            Some(RelayChain::new(1, 1))
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn hop_lists() {
        let chain = RelayChain::new(-1, -3);
        assert_eq!(chain.hops(), [-1, -3]);
        assert_eq!(chain.control_hops(), [-1, 0]);
        assert_eq!(chain.to_string(), "[-1, -3]");
    }
}
