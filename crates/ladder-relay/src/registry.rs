//! Node registry and node-code allocator.
//!
//! Every process keeps two code spaces: "upstream" holds positive codes
//! allocated upwards from 1, "downstream" holds negative codes allocated
//! downwards from -1. Vacated codes below the current extreme are queued
//! and handed out again before the range grows; the extreme itself simply
//! shrinks back.
//!
//! A boundary node registers its central relay link under the fixed code
//! [`CENTRAL_RELAY_NODE_CODE`](ladder_proto::CENTRAL_RELAY_NODE_CODE), which
//! is the only way code 0 ever enters a space.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use ladder_proto::NodeCode;
use thiserror::Error;

/// Which code space a link lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Upstream,
    Downstream,
}

impl Namespace {
    /// Namespace a non-zero code belongs to by its sign.
    pub fn of(code: NodeCode) -> Option<Self> {
        match code {
            c if c > 0 => Some(Namespace::Upstream),
            c if c < 0 => Some(Namespace::Downstream),
            _ => None,
        }
    }

    fn step(self) -> NodeCode {
        match self {
            Namespace::Upstream => 1,
            Namespace::Downstream => -1,
        }
    }

    fn admits(self, code: NodeCode) -> bool {
        Namespace::of(code) == Some(self)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Namespace::Upstream => "upstream",
            Namespace::Downstream => "downstream",
        })
    }
}

/// Errors related to code allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{0} code space exhausted")]
    AtCapacity(Namespace),

    #[error("node code {0} already in use")]
    CodeInUse(NodeCode),

    #[error("node code {code} does not belong to the {namespace} space")]
    WrongSign {
        code: NodeCode,
        namespace: Namespace,
    },
}

#[derive(Debug)]
struct CodeSpace<L> {
    namespace: Namespace,
    links: BTreeMap<NodeCode, L>,
    gaps: VecDeque<NodeCode>,
}

impl<L: Copy> CodeSpace<L> {
    fn new(namespace: Namespace) -> Self {
        Self {
            namespace,
            links: BTreeMap::new(),
            gaps: VecDeque::new(),
        }
    }

    /// Highest-magnitude code currently registered.
    fn extreme(&self) -> Option<NodeCode> {
        match self.namespace {
            Namespace::Upstream => self.links.keys().next_back().copied(),
            Namespace::Downstream => self.links.keys().next().copied(),
        }
    }

    fn allocate(&mut self) -> Result<NodeCode, RegistryError> {
        let extreme = self.extreme();
        // Gaps above a shrunken extreme are stale; extension reaches them again.
        while let Some(code) = self.gaps.pop_front() {
            let below = extreme.is_some_and(|e| code.unsigned_abs() < e.unsigned_abs());
            if below && !self.links.contains_key(&code) {
                return Ok(code);
            }
        }
        let step = self.namespace.step();
        match extreme {
            None => Ok(step),
            Some(last) => last
                .checked_add(step)
                .filter(|code| self.namespace.admits(*code))
                .ok_or(RegistryError::AtCapacity(self.namespace)),
        }
    }

    fn register(&mut self, link: L, assigned: Option<NodeCode>) -> Result<NodeCode, RegistryError> {
        let code = match assigned {
            Some(code) => {
                if code != 0 && !self.namespace.admits(code) {
                    return Err(RegistryError::WrongSign {
                        code,
                        namespace: self.namespace,
                    });
                }
                if self.links.contains_key(&code) {
                    return Err(RegistryError::CodeInUse(code));
                }
                code
            }
            None => self.allocate()?,
        };
        self.links.insert(code, link);
        Ok(code)
    }

    fn deregister(&mut self, code: NodeCode) -> Option<L> {
        let link = self.links.remove(&code)?;
        if code != 0
            && let Some(extreme) = self.extreme()
            && code.unsigned_abs() < extreme.unsigned_abs()
        {
            self.gaps.push_back(code);
        }
        Some(link)
    }
}

/// Per-process table of peer links keyed by node code.
#[derive(Debug)]
pub struct NodeRegistry<L> {
    upstream: CodeSpace<L>,
    downstream: CodeSpace<L>,
}

impl<L: Copy> Default for NodeRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: Copy> NodeRegistry<L> {
    pub fn new() -> Self {
        Self {
            upstream: CodeSpace::new(Namespace::Upstream),
            downstream: CodeSpace::new(Namespace::Downstream),
        }
    }

    fn space(&self, namespace: Namespace) -> &CodeSpace<L> {
        match namespace {
            Namespace::Upstream => &self.upstream,
            Namespace::Downstream => &self.downstream,
        }
    }

    fn space_mut(&mut self, namespace: Namespace) -> &mut CodeSpace<L> {
        match namespace {
            Namespace::Upstream => &mut self.upstream,
            Namespace::Downstream => &mut self.downstream,
        }
    }

    /// Registers `link` and returns its code.
    ///
    /// With `assigned`, that exact code is used after a uniqueness check.
    /// Otherwise a queued gap is reused, or the range grows by one step.
    pub fn register(
        &mut self,
        namespace: Namespace,
        link: L,
        assigned: Option<NodeCode>,
    ) -> Result<NodeCode, RegistryError> {
        self.space_mut(namespace).register(link, assigned)
    }

    pub fn register_upstream(&mut self, link: L) -> Result<NodeCode, RegistryError> {
        self.register(Namespace::Upstream, link, None)
    }

    pub fn register_downstream(&mut self, link: L) -> Result<NodeCode, RegistryError> {
        self.register(Namespace::Downstream, link, None)
    }

    pub fn lookup(&self, namespace: Namespace, code: NodeCode) -> Option<L> {
        self.space(namespace).links.get(&code).copied()
    }

    pub fn lookup_upstream(&self, code: NodeCode) -> Option<L> {
        self.lookup(Namespace::Upstream, code)
    }

    pub fn lookup_downstream(&self, code: NodeCode) -> Option<L> {
        self.lookup(Namespace::Downstream, code)
    }

    pub fn deregister(&mut self, namespace: Namespace, code: NodeCode) -> Option<L> {
        self.space_mut(namespace).deregister(code)
    }

    /// Codes currently registered in `namespace`, in ascending order.
    pub fn codes(&self, namespace: Namespace) -> Vec<NodeCode> {
        self.space(namespace).links.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.upstream.links.len() + self.downstream.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
