//! Central relay bookkeeping: which exit nodes exist, which entry nodes are
//! attached to them, and who has to be told when either side disappears.

use std::collections::{BTreeSet, HashMap};

use ladder_proto::{NodeCode, RejectReason};

use crate::error::RelayError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitInfo {
    pub identifier: String,
    pub password: String,
    /// Port entry nodes for this exit should listen on.
    pub connect_port: u16,
    pub code: NodeCode,
    pub connected_entries: BTreeSet<NodeCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub exit_identifier: String,
    pub exit_code: NodeCode,
    /// The exit already went away; later signals about it are expected.
    pub lame_duck: bool,
}

/// An entry node's identify request passed the directory checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub exit_code: NodeCode,
    pub port: u16,
}

#[derive(Debug, Default)]
pub struct CentralDirectory {
    exit_codes: HashMap<String, NodeCode>,
    exits: HashMap<NodeCode, ExitInfo>,
    entries: HashMap<NodeCode, EntryInfo>,
}

impl CentralDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_exit(&self, identifier: &str) -> bool {
        self.exit_codes.contains_key(identifier)
    }

    pub fn exit(&self, code: NodeCode) -> Option<&ExitInfo> {
        self.exits.get(&code)
    }

    pub fn exit_by_identifier(&self, identifier: &str) -> Option<&ExitInfo> {
        self.exit_codes
            .get(identifier)
            .and_then(|code| self.exits.get(code))
    }

    pub fn entry(&self, code: NodeCode) -> Option<&EntryInfo> {
        self.entries.get(&code)
    }

    pub fn exit_count(&self) -> usize {
        self.exits.len()
    }

    /// Whether `entry` is attached to the live exit registered under `exit`.
    pub fn is_attached(&self, entry: NodeCode, exit: NodeCode) -> bool {
        self.exits
            .get(&exit)
            .is_some_and(|info| info.connected_entries.contains(&entry))
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Registers a freshly accepted exit node.
    pub fn add_exit(
        &mut self,
        identifier: String,
        password: String,
        connect_port: u16,
        code: NodeCode,
    ) -> Result<(), RejectReason> {
        if self.has_exit(&identifier) {
            return Err(RejectReason::IdInUse);
        }
        self.exit_codes.insert(identifier.clone(), code);
        self.exits.insert(
            code,
            ExitInfo {
                identifier,
                password,
                connect_port,
                code,
                connected_entries: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Checks an entry node's credentials against the exit it names.
    pub fn admit_entry(&self, identifier: &str, password: &str) -> Result<Admission, RejectReason> {
        let exit = self
            .exit_by_identifier(identifier)
            .ok_or(RejectReason::IdNotInUse)?;
        if exit.password != password {
            return Err(RejectReason::WrongPassword);
        }
        Ok(Admission {
            exit_code: exit.code,
            port: exit.connect_port,
        })
    }

    /// Attaches an accepted entry node to its exit.
    pub fn add_entry(&mut self, code: NodeCode, exit_code: NodeCode) -> Result<(), RelayError> {
        let exit = self.exits.get_mut(&exit_code).ok_or_else(|| {
            RelayError::consistency(format!("entry {code} attached to unknown exit {exit_code}"))
        })?;
        exit.connected_entries.insert(code);
        self.entries.insert(
            code,
            EntryInfo {
                exit_identifier: exit.identifier.clone(),
                exit_code,
                lame_duck: false,
            },
        );
        Ok(())
    }

    /// Forgets an entry node. Returns the exit that must hear about it.
    ///
    /// A lame duck's exit is already gone, so there is nobody to notify.
    pub fn remove_entry(&mut self, code: NodeCode) -> Result<Option<NodeCode>, RelayError> {
        let info = self
            .entries
            .remove(&code)
            .ok_or_else(|| RelayError::consistency(format!("no entry info for node {code}")))?;
        if let Some(exit) = self.exits.get_mut(&info.exit_code)
            && exit.identifier == info.exit_identifier
            && exit.connected_entries.remove(&code)
        {
            return Ok(Some(info.exit_code));
        }
        if info.lame_duck {
            Ok(None)
        } else {
            Err(RelayError::consistency(format!(
                "entry {code} lost its exit {} without being marked",
                info.exit_code
            )))
        }
    }

    /// Forgets an exit node and marks its entries as lame ducks.
    ///
    /// Returns the entries that still have to be told, each exactly once.
    pub fn remove_exit(&mut self, code: NodeCode) -> Result<Vec<NodeCode>, RelayError> {
        let exit = self
            .exits
            .remove(&code)
            .ok_or_else(|| RelayError::consistency(format!("no exit info for node {code}")))?;
        if self.exit_codes.get(&exit.identifier) == Some(&code) {
            self.exit_codes.remove(&exit.identifier);
        }
        let mut notify = Vec::with_capacity(exit.connected_entries.len());
        for entry_code in exit.connected_entries {
            if let Some(entry) = self.entries.get_mut(&entry_code)
                && !entry.lame_duck
            {
                entry.lame_duck = true;
                notify.push(entry_code);
            }
        }
        Ok(notify)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_exit() -> CentralDirectory {
        let mut dir = CentralDirectory::new();
        dir.add_exit("svc".into(), "pw".into(), 8080, -1).unwrap();
        dir
    }

    #[test]
    fn exit_identifier_is_unique() {
        let mut dir = with_exit();
        assert_eq!(
            dir.add_exit("svc".into(), "other".into(), 9090, -2),
            Err(RejectReason::IdInUse)
        );
        assert_eq!(dir.exit_count(), 1);
    }

    #[test]
    fn entry_admission() {
        let dir = with_exit();
        assert_eq!(
            dir.admit_entry("svc", "pw"),
            Ok(Admission {
                exit_code: -1,
                port: 8080
            })
        );
        assert_eq!(dir.admit_entry("nope", "pw"), Err(RejectReason::IdNotInUse));
        assert_eq!(dir.admit_entry("svc", "bad"), Err(RejectReason::WrongPassword));
    }

    #[test]
    fn entry_loss_notifies_exit() {
        let mut dir = with_exit();
        dir.add_entry(1, -1).unwrap();
        assert!(dir.exit(-1).unwrap().connected_entries.contains(&1));
        assert_eq!(dir.remove_entry(1).unwrap(), Some(-1));
        assert!(dir.exit(-1).unwrap().connected_entries.is_empty());
        assert!(dir.remove_entry(1).is_err());
    }

    #[test]
    fn exit_loss_fans_out_to_each_entry_once() {
        let mut dir = with_exit();
        dir.add_entry(1, -1).unwrap();
        dir.add_entry(2, -1).unwrap();

        assert_eq!(dir.remove_exit(-1).unwrap(), vec![1, 2]);
        assert!(dir.entry(1).unwrap().lame_duck);
        assert!(dir.entry(2).unwrap().lame_duck);
        assert!(!dir.has_exit("svc"));

        // lame ducks disconnect later without faulting or notifying anyone
        assert_eq!(dir.remove_entry(1).unwrap(), None);
        assert_eq!(dir.remove_entry(2).unwrap(), None);
        assert_eq!(dir.entry_count(), 0);
    }

    #[test]
    fn lame_duck_survives_exit_reregistration_on_same_code() {
        let mut dir = with_exit();
        dir.add_entry(1, -1).unwrap();
        dir.remove_exit(-1).unwrap();

        dir.add_exit("svc".into(), "pw".into(), 8080, -1).unwrap();
        dir.add_entry(2, -1).unwrap();

        assert_eq!(dir.remove_entry(1).unwrap(), None);
        assert_eq!(dir.exit(-1).unwrap().connected_entries.len(), 1);
        assert_eq!(dir.remove_entry(2).unwrap(), Some(-1));
    }

    #[test]
    fn attachment_does_not_carry_over_to_a_new_exit_on_the_same_code() {
        let mut dir = with_exit();
        dir.add_exit("other".into(), "pw".into(), 9090, -2).unwrap();
        dir.add_entry(1, -1).unwrap();
        assert!(dir.is_attached(1, -1));
        assert!(!dir.is_attached(1, -2));
        assert!(!dir.is_attached(2, -1));

        dir.remove_exit(-1).unwrap();
        dir.add_exit("svc".into(), "pw".into(), 8080, -1).unwrap();
        assert!(!dir.is_attached(1, -1));
    }

    #[test]
    fn unmarked_orphan_is_a_consistency_fault() {
        let mut dir = with_exit();
        dir.add_entry(1, -1).unwrap();
        // simulate tables drifting apart
        dir.exits.clear();
        assert!(matches!(dir.remove_entry(1), Err(RelayError::Consistency(_))));
    }
}
