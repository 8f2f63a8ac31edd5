//! An in-memory driver that models ipset/iptables semantics for tests.

use crate::{Driver, Error, Op, SetName};
use access_controller_core::Ipv4Net;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
    sync::Arc,
};
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Clone, Debug, Default)]
pub struct RecordingFirewall {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
struct State {
    sets: BTreeMap<SetName, BTreeSet<Ipv4Net>>,
    block_rules: Vec<(SetName, Ipv4Addr)>,
    failures: Vec<String>,
}

// === impl RecordingFirewall ===

impl RecordingFirewall {
    /// Applies every queued operation, returning them in order.
    pub async fn drain(&self, ops: &mut UnboundedReceiver<Op>) -> Vec<Op> {
        let mut applied = Vec::new();
        while let Ok(op) = ops.try_recv() {
            // Failures are recorded by the driver methods.
            let _ = op.apply(self).await;
            applied.push(op);
        }
        applied
    }

    pub fn members(&self, set: &SetName) -> Option<BTreeSet<Ipv4Net>> {
        self.state.lock().sets.get(set).cloned()
    }

    pub fn set_exists(&self, set: &SetName) -> bool {
        self.state.lock().sets.contains_key(set)
    }

    pub fn contains(&self, set: &SetName, net: impl Into<Ipv4Net>) -> bool {
        let net = net.into();
        self.state
            .lock()
            .sets
            .get(set)
            .map(|members| members.contains(&net))
            .unwrap_or(false)
    }

    pub fn has_block_rule(&self, set: &SetName, client: Ipv4Addr) -> bool {
        self.state
            .lock()
            .block_rules
            .iter()
            .any(|(s, c)| s == set && *c == client)
    }

    pub fn block_rules(&self) -> Vec<(SetName, Ipv4Addr)> {
        self.state.lock().block_rules.clone()
    }

    pub fn failures(&self) -> Vec<String> {
        self.state.lock().failures.clone()
    }

    fn update(&self, f: impl FnOnce(&mut State) -> Result<(), Error>) -> Result<(), Error> {
        let mut state = self.state.lock();
        let res = f(&mut state);
        if let Err(error) = &res {
            state.failures.push(error.to_string());
        }
        res
    }
}

#[async_trait::async_trait]
impl Driver for RecordingFirewall {
    async fn probe(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn ensure_set(&self, set: &SetName) -> Result<(), Error> {
        self.update(|state| {
            state.sets.entry(set.clone()).or_default();
            Ok(())
        })
    }

    async fn flush_set(&self, set: &SetName) -> Result<(), Error> {
        self.update(|state| {
            state.set_mut(set)?.clear();
            Ok(())
        })
    }

    async fn destroy_set(&self, set: &SetName) -> Result<(), Error> {
        self.update(|state| {
            if state.block_rules.iter().any(|(s, _)| s == set) {
                return Err(Error::SetInUse(set.clone()));
            }
            state
                .sets
                .remove(set)
                .map(|_| ())
                .ok_or_else(|| Error::NoSuchSet(set.clone()))
        })
    }

    async fn swap_sets(&self, from: &SetName, to: &SetName) -> Result<(), Error> {
        self.update(|state| {
            let a = state.set_mut(from)?.clone();
            let b = std::mem::replace(state.set_mut(to)?, a);
            *state.set_mut(from)? = b;
            Ok(())
        })
    }

    async fn add_member(&self, set: &SetName, net: Ipv4Net) -> Result<(), Error> {
        self.update(|state| {
            state.set_mut(set)?.insert(net);
            Ok(())
        })
    }

    async fn remove_member(&self, set: &SetName, addr: Ipv4Addr) -> Result<(), Error> {
        self.update(|state| {
            state.set_mut(set)?.remove(&Ipv4Net::from(addr));
            Ok(())
        })
    }

    async fn install_block_rule(&self, set: &SetName, client: Ipv4Addr) -> Result<(), Error> {
        self.update(|state| {
            if !state.sets.contains_key(set) {
                return Err(Error::NoSuchSet(set.clone()));
            }
            if !state
                .block_rules
                .iter()
                .any(|(s, c)| s == set && *c == client)
            {
                state.block_rules.insert(0, (set.clone(), client));
            }
            Ok(())
        })
    }

    async fn remove_block_rule(&self, set: &SetName, client: Ipv4Addr) -> Result<(), Error> {
        self.update(|state| {
            state
                .block_rules
                .retain(|(s, c)| !(s == set && *c == client));
            Ok(())
        })
    }

    async fn block_rules(&self) -> Result<Vec<(SetName, Ipv4Addr)>, Error> {
        Ok(self.state.lock().block_rules.clone())
    }
}

// === impl State ===

impl State {
    fn set_mut(&mut self, set: &SetName) -> Result<&mut BTreeSet<Ipv4Net>, Error> {
        self.sets
            .get_mut(set)
            .ok_or_else(|| Error::NoSuchSet(set.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idempotent_semantics() {
        let fw = RecordingFirewall::default();
        let set = SetName::grants(&"alice".into());
        let addr = Ipv4Addr::new(10, 1, 2, 50);
        let client = Ipv4Addr::new(10, 8, 0, 2);

        fw.ensure_set(&set).await.unwrap();
        fw.ensure_set(&set).await.unwrap();
        fw.add_member(&set, addr.into()).await.unwrap();
        fw.add_member(&set, addr.into()).await.unwrap();
        assert_eq!(fw.members(&set).unwrap().len(), 1);

        fw.remove_member(&set, addr).await.unwrap();
        fw.remove_member(&set, addr).await.unwrap();
        assert!(fw.members(&set).unwrap().is_empty());

        fw.install_block_rule(&set, client).await.unwrap();
        fw.install_block_rule(&set, client).await.unwrap();
        assert_eq!(fw.block_rules().len(), 1);

        fw.remove_block_rule(&set, client).await.unwrap();
        fw.remove_block_rule(&set, client).await.unwrap();
        assert!(fw.block_rules().is_empty());

        assert!(fw.failures().is_empty());
    }

    #[tokio::test]
    async fn swap_exchanges_members() {
        let fw = RecordingFirewall::default();
        let live = SetName::grants(&"alice".into());
        let staging = SetName::staging(&"alice".into());
        let old: Ipv4Net = "10.1.0.0/16".parse().unwrap();
        let new: Ipv4Net = "10.2.0.0/16".parse().unwrap();

        fw.ensure_set(&live).await.unwrap();
        fw.ensure_set(&staging).await.unwrap();
        fw.add_member(&live, old).await.unwrap();
        fw.add_member(&staging, new).await.unwrap();
        fw.swap_sets(&staging, &live).await.unwrap();

        assert_eq!(fw.members(&live).unwrap(), Some(new).into_iter().collect::<BTreeSet<_>>());
        assert_eq!(fw.members(&staging).unwrap(), Some(old).into_iter().collect::<BTreeSet<_>>());
    }

    #[tokio::test]
    async fn failed_swap_leaves_members() {
        let fw = RecordingFirewall::default();
        let live = SetName::grants(&"alice".into());
        let staging = SetName::staging(&"alice".into());
        let net: Ipv4Net = "10.1.0.0/16".parse().unwrap();

        fw.ensure_set(&staging).await.unwrap();
        fw.add_member(&staging, net).await.unwrap();
        assert!(matches!(
            fw.swap_sets(&staging, &live).await,
            Err(Error::NoSuchSet(_))
        ));
        assert!(fw.contains(&staging, net));
        assert!(!fw.set_exists(&live));
    }

    #[tokio::test]
    async fn referenced_sets_cannot_be_destroyed() {
        let fw = RecordingFirewall::default();
        let set = SetName::grants(&"alice".into());
        let client = Ipv4Addr::new(10, 8, 0, 2);

        assert!(fw.install_block_rule(&set, client).await.is_err());
        fw.ensure_set(&set).await.unwrap();
        fw.install_block_rule(&set, client).await.unwrap();
        assert!(matches!(
            fw.destroy_set(&set).await,
            Err(Error::SetInUse(_))
        ));
        fw.remove_block_rule(&set, client).await.unwrap();
        fw.destroy_set(&set).await.unwrap();
        assert!(!fw.set_exists(&set));
        assert_eq!(fw.failures().len(), 2);
    }
}
