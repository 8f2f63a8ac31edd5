use crate::objects::Indexed;
use access_controller_core::{ClientRecord, ConfigReadError, Identity, Ipv4Net, ObjectRef};
use access_controller_firewall::{Op, SetName};
use parking_lot::RwLock;
use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::Ipv4Addr,
    sync::Arc,
};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

pub type SharedIndex = Arc<RwLock<Index>>;

/// Holds all active clients and discovered objects.
#[derive(Debug)]
pub struct Index {
    /// Active clients. Every client here has a bound address.
    pub(crate) clients: HashMap<Identity, ClientRecord>,

    /// Discovered objects with the clients each currently grants.
    pub(crate) objects: HashMap<ObjectRef, Indexed>,

    ops: UnboundedSender<Op>,
}

/// A descriptor read result, as handed to the index.
pub type Descriptor = (Identity, Result<ClientRecord, ConfigReadError>);

// === impl Index ===

impl Index {
    pub fn new(ops: UnboundedSender<Op>) -> Self {
        Self {
            clients: HashMap::default(),
            objects: HashMap::default(),
            ops,
        }
    }

    pub fn shared(ops: UnboundedSender<Op>) -> SharedIndex {
        Arc::new(RwLock::new(Self::new(ops)))
    }

    pub fn client(&self, identity: &Identity) -> Option<&ClientRecord> {
        self.clients.get(identity)
    }

    #[inline]
    pub fn is_active(&self, identity: &Identity) -> bool {
        self.clients.contains_key(identity)
    }

    /// Lists active clients in order.
    pub fn identities(&self) -> Vec<Identity> {
        let mut ids = self.clients.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Replaces a client's descriptor and rebuilds its grant set.
    ///
    /// A descriptor that could not be read, or that binds no address, tears down a previously
    /// active client.
    pub fn reload(&mut self, identity: Identity, descriptor: Result<ClientRecord, ConfigReadError>) {
        if let Some(previous) = self.stage(identity.clone(), descriptor) {
            self.publish(vec![(identity, previous)]);
        }
    }

    /// Replaces a batch of descriptors, rebuilding all affected grant sets in a single pass over
    /// the indexed objects.
    pub fn reload_all(&mut self, descriptors: impl IntoIterator<Item = Descriptor>) {
        let batch = descriptors
            .into_iter()
            .filter_map(|(id, descriptor)| {
                let previous = self.stage(id.clone(), descriptor)?;
                Some((id, previous))
            })
            .collect::<Vec<_>>();
        info!(clients = batch.len(), "Reloaded client descriptors");
        self.publish(batch);
    }

    /// Reloads every descriptor present and tears down every active client whose descriptor is
    /// no longer present.
    pub fn rescan(&mut self, descriptors: Vec<Descriptor>) {
        let present = descriptors
            .iter()
            .map(|(id, _)| id.clone())
            .collect::<HashSet<_>>();
        let stale = self
            .clients
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect::<Vec<_>>();
        for id in stale {
            info!(identity = %id, "Descriptor no longer present");
            self.teardown(&id);
        }
        self.reload_all(descriptors);
    }

    /// Tears down a client whose descriptor was removed.
    pub fn remove(&mut self, identity: &Identity) {
        if self.teardown(identity) {
            info!(%identity, "Descriptor removed");
        } else {
            debug!(%identity, "Descriptor removed for inactive client");
        }
    }

    /// Removes block rules that no active client accounts for, such as those of clients whose
    /// descriptors were deleted while the controller was not running. Sets that no longer belong
    /// to an active client are destroyed.
    pub fn prune(&mut self, installed: Vec<(SetName, Ipv4Addr)>) {
        let mut stale = BTreeSet::new();
        for (set, client) in installed {
            let owner = self
                .clients
                .iter()
                .find(|(id, _)| SetName::grants(id) == set)
                .map(|(_, record)| record.address);
            match owner {
                Some(address) if address == Some(client) => continue,
                Some(_) => {}
                None => {
                    stale.insert(set.clone());
                }
            }
            info!(%set, %client, "Removing leftover block rule");
            self.send(Op::RemoveBlockRule { set, client });
        }

        for set in stale {
            self.send(Op::FlushSet(set.clone()));
            self.send(Op::DestroySet(set));
        }
    }

    /// Records a descriptor in the client table, returning the client's previous address (if
    /// any) when the client must be published.
    fn stage(
        &mut self,
        identity: Identity,
        descriptor: Result<ClientRecord, ConfigReadError>,
    ) -> Option<Option<Ipv4Addr>> {
        let record = match descriptor {
            Ok(record) => record,
            Err(error) if error.is_not_found() => {
                debug!(%identity, "Descriptor does not exist");
                ClientRecord::unbound(identity.clone())
            }
            Err(error) => {
                warn!(%identity, %error, "Treating unreadable descriptor as unbound");
                ClientRecord::unbound(identity.clone())
            }
        };

        if let Err(error) = SetName::validate(&identity) {
            error!(%identity, %error, "Client cannot be enforced");
            return None;
        }

        if record.address.is_none() {
            if self.teardown(&identity) {
                info!(%identity, "Client no longer has an address");
            } else {
                debug!(%identity, "Client has no address");
            }
            return None;
        }

        let previous = self
            .clients
            .insert(identity, record)
            .and_then(|prior| prior.address);
        Some(previous)
    }

    /// Rebuilds the grant sets of the given clients and installs their block rules.
    ///
    /// Membership is assembled in a staging set and swapped into place, so the live set is never
    /// observed partially populated and the block rule never leaves the client unrestricted.
    fn publish(&mut self, batch: Vec<(Identity, Option<Ipv4Addr>)>) {
        if batch.is_empty() {
            return;
        }

        let mut members = batch
            .iter()
            .filter_map(|(id, _)| {
                let client = self.clients.get(id)?;
                let nets = client.static_networks().collect::<BTreeSet<_>>();
                Some((id.clone(), nets))
            })
            .collect::<HashMap<_, _>>();

        for indexed in self.objects.values_mut() {
            for (id, nets) in members.iter_mut() {
                let granted = match (indexed.object.address, self.clients.get(id)) {
                    (Some(addr), Some(client)) => match client.grant(&indexed.object) {
                        Some(rule) => {
                            nets.insert(Ipv4Net::from(addr));
                            debug!(identity = %id, object = %indexed.reference(), %rule, "Granted");
                            true
                        }
                        None => false,
                    },
                    _ => false,
                };
                if granted {
                    indexed.granted.insert(id.clone());
                } else {
                    indexed.granted.remove(id);
                }
            }
        }

        for (id, previous) in batch {
            let (Some(nets), Some(address)) = (
                members.remove(&id),
                self.clients.get(&id).and_then(|c| c.address),
            ) else {
                continue;
            };
            let live = SetName::grants(&id);
            let staging = SetName::staging(&id);
            info!(identity = %id, %address, members = nets.len(), "Activating client");

            self.send(Op::EnsureSet(live.clone()));
            self.send(Op::EnsureSet(staging.clone()));
            self.send(Op::FlushSet(staging.clone()));
            for net in nets {
                self.send(Op::AddMember {
                    set: staging.clone(),
                    net,
                });
            }
            self.send(Op::SwapSets {
                from: staging.clone(),
                to: live.clone(),
            });
            self.send(Op::DestroySet(staging));
            self.send(Op::InstallBlockRule {
                set: live.clone(),
                client: address,
            });
            if let Some(old) = previous.filter(|old| *old != address) {
                info!(identity = %id, %old, %address, "Client address changed");
                self.send(Op::RemoveBlockRule {
                    set: live,
                    client: old,
                });
            }
        }
    }

    /// Removes a client and all of its enforcement state. Returns false if the client was not
    /// active.
    fn teardown(&mut self, identity: &Identity) -> bool {
        let Some(client) = self.clients.remove(identity) else {
            return false;
        };
        for indexed in self.objects.values_mut() {
            indexed.granted.remove(identity);
        }

        let live = SetName::grants(identity);
        if let Some(address) = client.address {
            self.send(Op::RemoveBlockRule {
                set: live.clone(),
                client: address,
            });
        }
        self.send(Op::FlushSet(live.clone()));
        self.send(Op::DestroySet(live));
        true
    }

    pub(crate) fn send(&self, op: Op) {
        if self.ops.send(op).is_err() {
            error!("Enforcer is not running");
        }
    }
}
