use crate::Index;
use access_controller_core::{DiscoveredObject, Identity, Ipv4Net, Kind, ObjectRef};
use access_controller_firewall::{Op, SetName};
use std::{
    collections::{BTreeSet, HashSet},
    net::Ipv4Addr,
};
use tracing::{debug, info};

/// A discovered object and the clients it currently grants.
#[derive(Debug)]
pub(crate) struct Indexed {
    pub(crate) object: DiscoveredObject,
    pub(crate) granted: HashSet<Identity>,
}

// === impl Indexed ===

impl Indexed {
    pub(crate) fn reference(&self) -> ObjectRef {
        self.object.reference()
    }
}

// === impl Index ===

impl Index {
    /// Creates or updates a discovered object, granting its address to every client that matches
    /// it and revoking it from every client that no longer does.
    pub fn apply_object(&mut self, object: DiscoveredObject) {
        let reference = object.reference();
        let (prior_addr, prior_granted) = match self.objects.remove(&reference) {
            Some(Indexed { object, granted }) => (object.address, granted),
            None => (None, HashSet::new()),
        };

        let mut granted = HashSet::new();
        if let Some(addr) = object.address {
            for (id, client) in &self.clients {
                let Some(rule) = client.grant(&object) else {
                    continue;
                };
                granted.insert(id.clone());
                if prior_addr == Some(addr) && prior_granted.contains(id) {
                    continue;
                }
                info!(identity = %id, object = %reference, %addr, %rule, "Granting access");
                self.send(Op::AddMember {
                    set: SetName::grants(id),
                    net: Ipv4Net::from(addr),
                });
            }
        } else {
            debug!(object = %reference, "Ignoring object without an address");
        }

        if let Some(old) = prior_addr {
            for id in prior_granted {
                if object.address == Some(old) && granted.contains(&id) {
                    continue;
                }
                if self.still_granted(&id, old) {
                    debug!(identity = %id, object = %reference, addr = %old, "Address still granted");
                    continue;
                }
                info!(identity = %id, object = %reference, addr = %old, "Revoking access");
                self.send(Op::RemoveMember {
                    set: SetName::grants(&id),
                    addr: old,
                });
            }
        }

        self.objects.insert(reference, Indexed { object, granted });
    }

    /// Removes a discovered object, revoking its address from every client that is not granted it
    /// by another object or a static host rule.
    pub fn delete_object(&mut self, reference: ObjectRef) {
        let Some(Indexed { object, granted }) = self.objects.remove(&reference) else {
            debug!(object = %reference, "Ignoring delete of unknown object");
            return;
        };
        let Some(addr) = object.address else {
            return;
        };

        let mut sets = Vec::new();
        for id in self.clients.keys() {
            if self.still_granted(id, addr) {
                continue;
            }
            if granted.contains(id) {
                info!(identity = %id, object = %reference, %addr, "Revoking access");
            }
            sets.push(SetName::grants(id));
        }
        if !sets.is_empty() {
            sets.sort();
            self.send(Op::RemoveMemberEverywhere { sets, addr });
        }
    }

    /// Replaces every indexed object of a kind, deleting those that no longer exist.
    ///
    /// Objects may have been indexed by the startup listing before the watch began, so the
    /// index's own record decides which objects were removed.
    pub(crate) fn reset_objects(&mut self, kind: Kind, objects: Vec<DiscoveredObject>) {
        let mut prior = self
            .objects
            .keys()
            .filter(|reference| reference.kind == kind)
            .cloned()
            .collect::<BTreeSet<_>>();

        for object in objects {
            prior.remove(&object.reference());
            self.apply_object(object);
        }

        for reference in prior {
            debug!(object = %reference, "Object no longer exists");
            self.delete_object(reference);
        }
    }

    /// Indicates whether a client is granted an address by any indexed object or by a static rule
    /// for exactly that host.
    fn still_granted(&self, identity: &Identity, addr: Ipv4Addr) -> bool {
        let Some(client) = self.clients.get(identity) else {
            return false;
        };
        client.grants_host_statically(addr)
            || self
                .objects
                .values()
                .any(|o| o.object.address == Some(addr) && o.granted.contains(identity))
    }
}
