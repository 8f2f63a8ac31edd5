use crate::Labels;
use std::{fmt, net::Ipv4Addr};

/// The kinds of cluster objects a client may be granted access to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Workload,
    Service,
}

/// A workload or service observed in the cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredObject {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,

    /// The object's routable address. Objects without one are never granted.
    pub address: Option<Ipv4Addr>,

    pub labels: Labels,
}

/// Identifies a discovered object independently of its current state.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

// === impl Kind ===

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workload => f.write_str("workload"),
            Self::Service => f.write_str("service"),
        }
    }
}

// === impl DiscoveredObject ===

impl DiscoveredObject {
    pub fn reference(&self) -> ObjectRef {
        ObjectRef {
            kind: self.kind,
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

// === impl ObjectRef ===

impl ObjectRef {
    pub fn workload(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: Kind::Workload,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn service(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: Kind::Service,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}
