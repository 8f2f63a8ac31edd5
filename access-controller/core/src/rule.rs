use crate::DiscoveredObject;
use ipnet::Ipv4Net;
use std::fmt;

/// A single grant from a client descriptor.
///
/// Rules with a `Static` scope grant their network unconditionally. All other rules are templates
/// that grant the address of every discovered object they match; their network is informational.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct AccessRule {
    pub scope: Scope,
    pub selector: Selector,
    pub network: Ipv4Net,
}

/// Restricts the namespaces a template applies to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Not a template; the rule never matches discovered objects.
    Static,

    /// Matches objects in all namespaces.
    Wildcard,

    /// Matches objects in the named namespace.
    Namespace(String),
}

/// Restricts the labels a template applies to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Selector {
    Wildcard,
    ExactLabel { key: String, value: String },
}

// === impl AccessRule ===

impl AccessRule {
    pub fn new_static(network: Ipv4Net) -> Self {
        Self {
            scope: Scope::Static,
            selector: Selector::Wildcard,
            network,
        }
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        matches!(self.scope, Scope::Static)
    }

    /// Tests whether a discovered object satisfies this rule's template.
    pub fn matches(&self, object: &DiscoveredObject) -> bool {
        self.scope.matches(&object.namespace) && self.selector.matches(object)
    }
}

impl fmt::Display for AccessRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scope {
            Scope::Static => write!(f, "{}", self.network),
            Scope::Wildcard => write!(f, "*:{}", self.selector),
            Scope::Namespace(ref ns) => write!(f, "{}:{}", ns, self.selector),
        }
    }
}

// === impl Scope ===

impl Scope {
    fn matches(&self, namespace: &str) -> bool {
        match self {
            Self::Static => false,
            Self::Wildcard => true,
            Self::Namespace(ns) => ns == namespace,
        }
    }
}

// === impl Selector ===

impl Selector {
    fn matches(&self, object: &DiscoveredObject) -> bool {
        match self {
            Self::Wildcard => true,
            Self::ExactLabel { key, value } => object.labels.get(key) == Some(value.as_str()),
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wildcard => f.write_str("*"),
            Self::ExactLabel { key, value } => write!(f, "{}={}", key, value),
        }
    }
}
