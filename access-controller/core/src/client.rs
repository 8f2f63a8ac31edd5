use crate::{AccessRule, DiscoveredObject, Identity};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;

/// A tunnel client's parsed descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientRecord {
    pub identity: Identity,

    /// The client's tunnel address. Unset until a binding line is parsed.
    pub address: Option<Ipv4Addr>,

    /// Rules in file order. Order has no effect on matching.
    pub rules: Vec<AccessRule>,
}

// === impl ClientRecord ===

impl ClientRecord {
    /// A client with no address and no rules.
    pub fn unbound(identity: Identity) -> Self {
        Self {
            identity,
            address: None,
            rules: Vec::new(),
        }
    }

    /// Returns the first rule granting access to the object, if any.
    pub fn grant(&self, object: &DiscoveredObject) -> Option<&AccessRule> {
        self.rules.iter().find(|rule| rule.matches(object))
    }

    #[inline]
    pub fn matches(&self, object: &DiscoveredObject) -> bool {
        self.grant(object).is_some()
    }

    pub fn static_networks(&self) -> impl Iterator<Item = Ipv4Net> + '_ {
        self.rules
            .iter()
            .filter(|rule| rule.is_static())
            .map(|rule| rule.network)
    }

    /// Indicates whether a static rule grants exactly this host address.
    pub fn grants_host_statically(&self, addr: Ipv4Addr) -> bool {
        self.static_networks()
            .any(|net| net.prefix_len() == 32 && net.addr() == addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Kind, Labels, Scope, Selector};
    use std::iter::FromIterator;

    #[test]
    fn union_of_rules() {
        let client = ClientRecord {
            identity: "alice".into(),
            address: Some([10, 8, 0, 2].into()),
            rules: vec![
                AccessRule::new_static("10.1.2.0/24".parse().unwrap()),
                AccessRule {
                    scope: Scope::Namespace("teamA".into()),
                    selector: Selector::ExactLabel {
                        key: "role".into(),
                        value: "backend".into(),
                    },
                    network: "10.1.2.0/24".parse().unwrap(),
                },
                AccessRule {
                    scope: Scope::Namespace("teamB".into()),
                    selector: Selector::Wildcard,
                    network: "10.1.3.0/24".parse().unwrap(),
                },
            ],
        };

        let obj = |ns: &str, labels: Labels| DiscoveredObject {
            kind: Kind::Service,
            namespace: ns.into(),
            name: "svc".into(),
            address: Some([10, 96, 0, 10].into()),
            labels,
        };

        let backend = obj("teamA", Labels::from_iter(Some(("role", "backend"))));
        assert_eq!(client.grant(&backend), Some(&client.rules[1]));

        let anything_b = obj("teamB", Labels::default());
        assert_eq!(client.grant(&anything_b), Some(&client.rules[2]));

        assert!(!client.matches(&obj("teamA", Labels::default())));
        assert!(!client.matches(&obj("teamC", Labels::default())));

        assert_eq!(
            client.static_networks().collect::<Vec<_>>(),
            vec!["10.1.2.0/24".parse::<Ipv4Net>().unwrap()]
        );
    }

    #[test]
    fn static_host_grants() {
        let client = ClientRecord {
            identity: "bob".into(),
            address: Some([10, 8, 0, 3].into()),
            rules: vec![
                AccessRule::new_static("10.1.2.50/32".parse().unwrap()),
                AccessRule::new_static("10.1.3.0/24".parse().unwrap()),
            ],
        };
        assert!(client.grants_host_statically([10, 1, 2, 50].into()));
        assert!(!client.grants_host_statically([10, 1, 3, 7].into()));
    }
}
