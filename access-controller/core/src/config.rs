//! Client descriptor files.
//!
//! A descriptor is line-oriented. Fields are separated by whitespace and quotes are stripped from
//! each field. A binding line sets the client's address and discards any rules parsed so far. A
//! routing line following a binding line adds a rule; its trailing comment selects the rule's
//! kind:
//!
//! ```text
//! push "route 10.1.0.0 255.255.0.0"                      # static
//! push "route 10.1.2.0 255.255.255.0 #teamA:role=backend" # namespace + label
//! push "route 10.1.2.0 255.255.255.0 #teamA:*"            # any object in namespace
//! push "route 10.1.2.0 255.255.255.0 #*:role=backend"     # label in any namespace
//! ```
//!
//! All other lines are ignored, as are malformed lines.

use crate::{AccessRule, ClientRecord, Identity, Scope, Selector};
use ipnet::{Ipv4Net, PrefixLenError};
use std::{
    fs, io,
    net::{AddrParseError, Ipv4Addr},
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Names the directives recognized in descriptor files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Grammar {
    pub binding_keyword: String,
    pub routing_keyword: String,
}

/// Reads client descriptors from a directory with one file per client.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    dir: PathBuf,
    grammar: Grammar,
}

#[derive(Debug, Error)]
#[error("failed to read {}: {source}", .path.display())]
pub struct ConfigReadError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

#[derive(Debug, Error)]
enum LineError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid address: {0}")]
    Address(#[from] AddrParseError),

    #[error("invalid netmask: {0}")]
    Netmask(#[from] PrefixLenError),

    #[error("invalid template {0:?}")]
    Template(String),
}

const ROUTE_DIRECTIVE: &str = "route";

// === impl Grammar ===

impl Default for Grammar {
    fn default() -> Self {
        Self {
            binding_keyword: "ifconfig-push".to_string(),
            routing_keyword: "push".to_string(),
        }
    }
}

impl Grammar {
    /// Parses a descriptor's contents. Malformed lines are logged and skipped.
    pub fn parse(&self, identity: Identity, contents: &str) -> ClientRecord {
        let mut record = ClientRecord::unbound(identity);

        for (i, line) in contents.lines().enumerate() {
            let fields = line.split_whitespace().collect::<Vec<_>>();
            let Some(&keyword) = fields.first() else {
                continue;
            };
            let lineno = i + 1;

            if keyword == self.binding_keyword {
                match parse_binding(&fields[1..]) {
                    Ok(addr) => {
                        debug!(identity = %record.identity, %addr, "Client uses static address");
                        record.address = Some(addr);
                        record.rules.clear();
                    }
                    Err(error) => {
                        warn!(identity = %record.identity, lineno, %error, "Skipping binding line");
                    }
                }
            } else if keyword == self.routing_keyword {
                if record.address.is_none() {
                    trace!(identity = %record.identity, lineno, "Ignoring route before binding line");
                    continue;
                }
                match parse_route(&fields[1..]) {
                    Ok(Some(rule)) => {
                        debug!(identity = %record.identity, %rule, "Parsed rule");
                        record.rules.push(rule);
                    }
                    Ok(None) => {
                        trace!(identity = %record.identity, lineno, "Ignoring non-route directive");
                    }
                    Err(error) => {
                        warn!(identity = %record.identity, lineno, %error, "Skipping routing line");
                    }
                }
            }
        }

        record
    }
}

fn unquote(field: &str) -> &str {
    field.trim_matches('"')
}

fn parse_binding(args: &[&str]) -> Result<Ipv4Addr, LineError> {
    let addr = args.first().ok_or(LineError::Missing("address"))?;
    Ok(unquote(addr).parse()?)
}

/// Parses the arguments of a routing line, returning `None` if they carry some directive other
/// than a route.
fn parse_route(args: &[&str]) -> Result<Option<AccessRule>, LineError> {
    let args = args
        .iter()
        .map(|a| unquote(a))
        .filter(|a| !a.is_empty())
        .collect::<Vec<_>>();
    if args.first() != Some(&ROUTE_DIRECTIVE) {
        return Ok(None);
    }

    let network = args
        .get(1)
        .ok_or(LineError::Missing("network"))?
        .parse::<Ipv4Addr>()?;
    let netmask = args
        .get(2)
        .ok_or(LineError::Missing("netmask"))?
        .parse::<Ipv4Addr>()?;
    let network = Ipv4Net::new(network, ipnet::ipv4_mask_to_prefix(netmask)?)?.trunc();

    let comment = args.get(3..).unwrap_or_default().concat();
    let comment = comment.trim_matches('#');
    let Some((namespace, label)) = comment.split_once(':') else {
        return Ok(Some(AccessRule::new_static(network)));
    };

    let scope = match namespace {
        "" => return Err(LineError::Template(comment.to_string())),
        "*" => Scope::Wildcard,
        ns => Scope::Namespace(ns.to_string()),
    };
    let selector = match label {
        "*" => Selector::Wildcard,
        label => match label.split_once('=') {
            Some((key, value)) if !key.is_empty() => Selector::ExactLabel {
                key: key.to_string(),
                value: value.to_string(),
            },
            _ => return Err(LineError::Template(comment.to_string())),
        },
    };

    Ok(Some(AccessRule {
        scope,
        selector,
        network,
    }))
}

// === impl ConfigStore ===

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>, grammar: Grammar) -> Self {
        Self {
            dir: dir.into(),
            grammar,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, identity: &Identity) -> PathBuf {
        self.dir.join(identity.as_str())
    }

    /// Maps a file name in the descriptor directory to a client identity. Hidden files are not
    /// descriptors.
    pub fn identity(file_name: &str) -> Option<Identity> {
        if file_name.is_empty() || file_name.starts_with('.') {
            return None;
        }
        Some(Identity::from(file_name))
    }

    /// Reads and parses a client's descriptor.
    pub fn read(&self, identity: &Identity) -> Result<ClientRecord, ConfigReadError> {
        let path = self.path(identity);
        tracing::info!(path = %path.display(), "Parsing client descriptor");
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(self.grammar.parse(identity.clone(), &contents)),
            Err(source) => Err(ConfigReadError { path, source }),
        }
    }

    /// Lists the identities of all descriptors currently in the directory.
    pub fn identities(&self) -> io::Result<Vec<Identity>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let Some(id) = entry.file_name().to_str().and_then(Self::identity) else {
                continue;
            };
            // Follow symlinks so that projected volumes are supported.
            match fs::metadata(entry.path()) {
                Ok(meta) if meta.is_file() => ids.push(id),
                Ok(_) => {}
                Err(error) => debug!(%id, %error, "Skipping unreadable entry"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Reads every descriptor in the directory. Fails only if the directory cannot be listed.
    #[allow(clippy::type_complexity)]
    pub fn read_all(&self) -> io::Result<Vec<(Identity, Result<ClientRecord, ConfigReadError>)>> {
        let ids = self.identities()?;
        Ok(ids
            .into_iter()
            .map(|id| {
                let record = self.read(&id);
                (id, record)
            })
            .collect())
    }
}

// === impl ConfigReadError ===

impl ConfigReadError {
    pub fn is_not_found(&self) -> bool {
        self.source.kind() == io::ErrorKind::NotFound
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(contents: &str) -> ClientRecord {
        Grammar::default().parse("alice".into(), contents)
    }

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn label(ns: Option<&str>, key: &str, value: &str) -> AccessRule {
        AccessRule {
            scope: ns.map_or(Scope::Wildcard, |ns| Scope::Namespace(ns.to_string())),
            selector: Selector::ExactLabel {
                key: key.to_string(),
                value: value.to_string(),
            },
            network: net("10.1.2.0/24"),
        }
    }

    #[test]
    fn binding_then_routes_in_file_order() {
        let record = parse(
            r##"
ifconfig-push 10.8.0.2 255.255.255.0
push "route 10.1.0.0 255.255.0.0"
push "route 10.1.2.0 255.255.255.0 #teamA:role=backend"

push "route 10.1.2.0 255.255.255.0 #teamA:*"
push "route 10.1.2.0 255.255.255.0 #*:role=backend"
push "route 10.1.2.0 255.255.255.0 #*:*"
"##,
        );
        assert_eq!(record.identity, Identity::from("alice"));
        assert_eq!(record.address, Some(Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(
            record.rules,
            vec![
                AccessRule::new_static(net("10.1.0.0/16")),
                label(Some("teamA"), "role", "backend"),
                AccessRule {
                    scope: Scope::Namespace("teamA".into()),
                    selector: Selector::Wildcard,
                    network: net("10.1.2.0/24"),
                },
                label(None, "role", "backend"),
                AccessRule {
                    scope: Scope::Wildcard,
                    selector: Selector::Wildcard,
                    network: net("10.1.2.0/24"),
                },
            ]
        );
    }

    #[test]
    fn routes_before_binding_are_dropped() {
        let record = parse(
            r##"
push "route 10.9.0.0 255.255.0.0"
ifconfig-push 10.8.0.2 255.255.255.0
push "route 10.1.0.0 255.255.0.0"
"##,
        );
        assert_eq!(record.rules, vec![AccessRule::new_static(net("10.1.0.0/16"))]);
    }

    #[test]
    fn binding_resets_rules() {
        let record = parse(
            r##"
ifconfig-push 10.8.0.2 255.255.255.0
push "route 10.1.0.0 255.255.0.0"
ifconfig-push 10.8.0.3 255.255.255.0
push "route 10.2.0.0 255.255.0.0"
"##,
        );
        assert_eq!(record.address, Some(Ipv4Addr::new(10, 8, 0, 3)));
        assert_eq!(record.rules, vec![AccessRule::new_static(net("10.2.0.0/16"))]);
    }

    #[test]
    fn no_binding_line() {
        let record = parse("push \"route 10.1.0.0 255.255.0.0\"\n");
        assert_eq!(record.address, None);
        assert!(record.rules.is_empty());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let record = parse(
            r##"
ifconfig-push 10.8.0.2 255.255.255.0
ifconfig-push not-an-address
push "dhcp-option DNS 10.0.0.10"
push "route 10.1.0.0"
push "route 10.1.0.0 255.0.255.0"
push "route 10.1.0.300 255.255.0.0"
push "route 10.1.2.0 255.255.255.0 #:role=backend"
push "route 10.1.2.0 255.255.255.0 #teamA:role"
push "route 10.1.2.0 255.255.255.0 #teamA:=backend"
push-reset
topology subnet
push "route 10.3.0.0 255.255.0.0"
"##,
        );
        assert_eq!(record.address, Some(Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(record.rules, vec![AccessRule::new_static(net("10.3.0.0/16"))]);
    }

    #[test]
    fn network_is_truncated_to_prefix() {
        let record = parse(
            r##"
ifconfig-push 10.8.0.2 255.255.255.0
push "route 10.1.2.7 255.255.255.0"
push "route 10.1.2.7 255.255.255.255"
"##,
        );
        assert_eq!(
            record.rules,
            vec![
                AccessRule::new_static(net("10.1.2.0/24")),
                AccessRule::new_static(net("10.1.2.7/32")),
            ]
        );
    }

    #[test]
    fn comment_spacing_and_quotes() {
        let record = parse(
            r##"
ifconfig-push "10.8.0.2" "255.255.255.0"
push "route 10.1.2.0 255.255.255.0 # teamA:role=backend "
push "route" "10.1.2.0" "255.255.255.0" "#teamA:role=backend"
"##,
        );
        assert_eq!(
            record.rules,
            vec![
                label(Some("teamA"), "role", "backend"),
                label(Some("teamA"), "role", "backend"),
            ]
        );
    }

    #[test]
    fn custom_keywords() {
        let grammar = Grammar {
            binding_keyword: "assign-address".into(),
            routing_keyword: "grant".into(),
        };
        let record = grammar.parse(
            "bob".into(),
            r##"
ifconfig-push 10.8.0.9 255.255.255.0
assign-address 10.8.0.3
grant "route 10.1.0.0 255.255.0.0"
push "route 10.2.0.0 255.255.0.0"
"##,
        );
        assert_eq!(record.address, Some(Ipv4Addr::new(10, 8, 0, 3)));
        assert_eq!(record.rules, vec![AccessRule::new_static(net("10.1.0.0/16"))]);
    }

    #[test]
    fn store_reads_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("alice"),
            "ifconfig-push 10.8.0.2 255.255.255.0\npush \"route 10.1.0.0 255.255.0.0\"\n",
        )
        .unwrap();
        fs::write(dir.path().join("bob"), "ifconfig-push 10.8.0.3 255.255.255.0\n").unwrap();
        fs::write(dir.path().join(".alice.swp"), "garbage").unwrap();
        fs::create_dir(dir.path().join("archive")).unwrap();

        let store = ConfigStore::new(dir.path(), Grammar::default());
        assert_eq!(
            store.identities().unwrap(),
            vec![Identity::from("alice"), Identity::from("bob")]
        );

        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 2);
        let alice = records[0].1.as_ref().unwrap();
        assert_eq!(alice.address, Some(Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(alice.rules.len(), 1);
        let bob = records[1].1.as_ref().unwrap();
        assert!(bob.rules.is_empty());

        let error = store.read(&"carol".into()).unwrap_err();
        assert!(error.is_not_found());
        assert_eq!(error.path, dir.path().join("carol"));
    }

    #[test]
    fn hidden_files_are_not_identities() {
        assert_eq!(ConfigStore::identity("alice"), Some("alice".into()));
        assert_eq!(ConfigStore::identity(".alice.swp"), None);
        assert_eq!(ConfigStore::identity("..data"), None);
        assert_eq!(ConfigStore::identity(""), None);
    }
}
