//! Enforcement of client grants at the packet-filtering layer.
//!
//! Each client owns a set of permitted destinations and a block rule that rejects forwarded
//! traffic from the client's address to anything outside that set:
//!
//! ```text
//! iptables -I FORWARD -s <client> -m set ! --match-set <identity> dst -j REJECT
//! ```
//!
//! The index never runs commands itself. It emits [`Op`]s onto a queue that a single [`Enforcer`]
//! task applies, in order, through a [`Driver`]. Every operation is idempotent and failures are
//! logged rather than propagated: a failed command leaves the backend inconsistent until the next
//! reload or discovery event touches the same client.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod enforcer;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
mod netfilter;

pub use self::{enforcer::Enforcer, netfilter::Netfilter};
use access_controller_core::{Identity, Ipv4Net};
use std::{fmt, io, net::Ipv4Addr, process::ExitStatus};
use thiserror::Error;

/// The name of an ipset.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SetName(String);

/// A single idempotent change to the enforcement backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    EnsureSet(SetName),
    FlushSet(SetName),
    DestroySet(SetName),

    /// Atomically exchanges the contents of two sets.
    SwapSets {
        from: SetName,
        to: SetName,
    },

    AddMember {
        set: SetName,
        net: Ipv4Net,
    },

    RemoveMember {
        set: SetName,
        addr: Ipv4Addr,
    },

    RemoveMemberEverywhere {
        sets: Vec<SetName>,
        addr: Ipv4Addr,
    },

    InstallBlockRule {
        set: SetName,
        client: Ipv4Addr,
    },

    RemoveBlockRule {
        set: SetName,
        client: Ipv4Addr,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid set name {name:?}: {reason}")]
    InvalidSetName { name: String, reason: &'static str },

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("set {0} does not exist")]
    NoSuchSet(SetName),

    #[error("set {0} is referenced by a block rule")]
    SetInUse(SetName),
}

/// The enforcement backend.
///
/// Adding a present member, removing an absent member, installing a present block rule, and
/// removing an absent block rule must all succeed.
#[async_trait::async_trait]
pub trait Driver: Send + Sync + 'static {
    /// Checks that the backend is usable.
    async fn probe(&self) -> Result<(), Error>;

    async fn ensure_set(&self, set: &SetName) -> Result<(), Error>;

    async fn flush_set(&self, set: &SetName) -> Result<(), Error>;

    async fn destroy_set(&self, set: &SetName) -> Result<(), Error>;

    async fn swap_sets(&self, from: &SetName, to: &SetName) -> Result<(), Error>;

    async fn add_member(&self, set: &SetName, net: Ipv4Net) -> Result<(), Error>;

    async fn remove_member(&self, set: &SetName, addr: Ipv4Addr) -> Result<(), Error>;

    /// Attempts removal from each set, continuing past failures.
    async fn remove_member_everywhere(
        &self,
        sets: &[SetName],
        addr: Ipv4Addr,
    ) -> Result<(), Error> {
        let mut failure = None;
        for set in sets {
            if let Err(error) = self.remove_member(set, addr).await {
                tracing::warn!(%set, %addr, %error, "Failed to remove member");
                failure = Some(error);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    async fn install_block_rule(&self, set: &SetName, client: Ipv4Addr) -> Result<(), Error>;

    async fn remove_block_rule(&self, set: &SetName, client: Ipv4Addr) -> Result<(), Error>;

    /// Lists the block rules currently installed, including those left by a previous run.
    async fn block_rules(&self) -> Result<Vec<(SetName, Ipv4Addr)>, Error>;
}

// === impl SetName ===

impl SetName {
    /// The kernel's limit on set name length.
    pub const MAX_LEN: usize = 31;

    const STAGING_SUFFIX: &'static str = "-next";

    /// The set holding a client's current grants.
    pub fn grants(identity: &Identity) -> Self {
        Self(identity.to_string())
    }

    /// The set a client's grants are assembled in before being swapped into place.
    pub fn staging(identity: &Identity) -> Self {
        Self(format!("{}{}", identity, Self::STAGING_SUFFIX))
    }

    /// Checks that both of an identity's set names are usable.
    pub fn validate(identity: &Identity) -> Result<(), Error> {
        let name = identity.as_str();
        let invalid = |reason| {
            Err(Error::InvalidSetName {
                name: name.to_string(),
                reason,
            })
        };
        if name.is_empty() {
            return invalid("empty");
        }
        if name.len() + Self::STAGING_SUFFIX.len() > Self::MAX_LEN {
            return invalid("too long");
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return invalid("contains whitespace");
        }
        Ok(())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === impl Op ===

impl Op {
    pub async fn apply<D: Driver + ?Sized>(&self, driver: &D) -> Result<(), Error> {
        match self {
            Self::EnsureSet(set) => driver.ensure_set(set).await,
            Self::FlushSet(set) => driver.flush_set(set).await,
            Self::DestroySet(set) => driver.destroy_set(set).await,
            Self::SwapSets { from, to } => driver.swap_sets(from, to).await,
            Self::AddMember { set, net } => driver.add_member(set, *net).await,
            Self::RemoveMember { set, addr } => driver.remove_member(set, *addr).await,
            Self::RemoveMemberEverywhere { sets, addr } => {
                driver.remove_member_everywhere(sets, *addr).await
            }
            Self::InstallBlockRule { set, client } => driver.install_block_rule(set, *client).await,
            Self::RemoveBlockRule { set, client } => driver.remove_block_rule(set, *client).await,
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EnsureSet(set) => write!(f, "ensure set {}", set),
            Self::FlushSet(set) => write!(f, "flush set {}", set),
            Self::DestroySet(set) => write!(f, "destroy set {}", set),
            Self::SwapSets { from, to } => write!(f, "swap set {} into {}", from, to),
            Self::AddMember { set, net } => write!(f, "add {} to {}", net, set),
            Self::RemoveMember { set, addr } => write!(f, "remove {} from {}", addr, set),
            Self::RemoveMemberEverywhere { sets, addr } => {
                write!(f, "remove {} from {} sets", addr, sets.len())
            }
            Self::InstallBlockRule { set, client } => {
                write!(f, "install block rule for {} outside {}", client, set)
            }
            Self::RemoveBlockRule { set, client } => {
                write!(f, "remove block rule for {} outside {}", client, set)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_names() {
        let alice = Identity::from("alice");
        assert_eq!(SetName::grants(&alice).as_str(), "alice");
        assert_eq!(SetName::staging(&alice).as_str(), "alice-next");
        assert!(SetName::validate(&alice).is_ok());
    }

    #[test]
    fn invalid_set_names() {
        // The staging name must fit as well.
        let longest = Identity::from("a".repeat(SetName::MAX_LEN - 5));
        assert!(SetName::validate(&longest).is_ok());
        let too_long = Identity::from("a".repeat(SetName::MAX_LEN - 4));
        assert!(matches!(
            SetName::validate(&too_long),
            Err(Error::InvalidSetName { reason: "too long", .. })
        ));

        assert!(SetName::validate(&Identity::from("")).is_err());
        assert!(SetName::validate(&Identity::from("al ice")).is_err());
    }
}
