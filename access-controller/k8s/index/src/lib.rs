//! Access Controller Index
//!
//! The index holds every active tunnel client's parsed descriptor and every discovered workload
//! and service, and keeps each client's grant set in sync with both:
//!
//! - When a client's descriptor is reloaded, its grant set is rebuilt from its static rules and
//!   every indexed object its templates match.
//! - When a `Pod` or `Service` is applied, its address is granted to every client with a matching
//!   template, and revoked from every client that matched it before but no longer does.
//! - When a `Pod` or `Service` is deleted, its address is revoked from every client, except where
//!   another object or a static host rule still grants it.
//!
//! ```text
//! [ Descriptor ] -> [ Client ] -> [ Grant set ] <- [ Pod | Service ]
//! ```
//!
//! The index never touches the enforcement backend directly. All changes are emitted as
//! [`firewall::Op`]s while the index is locked, so the order in which an `Enforcer` applies them
//! matches the order in which the index changed.
//!
//! Only two client states are observable: a client is either active (present in the index with a
//! bound address and an installed block rule) or absent.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod index;
mod objects;
pub mod pod;
pub mod service;


pub use self::index::{Descriptor, Index, SharedIndex};
pub use access_controller_firewall as firewall;
