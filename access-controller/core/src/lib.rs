//! Access rules for tunnel clients.
//!
//! Each tunnel client is identified by the name of its descriptor file. The descriptor binds the
//! client to a tunnel address and lists the destinations it may reach: either a static network, or
//! a template that selects cluster workloads and services by namespace and label.
//!
//! ```text
//! ifconfig-push 10.8.0.2 255.255.255.0
//! push "route 10.1.2.0 255.255.255.0 #teamA:role=backend"
//! ```
//!
//! A client is granted an object's address when any of its templates match the object.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod client;
pub mod config;
mod identity;
mod object;
mod rule;

pub use self::{
    client::ClientRecord,
    config::{ConfigReadError, ConfigStore, Grammar},
    identity::Identity,
    object::{DiscoveredObject, Kind, ObjectRef},
    rule::{AccessRule, Scope, Selector},
};
pub use access_controller_k8s_api::Labels;
pub use ipnet::Ipv4Net;
