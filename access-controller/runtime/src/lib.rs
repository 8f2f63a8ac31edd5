#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use access_controller_core as core;
pub use access_controller_firewall as firewall;
pub use access_controller_k8s_api as k8s;
pub use access_controller_k8s_index as index;

mod args;
mod discovery;
mod watch;

pub use self::{args::Args, watch::ConfigWatcher};
