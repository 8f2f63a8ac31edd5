#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;

pub use self::labels::Labels;
pub use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus, Service, ServiceSpec};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, ResourceExt},
    Client,
};
