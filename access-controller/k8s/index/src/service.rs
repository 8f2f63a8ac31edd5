use crate::Index;
use access_controller_core::{DiscoveredObject, Kind, Labels, ObjectRef};
use access_controller_k8s_api::{ResourceExt, Service};
use kubert::index::NamespacedRemoved;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// The cluster IP of a headless service.
const HEADLESS: &str = "None";

impl kubert::index::IndexNamespacedResource<Service> for Index {
    fn apply(&mut self, service: Service) {
        match discovered(service) {
            Some(object) => self.apply_object(object),
            None => warn!("Ignoring service without a namespace"),
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_object(ObjectRef::service(namespace, name))
    }

    /// Objects listed at startup are unknown to the watch, so its removals are not used.
    fn reset(&mut self, services: Vec<Service>, _removed: NamespacedRemoved) {
        let objects = services.into_iter().filter_map(discovered).collect();
        self.reset_objects(Kind::Service, objects)
    }
}

/// Converts a `Service` into a discovered object. Returns `None` if the service has no namespace.
pub fn discovered(service: Service) -> Option<DiscoveredObject> {
    let namespace = service.namespace()?;
    let name = service.name_unchecked();
    let address = cluster_ip(&service);
    if address.is_none() {
        debug!(%namespace, %name, "Service has no IPv4 cluster IP");
    }
    Some(DiscoveredObject {
        kind: Kind::Service,
        namespace,
        name,
        address,
        labels: Labels::from(service.metadata.labels),
    })
}

/// Returns the service's first IPv4 cluster IP, preferring `spec.clusterIPs`.
fn cluster_ip(service: &Service) -> Option<Ipv4Addr> {
    let spec = service.spec.as_ref()?;
    spec.cluster_ips
        .iter()
        .flatten()
        .map(String::as_str)
        .chain(spec.cluster_ip.as_deref())
        .filter(|ip| !ip.is_empty() && *ip != HEADLESS)
        .find_map(|ip| match ip.parse::<Ipv4Addr>() {
            Ok(addr) => Some(addr),
            Err(error) => {
                debug!(%error, ip, "Skipping cluster IP");
                None
            }
        })
}
