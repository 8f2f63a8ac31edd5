use crate::Index;
use access_controller_core::{DiscoveredObject, Kind, Labels, ObjectRef};
use access_controller_k8s_api::{Pod, ResourceExt};
use kubert::index::NamespacedRemoved;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// Pods that have terminated no longer hold an address.
const TERMINAL_PHASES: [&str; 2] = ["Succeeded", "Failed"];

impl kubert::index::IndexNamespacedResource<Pod> for Index {
    fn apply(&mut self, pod: Pod) {
        match workload(pod) {
            Some(object) => self.apply_object(object),
            None => warn!("Ignoring pod without a namespace"),
        }
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.delete_object(ObjectRef::workload(namespace, name))
    }

    /// Objects listed at startup are unknown to the watch, so its removals are not used.
    fn reset(&mut self, pods: Vec<Pod>, _removed: NamespacedRemoved) {
        let objects = pods.into_iter().filter_map(workload).collect();
        self.reset_objects(Kind::Workload, objects)
    }
}

/// Converts a `Pod` into a discovered workload. Returns `None` if the pod has no namespace.
pub fn workload(pod: Pod) -> Option<DiscoveredObject> {
    let namespace = pod.namespace()?;
    let name = pod.name_unchecked();
    let address = address(&pod);
    if address.is_none() {
        debug!(%namespace, %name, "Pod has no IPv4 address");
    }
    Some(DiscoveredObject {
        kind: Kind::Workload,
        namespace,
        name,
        address,
        labels: Labels::from(pod.metadata.labels),
    })
}

/// Returns the pod's first IPv4 address, preferring `status.podIPs`.
fn address(pod: &Pod) -> Option<Ipv4Addr> {
    let status = pod.status.as_ref()?;
    if let Some(phase) = status.phase.as_deref() {
        if TERMINAL_PHASES.contains(&phase) {
            return None;
        }
    }

    status
        .pod_ips
        .iter()
        .flatten()
        .map(|ip| ip.ip.as_str())
        .chain(status.pod_ip.as_deref())
        .find_map(|ip| ip.parse::<Ipv4Addr>().ok())
}
