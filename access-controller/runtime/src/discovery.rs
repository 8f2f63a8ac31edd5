use crate::{
    index::SharedIndex,
    k8s::{Api, Client, ListParams, Pod, Service},
};
use anyhow::{Context, Result};
use kubert::index::IndexNamespacedResource;
use tracing::info;

/// Lists every pod and service in the cluster once and applies them to the index.
///
/// The index must know about all existing objects before client descriptors are loaded so that
/// the initial grant sets are complete.
pub async fn list_all(client: Client, index: &SharedIndex) -> Result<()> {
    let params = ListParams::default();
    let pods = Api::<Pod>::all(client.clone())
        .list(&params)
        .await
        .context("failed to list pods")?;
    let services = Api::<Service>::all(client)
        .list(&params)
        .await
        .context("failed to list services")?;
    info!(
        pods = pods.items.len(),
        services = services.items.len(),
        "Discovered cluster objects"
    );

    let mut index = index.write();
    for pod in pods.items {
        IndexNamespacedResource::<Pod>::apply(&mut *index, pod);
    }
    for service in services.items {
        IndexNamespacedResource::<Service>::apply(&mut *index, service);
    }
    Ok(())
}
