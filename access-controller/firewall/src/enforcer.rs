use crate::{Driver, Op};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error};

/// Applies queued operations to a driver, one at a time and in order.
pub struct Enforcer<D> {
    driver: D,
    ops: UnboundedReceiver<Op>,
}

// === impl Enforcer ===

impl<D: Driver> Enforcer<D> {
    pub fn new(driver: D, ops: UnboundedReceiver<Op>) -> Self {
        Self { driver, ops }
    }

    /// Runs until all senders are dropped.
    pub async fn run(mut self) {
        while let Some(op) = self.ops.recv().await {
            debug!(%op, "Applying");
            // Failures are not retried; the next reload or discovery event repairs the state.
            if let Err(error) = op.apply(&self.driver).await {
                error!(%op, %error, "Firewall operation failed");
            }
        }
        debug!("Operation queue closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fake::RecordingFirewall, SetName};
    use std::net::Ipv4Addr;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn applies_in_order_past_failures() {
        let fw = RecordingFirewall::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let set = SetName::grants(&"alice".into());
        let net = "10.1.2.0/24".parse().unwrap();

        // Adding to a missing set fails; the queue keeps going.
        tx.send(Op::AddMember {
            set: set.clone(),
            net,
        })
        .unwrap();
        tx.send(Op::EnsureSet(set.clone())).unwrap();
        tx.send(Op::AddMember {
            set: set.clone(),
            net,
        })
        .unwrap();
        tx.send(Op::InstallBlockRule {
            set: set.clone(),
            client: Ipv4Addr::new(10, 8, 0, 2),
        })
        .unwrap();
        drop(tx);

        Enforcer::new(fw.clone(), rx).run().await;

        assert!(fw.contains(&set, net));
        assert!(fw.has_block_rule(&set, Ipv4Addr::new(10, 8, 0, 2)));
        assert_eq!(fw.failures().len(), 1);
    }
}
