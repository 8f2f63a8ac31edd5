use crate::{
    core::{ConfigStore, Identity},
    index::SharedIndex,
};
use ring::digest;
use std::{collections::BTreeMap, fs, io, time::Duration};
use tokio::time;
use tracing::{debug, info, warn};

/// Reloads client descriptors as they change on disk.
///
/// On Linux, changes are detected with inotify. If a watch cannot be established, or fails while
/// running, the directory is polled instead.
#[derive(Clone, Debug)]
pub struct ConfigWatcher {
    store: ConfigStore,
    index: SharedIndex,
    poll_interval: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Change {
    /// A descriptor was created or written.
    Updated(Identity),

    /// A descriptor was removed.
    Removed(Identity),

    /// Changes may have been missed; reload everything.
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    Rescan,
}

/// The SHA-256 digest of every descriptor in a directory.
#[derive(Debug, Default)]
struct Snapshot(BTreeMap<Identity, Vec<u8>>);

// === impl ConfigWatcher ===

impl ConfigWatcher {
    pub fn new(store: ConfigStore, index: SharedIndex, poll_interval: Duration) -> Self {
        Self {
            store,
            index,
            poll_interval,
        }
    }

    pub async fn run(self) {
        #[cfg(target_os = "linux")]
        match notify::watch(self.store.dir()) {
            Ok(events) => {
                info!(dir = %self.store.dir().display(), "Watching descriptors");
                self.watch(events).await;
                // Changes may have been lost before the polls start.
                self.apply(Change::Rescan);
            }
            Err(error) => {
                warn!(%error, "Failed to initialize inotify, falling back to polling");
            }
        }

        self.poll().await
    }

    #[cfg(target_os = "linux")]
    async fn watch(&self, mut events: notify::Events) {
        use futures::prelude::*;

        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(error) => {
                    warn!(%error, "Watch failed, falling back to polling");
                    return;
                }
            };
            tracing::trace!(mask = ?event.mask, name = ?event.name, "Event");
            if event.mask.contains(inotify::EventMask::IGNORED) {
                warn!("Watch removed, falling back to polling");
                return;
            }
            if let Some(change) = notify::classify(event.mask, event.name.as_deref()) {
                self.apply(change);
            }
        }
        debug!("Watch stream ended");
    }

    async fn poll(&self) {
        let mut snapshot = Snapshot::scan(&self.store).unwrap_or_else(|error| {
            warn!(%error, "Failed to scan descriptors");
            Snapshot::default()
        });

        let mut interval = time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let next = match Snapshot::scan(&self.store) {
                Ok(next) => next,
                Err(error) => {
                    warn!(%error, "Failed to scan descriptors");
                    continue;
                }
            };
            for change in snapshot.changes(&next) {
                self.apply(change);
            }
            snapshot = next;
        }
    }

    fn apply(&self, change: Change) {
        match change {
            Change::Updated(identity) => {
                let descriptor = self.store.read(&identity);
                self.index.write().reload(identity, descriptor);
            }
            Change::Removed(identity) => self.index.write().remove(&identity),
            Change::Rescan => match self.store.read_all() {
                Ok(descriptors) => {
                    info!(descriptors = descriptors.len(), "Rescanning descriptors");
                    self.index.write().rescan(descriptors);
                }
                Err(error) => {
                    warn!(dir = %self.store.dir().display(), %error, "Failed to rescan descriptors");
                }
            },
        }
    }
}

// === impl Snapshot ===

impl Snapshot {
    fn scan(store: &ConfigStore) -> io::Result<Self> {
        let mut digests = BTreeMap::new();
        for id in store.identities()? {
            match fs::read(store.path(&id)) {
                Ok(contents) => {
                    let digest = digest::digest(&digest::SHA256, &contents);
                    digests.insert(id, digest.as_ref().to_vec());
                }
                Err(error) => debug!(%id, %error, "Skipping unreadable descriptor"),
            }
        }
        Ok(Self(digests))
    }

    fn changes(&self, next: &Self) -> Vec<Change> {
        let updated = next
            .0
            .iter()
            .filter(|(id, digest)| self.0.get(*id) != Some(*digest))
            .map(|(id, _)| Change::Updated(id.clone()));
        let removed = self
            .0
            .keys()
            .filter(|id| !next.0.contains_key(*id))
            .map(|id| Change::Removed(id.clone()));
        updated.chain(removed).collect()
    }
}

#[cfg(target_os = "linux")]
mod notify {
    use super::Change;
    use crate::core::ConfigStore;
    use inotify::{EventMask, EventStream, Inotify, WatchMask};
    use std::{ffi::OsStr, io, path::Path};

    pub(super) type Events = EventStream<[u8; 4096]>;

    pub(super) fn watch(dir: &Path) -> io::Result<Events> {
        let inotify = Inotify::init()?;
        inotify.watches().add(
            dir,
            WatchMask::CLOSE_WRITE
                | WatchMask::CREATE
                | WatchMask::MOVED_TO
                | WatchMask::DELETE
                | WatchMask::MOVED_FROM
                | WatchMask::DELETE_SELF
                | WatchMask::MOVE_SELF,
        )?;
        inotify.into_event_stream([0; 4096])
    }

    /// Maps a notification to the change it implies.
    ///
    /// Names starting with `..` belong to volumes that are updated by swapping a `..data`
    /// symlink; any change to them may replace every descriptor at once.
    pub(super) fn classify(mask: EventMask, name: Option<&OsStr>) -> Option<Change> {
        if mask.intersects(EventMask::Q_OVERFLOW | EventMask::DELETE_SELF | EventMask::MOVE_SELF) {
            return Some(Change::Rescan);
        }

        let name = name?.to_str()?;
        if name.starts_with("..") {
            return Some(Change::Rescan);
        }
        if mask.contains(EventMask::ISDIR) {
            return None;
        }

        let identity = ConfigStore::identity(name)?;
        if mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM) {
            return Some(Change::Removed(identity));
        }
        if mask.intersects(EventMask::CLOSE_WRITE | EventMask::CREATE | EventMask::MOVED_TO) {
            return Some(Change::Updated(identity));
        }
        None
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_classify() {
            let name = |n: &'static str| Some(OsStr::new(n));
            for (mask, name, change) in [
                (EventMask::CLOSE_WRITE, name("alice"), Some(Change::Updated("alice".into()))),
                (EventMask::CREATE, name("alice"), Some(Change::Updated("alice".into()))),
                (EventMask::MOVED_TO, name("bob"), Some(Change::Updated("bob".into()))),
                (EventMask::DELETE, name("alice"), Some(Change::Removed("alice".into()))),
                (EventMask::MOVED_FROM, name("bob"), Some(Change::Removed("bob".into()))),
                (EventMask::CLOSE_WRITE, name(".alice.swp"), None),
                (EventMask::CREATE | EventMask::ISDIR, name("subdir"), None),
                (EventMask::CREATE, name("..data_tmp"), Some(Change::Rescan)),
                (EventMask::MOVED_TO, name("..data"), Some(Change::Rescan)),
                (EventMask::Q_OVERFLOW, None, Some(Change::Rescan)),
                (EventMask::DELETE_SELF, None, Some(Change::Rescan)),
                (EventMask::OPEN, name("alice"), None),
            ] {
                assert_eq!(classify(mask, name), change, "{:?} {:?}", mask, name);
            }
        }
    }
}
