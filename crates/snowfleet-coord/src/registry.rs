//! Worker slot registration and discovery on top of a [`Coordinator`].

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    coordinator::{
        CreateMode, Coordinator, SessionEvent, Watch, is_valid_path, join_path, node_name,
    },
    error::{Error, Result},
    leader::sort_leader_first,
    peer::PeerRecord,
};

/// Live peers grouped by worker slot. Each slot lists `(child, record)`
/// pairs leader first.
pub type PeerMap = BTreeMap<u64, Vec<(String, PeerRecord)>>;

/// A claim on a worker slot held by this process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Registration {
    id: u64,
    worker_id: u64,
    slot_path: String,
}

impl Registration {
    pub fn worker_id(&self) -> u64 {
        self.worker_id
    }

    /// The slot directory the registration lives under.
    pub fn slot_path(&self) -> &str {
        &self.slot_path
    }
}

struct Held {
    slot_path: String,
    data: Vec<u8>,
    path: String,
}

type HeldMap = Arc<Mutex<HashMap<u64, Held>>>;

/// Registers worker slots and discovers their leaders.
///
/// The registry remembers every registration it created. When the session
/// expires (and the coordination service therefore deleted the ephemeral
/// nodes) the registrations are re-created as soon as a new session is
/// connected. Re-created nodes get fresh sequence numbers, so a server that
/// lost its session rejoins its slots as a standby.
pub struct CoordinationRegistry {
    coordinator: Arc<dyn Coordinator>,
    held: HeldMap,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl CoordinationRegistry {
    /// Waits up to `timeout` for the coordinator's session to be connected and
    /// starts the background task that follows session events.
    ///
    /// # Errors
    ///
    /// [`Error::CoordinationUnavailable`] if no session is established in time.
    pub async fn connect(coordinator: Arc<dyn Coordinator>, timeout: Duration) -> Result<Self> {
        let mut events = coordinator.session_events();
        tokio::time::timeout(timeout, wait_connected(coordinator.as_ref(), &mut events))
            .await
            .map_err(|_| Error::CoordinationUnavailable {
                reason: format!("no session established within {timeout:?}"),
            })??;
        info!(
            session_id = coordinator.session_id(),
            "coordination session connected"
        );

        let held = HeldMap::default();
        let shutdown = CancellationToken::new();
        tokio::spawn(follow_session(
            Arc::clone(&coordinator),
            Arc::clone(&held),
            events,
            shutdown.child_token(),
        ));

        Ok(Self {
            coordinator,
            held,
            next_id: AtomicU64::new(0),
            shutdown,
        })
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    /// Creates every missing component of `path`. Existing nodes are fine.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPath`] for a relative or malformed path,
    /// [`Error::CoordinationWrite`] if a component cannot be created.
    pub async fn ensure_root_path(&self, path: &str) -> Result<()> {
        if !is_valid_path(path) {
            return Err(Error::MalformedPath {
                path: path.to_string(),
            });
        }
        let mut current = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            current.push('/');
            current.push_str(component);
            self.ensure_node(&current).await?;
        }
        Ok(())
    }

    async fn ensure_node(&self, path: &str) -> Result<()> {
        match self
            .coordinator
            .create(path, b"", CreateMode::Persistent)
            .await
        {
            Ok(_) => {
                debug!(path, "created coordination node");
                Ok(())
            }
            Err(Error::NodeExists { .. }) => Ok(()),
            Err(e) => Err(Error::write(path, e)),
        }
    }

    /// Claims a slot: creates `root/worker_id` if needed and an ephemeral
    /// sequential child carrying `record`.
    ///
    /// # Errors
    ///
    /// [`Error::CoordinationWrite`] if either node cannot be created.
    #[tracing::instrument(level = "debug", skip(self, record))]
    pub async fn register_worker_slot(
        &self,
        root: &str,
        worker_id: u64,
        record: &PeerRecord,
    ) -> Result<Registration> {
        let slot_path = slot_path(root, worker_id);
        self.ensure_node(&slot_path).await?;

        let data = record.to_json()?;
        let path = self
            .coordinator
            .create(&format!("{slot_path}/"), &data, CreateMode::EphemeralSequential)
            .await
            .map_err(|e| Error::write(&slot_path, e))?;
        info!(worker_id, %path, "registered worker slot");

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.held.lock().insert(
            id,
            Held {
                slot_path: slot_path.clone(),
                data,
                path,
            },
        );
        Ok(Registration {
            id,
            worker_id,
            slot_path,
        })
    }

    /// Current node path of a registration, if it is still held.
    pub fn registration_path(&self, registration: &Registration) -> Option<String> {
        self.held
            .lock()
            .get(&registration.id)
            .map(|held| held.path.clone())
    }

    /// Deletes a registration's node and stops re-creating it. A node that is
    /// already gone counts as released.
    pub async fn release(&self, registration: &Registration) -> Result<()> {
        let Some(held) = self.held.lock().remove(&registration.id) else {
            return Ok(());
        };
        match self.coordinator.delete(&held.path).await {
            Ok(()) | Err(Error::NoNode { .. }) => {
                info!(
                    worker_id = registration.worker_id,
                    path = %held.path,
                    "released worker slot"
                );
                Ok(())
            }
            Err(e) => Err(Error::write(held.path, e)),
        }
    }

    /// Lists every registered peer under `root`, grouped by worker slot.
    ///
    /// Children deleted between listing and reading are skipped.
    ///
    /// # Errors
    ///
    /// [`Error::MalformedPath`] for a slot directory whose name is not a
    /// worker id, [`Error::MalformedPeerRecord`] for an undecodable payload.
    pub async fn peers(&self, root: &str) -> Result<PeerMap> {
        let mut peers = PeerMap::new();
        for slot in self.coordinator.children(root).await? {
            let worker_id = slot.parse::<u64>().map_err(|_| Error::MalformedPath {
                path: join_path(root, &slot),
            })?;
            let slot_path = join_path(root, &slot);
            let mut children = self.coordinator.children(&slot_path).await?;
            sort_leader_first(children.as_mut_slice());

            let mut records = Vec::with_capacity(children.len());
            for child in children {
                match self.read_record(&join_path(&slot_path, &child)).await {
                    Ok(record) => records.push((child, record)),
                    Err(Error::NoNode { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
            peers.insert(worker_id, records);
        }
        Ok(peers)
    }

    /// Children of a slot, leader first, with a watch for the next change.
    pub async fn watch_slot(&self, root: &str, worker_id: u64) -> Result<(Vec<String>, Watch)> {
        let (mut children, watch) = self
            .coordinator
            .children_watch(&slot_path(root, worker_id))
            .await?;
        sort_leader_first(children.as_mut_slice());
        Ok((children, watch))
    }

    /// Reads the record stored at `root/worker_id/child`.
    pub async fn peer_record(&self, root: &str, worker_id: u64, child: &str) -> Result<PeerRecord> {
        self.read_record(&join_path(&slot_path(root, worker_id), child))
            .await
    }

    async fn read_record(&self, path: &str) -> Result<PeerRecord> {
        let data = self.coordinator.get(path).await?;
        PeerRecord::from_json(path, &data)
    }

    /// Stops following session events and closes the session.
    pub async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.held.lock().clear();
        self.coordinator.close().await
    }
}

impl Drop for CoordinationRegistry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Path of a worker slot directory.
pub fn slot_path(root: &str, worker_id: u64) -> String {
    join_path(root, &worker_id.to_string())
}

async fn wait_connected(
    coordinator: &dyn Coordinator,
    events: &mut broadcast::Receiver<SessionEvent>,
) -> Result<()> {
    loop {
        if coordinator.is_connected() {
            return Ok(());
        }
        match events.recv().await {
            Ok(SessionEvent::Connected) => return Ok(()),
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => {
                return Err(Error::CoordinationUnavailable {
                    reason: "session closed while connecting".to_string(),
                });
            }
        }
    }
}

async fn follow_session(
    coordinator: Arc<dyn Coordinator>,
    held: HeldMap,
    mut events: broadcast::Receiver<SessionEvent>,
    shutdown: CancellationToken,
) {
    let mut pending_reregister = false;
    loop {
        let event = tokio::select! {
            () = shutdown.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(SessionEvent::Connected) => {
                info!(
                    session_id = coordinator.session_id(),
                    "coordination session connected"
                );
                if pending_reregister {
                    pending_reregister = !reregister(coordinator.as_ref(), &held).await;
                }
            }
            Ok(SessionEvent::Disconnected) => {
                warn!("coordination session disconnected");
            }
            Ok(SessionEvent::Expired) => {
                warn!("coordination session expired, registrations will be re-created");
                pending_reregister = true;
            }
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "missed coordination session events");
                // An expiry may have been among them, and so may the
                // reconnect that follows it.
                pending_reregister = true;
                if coordinator.is_connected() {
                    pending_reregister = !reregister(coordinator.as_ref(), &held).await;
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
    debug!("stopped following coordination session");
}

/// Re-creates every held registration. Returns `false` if any failed.
async fn reregister(coordinator: &dyn Coordinator, held: &HeldMap) -> bool {
    let snapshot: Vec<(u64, String, Vec<u8>, String)> = held
        .lock()
        .iter()
        .map(|(id, h)| (*id, h.slot_path.clone(), h.data.clone(), h.path.clone()))
        .collect();

    let mut ok = true;
    for (id, slot_path, data, old_path) in snapshot {
        // Skip registrations whose node survived (e.g. a lagged receiver).
        if coordinator.get(&old_path).await.is_ok() {
            continue;
        }
        let created = match coordinator.create(&slot_path, b"", CreateMode::Persistent).await {
            Ok(_) | Err(Error::NodeExists { .. }) => {
                coordinator
                    .create(&format!("{slot_path}/"), &data, CreateMode::EphemeralSequential)
                    .await
            }
            Err(e) => Err(e),
        };
        match created {
            Ok(path) => {
                info!(
                    old = node_name(&old_path),
                    new = node_name(&path),
                    %slot_path,
                    "re-registered worker slot"
                );
                let orphaned = match held.lock().get_mut(&id) {
                    Some(entry) => {
                        entry.path = path;
                        None
                    }
                    None => Some(path),
                };
                // Released while re-registering; the node is ours to drop.
                if let Some(path) = orphaned {
                    let _ = coordinator.delete(&path).await;
                }
            }
            Err(e) => {
                error!(%slot_path, error = %e, "failed to re-register worker slot");
                ok = false;
            }
        }
    }
    ok
}
