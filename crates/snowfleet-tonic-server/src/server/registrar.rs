//! Binding the configured worker ids to generators and coordination slots.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use snowfleet_coord::{CoordinationRegistry, PeerRecord, Registration};
use snowfleet_tonic_core::{Clock, Error as WireError, Generator};
use tracing::{error, info, warn};

use crate::server::error::{Error, Result};

/// The generators this node serves, keyed by worker id, together with the
/// registrations that advertise them.
pub struct WorkerRegistry {
    generators: BTreeMap<u64, Generator>,
    registrations: Vec<Registration>,
    coordination: Arc<CoordinationRegistry>,
    datacenter_id: u64,
}

impl WorkerRegistry {
    /// The generator for `worker_id`.
    ///
    /// # Errors
    ///
    /// [`WireError::UnknownWorker`] if this node does not serve the slot.
    pub fn get(&self, worker_id: i64) -> Result<&Generator, WireError> {
        u64::try_from(worker_id)
            .ok()
            .and_then(|id| self.generators.get(&id))
            .ok_or(WireError::UnknownWorker { worker_id })
    }

    pub fn datacenter_id(&self) -> u64 {
        self.datacenter_id
    }

    pub fn worker_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.generators.keys().copied()
    }

    pub fn registrations(&self) -> &[Registration] {
        &self.registrations
    }

    /// Deletes every registration. Generators stay usable.
    ///
    /// All registrations are attempted; the first failure is returned.
    pub async fn release(&self) -> Result<()> {
        let mut first_err = None;
        for registration in &self.registrations {
            if let Err(e) = self.coordination.release(registration).await {
                warn!(worker_id = registration.worker_id(), error = %e, "failed to release worker slot");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

/// Builds one generator per worker id and claims the matching slots.
///
/// Binding is all or nothing: when any id fails, the registrations created so
/// far are released before the error is returned.
///
/// # Errors
///
/// - [`Error::DuplicateWorkerId`] if `worker_ids` repeats an id.
/// - [`Error::Generator`] for an id or datacenter out of range, or an epoch in
///   the future.
/// - [`Error::Coordination`] if a slot cannot be registered.
pub async fn bind_worker_ids(
    coordination: Arc<CoordinationRegistry>,
    root_path: &str,
    worker_ids: &[u64],
    datacenter_id: u64,
    epoch: Duration,
    record: &PeerRecord,
) -> Result<WorkerRegistry> {
    let mut generators = BTreeMap::new();
    for &worker_id in worker_ids {
        if generators.contains_key(&worker_id) {
            return Err(Error::DuplicateWorkerId { worker_id });
        }
        let generator = Generator::new(worker_id, datacenter_id, epoch, Clock::default())?;
        generators.insert(worker_id, generator);
    }

    let mut workers = WorkerRegistry {
        generators,
        registrations: Vec::with_capacity(worker_ids.len()),
        coordination: Arc::clone(&coordination),
        datacenter_id,
    };
    for &worker_id in worker_ids {
        match coordination
            .register_worker_slot(root_path, worker_id, record)
            .await
        {
            Ok(registration) => workers.registrations.push(registration),
            Err(e) => {
                error!(worker_id, error = %e, "failed to bind worker id, rolling back");
                if let Err(release_err) = workers.release().await {
                    warn!(error = %release_err, "rollback left registrations behind");
                }
                return Err(e.into());
            }
        }
    }

    info!(?worker_ids, datacenter_id, "worker ids bound");
    Ok(workers)
}
