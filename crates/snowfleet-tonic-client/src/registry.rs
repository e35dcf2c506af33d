use std::{collections::HashMap, fmt, sync::Arc};

use parking_lot::Mutex;
use snowfleet_coord::CoordinationRegistry;

use crate::{
    error::Result,
    router::{FailoverRouter, RouterConfig},
    rpc::Connector,
};

pub(crate) type RouterMap = Mutex<HashMap<u64, Arc<FailoverRouter>>>;

/// One bound [`FailoverRouter`] per worker id, sharing a coordination session
/// and a connector.
///
/// Binding a worker id that already has a live router returns that router.
/// Closing a router removes it, so the next [`RouterRegistry::bind`] creates a
/// fresh one.
pub struct RouterRegistry {
    coordination: Arc<CoordinationRegistry>,
    connector: Arc<dyn Connector>,
    config: RouterConfig,
    routers: Arc<RouterMap>,
}

impl RouterRegistry {
    pub fn new(
        coordination: Arc<CoordinationRegistry>,
        connector: Arc<dyn Connector>,
        config: RouterConfig,
    ) -> Self {
        Self {
            coordination,
            connector,
            config,
            routers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the bound router for `worker_id`, creating and binding one if
    /// needed.
    pub fn bind(&self, worker_id: u64) -> Result<Arc<FailoverRouter>> {
        let mut routers = self.routers.lock();
        if let Some(router) = routers.get(&worker_id) {
            return Ok(Arc::clone(router));
        }
        let router = Arc::new(FailoverRouter::with_owner(
            Arc::clone(&self.coordination),
            Arc::clone(&self.connector),
            worker_id,
            self.config.clone(),
            Some(Arc::downgrade(&self.routers)),
        ));
        router.bind()?;
        routers.insert(worker_id, Arc::clone(&router));
        Ok(router)
    }

    pub fn get(&self, worker_id: u64) -> Option<Arc<FailoverRouter>> {
        self.routers.lock().get(&worker_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.routers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every router.
    pub fn close_all(&self) {
        let routers: Vec<_> = self.routers.lock().drain().map(|(_, r)| r).collect();
        for router in routers {
            router.close();
        }
    }
}

impl Drop for RouterRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl fmt::Debug for RouterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut workers: Vec<u64> = self.routers.lock().keys().copied().collect();
        workers.sort_unstable();
        f.debug_struct("RouterRegistry")
            .field("workers", &workers)
            .field("config", &self.config)
            .finish()
    }
}
