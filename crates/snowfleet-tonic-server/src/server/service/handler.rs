//! Request handling for the `snowfleet.Snowflake` gRPC service.
//!
//! Every call is served synchronously by the generator bound to the requested
//! worker id; generator failures are returned to the caller unchanged (see
//! [`snowfleet_tonic_core::Error`] for the status mapping).

use std::sync::Arc;

use snowfleet_tonic_core::{
    Error, MAX_BATCH_SIZE, PING_OK,
    proto::{
        DatacenterIdRequest, DatacenterIdResponse, NextIdRequest, NextIdResponse, NextIdsRequest,
        NextIdsResponse, PingRequest, PingResponse, TimestampRequest, TimestampResponse,
        snowflake_server::Snowflake,
    },
    snowfleet::{self, unix_seconds},
};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status};

use crate::server::registrar::WorkerRegistry;

/// The ID service, shared by all connections.
#[derive(Clone)]
pub struct IdService {
    workers: Arc<WorkerRegistry>,
    shutdown: CancellationToken,
}

impl IdService {
    pub fn new(workers: Arc<WorkerRegistry>) -> Self {
        Self {
            workers,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn workers(&self) -> &Arc<WorkerRegistry> {
        &self.workers
    }

    /// Refuses further ID requests and releases the worker registrations so
    /// clients move to the standbys.
    pub async fn shutdown(&self) -> crate::server::error::Result<()> {
        self.shutdown.cancel();
        self.workers.release().await
    }

    fn check_running(&self) -> Result<(), Error> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ServiceShutdown);
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl Snowflake for IdService {
    #[tracing::instrument(level = "debug", skip_all, fields(worker_id = req.get_ref().worker_id))]
    async fn next_id(&self, req: Request<NextIdRequest>) -> Result<Response<NextIdResponse>, Status> {
        self.check_running()?;
        let generator = self.workers.get(req.get_ref().worker_id)?;
        let id = generator.next_id().map_err(Error::from)?;
        Ok(Response::new(NextIdResponse { id: id.to_i64() }))
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(worker_id = req.get_ref().worker_id, count = req.get_ref().count)
    )]
    async fn next_ids(
        &self,
        req: Request<NextIdsRequest>,
    ) -> Result<Response<NextIdsResponse>, Status> {
        self.check_running()?;
        let NextIdsRequest { worker_id, count } = req.into_inner();
        let generator = self.workers.get(worker_id)?;
        let count = usize::try_from(count).map_err(|_| {
            Error::IdGeneration(snowfleet::Error::InvalidCount {
                requested: i64::from(count),
                max: MAX_BATCH_SIZE,
            })
        })?;
        let ids = generator.next_ids(count).map_err(Error::from)?;
        Ok(Response::new(NextIdsResponse {
            ids: ids.iter().map(|id| id.to_i64()).collect(),
        }))
    }

    async fn datacenter_id(
        &self,
        _req: Request<DatacenterIdRequest>,
    ) -> Result<Response<DatacenterIdResponse>, Status> {
        Ok(Response::new(DatacenterIdResponse {
            datacenter_id: self.workers.datacenter_id() as i64,
        }))
    }

    async fn timestamp(
        &self,
        _req: Request<TimestampRequest>,
    ) -> Result<Response<TimestampResponse>, Status> {
        Ok(Response::new(TimestampResponse {
            timestamp: unix_seconds() as i64,
        }))
    }

    async fn ping(&self, _req: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        self.check_running()?;
        Ok(Response::new(PingResponse {
            status: PING_OK.to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use snowfleet_coord::{CoordinationRegistry, MemoryTree, PeerRecord};
    use snowfleet_tonic_core::{EPOCH, SnowflakeId};
    use tonic::Code;

    use super::*;
    use crate::server::registrar::bind_worker_ids;

    const ROOT: &str = "/snowfleet-servers";

    async fn service(tree: &MemoryTree) -> IdService {
        let coordination = Arc::new(
            CoordinationRegistry::connect(Arc::new(tree.connect()), Duration::from_secs(1))
                .await
                .unwrap(),
        );
        coordination.ensure_root_path(ROOT).await.unwrap();
        let record = PeerRecord::new(vec!["127.0.0.1:50051".to_string()]);
        let workers = bind_worker_ids(coordination, ROOT, &[2, 5], 7, EPOCH, &record)
            .await
            .unwrap();
        IdService::new(Arc::new(workers))
    }

    #[tokio::test]
    async fn next_id_uses_the_requested_worker() {
        let tree = MemoryTree::new();
        let service = service(&tree).await;

        let mut last = 0;
        for _ in 0..10 {
            let resp = service
                .next_id(Request::new(NextIdRequest { worker_id: 5 }))
                .await
                .unwrap()
                .into_inner();
            assert!(resp.id > last);
            last = resp.id;

            let id = SnowflakeId::from_raw(resp.id as u64);
            assert_eq!(id.worker_id(), 5);
            assert_eq!(id.datacenter_id(), 7);
        }
    }

    #[tokio::test]
    async fn unknown_worker_is_not_found() {
        let tree = MemoryTree::new();
        let service = service(&tree).await;

        let status = service
            .next_id(Request::new(NextIdRequest { worker_id: 3 }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::NotFound);
        assert_eq!(Error::from(status), Error::UnknownWorker { worker_id: 3 });
    }

    #[tokio::test]
    async fn next_ids_checks_the_count() {
        let tree = MemoryTree::new();
        let service = service(&tree).await;

        for count in [0, 1, 57, MAX_BATCH_SIZE as i32] {
            let ids = service
                .next_ids(Request::new(NextIdsRequest {
                    worker_id: 2,
                    count,
                }))
                .await
                .unwrap()
                .into_inner()
                .ids;
            assert_eq!(ids.len(), count as usize);
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }

        for count in [-1, MAX_BATCH_SIZE as i32 + 1] {
            let status = service
                .next_ids(Request::new(NextIdsRequest {
                    worker_id: 2,
                    count,
                }))
                .await
                .unwrap_err();
            assert_eq!(status.code(), Code::InvalidArgument);
            assert_eq!(
                Error::from(status),
                Error::IdGeneration(snowfleet::Error::InvalidCount {
                    requested: i64::from(count),
                    max: MAX_BATCH_SIZE,
                })
            );
        }
    }

    #[tokio::test]
    async fn reports_datacenter_and_clock() {
        let tree = MemoryTree::new();
        let service = service(&tree).await;

        let dc = service
            .datacenter_id(Request::new(DatacenterIdRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(dc.datacenter_id, 7);

        let before = unix_seconds() as i64;
        let ts = service
            .timestamp(Request::new(TimestampRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert!(ts.timestamp >= before && ts.timestamp <= before + 1);

        let ping = service
            .ping(Request::new(PingRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(ping.status, PING_OK);
    }

    #[tokio::test]
    async fn shutdown_refuses_requests_and_releases_slots() {
        let tree = MemoryTree::new();
        let service = service(&tree).await;
        assert!(tree.exists("/snowfleet-servers/2/0000000000"));

        service.shutdown().await.unwrap();
        assert!(!tree.exists("/snowfleet-servers/2/0000000000"));
        assert!(!tree.exists("/snowfleet-servers/5/0000000000"));

        let status = service
            .next_id(Request::new(NextIdRequest { worker_id: 2 }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), Code::Unavailable);
        assert!(Error::from(status).is_transport());
    }
}
