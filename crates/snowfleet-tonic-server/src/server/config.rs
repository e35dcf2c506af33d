use std::{collections::HashSet, net::SocketAddr, time::Duration};

use anyhow::{bail, ensure};
use clap::{Parser, ValueEnum};
use snowfleet_tonic_core::{
    Clock, EPOCH, MAX_DATACENTER_ID, MAX_WORKER_ID, snowfleet::TimeSource,
};

/// Coordination backend the node registers with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum CoordinatorKind {
    /// In-process tree; only useful for a single node or local testing.
    Memory,
    /// An etcd cluster (requires the `etcd` feature).
    Etcd,
}

/// Runtime configuration for the `snowfleet-tonic-server` binary.
///
/// Every value can be given as a CLI flag or through the environment (a `.env`
/// file in the working directory is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "snowfleet-tonic-server",
    version,
    about = "A gRPC node of the snowfleet unique ID service"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// RPC addresses published to the coordination service for clients and
    /// peers, comma separated. Defaults to `SERVER_ADDR`, which is only
    /// accepted with the memory coordinator when it is a wildcard address.
    ///
    /// Environment variable: `ADVERTISE_ADDRS`
    #[arg(long, env = "ADVERTISE_ADDRS", value_delimiter = ',')]
    pub advertise_addrs: Vec<String>,

    /// Secondary (legacy protocol) addresses stored next to the RPC addresses
    /// in the peer record, comma separated.
    ///
    /// Environment variable: `SECONDARY_ADDRS`
    #[arg(long, env = "SECONDARY_ADDRS", value_delimiter = ',')]
    pub secondary_addrs: Vec<String>,

    /// Datacenter id embedded in every generated ID (0..=31).
    ///
    /// Environment variable: `DATACENTER_ID`
    #[arg(long, env = "DATACENTER_ID", default_value_t = 0)]
    pub datacenter_id: u64,

    /// Worker slots this node serves, comma separated (each 0..=31).
    ///
    /// Environment variable: `WORKER_IDS`
    #[arg(long, env = "WORKER_IDS", value_delimiter = ',', default_value = "0")]
    pub worker_ids: Vec<u64>,

    /// Custom epoch in milliseconds since the Unix epoch. Must match across
    /// the fleet.
    ///
    /// Environment variable: `EPOCH_MS`
    #[arg(long, env = "EPOCH_MS", default_value_t = EPOCH.as_millis() as u64)]
    pub epoch_ms: u64,

    /// Coordination backend.
    ///
    /// Environment variable: `COORDINATOR`
    #[arg(long, env = "COORDINATOR", value_enum, default_value_t = CoordinatorKind::Memory)]
    pub coordinator: CoordinatorKind,

    /// Coordination service endpoints, comma separated.
    ///
    /// Environment variable: `COORDINATION_ENDPOINTS`
    #[arg(
        long,
        env = "COORDINATION_ENDPOINTS",
        value_delimiter = ',',
        default_value = "127.0.0.1:2379"
    )]
    pub coordination_endpoints: Vec<String>,

    /// Seconds to wait for the coordination session at startup.
    ///
    /// Environment variable: `COORDINATION_TIMEOUT_SECS`
    #[arg(long, env = "COORDINATION_TIMEOUT_SECS", default_value_t = 15)]
    pub coordination_timeout_secs: u64,

    /// Session time-to-live in seconds. Registrations vanish this long after
    /// the node stops heart-beating.
    ///
    /// Environment variable: `SESSION_TTL_SECS`
    #[arg(long, env = "SESSION_TTL_SECS", default_value_t = 10)]
    pub session_ttl_secs: u64,

    /// Root node of the slot directories.
    ///
    /// Environment variable: `ROOT_PATH`
    #[arg(long, env = "ROOT_PATH", default_value_t = String::from("/snowfleet-servers"))]
    pub root_path: String,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub advertise_addrs: Vec<String>,
    pub secondary_addrs: Vec<String>,
    pub datacenter_id: u64,
    pub worker_ids: Vec<u64>,
    pub epoch: Duration,
    pub coordinator: CoordinatorKind,
    pub coordination_endpoints: Vec<String>,
    pub coordination_timeout: Duration,
    pub session_ttl: Duration,
    pub root_path: String,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        ensure!(!args.worker_ids.is_empty(), "WORKER_IDS must not be empty");

        let mut seen = HashSet::with_capacity(args.worker_ids.len());
        for &worker_id in &args.worker_ids {
            if worker_id > MAX_WORKER_ID {
                bail!("worker id {worker_id} exceeds the maximum ({MAX_WORKER_ID})");
            }
            if !seen.insert(worker_id) {
                bail!("worker id {worker_id} is listed more than once");
            }
        }

        if args.datacenter_id > MAX_DATACENTER_ID {
            bail!(
                "DATACENTER_ID ({}) exceeds the maximum ({MAX_DATACENTER_ID})",
                args.datacenter_id
            );
        }

        let now = Clock::default().current_millis();
        if args.epoch_ms > now {
            bail!(
                "EPOCH_MS ({}) lies in the future (now = {now})",
                args.epoch_ms
            );
        }

        ensure!(
            args.root_path.starts_with('/') && args.root_path.len() > 1,
            "ROOT_PATH must be an absolute path below `/`, got {:?}",
            args.root_path
        );
        ensure!(
            !args.coordination_endpoints.is_empty(),
            "COORDINATION_ENDPOINTS must not be empty"
        );
        ensure!(args.session_ttl_secs > 0, "SESSION_TTL_SECS must be positive");

        let advertise_addrs: Vec<String> = args
            .advertise_addrs
            .into_iter()
            .filter(|addr| !addr.trim().is_empty())
            .collect();
        if let Some(addr) = advertise_addrs.iter().find(|addr| is_wildcard(addr)) {
            bail!("ADVERTISE_ADDRS contains the wildcard address {addr}, which peers cannot dial");
        }
        let advertise_addrs = if advertise_addrs.is_empty() {
            ensure!(
                args.coordinator == CoordinatorKind::Memory || !is_wildcard(&args.server_addr),
                "SERVER_ADDR {} is a wildcard address; set ADVERTISE_ADDRS to addresses peers can dial",
                args.server_addr
            );
            vec![args.server_addr.clone()]
        } else {
            advertise_addrs
        };

        Ok(Self {
            server_addr: args.server_addr,
            advertise_addrs,
            secondary_addrs: args.secondary_addrs,
            datacenter_id: args.datacenter_id,
            worker_ids: args.worker_ids,
            epoch: Duration::from_millis(args.epoch_ms),
            coordinator: args.coordinator,
            coordination_endpoints: args.coordination_endpoints,
            coordination_timeout: Duration::from_secs(args.coordination_timeout_secs),
            session_ttl: Duration::from_secs(args.session_ttl_secs),
            root_path: args.root_path,
        })
    }
}

/// `0.0.0.0:port` or `[::]:port`.
fn is_wildcard(addr: &str) -> bool {
    addr.parse::<SocketAddr>()
        .is_ok_and(|addr| addr.ip().is_unspecified())
}
