use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use ipnetwork::IpNetwork;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RuntimeMode {
    Docker,
    Firecracker,
}

/// Node agent. Configured entirely through the environment; one process per
/// worker host.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Stable identity of this host; also the `servers` row id
    #[clap(long, env = "NODE_ID")]
    pub node_id: Uuid,

    /// Region this host belongs to
    #[clap(long, env = "REGION_CODE", default_value = "local")]
    pub region_code: String,

    /// Postgres connection string
    #[clap(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Which runtime drives workloads on this host
    #[clap(long, env = "NODE_RUNTIME", value_enum, default_value = "docker")]
    pub runtime: RuntimeMode,

    /// This host's address on the internal network
    #[clap(long, env = "NODE_INTERNAL_IP")]
    pub internal_ip: IpAddr,

    /// CIDR range instance addresses are allocated from
    #[clap(long, env = "NODE_IP_RANGE")]
    pub ip_range: IpNetwork,

    /// Seconds between reconciliation cycles (jittered ±50%)
    #[clap(long, env = "NODE_INTERVAL_SECS", default_value_t = 10)]
    pub interval_secs: u64,

    /// Key for decrypting instance environment variables (base64, 32 bytes)
    #[clap(long, env = "SECRETS_KEY")]
    pub secrets_key: String,

    /// Docker: bridge network containers attach to
    #[clap(long, env = "DOCKER_NETWORK", default_value = "zeitwork")]
    pub docker_network: String,

    /// Registry credentials used for pulls
    #[clap(long, env = "REGISTRY_HOST", default_value = "")]
    pub registry_host: String,

    #[clap(long, env = "REGISTRY_USERNAME", default_value = "")]
    pub registry_username: String,

    #[clap(long, env = "REGISTRY_PASSWORD", default_value = "")]
    pub registry_password: String,

    /// Firecracker: VMM and jailer binaries
    #[clap(long, env = "FIRECRACKER_BIN", default_value = "firecracker")]
    pub firecracker_bin: PathBuf,

    #[clap(long, env = "JAILER_BIN")]
    pub jailer_bin: Option<PathBuf>,

    /// Firecracker: guest kernel image
    #[clap(long, env = "FIRECRACKER_KERNEL", default_value = "/var/lib/zeitwork/vmlinux")]
    pub kernel_path: PathBuf,

    /// Firecracker: directory holding per-image rootfs files
    #[clap(long, env = "FIRECRACKER_ROOTFS_DIR", default_value = "/var/lib/zeitwork/rootfs")]
    pub rootfs_dir: PathBuf,

    /// Ephemeral per-instance state (configs, sockets, console logs);
    /// cleaned at shutdown
    #[clap(long, env = "NODE_DATA_DIR", default_value = "/run/zeitwork")]
    pub data_dir: PathBuf,
}
