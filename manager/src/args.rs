use clap::Parser;

/// Fast-path manager. Configured entirely through the environment.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Postgres connection string
    #[clap(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// NATS server to consume change events from
    #[clap(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// Region whose pool VMs may be claimed
    #[clap(long, env = "REGION_CODE", default_value = "local")]
    pub region_code: String,

    /// Port workloads are expected to listen on
    #[clap(long, env = "WORKLOAD_PORT", default_value_t = 8080)]
    pub workload_port: i32,

    /// Deployments stuck in `starting` longer than this are failed
    #[clap(long, env = "STARTUP_TIMEOUT_SECS", default_value_t = 600)]
    pub startup_timeout_secs: u64,
}
