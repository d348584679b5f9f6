use clap::Parser;

/// Reconciliation engine. Configured entirely through the environment.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Postgres connection string
    #[clap(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Seconds between reconciliation cycles (jittered ±50%)
    #[clap(long, env = "RECONCILER_INTERVAL_SECS", default_value_t = 5)]
    pub interval_secs: u64,

    /// Builds stuck in `building` longer than this are failed
    #[clap(long, env = "BUILD_TIMEOUT_SECS", default_value_t = 600)]
    pub build_timeout_secs: u64,

    /// Deployments stuck in `starting` longer than this are failed
    #[clap(long, env = "STARTUP_TIMEOUT_SECS", default_value_t = 600)]
    pub startup_timeout_secs: u64,

    /// How long a superseded deployment keeps serving after its successor
    /// reaches `running`
    #[clap(long, env = "GRACE_PERIOD_SECS", default_value_t = 300)]
    pub grace_period_secs: u64,

    /// Warm pool target per region
    #[clap(long, env = "POOL_SIZE", default_value_t = 3)]
    pub pool_size: u32,

    /// Region this reconciler is responsible for; created if missing
    #[clap(long, env = "REGION_CODE", default_value = "local")]
    pub region_code: String,

    /// Resources given to pool VMs
    #[clap(long, env = "POOL_VM_VCPUS", default_value_t = 1)]
    pub pool_vm_vcpus: i32,

    #[clap(long, env = "POOL_VM_MEMORY_MB", default_value_t = 512)]
    pub pool_vm_memory_mb: i32,

    /// Port workloads are expected to listen on
    #[clap(long, env = "WORKLOAD_PORT", default_value_t = 8080)]
    pub workload_port: i32,
}
