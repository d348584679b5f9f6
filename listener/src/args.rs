use clap::Parser;

/// WAL-to-bus bridge. Configured entirely through the environment.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Postgres connection string; must allow replication connections
    #[clap(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// NATS server to publish change events to
    #[clap(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    pub nats_url: String,

    /// Replication slot name; replicas must use distinct slots
    #[clap(long, env = "LISTENER_SLOT", default_value = "zeitwork_listener")]
    pub slot: String,

    /// Publication name to (re)create
    #[clap(long, env = "LISTENER_PUBLICATION", default_value = "zeitwork")]
    pub publication: String,

    /// Tables whose row changes are published
    #[clap(
        long,
        env = "LISTENER_TABLES",
        value_delimiter = ',',
        default_value = "deployments,builds,images,vms,domains,servers"
    )]
    pub tables: Vec<String>,
}
