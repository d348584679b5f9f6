use std::net::SocketAddr;

use clap::Parser;

/// Edge proxy. Configured entirely through the environment.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Postgres connection string
    #[clap(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// HTTPS listener (user traffic + TLS-ALPN-01 challenges)
    #[clap(long, env = "EDGE_HTTPS_ADDR", default_value = "0.0.0.0:443")]
    pub https_addr: SocketAddr,

    /// HTTP listener; only issues redirects to HTTPS
    #[clap(long, env = "EDGE_HTTP_ADDR", default_value = "0.0.0.0:80")]
    pub http_addr: SocketAddr,

    /// The edge's own hostname; always authorized for certificate issuance
    #[clap(long, env = "EDGE_HOSTNAME")]
    pub hostname: String,

    /// Contact for the ACME account
    #[clap(long, env = "ACME_EMAIL")]
    pub acme_email: String,

    /// ACME directory; defaults to Let's Encrypt production
    #[clap(long, env = "ACME_DIRECTORY")]
    pub acme_directory: Option<String>,

    /// Seconds between route table refreshes (jittered ±50%)
    #[clap(long, env = "EDGE_REFRESH_SECS", default_value_t = 10)]
    pub refresh_secs: u64,
}
