use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Controller configuration.
///
/// Every setting has a default, can be supplied via `PROVISIONER_*`
/// environment variables (a `.env` file is honored in development), and can be
/// overridden by the matching command-line flag.
#[derive(Debug, Clone, Parser)]
#[command(name = "server", about = "Bare-metal provisioning controller")]
pub struct Config {
    /// Listener bind address.
    #[arg(long, env = "PROVISIONER_HTTP_ADDR", default_value = "0.0.0.0:8080")]
    pub http_addr: SocketAddr,

    /// SQLite database file.
    #[arg(long, env = "PROVISIONER_DB_PATH", default_value = "provisioner.db")]
    pub db_path: PathBuf,

    /// Root directory for on-disk media.
    #[arg(long, env = "PROVISIONER_STORAGE_ROOT", default_value = "./data")]
    pub storage_root: PathBuf,

    /// Directory task ISOs are built under. Defaults to `<storage-root>/tasks`.
    #[arg(long, env = "PROVISIONER_TASK_ISO_DIR")]
    pub task_iso_dir: Option<PathBuf>,

    /// External base URL BMCs use to fetch task ISOs.
    #[arg(
        long,
        env = "PROVISIONER_MEDIA_BASE_URL",
        default_value = "http://127.0.0.1:8080"
    )]
    pub media_base_url: String,

    /// Baseline maintenance image the BMC is told to boot.
    #[arg(
        long,
        env = "PROVISIONER_MAINTENANCE_ISO_URL",
        default_value = "http://127.0.0.1:8080/media/maintenance.iso"
    )]
    pub maintenance_iso_url: String,

    /// Shared secret required in `X-Webhook-Secret`. Unset disables auth.
    #[arg(long, env = "PROVISIONER_WEBHOOK_SECRET")]
    pub webhook_secret: Option<String>,

    /// Previous webhook secret, accepted during rotation.
    #[arg(long, env = "PROVISIONER_WEBHOOK_SECRET_PREVIOUS")]
    pub webhook_secret_previous: Option<String>,

    /// Number of concurrent provisioning workers.
    #[arg(long, env = "PROVISIONER_WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Per-request timeout for BMC operations, in seconds.
    #[arg(long, env = "PROVISIONER_BMC_TIMEOUT_SECS", default_value_t = 30)]
    pub bmc_timeout_secs: u64,

    /// Retry budget for transient BMC failures.
    #[arg(long, env = "PROVISIONER_BMC_RETRIES", default_value_t = 3)]
    pub bmc_retries: u32,

    /// Job lease TTL, in seconds. Heartbeats run at half this interval.
    #[arg(long, env = "PROVISIONER_LEASE_TTL_SECS", default_value_t = 600)]
    pub lease_ttl_secs: u64,

    /// How long a job may sit in `await_callback` before it is failed.
    #[arg(long, env = "PROVISIONER_JOB_STUCK_TIMEOUT_SECS", default_value_t = 1800)]
    pub job_stuck_timeout_secs: u64,

    /// Store poll interval for idle workers and callback waits, milliseconds.
    #[arg(long, env = "PROVISIONER_POLL_INTERVAL_MS", default_value_t = 2000)]
    pub poll_interval_ms: u64,

    /// HMAC secret for signed media URLs. Unset serves media unsigned.
    #[arg(long, env = "PROVISIONER_SIGNING_SECRET")]
    pub signing_secret: Option<String>,

    /// Lifetime of minted media URLs, in seconds.
    #[arg(long, env = "PROVISIONER_SIGNED_URL_TTL_SECS", default_value_t = 900)]
    pub signed_url_ttl_secs: u64,

    /// Bind signed media URLs to the requesting client IP.
    #[arg(
        long,
        env = "PROVISIONER_BIND_MEDIA_TO_IP",
        action = clap::ArgAction::SetTrue
    )]
    pub bind_media_to_ip: bool,

    /// Honor one X-Forwarded-For hop when determining a request's client IP.
    /// Pass `false` when BMCs reach the controller directly with no proxy in
    /// front, so the header cannot be spoofed.
    #[arg(
        long,
        env = "PROVISIONER_TRUST_PROXY_HEADERS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub trust_proxy_headers: bool,

    /// Passphrase for encrypting BMC credentials at rest. Unset stores them
    /// as given.
    #[arg(long, env = "PROVISIONER_SECRETS_PASSPHRASE")]
    pub secrets_passphrase: Option<String>,
}

impl Config {
    /// Load from `.env`, environment, and command-line flags.
    pub fn load() -> Self {
        let _ = dotenvy::dotenv();
        Self::parse()
    }

    pub fn task_iso_dir(&self) -> PathBuf {
        self.task_iso_dir
            .clone()
            .unwrap_or_else(|| self.storage_root.join("tasks"))
    }

    pub fn bmc_timeout(&self) -> Duration {
        Duration::from_secs(self.bmc_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn job_stuck_timeout(&self) -> Duration {
        Duration::from_secs(self.job_stuck_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn signed_url_ttl(&self) -> Duration {
        Duration::from_secs(self.signed_url_ttl_secs)
    }
}
