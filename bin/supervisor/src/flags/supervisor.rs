//! Supervisor CLI flags: every recognized environment variable from §6, plus the bus and
//! bucket naming that the distilled spec leaves implicit but which the running process
//! still needs wired through somewhere.

use clap::Args;
use ekko_supervisor_service::ServiceConfig;

/// CLI flags for the `ekko-supervisor` binary, flattened into [`crate::cli::Cli`].
#[derive(Args, Debug, Clone)]
pub struct SupervisorArgs {
    /// Message bus connection URL.
    #[arg(long = "nats.url", env = "NATS_URL", default_value = "nats://localhost:4222")]
    pub nats_url: String,

    /// Configuration key-value bucket name (§6).
    #[arg(long = "config-bucket", env = "CONFIG_BUCKET", default_value = "ekko_nodes")]
    pub config_bucket_name: String,

    /// Data key-value bucket name shared by every `BlockFetcher`'s cursor state (§6).
    #[arg(long = "data-bucket", env = "DATA_BUCKET", default_value = "ekko_fetcher_state")]
    pub data_bucket_name: String,

    /// Disable wallet filtering so `BlockFetcher`s forward every transaction (§6).
    #[arg(long = "filter-wallets", env = "FILTER_WALLETS", default_value_t = true)]
    pub filter_wallets: bool,

    /// S3-compatible object store endpoint (§6).
    #[arg(long = "minio.endpoint", env = "MINIO_ENDPOINT", default_value = "localhost:9000")]
    pub minio_endpoint: String,

    /// S3-compatible object store access key (§6).
    #[arg(long = "minio.access-key", env = "MINIO_ACCESS_KEY", default_value = "minioadmin")]
    pub minio_access_key: String,

    /// S3-compatible object store secret key (§6).
    #[arg(long = "minio.secret-key", env = "MINIO_SECRET_KEY", default_value = "minioadmin")]
    pub minio_secret_key: String,

    /// S3-compatible object store bucket (§6).
    #[arg(long = "minio.bucket", env = "MINIO_BUCKET", default_value = "blockchain-data")]
    pub minio_bucket: String,

    /// Whether to use TLS against the object store endpoint (§6).
    #[arg(long = "minio.use-ssl", env = "MINIO_USE_SSL", default_value_t = false)]
    pub minio_use_ssl: bool,

    /// Prefix under the object store bucket, before the per-group/per-node path (§4.7).
    #[arg(long = "object-store.base-path", env = "OBJECT_STORE_BASE_PATH", default_value = "ekko")]
    pub object_store_base_path: String,

    /// Maximum records per `ArrowWriter` flush (§4.7).
    #[arg(long = "writer.batch-size", env = "WRITER_BATCH_SIZE", default_value_t = 25)]
    pub batch_size: usize,

    /// Maximum wall time in seconds between `ArrowWriter` flushes (§4.7).
    #[arg(long = "writer.flush-interval-secs", env = "WRITER_FLUSH_INTERVAL_SECS", default_value_t = 10)]
    pub flush_interval_secs: u64,
}

impl SupervisorArgs {
    /// Builds the [`ServiceConfig`] the supervisor service is constructed from.
    pub async fn init_config(&self) -> anyhow::Result<ServiceConfig> {
        Ok(ServiceConfig {
            nats_url: self.nats_url.clone(),
            config_bucket_name: self.config_bucket_name.clone(),
            data_bucket_name: self.data_bucket_name.clone(),
            filter_wallets_enabled: self.filter_wallets,
            minio_endpoint: self.minio_endpoint.clone(),
            minio_access_key: self.minio_access_key.clone(),
            minio_secret_key: self.minio_secret_key.clone(),
            minio_bucket: self.minio_bucket.clone(),
            minio_use_ssl: self.minio_use_ssl,
            object_store_base_path: self.object_store_base_path.clone(),
            batch_size: self.batch_size,
            flush_interval: std::time::Duration::from_secs(self.flush_interval_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        supervisor: SupervisorArgs,
    }

    #[test]
    fn defaults_match_spec_env_vars() {
        let cli = TestCli::parse_from(["test"]);
        assert_eq!(cli.supervisor.config_bucket_name, "ekko_nodes");
        assert_eq!(cli.supervisor.minio_endpoint, "localhost:9000");
        assert_eq!(cli.supervisor.minio_access_key, "minioadmin");
        assert_eq!(cli.supervisor.minio_secret_key, "minioadmin");
        assert_eq!(cli.supervisor.minio_bucket, "blockchain-data");
        assert!(!cli.supervisor.minio_use_ssl);
        assert!(cli.supervisor.filter_wallets);
        assert_eq!(cli.supervisor.batch_size, 25);
        assert_eq!(cli.supervisor.flush_interval_secs, 10);
    }

    #[test]
    fn filter_wallets_can_be_disabled_via_env() {
        // SAFETY: test runs single-threaded within this process and restores nothing since
        // env vars are process-local to the test binary invocation.
        unsafe {
            std::env::set_var("FILTER_WALLETS", "false");
        }
        let cli = TestCli::parse_from(["test"]);
        assert!(!cli.supervisor.filter_wallets);
        unsafe {
            std::env::remove_var("FILTER_WALLETS");
        }
    }

    #[tokio::test]
    async fn init_config_copies_fields_through() {
        let cli = TestCli::parse_from(["test", "--minio.bucket", "custom-bucket"]);
        let config = cli.supervisor.init_config().await.unwrap();
        assert_eq!(config.minio_bucket, "custom-bucket");
        assert_eq!(config.flush_interval, std::time::Duration::from_secs(10));
    }
}
