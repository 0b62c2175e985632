//! Prometheus metrics bootstrap shared by ekko-supervisor binaries.

use clap::Args;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// CLI flags controlling the Prometheus metrics exporter, flattened into a binary's
/// top-level [`clap::Parser`].
#[derive(Args, Debug, Clone)]
pub struct MetricsArgs {
    /// Enable the Prometheus metrics HTTP listener.
    #[arg(long = "metrics.enabled", env = "METRICS_ENABLED", default_value_t = false)]
    pub enabled: bool,

    /// Address for the Prometheus metrics HTTP listener to bind to.
    #[arg(long = "metrics.addr", env = "METRICS_ADDR", default_value = "0.0.0.0")]
    pub address: IpAddr,

    /// Port for the Prometheus metrics HTTP listener to bind to.
    #[arg(long = "metrics.port", env = "METRICS_PORT", default_value_t = 9000)]
    pub port: u16,
}

impl Default for MetricsArgs {
    fn default() -> Self {
        Self { enabled: false, address: IpAddr::V4(Ipv4Addr::UNSPECIFIED), port: 9000 }
    }
}

impl MetricsArgs {
    /// Installs the Prometheus recorder and starts its HTTP listener, if enabled.
    pub fn init_metrics(&self) -> anyhow::Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let socket = SocketAddr::new(self.address, self.port);
        PrometheusBuilder::new().with_http_listener(socket).install()?;
        Ok(())
    }
}
