//! DeviceLink daemon entry point.
//!
//! Loads (or generates) the configuration, loads the TLS certificate
//! material, builds the orchestrator, and runs its event loop until
//! ctrl-c.
//!
//! ```text
//! main()
//!  └─ DaemonConfig::load_or_create()  -- config.toml, generated on first run
//!  └─ TlsIdentity::load()             -- certificate.pem + private.pem
//!  └─ Orchestrator::new()             -- binds the session listener
//!  └─ Orchestrator::run()             -- discovery + event loop, until ctrl-c
//! ```

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use devicelink_daemon::config::{self, DaemonConfig};
use devicelink_daemon::orchestrator::Orchestrator;
use devicelink_daemon::tlsconfig::TlsIdentity;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = config::config_path().context("resolving config path")?;
    let config = DaemonConfig::load_or_create(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Structured logging. Level comes from the config file, overridden by
    // `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level)),
        )
        .init();

    info!(
        "DeviceLink daemon starting as {} ({})",
        config.device.name, config.device.id
    );

    let tls = Arc::new(
        TlsIdentity::load(&config.tls.cert_path, &config.tls.key_path).with_context(|| {
            format!(
                "loading TLS identity from {} / {}",
                config.tls.cert_path.display(),
                config.tls.key_path.display()
            )
        })?,
    );

    let orchestrator = Orchestrator::new(&config, tls)
        .await
        .context("starting services")?;

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received");
    };
    orchestrator.run(shutdown).await.context("event loop")?;

    info!("DeviceLink daemon stopped");
    Ok(())
}
