use std::sync::Arc;

use clap::Parser;
use fastd_core::config::{Args, Config};
use fastd_core::control::ControlEndpoint;
use fastd_core::{control_socket, init_tracing, Module};

#[tokio::main]
async fn main() -> fastd_core::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config).unwrap_or_else(|e| {
        eprintln!("warning: {e}, falling back to defaults");
        Config::default()
    });
    config.apply_args(&args);

    init_tracing(&config.log_filter);

    let module = Module::new(config.clone());

    for bind in &config.bind {
        let addr: std::net::SocketAddr = bind
            .parse()
            .map_err(|e| format!("invalid bind address {bind}: {e}"))?;
        module.bind(fastd_core::endpoint::Endpoint::new(addr)).await?;
    }

    let control = Arc::new(ControlEndpoint::new(module.clone()));

    let _config_watcher = fastd_core::config_watcher::ConfigWatcher::spawn(&args.config, move |cfg| {
        tracing::info!(log_filter = %cfg.log_filter, "config file changed");
    })
    .ok();

    if let Some(path) = config.control_socket.clone() {
        let control = control.clone();
        tokio::spawn(async move {
            if let Err(e) = control_socket::serve(&path, control).await {
                tracing::error!(error = %e, "control endpoint stopped");
            }
        });
    }

    tracing::info!("fastd-core datapath running, ctrl-c to shut down");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    module.shutdown().await;

    Ok(())
}
