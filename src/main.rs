// Copyright (c) 2025 Atropos
// SPDX-License-Identifier: MIT

use atrk::constants::{DEFAULT_LEASE_NAME, DEFAULT_WORKER_COUNT, ENV_ENABLE_WEBHOOKS};
use atrk::crd::{App, AppBase};
use atrk::error::EXIT_RUNTIME;
use atrk::health::ping;
use atrk::leader::ElectionConfig;
use atrk::manager::{Manager, ManagerOptions};
use atrk::mem::{MemoryCluster, MemoryLeaseStore};
use atrk::reconcilers::{app::AppReconciler, app_base::AppBaseReconciler};
use atrk::webhooks::{AppBaseDefaulter, AppBaseValidator, AppDefaulter, AppValidator};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[command(name = "atrk", about = "Controller manager for App and AppBase resources", version)]
struct Args {
    /// The address the probe endpoint binds to.
    #[arg(long, default_value = "0.0.0.0:8081")]
    health_probe_bind_address: SocketAddr,

    /// The address the webhook server binds to.
    #[arg(long, default_value = "0.0.0.0:9443")]
    webhook_bind_address: SocketAddr,

    /// Enable leader election for controller manager.
    /// Enabling this will ensure there is only one active controller manager.
    #[arg(long)]
    leader_elect: bool,

    /// Name of the lease record contended for by manager replicas.
    #[arg(long, default_value = DEFAULT_LEASE_NAME)]
    leader_election_id: String,

    /// Number of reconcile workers.
    #[arg(long, default_value_t = DEFAULT_WORKER_COUNT)]
    workers: usize,
}

fn main() {
    let args = Args::parse();

    // Build Tokio runtime with custom thread names
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .thread_name("atrk-controller")
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to build runtime: {err}");
            std::process::exit(EXIT_RUNTIME);
        }
    };

    let code = runtime.block_on(async_main(args));
    if code != 0 {
        std::process::exit(code);
    }
}

async fn async_main(args: Args) -> i32 {
    // Initialize logging with custom format
    //
    // Respects RUST_LOG environment variable if set, otherwise defaults to INFO level
    // Example: RUST_LOG=debug cargo run
    //
    // Respects RUST_LOG_FORMAT environment variable for output format
    // Example: RUST_LOG_FORMAT=json cargo run
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let log_format = std::env::var("RUST_LOG_FORMAT").unwrap_or_else(|_| "text".to_string());

    match log_format.to_lowercase().as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_file(true)
                .with_line_number(true)
                .with_thread_names(true)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .init();
        }
    }

    info!("Starting atrk controller manager");

    // Standalone backends; a deployment against a real cluster provides its
    // own ClusterStateSource and LeaseStore implementations.
    let cluster = Arc::new(MemoryCluster::new());
    let lease_store = Arc::new(MemoryLeaseStore::new());

    let options = ManagerOptions {
        probe_addr: args.health_probe_bind_address,
        webhook_addr: args.webhook_bind_address,
        leader_election: args.leader_elect,
        election: ElectionConfig::new(&args.leader_election_id),
        worker_count: args.workers,
        ..ManagerOptions::default()
    };

    // Manager setup.
    let mut builder = match Manager::builder(options, cluster, lease_store) {
        Ok(builder) => builder,
        Err(err) => {
            error!(error = %err, "unable to start manager");
            return err.exit_code();
        }
    };

    // Controllers setup.
    if let Err(err) = builder.register_controller(
        AppBase::kind_id(),
        AppBase::decode,
        Arc::new(AppBaseReconciler),
    ) {
        error!(error = %err, controller = "AppBase", "unable to create controller");
        return err.exit_code();
    }
    if let Err(err) =
        builder.register_controller(App::kind_id(), App::decode, Arc::new(AppReconciler))
    {
        error!(error = %err, controller = "App", "unable to create controller");
        return err.exit_code();
    }

    // Webhooks setup, skipped entirely when ENABLE_WEBHOOKS=false.
    if std::env::var(ENV_ENABLE_WEBHOOKS).as_deref() != Ok("false") {
        if let Err(err) = builder.register_webhook(
            &App::kind_id(),
            vec![Arc::new(AppDefaulter)],
            vec![Arc::new(AppValidator)],
        ) {
            error!(error = %err, webhook = "App", "unable to create webhook");
            return err.exit_code();
        }
        if let Err(err) = builder.register_webhook(
            &AppBase::kind_id(),
            vec![Arc::new(AppBaseDefaulter)],
            vec![Arc::new(AppBaseValidator)],
        ) {
            error!(error = %err, webhook = "AppBase", "unable to create webhook");
            return err.exit_code();
        }
    } else {
        debug!("Webhook registration disabled via {ENV_ENABLE_WEBHOOKS}");
    }

    // Health checks.
    if let Err(err) = builder.add_healthz_check("healthz", ping()) {
        error!(error = %err, "unable to set up health check");
        return err.exit_code();
    }
    if let Err(err) = builder.add_readyz_check("readyz", ping()) {
        error!(error = %err, "unable to set up ready check");
        return err.exit_code();
    }

    let manager = match builder.build() {
        Ok(manager) => manager,
        Err(err) => {
            error!(error = %err, "unable to start manager");
            return err.exit_code();
        }
    };

    // Shutdown on SIGINT/SIGTERM.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            cancel.cancel();
        });
    }

    // Start the manager. By now the manager is fully configured and set up
    // with the controllers.
    info!("starting manager");
    match manager.run(cancel).await {
        Ok(()) => 0,
        Err(err) => {
            error!(error = %err, "problem running manager");
            EXIT_RUNTIME
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                error!(error = %err, "unable to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT, shutting down");
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received SIGINT, shutting down");
    }
}
