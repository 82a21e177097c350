use std::time::Duration;

use actix_web::web;
use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use coderun::config::{CliArgs, Config};
use coderun::database as db;
use coderun::janitor::janitor;
use coderun::routes::AuthPolicy;
use coderun::sandbox::Engine;
use coderun::web_server::build_server;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        sandbox: sandbox_config,
        auth: auth_config,
    } = cli.to_config().context("Failed to load configuration")?;

    let db_path = db::get_db_path()?;
    if cli.flush_data {
        db::remove_db(&db_path);
    }

    let db_pool = db::init_db(&db_path)
        .await
        .context("Failed to initialize database")?;
    db::seed_identities(&db_pool, &auth_config.identities)
        .await
        .context("Failed to seed identities")?;

    let engine = web::Data::new(
        Engine::build(&sandbox_config).context("Failed to build execution engine")?,
    );
    let root = engine.workspace_root().clone();

    // Nothing is executing yet, so every workspace under the root is a leftover
    let leftovers = root.sweep(Duration::ZERO);
    if leftovers > 0 {
        log::warn!("Removed {leftovers} workspaces left over from a previous run");
    }

    let shutdown_token = CancellationToken::new();
    let policy = AuthPolicy {
        require_active_subscription: auth_config.require_active_subscription,
    };

    // ======= PREPARATION END, EXECUTION START =======

    let mut janitor_task = tokio::spawn(janitor(
        root,
        sandbox_config.sweep_interval(),
        shutdown_token.clone(),
    ));

    let server = build_server(server_config, db_pool, engine.clone(), policy)
        .context("Failed to build server")?;

    let server_handle = server.handle();
    let server_task = actix_web::rt::spawn(server);

    // ===== EXECUTION END, WAITING FOR SHUTDOWN ======

    let janitor_done = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Ctrl-c received, shutting down...");
            false
        }
        res_server = server_task => {
            log::error!("Server terminated unexpectedly: {:?}", res_server);
            false
        }
        res_janitor = &mut janitor_task => {
            log::error!("Janitor terminated unexpectedly: {:?}", res_janitor);
            true
        }
    };

    // 1. Refuse new executions, then shut down actix-web gracefully
    engine.close();
    server_handle.stop(true).await;

    // 2. Stop the janitor and wait for it
    shutdown_token.cancel();
    if !janitor_done {
        match janitor_task.await {
            Ok(Err(e)) => log::error!("Janitor finished with error: {e:?}"),
            Err(e) if e.is_panic() => log::error!("Janitor panicked: {e:?}"),
            _ => {}
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}
