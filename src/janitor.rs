use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::sandbox::WorkspaceRoot;

/// Periodically removes workspaces that no execution owns, such as those left
/// behind by a crashed process. A directory must be at least `interval` old
/// before it is removed, so one still being set up is never touched.
pub async fn janitor(
    root: WorkspaceRoot,
    interval: Duration,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; startup sweeping is done by the caller
    ticker.tick().await;

    log::info!("Janitor started, sweeping every {interval:?}");

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Janitor received shutdown signal, stopping");
                break;
            }

            _ = ticker.tick() => {
                let root = root.clone();
                let removed = tokio::task::spawn_blocking(move || root.sweep(interval)).await?;
                if removed > 0 {
                    log::info!("Janitor removed {removed} stale workspaces");
                } else {
                    log::debug!("Janitor found no stale workspaces");
                }
            }
        }
    }

    Ok(())
}
