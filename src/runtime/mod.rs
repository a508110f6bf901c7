pub mod api;
pub mod watcher;

use crate::adapters::config::Settings;
use crate::core::error::AppError;

/// Boots the facade, kicks off an initial sync and keeps watching the source
/// until interrupted.
pub fn run() -> Result<(), AppError> {
    let settings = Settings::load();
    let app = api::App::bootstrap(settings)?;

    match app.source_info() {
        Ok(info) => log::info!(
            "Source at {}: {} sessions, {} messages",
            info.path,
            info.session_count,
            info.message_count
        ),
        Err(error) => log::warn!("Source is not readable yet: {error}"),
    }

    app.start_sync();
    let watcher = match app.watch_source() {
        Ok(watcher) => Some(watcher),
        Err(error) => {
            log::warn!("Auto-sync watcher is disabled: {error}");
            None
        }
    };

    let runtime = tokio::runtime::Runtime::new()
        .map_err(|error| AppError::internal(format!("failed to start runtime: {error}")))?;
    runtime.block_on(async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {error}");
        }
    });

    log::info!("Shutting down");
    drop(watcher);
    Ok(())
}
