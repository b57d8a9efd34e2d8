use log::info;
use tandem_sync::{ServerConfig, ServerError, SyncServer};

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;
    info!("Starting Tandem sync server on {}...", config.bind_addr);

    let server = SyncServer::new(config);
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connection(s) served, {} room(s) open",
                stats.total_connections, stats.active_rooms
            );
            Ok(())
        }
    }
}
