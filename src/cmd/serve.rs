//! Gateway server command — `storygen serve`.

use anyhow::Result;

use storygen::config::AppConfig;
use storygen::server;

pub async fn cmd_serve(config: AppConfig) -> Result<()> {
    server::start_server(config).await
}
