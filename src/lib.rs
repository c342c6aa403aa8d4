pub mod broker;
pub mod config;
pub mod core;
pub mod logging;
pub mod metrics;
pub mod storage;

use crate::broker::server::start_broker;
use crate::config::Config;

pub async fn run(config: Config) -> anyhow::Result<()> {
    start_broker(config).await
}
