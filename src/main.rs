use dispersion_bot::clock::{Clock, SystemClock};
use dispersion_bot::config::RunMode;
use dispersion_bot::executor::{ExecutorConfig, Reconciler};
use dispersion_bot::logger;
use dispersion_bot::trade::execution::exchange_box::ExchangeBox;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();

    let git_hash = option_env!("BUILD_GIT_HASH").unwrap_or("unknown");
    log::info!("dispersion-executor git: {}", git_hash);
    log::info!("Starting execution reconciler...");

    let cfg = ExecutorConfig::from_env_or_yaml()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let exchange = ExchangeBox::create(
        &cfg.exchange_name,
        &cfg.rest_endpoint,
        RunMode::from_flag(cfg.armed),
        Duration::from_secs(cfg.http_timeout_secs.max(1)),
        cfg.retry,
        clock.clone(),
    )?;
    let mut reconciler = Reconciler::new(cfg, Arc::new(exchange), clock);
    reconciler.run().await
}
