use dispersion_bot::clock::{Clock, SystemClock};
use dispersion_bot::logger;
use dispersion_bot::ports::price_feed::{FilePriceFeed, PriceFeed};
use dispersion_bot::ports::replay_feed::ReplayPriceFeed;
use dispersion_bot::signal::{SignalConfig, SignalEngine};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init();

    let git_hash = option_env!("BUILD_GIT_HASH").unwrap_or("unknown");
    log::info!("dispersion-signal git: {}", git_hash);
    log::info!("Starting dispersion signal loop...");

    let cfg = SignalConfig::from_env_or_yaml()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let feed: Box<dyn PriceFeed> = match &cfg.replay_file {
        Some(path) => {
            let replay = ReplayPriceFeed::new(path)?;
            log::info!("[BACKTEST] loaded {} snapshots from {}", replay.len(), path);
            Box::new(replay)
        }
        None => Box::new(FilePriceFeed::new(
            &cfg.prices_path,
            clock.clone(),
            Some(cfg.price_max_age_secs),
        )),
    };
    let mut engine = SignalEngine::new(cfg, feed, clock);
    engine.run().await
}
