use crate::clock::Clock;
use crate::config::{get_binance_credentials_from_env, RunMode};
use crate::error::ExchangeError;
use crate::ports::exchange::{Exchange, ExchangePosition, OrderAck, OrderSide, SymbolFilters};
use crate::trade::execution::binance_futures::BinanceFutures;
use async_trait::async_trait;
use rand::Rng;
use rust_decimal::Decimal;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_delay_ms);
        let jitter = if exp > 1 {
            rand::thread_rng().gen_range(0..=exp / 2)
        } else {
            0
        };
        Duration::from_millis(exp.saturating_add(jitter).min(self.max_delay_ms))
    }
}

/// Composition-root wrapper around the venue adapter. Adds the dry-run gate
/// on order-placing calls, bounded retries on idempotent calls and
/// rate-limit warnings.
pub struct ExchangeBox {
    pub inner: Box<dyn Exchange>,
    run_mode: RunMode,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl ExchangeBox {
    pub fn new(
        inner: Box<dyn Exchange>,
        run_mode: RunMode,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            run_mode,
            retry,
            clock,
        }
    }

    pub fn create(
        exchange_name: &str,
        rest_endpoint: &str,
        run_mode: RunMode,
        timeout: Duration,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ExchangeError> {
        match exchange_name {
            "binance" | "binance_futures" => {
                let credentials = get_binance_credentials_from_env(run_mode)
                    .map_err(|e| ExchangeError::MissingCredentials(e.to_string()))?;
                let connector = BinanceFutures::new(rest_endpoint, credentials, timeout)?;
                Ok(ExchangeBox::new(Box::new(connector), run_mode, retry, clock))
            }
            other => Err(ExchangeError::DataUnavailable(format!(
                "unsupported exchange '{}'",
                other
            ))),
        }
    }

    pub fn run_mode(&self) -> RunMode {
        self.run_mode
    }

    fn report_rate_limit(&self, operation: &str, detail: &str, err: &ExchangeError) {
        if matches!(err, ExchangeError::RateLimited(_)) {
            log::warn!("[RATE_LIMIT] {} ({}): {}", operation, detail, err);
        }
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &str,
        detail: &str,
        mut call: F,
    ) -> Result<T, ExchangeError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, ExchangeError>> + Send,
        T: Send,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    self.report_rate_limit(operation, detail, &err);
                    attempt += 1;
                    if !err.is_transient() || attempt >= attempts {
                        return Err(err);
                    }
                    let delay = self.retry.delay_for(attempt - 1);
                    log::debug!(
                        "[EXCHANGE] {} ({}) attempt {}/{} failed: {}; retrying in {:?}",
                        operation,
                        detail,
                        attempt,
                        attempts,
                        err,
                        delay
                    );
                    self.clock.sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl Exchange for ExchangeBox {
    async fn list_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        self.with_retry("list_open_positions", "-", || self.inner.list_open_positions())
            .await
    }

    async fn get_mark_price(&self, symbol: &str) -> Result<f64, ExchangeError> {
        self.with_retry("get_mark_price", symbol, || self.inner.get_mark_price(symbol))
            .await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), ExchangeError> {
        if !self.run_mode.is_armed() {
            log::info!(
                "[DRY_RUN] would set leverage symbol={} leverage={}x",
                symbol,
                leverage
            );
            return Ok(());
        }
        self.with_retry("set_leverage", symbol, || {
            self.inner.set_leverage(symbol, leverage)
        })
        .await
    }

    // Not retried: a timed-out order may still have filled. The next cycle
    // re-derives intent from exchange positions.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        if !self.run_mode.is_armed() {
            log::info!(
                "[DRY_RUN] would place MARKET symbol={} side={} qty={} reduce_only={}",
                symbol,
                side.as_str(),
                qty,
                reduce_only
            );
            return Ok(OrderAck {
                order_id: "dry-run".to_string(),
                symbol: symbol.to_string(),
                side,
                qty,
            });
        }
        let result = self
            .inner
            .place_market_order(symbol, side, qty, reduce_only)
            .await;
        if let Err(err) = &result {
            self.report_rate_limit("place_market_order", symbol, err);
        }
        result
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters, ExchangeError> {
        self.with_retry("symbol_filters", symbol, || self.inner.symbol_filters(symbol))
            .await
    }
}
