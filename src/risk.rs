use crate::documents::Side;
use crate::ports::exchange::ExchangePosition;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeverageParams {
    pub lev_base: f64,
    pub lev_min: f64,
    pub lev_max: f64,
    pub lev_z_full: f64,
}

/// Linear ramp from `lev_base` at z = 0 to `lev_max` at |z| >= `lev_z_full`,
/// clamped to `[lev_min, lev_max]`.
pub fn leverage_for_z(z: f64, p: &LeverageParams) -> f64 {
    let lo = p.lev_min.min(p.lev_max);
    let hi = p.lev_max.max(p.lev_min);
    let frac = if p.lev_z_full > 0.0 && z.is_finite() {
        (z.abs() / p.lev_z_full).min(1.0)
    } else {
        0.0
    };
    let lev = p.lev_base + frac * (p.lev_max - p.lev_base);
    if lev.is_finite() {
        lev.clamp(lo, hi)
    } else {
        lo
    }
}

pub fn exchange_leverage(lev: f64) -> u32 {
    lev.floor().max(1.0) as u32
}

// Enter beyond `z_enter`, stay until `|z| <= z_exit`. An opposite side is
// only taken once the new side clears `z_enter` on its own.
pub fn hysteresis(z: f64, prev: Side, z_enter: f64, z_exit: f64) -> Side {
    if !z.is_finite() {
        return prev;
    }
    let candidate = Side::from_z(z);
    match prev {
        Side::Flat => {
            if z.abs() >= z_enter {
                candidate
            } else {
                Side::Flat
            }
        }
        held => {
            if z.abs() <= z_exit {
                Side::Flat
            } else if candidate != held && z.abs() >= z_enter {
                candidate
            } else {
                held
            }
        }
    }
}

/// Margin behind a position: reported margin, then isolated margin, then
/// `|notional| / leverage`.
pub fn position_margin(pos: &ExchangePosition) -> Option<f64> {
    let usable = |v: Option<f64>| v.filter(|m| m.is_finite() && *m > 0.0);
    usable(pos.margin)
        .or_else(|| usable(pos.isolated_margin))
        .or_else(|| {
            let notional = pos.notional.filter(|n| n.is_finite())?.abs();
            let lev = pos.leverage.filter(|l| l.is_finite() && *l > 0.0)?;
            usable(Some(notional / lev))
        })
}

pub fn position_roi(pos: &ExchangePosition) -> Option<f64> {
    let margin = position_margin(pos)?;
    let pnl = pos.unrealized_pnl.filter(|p| p.is_finite())?;
    Some(pnl / margin)
}

pub fn rolling_take_profit_hit(roi: f64, peak_roi: f64, drop: f64) -> bool {
    peak_roi > 0.0 && roi < peak_roi * (1.0 - drop)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TakeProfitMode {
    Fixed,
    Vol,
}

impl std::str::FromStr for TakeProfitMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "fixed" => Ok(TakeProfitMode::Fixed),
            "vol" => Ok(TakeProfitMode::Vol),
            other => Err(format!("unknown take-profit mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TakeProfitParams {
    pub mode: TakeProfitMode,
    pub tp_pct: f64,
    pub k: f64,
    pub tp_min: f64,
    pub tp_max: f64,
    pub min_samples: usize,
}

// `series` holds relative log-price levels (ln(asset/ref)), not their returns.
// Too few samples in `vol` mode fall back to the fixed target.
pub fn take_profit_target(p: &TakeProfitParams, series: &[f64]) -> (Option<f64>, &'static str) {
    let fixed = (p.tp_pct > 0.0).then_some(p.tp_pct);
    if p.mode == TakeProfitMode::Fixed {
        return (fixed, "fixed");
    }
    if series.len() < p.min_samples.max(2) {
        return (fixed, "fixed");
    }
    match crate::dispersion::mean_std(series) {
        Some((_, vol)) if vol.is_finite() => {
            let lo = p.tp_min.min(p.tp_max);
            let hi = p.tp_max.max(p.tp_min);
            (Some((p.k * vol).clamp(lo, hi)), "vol")
        }
        _ => (fixed, "fixed"),
    }
}

pub fn quantize_qty(size: Decimal, step: Decimal, min_qty: Decimal) -> Decimal {
    if size <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let floored = if step > Decimal::ZERO {
        (size / step).trunc() * step
    } else {
        size
    };
    if floored <= Decimal::ZERO || floored < min_qty {
        return Decimal::ZERO;
    }
    floored.normalize()
}

pub fn order_quantity(
    usd_notional: f64,
    leverage: f64,
    mark_price: f64,
    step: Decimal,
    min_qty: Decimal,
) -> Decimal {
    if mark_price <= 0.0 || !mark_price.is_finite() {
        return Decimal::ZERO;
    }
    let raw = usd_notional * leverage / mark_price;
    match Decimal::from_f64(raw) {
        Some(size) => quantize_qty(size, step, min_qty),
        None => Decimal::ZERO,
    }
}

pub fn decimal_to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
