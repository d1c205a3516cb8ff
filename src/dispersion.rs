use crate::documents::Side;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

// Population standard deviation at or below this is treated as zero.
pub const MIN_DISPERSION_STD: f64 = 1e-12;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativeSnapshot {
    pub ts: i64,
    pub rel: BTreeMap<String, f64>,
}

impl RelativeSnapshot {
    pub fn from_prices(
        ts: i64,
        prices: &BTreeMap<String, f64>,
        reference: &str,
        universe: &[String],
    ) -> Option<Self> {
        let ref_price = prices
            .get(reference)
            .copied()
            .filter(|p| p.is_finite() && *p > 0.0)?;
        let rel: BTreeMap<String, f64> = universe
            .iter()
            .filter(|asset| asset.as_str() != reference)
            .filter_map(|asset| {
                let price = prices.get(asset).copied()?;
                if !price.is_finite() || price <= 0.0 {
                    return None;
                }
                Some((asset.clone(), (price / ref_price).ln()))
            })
            .collect();
        if rel.is_empty() {
            return None;
        }
        Some(Self { ts, rel })
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RelativeHistory {
    entries: VecDeque<RelativeSnapshot>,
}

impl RelativeHistory {
    // Appends and drops everything older than `lookback_secs` before the
    // newest entry. Out-of-order snapshots are ignored.
    pub fn push(&mut self, snapshot: RelativeSnapshot, lookback_secs: i64) {
        if let Some(last) = self.entries.back() {
            if snapshot.ts <= last.ts {
                log::debug!(
                    "[SIGNAL] ignoring snapshot ts={} (latest={})",
                    snapshot.ts,
                    last.ts
                );
                return;
            }
        }
        self.entries.push_back(snapshot);
        self.prune(lookback_secs);
    }

    pub fn prune(&mut self, lookback_secs: i64) {
        let Some(latest) = self.entries.back().map(|e| e.ts) else {
            return;
        };
        let cutoff = latest.saturating_sub(lookback_secs.max(0));
        while let Some(front) = self.entries.front() {
            if front.ts < cutoff {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn span_secs(&self) -> i64 {
        match (self.entries.front(), self.entries.back()) {
            (Some(first), Some(last)) => last.ts - first.ts,
            _ => 0,
        }
    }

    pub fn latest_ts(&self) -> Option<i64> {
        self.entries.back().map(|e| e.ts)
    }

    /// `latest_rel - oldest_rel` for each asset present at both ends of the
    /// window, using each asset's own oldest sample.
    pub fn window_returns(&self) -> BTreeMap<String, f64> {
        let Some(latest) = self.entries.back() else {
            return BTreeMap::new();
        };
        latest
            .rel
            .iter()
            .filter_map(|(asset, last)| {
                let first = self.entries.iter().find_map(|e| e.rel.get(asset))?;
                Some((asset.clone(), last - first))
            })
            .collect()
    }

    pub fn series_since(&self, asset: &str, lookback_secs: i64) -> Vec<f64> {
        let Some(latest) = self.latest_ts() else {
            return Vec::new();
        };
        let cutoff = latest.saturating_sub(lookback_secs.max(0));
        self.entries
            .iter()
            .filter(|e| e.ts >= cutoff)
            .filter_map(|e| e.rel.get(asset).copied())
            .collect()
    }
}

// Population mean and standard deviation.
pub fn mean_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values
        .iter()
        .map(|v| {
            let d = v - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    Some((mean, var.sqrt()))
}

/// Cross-sectional z-scores of `returns`; `None` on zero dispersion or fewer
/// than two assets.
pub fn cross_sectional_z(returns: &BTreeMap<String, f64>) -> Option<BTreeMap<String, f64>> {
    if returns.len() < 2 {
        return None;
    }
    let values: Vec<f64> = returns.values().copied().collect();
    let (mean, std) = mean_std(&values)?;
    if !std.is_finite() || std <= MIN_DISPERSION_STD {
        return None;
    }
    Some(
        returns
            .iter()
            .map(|(asset, r)| (asset.clone(), (r - mean) / std))
            .collect(),
    )
}

pub fn rank_by_magnitude(z: &BTreeMap<String, f64>) -> Vec<(String, f64)> {
    let mut ranked: Vec<(String, f64)> = z.iter().map(|(k, v)| (k.clone(), *v)).collect();
    ranked.sort_by(|a, b| {
        b.1.abs()
            .partial_cmp(&a.1.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    ranked
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionParams {
    pub z_enter: f64,
    pub z_exit: f64,
    pub switch_delta: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Held {
    pub asset: String,
    pub side: Side,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    StayFlat,
    Enter { asset: String, side: Side, z: f64 },
    Hold { asset: String, side: Side, z: Option<f64> },
    Exit { asset: String, z: f64 },
    Rotate { from: String, asset: String, side: Side, z: f64 },
    Flip { asset: String, side: Side, z: f64 },
}

impl Transition {
    pub fn is_state_change(&self) -> bool {
        !matches!(self, Transition::StayFlat | Transition::Hold { .. })
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Transition::StayFlat => "flat",
            Transition::Enter { .. } => "enter",
            Transition::Hold { .. } => "hold",
            Transition::Exit { .. } => "exit",
            Transition::Rotate { .. } => "rotate",
            Transition::Flip { .. } => "flip",
        }
    }
}

pub fn select(
    held: Option<&Held>,
    z: &BTreeMap<String, f64>,
    ranked: &[(String, f64)],
    params: &SelectionParams,
) -> Transition {
    let Some(held) = held else {
        return match ranked.first() {
            Some((asset, z_best)) if z_best.abs() >= params.z_enter => Transition::Enter {
                asset: asset.clone(),
                side: Side::from_z(*z_best),
                z: *z_best,
            },
            _ => Transition::StayFlat,
        };
    };

    let Some(z_held) = z.get(&held.asset).copied() else {
        return Transition::Hold {
            asset: held.asset.clone(),
            side: held.side,
            z: None,
        };
    };

    if z_held.abs() <= params.z_exit {
        return Transition::Exit {
            asset: held.asset.clone(),
            z: z_held,
        };
    }

    if let Some((challenger, z_c)) = ranked.iter().find(|(asset, _)| *asset != held.asset) {
        if z_c.abs() >= z_held.abs() + params.switch_delta && z_c.abs() >= params.z_enter {
            return Transition::Rotate {
                from: held.asset.clone(),
                asset: challenger.clone(),
                side: Side::from_z(*z_c),
                z: *z_c,
            };
        }
    }

    let current = Side::from_z(z_held);
    if current != held.side && z_held.abs() >= params.z_enter {
        return Transition::Flip {
            asset: held.asset.clone(),
            side: current,
            z: z_held,
        };
    }

    Transition::Hold {
        asset: held.asset.clone(),
        side: held.side,
        z: Some(z_held),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> SelectionParams {
        SelectionParams {
            z_enter: 1.2,
            z_exit: 0.4,
            switch_delta: 0.3,
        }
    }

    fn snap(ts: i64, pairs: &[(&str, f64)]) -> RelativeSnapshot {
        RelativeSnapshot {
            ts,
            rel: pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        }
    }

    fn zmap(pairs: &[(&str, f64)]) -> BTreeMap<String, f64> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn held(asset: &str, side: Side) -> Held {
        Held {
            asset: asset.to_string(),
            side,
        }
    }

    #[test]
    fn relative_snapshot_uses_log_ratio_to_reference() {
        let prices: BTreeMap<String, f64> = [("BTC", 100.0), ("ETH", 10.0), ("SOL", -1.0)]
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        let universe = vec!["ETH".to_string(), "SOL".to_string(), "DOGE".to_string()];
        let snap = RelativeSnapshot::from_prices(7, &prices, "BTC", &universe).unwrap();
        assert_eq!(snap.rel.len(), 1);
        assert!((snap.rel["ETH"] - (0.1f64).ln()).abs() < 1e-12);

        let mut no_ref = prices.clone();
        no_ref.remove("BTC");
        assert!(RelativeSnapshot::from_prices(7, &no_ref, "BTC", &universe).is_none());
    }

    #[test]
    fn history_prunes_relative_to_latest() {
        let mut history = RelativeHistory::default();
        history.push(snap(0, &[("A", 0.0)]), 100);
        history.push(snap(50, &[("A", 0.1)]), 100);
        history.push(snap(120, &[("A", 0.2)]), 100);
        assert_eq!(history.len(), 2);
        assert_eq!(history.span_secs(), 70);

        // stale snapshot is dropped
        history.push(snap(110, &[("A", 9.9)]), 100);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn scenario_a_returns_and_z() {
        let mut history = RelativeHistory::default();
        history.push(snap(0, &[("A", 0.0), ("B", 0.0), ("C", 0.0)]), 3600);
        history.push(snap(60, &[("A", 0.02), ("B", -0.01), ("C", 0.0)]), 3600);

        let returns = history.window_returns();
        assert!((returns["A"] - 0.02).abs() < 1e-12);
        assert!((returns["B"] + 0.01).abs() < 1e-12);

        let z = cross_sectional_z(&returns).unwrap();
        let ranked = rank_by_magnitude(&z);
        assert_eq!(ranked[0].0, "A");
        assert!(z["A"] >= 1.2);

        match select(None, &z, &ranked, &params()) {
            Transition::Enter { asset, side, .. } => {
                assert_eq!(asset, "A");
                assert_eq!(side, Side::Short);
            }
            other => panic!("expected enter, got {:?}", other),
        }
    }

    #[test]
    fn z_scores_are_deterministic() {
        let returns = zmap(&[("A", 0.03), ("B", -0.02), ("C", 0.01), ("D", 0.0)]);
        let first = cross_sectional_z(&returns).unwrap();
        let second = cross_sectional_z(&returns).unwrap();
        assert_eq!(first, second);
        let sum: f64 = first.values().sum();
        assert!(sum.abs() < 1e-9);
    }

    #[test]
    fn zero_dispersion_has_no_z() {
        assert!(cross_sectional_z(&zmap(&[("A", 0.01), ("B", 0.01), ("C", 0.01)])).is_none());
        assert!(cross_sectional_z(&zmap(&[("A", 0.01)])).is_none());
    }

    #[test]
    fn flat_below_enter_stays_flat() {
        let z = zmap(&[("A", 1.1), ("B", -1.1)]);
        let ranked = rank_by_magnitude(&z);
        assert_eq!(select(None, &z, &ranked, &params()), Transition::StayFlat);
    }

    #[test]
    fn held_exits_at_z_exit() {
        let z = zmap(&[("A", 0.4), ("B", -2.0)]);
        let ranked = rank_by_magnitude(&z);
        let t = select(Some(&held("A", Side::Short)), &z, &ranked, &params());
        assert!(matches!(t, Transition::Exit { .. }));
    }

    #[test]
    fn rotation_requires_switch_delta_and_enter() {
        let h = held("A", Side::Short);

        // 1.7 < 1.5 + 0.3: hold
        let z = zmap(&[("A", 1.5), ("B", -1.7)]);
        let t = select(Some(&h), &z, &rank_by_magnitude(&z), &params());
        assert!(matches!(t, Transition::Hold { .. }));

        // clears 1.5 + 0.3 and z_enter: rotate
        let z = zmap(&[("A", 1.5), ("B", -1.9)]);
        let t = select(Some(&h), &z, &rank_by_magnitude(&z), &params());
        assert_eq!(
            t,
            Transition::Rotate {
                from: "A".into(),
                asset: "B".into(),
                side: Side::Long,
                z: -1.9
            }
        );

        // beats by delta but below z_enter: hold
        let z = zmap(&[("A", 0.5), ("B", 1.0)]);
        let t = select(Some(&h), &z, &rank_by_magnitude(&z), &params());
        assert!(matches!(t, Transition::Hold { .. }));
    }

    #[test]
    fn sign_flip_beyond_enter_flips() {
        let z = zmap(&[("A", -1.3), ("B", 0.2)]);
        let t = select(
            Some(&held("A", Side::Short)),
            &z,
            &rank_by_magnitude(&z),
            &params(),
        );
        assert!(t.is_state_change());
        assert_eq!(
            t,
            Transition::Flip {
                asset: "A".into(),
                side: Side::Long,
                z: -1.3
            }
        );
    }

    #[test]
    fn missing_held_z_holds() {
        let z = zmap(&[("B", 3.0), ("C", -3.0)]);
        let t = select(
            Some(&held("A", Side::Long)),
            &z,
            &rank_by_magnitude(&z),
            &params(),
        );
        assert_eq!(
            t,
            Transition::Hold {
                asset: "A".into(),
                side: Side::Long,
                z: None
            }
        );
        assert!(!t.is_state_change());
    }

    #[test]
    fn series_since_respects_lookback() {
        let mut history = RelativeHistory::default();
        for ts in 0..10 {
            history.push(snap(ts * 10, &[("A", ts as f64)]), 1_000);
        }
        assert_eq!(history.series_since("A", 30), vec![6.0, 7.0, 8.0, 9.0]);
        assert!(history.series_since("B", 30).is_empty());
    }
}
