//! Summary statistics over the realized P&L log.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use statrs::statistics::Statistics;

use crate::models::RealizedPnlEntry;

/// Aggregate view of closed positions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PnlSummary {
    pub closed_positions: u32,
    pub winners: u32,
    pub losers: u32,

    /// Fraction of closes with positive P&L (0.0 to 1.0)
    pub win_rate: f64,

    pub total_pnl: Decimal,
    pub best: Decimal,
    pub worst: Decimal,

    /// Largest peak-to-trough fall of cumulative realized P&L
    pub max_drawdown: Decimal,

    pub mean_pnl: f64,
    pub std_dev_pnl: f64,

    /// Mean of per-close returns on entry notional
    pub mean_return: f64,
}

impl PnlSummary {
    /// Summarize entries in any order; drawdown is taken in close order.
    pub fn from_entries(entries: &[RealizedPnlEntry]) -> Self {
        let mut summary = Self::default();
        if entries.is_empty() {
            return summary;
        }

        let mut ordered: Vec<&RealizedPnlEntry> = entries.iter().collect();
        ordered.sort_by_key(|e| (e.closed_at, e.id));
        let pnls: Vec<Decimal> = ordered.iter().map(|e| e.realized_pnl).collect();

        summary.closed_positions = pnls.len() as u32;
        summary.winners = ordered.iter().filter(|e| e.is_win()).count() as u32;
        summary.losers = pnls.iter().filter(|p| **p < Decimal::ZERO).count() as u32;
        summary.win_rate = summary.winners as f64 / pnls.len() as f64;
        summary.total_pnl = pnls.iter().copied().sum();
        summary.best = pnls.iter().copied().max().unwrap_or_default();
        summary.worst = pnls.iter().copied().min().unwrap_or_default();
        summary.max_drawdown = max_drawdown(&pnls);

        let values: Vec<f64> = pnls.iter().filter_map(|p| p.to_f64()).collect();
        summary.mean_pnl = values.clone().mean();
        // Sample std dev is undefined for one observation
        if values.len() > 1 {
            summary.std_dev_pnl = values.std_dev();
        }

        let returns: Vec<f64> = ordered.iter().filter_map(|e| e.return_pct().to_f64()).collect();
        summary.mean_return = returns.mean();

        summary
    }
}

fn max_drawdown(pnls: &[Decimal]) -> Decimal {
    let mut equity = Decimal::ZERO;
    let mut peak = Decimal::ZERO;
    let mut max_dd = Decimal::ZERO;

    for pnl in pnls {
        equity += pnl;
        if equity > peak {
            peak = equity;
        }
        max_dd = max_dd.max(peak - equity);
    }

    max_dd
}
