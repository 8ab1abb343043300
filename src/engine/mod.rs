// 执行引擎 - 协调器与恢复加载
pub mod coordinator;
pub mod recovery;

pub use coordinator::ExecutionCoordinator;
pub use recovery::RecoveryLoader;

use crate::core::risk_ledger::RiskState;
use crate::core::types::{OrderSide, PerformanceStats, TradeRecord};

/// 由成交记录与风控状态汇总绩效
pub fn summarize(trades: &[TradeRecord], risk: &RiskState) -> PerformanceStats {
    let mut stats = PerformanceStats {
        total_trades: trades.len() as u64,
        total_bought: 0.0,
        total_sold: 0.0,
        total_fees: 0.0,
        realized_pnl: 0.0,
        equity: risk.equity_snapshot,
        drawdown_pct: if risk.peak_equity > 0.0 {
            (risk.peak_equity - risk.equity_snapshot) / risk.peak_equity
        } else {
            0.0
        },
        daily_pnl: risk.daily_realized_pnl,
        trading_paused: risk.trading_paused,
    };

    for trade in trades {
        let notional = trade.filled_price * trade.filled_quantity;
        match trade.side {
            OrderSide::Buy => stats.total_bought += notional,
            OrderSide::Sell => stats.total_sold += notional,
        }
        stats.total_fees += trade.fee;
        stats.realized_pnl += trade.realized_pnl;
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn summarize_totals_by_side() {
        let risk = RiskState {
            equity_snapshot: 10_050.0,
            peak_equity: 10_100.0,
            daily_realized_pnl: 50.0,
            trading_paused: false,
            pause_reason: None,
            day_start: Utc::now(),
            applied_trades: 2,
        };
        let trades = vec![
            TradeRecord {
                order_id: "a".to_string(),
                symbol: "BTC/USD".to_string(),
                side: OrderSide::Buy,
                filled_price: 100.0,
                filled_quantity: 1.0,
                fee: 0.1,
                realized_pnl: -0.1,
                timestamp: Utc::now(),
            },
            TradeRecord {
                order_id: "b".to_string(),
                symbol: "BTC/USD".to_string(),
                side: OrderSide::Sell,
                filled_price: 105.0,
                filled_quantity: 1.0,
                fee: 0.1,
                realized_pnl: 4.9,
                timestamp: Utc::now(),
            },
        ];

        let stats = summarize(&trades, &risk);
        assert_eq!(stats.total_trades, 2);
        assert!((stats.total_bought - 100.0).abs() < 1e-9);
        assert!((stats.total_sold - 105.0).abs() < 1e-9);
        assert!((stats.realized_pnl - 4.8).abs() < 1e-9);
        assert!(stats.drawdown_pct > 0.0);
    }
}
