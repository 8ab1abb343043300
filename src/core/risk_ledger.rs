//! 风控账本模块
//! 统一管理净值、持仓、日盈亏与交易暂停标志
//! 策略提议，账本裁决：所有订单意图必须经过evaluate审批

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::config::RiskConfig;
use crate::core::types::{Fill, OrderIntent, OrderSide, Position, TradeRecord};
use crate::utils::clock::{crossed_day_boundary, day_anchor};

/// 风控状态（持久化记录，随控制循环传递，不做全局单例）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskState {
    pub equity_snapshot: f64,
    /// 历史最高净值（单调递增，用于计算回撤）
    pub peak_equity: f64,
    pub daily_realized_pnl: f64,
    /// 粘性暂停标志：一旦置位，只有显式resume才能清除
    pub trading_paused: bool,
    pub pause_reason: Option<String>,
    pub day_start: DateTime<Utc>,
    /// 已反映进本状态的成交记录条数，用于恢复时与成交日志对齐
    #[serde(default)]
    pub applied_trades: u64,
}

/// 审批结果
#[derive(Debug, Clone)]
pub enum RiskVerdict {
    /// 通过，数量可能已被缩减
    Approved(OrderIntent),
    /// 拒绝（政策裁决，附原因，非错误）
    Rejected(String),
}

/// 风控账本
pub struct RiskLedger {
    config: RiskConfig,
    day_boundary_hour: u32,
    state: RiskState,
    /// 按基础资产记录的持仓
    positions: HashMap<String, Position>,
}

impl RiskLedger {
    pub fn new(
        config: RiskConfig,
        day_boundary_hour: u32,
        initial_equity: f64,
        now: DateTime<Utc>,
    ) -> Self {
        log::info!("💰 风控账本初始化: 净值 {:.2}", initial_equity);
        Self {
            config,
            day_boundary_hour,
            state: RiskState {
                equity_snapshot: initial_equity,
                peak_equity: initial_equity,
                daily_realized_pnl: 0.0,
                trading_paused: false,
                pause_reason: None,
                day_start: day_anchor(now, day_boundary_hour),
                applied_trades: 0,
            },
            positions: HashMap::new(),
        }
    }

    /// 从持久化状态恢复
    pub fn from_parts(
        config: RiskConfig,
        day_boundary_hour: u32,
        state: RiskState,
        positions: HashMap<String, Position>,
    ) -> Self {
        Self {
            config,
            day_boundary_hour,
            state,
            positions,
        }
    }

    pub fn state(&self) -> &RiskState {
        &self.state
    }

    pub fn positions(&self) -> &HashMap<String, Position> {
        &self.positions
    }

    pub fn position(&self, asset: &str) -> Position {
        self.positions
            .get(asset)
            .cloned()
            .unwrap_or_else(|| Position::empty(asset))
    }

    pub fn is_paused(&self) -> bool {
        self.state.trading_paused
    }

    /// 当前回撤比例
    pub fn drawdown(&self) -> f64 {
        if self.state.peak_equity <= 0.0 {
            return 0.0;
        }
        (self.state.peak_equity - self.state.equity_snapshot) / self.state.peak_equity
    }

    /// 日界检查：跨界时重置日盈亏（恰好在日界，绝不中途重置）
    /// 暂停标志不随日界自动清除
    pub fn roll_day(&mut self, now: DateTime<Utc>) {
        if crossed_day_boundary(self.state.day_start, now, self.day_boundary_hour) {
            self.state.day_start = day_anchor(now, self.day_boundary_hour);
            self.state.daily_realized_pnl = 0.0;
            log::info!("📅 跨过日界，日盈亏计数重置");
        }
    }

    fn pause(&mut self, reason: String) {
        if !self.state.trading_paused {
            log::error!("🛑 交易暂停: {}", reason);
            self.state.trading_paused = true;
            self.state.pause_reason = Some(reason);
        }
    }

    /// 显式恢复交易，清除粘性暂停标志
    pub fn resume(&mut self) {
        if self.state.trading_paused {
            log::warn!(
                "▶️ 交易恢复（此前原因: {}）",
                self.state.pause_reason.as_deref().unwrap_or("未知")
            );
        }
        self.state.trading_paused = false;
        self.state.pause_reason = None;
    }

    /// 审批订单意图
    ///
    /// 数量上限 = 单笔风险比例 × 净值 / (止损比例 × 价格)，
    /// 即止损触发时的损失不超过配置的单笔风险额度
    pub fn evaluate(
        &mut self,
        intent: OrderIntent,
        last_price: f64,
        now: DateTime<Utc>,
    ) -> RiskVerdict {
        self.roll_day(now);

        if self.state.trading_paused {
            return RiskVerdict::Rejected(format!(
                "交易已暂停: {}",
                self.state.pause_reason.as_deref().unwrap_or("未知")
            ));
        }

        let price = intent.price.unwrap_or(last_price);
        if price <= 0.0 || intent.quantity <= 0.0 {
            return RiskVerdict::Rejected(format!(
                "无效的意图参数: 价格={:.8} 数量={:.8}",
                price, intent.quantity
            ));
        }

        // 回撤检查（触发即置粘性暂停）
        let drawdown = self.drawdown();
        if drawdown >= self.config.max_drawdown_pct {
            self.pause(format!(
                "最大回撤触发: {:.1}% >= {:.1}%",
                drawdown * 100.0,
                self.config.max_drawdown_pct * 100.0
            ));
            return RiskVerdict::Rejected(
                self.state.pause_reason.clone().unwrap_or_default(),
            );
        }

        // 仓位规模：止损时的损失不超过单笔风险额度
        let equity = self.state.equity_snapshot;
        let risk_amount = equity * self.config.max_risk_per_trade_pct;
        let max_quantity = risk_amount / (self.config.stop_loss_pct * price);
        let quantity = intent.quantity.min(max_quantity);

        // 预测日亏损：本单止损后是否会突破日亏损上限
        // （已突破的情形由成交记录时置位的暂停标志兜底，
        //  显式resume之后不重复触发）
        let daily_limit = self.config.daily_loss_limit_pct * equity;
        let loss_at_stop = quantity * price * self.config.stop_loss_pct;
        if self.state.daily_realized_pnl > -daily_limit
            && self.state.daily_realized_pnl - loss_at_stop < -daily_limit
        {
            return RiskVerdict::Rejected(format!(
                "预测将突破日亏损上限: 当前 {:.2}, 止损后 {:.2}, 上限 -{:.2}",
                self.state.daily_realized_pnl,
                self.state.daily_realized_pnl - loss_at_stop,
                daily_limit
            ));
        }

        if quantity < intent.quantity {
            log::info!(
                "✂️ 风控缩减订单: {} {:.8} -> {:.8}",
                intent.symbol,
                intent.quantity,
                quantity
            );
        }

        let mut sized = intent;
        sized.quantity = quantity;
        RiskVerdict::Approved(sized)
    }

    /// 记录已确认成交
    ///
    /// 更新持仓（均价成本法）、日盈亏、净值与峰值，
    /// 返回待追加的成交记录；调用方必须在本周期结束前持久化该记录
    pub fn record_fill(&mut self, fill: &Fill, base_asset: &str, now: DateTime<Utc>) -> TradeRecord {
        self.roll_day(now);

        let position = self
            .positions
            .entry(base_asset.to_string())
            .or_insert_with(|| Position::empty(base_asset));

        let realized_pnl = match fill.side {
            OrderSide::Buy => {
                let total_cost = position.average_cost * position.quantity
                    + fill.price * fill.quantity;
                position.quantity += fill.quantity;
                if position.quantity > 0.0 {
                    position.average_cost = total_cost / position.quantity;
                }
                -fill.fee
            }
            OrderSide::Sell => {
                let sell_quantity = if fill.quantity > position.quantity {
                    // 不允许做空：卖出数量超过持仓视为对账异常，按持仓截断
                    log::error!(
                        "❌ 卖出成交超过持仓: {} {:.8} > {:.8}",
                        base_asset,
                        fill.quantity,
                        position.quantity
                    );
                    position.quantity
                } else {
                    fill.quantity
                };
                position.quantity -= sell_quantity;
                (fill.price - position.average_cost) * sell_quantity - fill.fee
            }
        };

        self.state.daily_realized_pnl += realized_pnl;
        self.state.equity_snapshot += realized_pnl;
        if self.state.equity_snapshot > self.state.peak_equity {
            self.state.peak_equity = self.state.equity_snapshot;
        }

        // 日亏损上限突破检查（成交时置位，粘性）
        let daily_limit = self.config.daily_loss_limit_pct * self.state.equity_snapshot;
        if self.state.daily_realized_pnl <= -daily_limit {
            self.pause(format!(
                "日亏损上限触发: {:.2} <= -{:.2}",
                self.state.daily_realized_pnl, daily_limit
            ));
        }

        self.state.applied_trades += 1;

        TradeRecord {
            order_id: fill.order_id.clone(),
            symbol: fill.symbol.clone(),
            side: fill.side,
            filled_price: fill.price,
            filled_quantity: fill.quantity,
            fee: fill.fee,
            realized_pnl,
            timestamp: fill.timestamp,
        }
    }

    /// 由成交记录重建持仓（恢复路径，与record_fill的持仓算法一致）
    pub fn apply_trade(&mut self, record: &TradeRecord, base_asset: &str) {
        let position = self
            .positions
            .entry(base_asset.to_string())
            .or_insert_with(|| Position::empty(base_asset));

        match record.side {
            OrderSide::Buy => {
                let total_cost = position.average_cost * position.quantity
                    + record.filled_price * record.filled_quantity;
                position.quantity += record.filled_quantity;
                if position.quantity > 0.0 {
                    position.average_cost = total_cost / position.quantity;
                }
            }
            OrderSide::Sell => {
                position.quantity = (position.quantity - record.filled_quantity).max(0.0);
            }
        }
    }

    /// 把快照之后追加的成交记录完整补入账本（恢复路径）
    ///
    /// 与record_fill等效地推进持仓、净值、峰值与日盈亏，
    /// 成交日志是账本的最终事实来源，快照只是加速手段
    pub fn replay_trade(&mut self, record: &TradeRecord, base_asset: &str) {
        self.apply_trade(record, base_asset);

        self.state.equity_snapshot += record.realized_pnl;
        if self.state.equity_snapshot > self.state.peak_equity {
            self.state.peak_equity = self.state.equity_snapshot;
        }
        if record.timestamp >= self.state.day_start {
            self.state.daily_realized_pnl += record.realized_pnl;
            let daily_limit = self.config.daily_loss_limit_pct * self.state.equity_snapshot;
            if self.state.daily_realized_pnl <= -daily_limit {
                self.pause(format!(
                    "日亏损上限触发: {:.2} <= -{:.2}",
                    self.state.daily_realized_pnl, daily_limit
                ));
            }
        }
        self.state.applied_trades += 1;
    }

    /// 标记前n条成交记录已反映在当前状态中
    pub fn mark_applied(&mut self, n: u64) {
        self.state.applied_trades = n;
    }

    /// 按最新获取的账户净值重算回撤（周期性对账路径）
    pub fn update_equity(&mut self, equity: f64, now: DateTime<Utc>) {
        self.roll_day(now);
        self.state.equity_snapshot = equity;
        if equity > self.state.peak_equity {
            self.state.peak_equity = equity;
        }

        let drawdown = self.drawdown();
        if drawdown >= self.config.max_drawdown_pct {
            self.pause(format!(
                "最大回撤触发: {:.1}% >= {:.1}%",
                drawdown * 100.0,
                self.config.max_drawdown_pct * 100.0
            ));
        }
    }
}
