//! 定投策略
//!
//! 两类触发：定时买入（距上次买入超过配置间隔）与逢跌加仓
//! （现价较上次买入价下跌超过配置比例）。两类触发共用同一个
//! 日内买入次数上限，超限后本日剩余触发全部抑制

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::config::DcaConfig;
use crate::core::types::{Fill, Order, OrderIntent, OrderKind, OrderSide, OrderStatus};
use crate::strategies::CycleContext;
use crate::utils::clock::{crossed_day_boundary, day_anchor};
use crate::utils::generate_order_id_with_tag;

/// 定投持久化状态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DcaState {
    pub last_buy_time: Option<DateTime<Utc>>,
    /// 逢跌触发的参照价（最近一次买入成交价）
    pub last_buy_price: Option<f64>,
    pub buys_today: u32,
    pub day_start: Option<DateTime<Utc>>,
    /// 在途订单的客户端ID，同一时刻最多一笔在途
    pub pending_order: Option<String>,
}

pub struct DcaStrategy {
    symbol: String,
    config: DcaConfig,
    day_boundary_hour: u32,
    state: DcaState,
}

impl DcaStrategy {
    pub fn new(symbol: &str, config: DcaConfig, day_boundary_hour: u32) -> Self {
        Self {
            symbol: symbol.to_string(),
            config,
            day_boundary_hour,
            state: DcaState::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state(&self) -> &DcaState {
        &self.state
    }

    pub fn load_state(&mut self, state: DcaState) {
        log::info!(
            "📥 定投状态恢复: {} 上次买入 {:?} @ {:?}, 今日 {} 次",
            self.symbol,
            state.last_buy_time,
            state.last_buy_price,
            state.buys_today
        );
        self.state = state;
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        match self.state.day_start {
            None => self.state.day_start = Some(day_anchor(now, self.day_boundary_hour)),
            Some(day_start) => {
                if crossed_day_boundary(day_start, now, self.day_boundary_hour) {
                    self.state.day_start = Some(day_anchor(now, self.day_boundary_hour));
                    self.state.buys_today = 0;
                    log::info!("📅 定投日计数重置: {}", self.symbol);
                }
            }
        }
    }

    pub fn propose(&mut self, ctx: &CycleContext) -> Vec<OrderIntent> {
        if !self.config.enabled {
            return Vec::new();
        }
        self.roll_day(ctx.now);

        if self.state.pending_order.is_some() {
            return Vec::new();
        }
        if self.state.buys_today >= self.config.max_buys_per_day {
            log::debug!(
                "🚫 定投抑制: {} 今日已买 {} 次达上限",
                self.symbol,
                self.state.buys_today
            );
            return Vec::new();
        }

        let interval = Duration::hours(self.config.buy_interval_hours as i64);
        let scheduled = match self.state.last_buy_time {
            None => true,
            Some(t) => ctx.now - t >= interval,
        };
        let dip = match self.state.last_buy_price {
            Some(p) => ctx.ticker.last <= p * (1.0 - self.config.price_drop_trigger_pct),
            None => false,
        };

        if !scheduled && !dip {
            return Vec::new();
        }

        let reason = if dip && !scheduled {
            format!(
                "逢跌加仓: 现价 {:.4} 较上次买入 {:.4} 跌超 {:.1}%",
                ctx.ticker.last,
                self.state.last_buy_price.unwrap_or(0.0),
                self.config.price_drop_trigger_pct * 100.0
            )
        } else {
            "定时买入".to_string()
        };

        let quantity = ctx.equity * self.config.buy_amount_pct / ctx.ticker.last;
        let coid = generate_order_id_with_tag("DCA");
        self.state.pending_order = Some(coid.clone());

        log::info!("🛒 定投触发: {} {:.8} ({})", self.symbol, quantity, reason);

        vec![OrderIntent {
            client_order_id: coid,
            symbol: self.symbol.clone(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            price: None,
            quantity,
            strategy: "dca".to_string(),
            reason,
        }]
    }

    pub fn on_order_closed(&mut self, client_order_id: &str) {
        if self.state.pending_order.as_deref() == Some(client_order_id) {
            self.state.pending_order = None;
        }
    }

    pub fn on_fill(&mut self, order: &Order, fill: &Fill, now: DateTime<Utc>) {
        if self.state.pending_order.as_deref() != Some(order.client_order_id.as_str()) {
            return;
        }
        self.roll_day(now);
        self.state.last_buy_price = Some(fill.price);

        if order.status == OrderStatus::Filled {
            self.state.buys_today += 1;
            self.state.last_buy_time = Some(now);
            self.state.pending_order = None;
            log::info!(
                "✅ 定投买入完成: {} {:.8} @ {:.4} (今日第 {} 次)",
                self.symbol,
                fill.quantity,
                fill.price,
                self.state.buys_today
            );
        }
    }
}
