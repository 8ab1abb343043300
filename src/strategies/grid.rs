//! 网格策略
//!
//! 以首次观察到的价格为中心铺设价位网格，每个网格区间同一时刻
//! 只占用一张订单：区间下沿的买单，或买单成交后武装在区间上沿的卖单。
//! 卖单成交释放区间，买单在下一周期自动补挂，形成自愈循环

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::config::{GridConfig, GridSpacing};
use crate::core::types::{Fill, Order, OrderIntent, OrderKind, OrderSide};
use crate::strategies::CycleContext;
use crate::utils::generate_order_id_with_tag;

/// 单个网格价位
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridLevel {
    pub price: f64,
    /// 本价位活动买单的客户端订单ID
    pub buy_order: Option<String>,
    /// 本价位活动卖单的客户端订单ID
    pub sell_order: Option<String>,
    /// 已由下方买单成交武装、待挂出的卖出数量
    pub armed_sell_qty: f64,
}

/// 网格持久化状态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GridState {
    pub center_price: f64,
    pub levels: Vec<GridLevel>,
    /// 网格总预算（报价货币）
    pub allocation_total: f64,
    /// 剩余可用预算，买单占用，卖出回笼
    pub allocation_remaining: f64,
    pub per_level_quote: f64,
    /// 客户端订单ID -> 尚未消耗的预算占用
    pub reservations: HashMap<String, f64>,
}

pub struct GridStrategy {
    symbol: String,
    config: GridConfig,
    state: GridState,
}

impl GridStrategy {
    pub fn new(symbol: &str, config: GridConfig) -> Self {
        Self {
            symbol: symbol.to_string(),
            config,
            state: GridState::default(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn state(&self) -> &GridState {
        &self.state
    }

    pub fn load_state(&mut self, state: GridState) {
        log::info!(
            "📥 网格状态恢复: {} 中心价 {:.4}, {} 个价位, 剩余预算 {:.2}",
            self.symbol,
            state.center_price,
            state.levels.len(),
            state.allocation_remaining
        );
        self.state = state;
    }

    /// 以center为中心铺设价位，num_grids个区间对应num_grids+1个价位
    fn initialize(&mut self, center: f64, equity: f64) {
        let lower = center * (1.0 - self.config.lower_price_pct);
        let upper = center * (1.0 + self.config.upper_price_pct);
        let n = self.config.num_grids;

        let mut levels = Vec::with_capacity(n as usize + 1);
        for i in 0..=n {
            let price = match self.config.spacing {
                GridSpacing::Arithmetic => {
                    lower + (upper - lower) * i as f64 / n as f64
                }
                GridSpacing::Geometric => {
                    lower * (upper / lower).powf(i as f64 / n as f64)
                }
            };
            levels.push(GridLevel {
                price,
                buy_order: None,
                sell_order: None,
                armed_sell_qty: 0.0,
            });
        }

        let allocation = equity * self.config.allocation_pct;
        self.state = GridState {
            center_price: center,
            allocation_total: allocation,
            allocation_remaining: allocation,
            per_level_quote: allocation / n as f64,
            levels,
            reservations: HashMap::new(),
        };

        log::info!(
            "📊 网格初始化: {} 中心价 {:.4}, 区间 [{:.4}, {:.4}], {} 格, 预算 {:.2}",
            self.symbol,
            center,
            lower,
            upper,
            n,
            allocation
        );
    }

    /// 区间i（价位i与i+1之间）是否已被上沿卖单占用
    fn gap_sell_active(&self, i: usize) -> bool {
        match self.state.levels.get(i + 1) {
            Some(above) => above.sell_order.is_some() || above.armed_sell_qty > 0.0,
            // 最高价位之上没有区间，不补挂买单
            None => true,
        }
    }

    pub fn propose(&mut self, ctx: &CycleContext) -> Vec<OrderIntent> {
        if !self.config.enabled {
            return Vec::new();
        }
        if self.state.levels.is_empty() {
            self.initialize(ctx.ticker.last, ctx.equity);
        }

        let last = ctx.ticker.last;
        let mut intents = Vec::new();

        for i in 0..self.state.levels.len() {
            let level = self.state.levels[i].clone();

            // 武装好的卖单挂到价位上
            if level.armed_sell_qty > 0.0 && level.sell_order.is_none() {
                let coid = generate_order_id_with_tag("GRID");
                self.state.levels[i].sell_order = Some(coid.clone());
                intents.push(OrderIntent {
                    client_order_id: coid,
                    symbol: self.symbol.clone(),
                    side: OrderSide::Sell,
                    kind: OrderKind::Limit,
                    price: Some(level.price),
                    quantity: level.armed_sell_qty,
                    strategy: "grid".to_string(),
                    reason: format!("网格卖出 @ {:.4}", level.price),
                });
                continue;
            }

            // 价格之下的空闲区间补挂买单
            if level.price < last
                && level.buy_order.is_none()
                && !self.gap_sell_active(i)
            {
                if self.state.allocation_remaining + 1e-9 < self.state.per_level_quote {
                    log::debug!(
                        "🚫 网格预算不足: {} 剩余 {:.2} < {:.2}",
                        self.symbol,
                        self.state.allocation_remaining,
                        self.state.per_level_quote
                    );
                    continue;
                }
                let quantity = self.state.per_level_quote / level.price;
                let coid = generate_order_id_with_tag("GRID");
                self.state.allocation_remaining -= self.state.per_level_quote;
                self.state
                    .reservations
                    .insert(coid.clone(), self.state.per_level_quote);
                self.state.levels[i].buy_order = Some(coid.clone());
                intents.push(OrderIntent {
                    client_order_id: coid,
                    symbol: self.symbol.clone(),
                    side: OrderSide::Buy,
                    kind: OrderKind::Limit,
                    price: Some(level.price),
                    quantity,
                    strategy: "grid".to_string(),
                    reason: format!("网格买入 @ {:.4}", level.price),
                });
            }
        }

        intents
    }

    fn find_level(&self, client_order_id: &str) -> Option<(usize, OrderSide)> {
        for (i, level) in self.state.levels.iter().enumerate() {
            if level.buy_order.as_deref() == Some(client_order_id) {
                return Some((i, OrderSide::Buy));
            }
            if level.sell_order.as_deref() == Some(client_order_id) {
                return Some((i, OrderSide::Sell));
            }
        }
        None
    }

    /// 下单回执：风控可能缩减了数量，按实际订单调整预算占用
    pub fn on_order_tracked(&mut self, order: &Order) {
        if let Some((i, OrderSide::Buy)) = self.find_level(&order.client_order_id) {
            let price = order.price.unwrap_or(self.state.levels[i].price);
            let actual = price * order.quantity;
            if let Some(reserved) = self.state.reservations.get_mut(&order.client_order_id) {
                if actual < *reserved {
                    self.state.allocation_remaining += *reserved - actual;
                    *reserved = actual;
                }
            }
        }
    }

    /// 订单被拒绝或取消，释放价位与剩余预算占用
    pub fn on_order_closed(&mut self, client_order_id: &str) {
        if let Some((i, side)) = self.find_level(client_order_id) {
            match side {
                OrderSide::Buy => {
                    self.state.levels[i].buy_order = None;
                    if let Some(reserved) = self.state.reservations.remove(client_order_id) {
                        self.state.allocation_remaining += reserved;
                    }
                }
                OrderSide::Sell => {
                    // 武装数量保留，下一周期重新挂出
                    self.state.levels[i].sell_order = None;
                }
            }
        }
    }

    pub fn on_fill(&mut self, order: &Order, fill: &Fill) {
        let Some((i, side)) = self.find_level(&order.client_order_id) else {
            return;
        };

        match side {
            OrderSide::Buy => {
                // 已成交部分的预算占用转为持仓，不再回笼
                let cost = fill.price * fill.quantity;
                if let Some(reserved) = self.state.reservations.get_mut(&order.client_order_id) {
                    *reserved = (*reserved - cost).max(0.0);
                }

                // 买单成交，武装上一个价位的卖单
                if i + 1 < self.state.levels.len() {
                    self.state.levels[i + 1].armed_sell_qty += fill.quantity;
                    log::info!(
                        "📈 网格买入成交: {} {:.8} @ {:.4}, 武装卖出 @ {:.4}",
                        self.symbol,
                        fill.quantity,
                        fill.price,
                        self.state.levels[i + 1].price
                    );
                }

                if order.status.is_terminal() {
                    self.state.levels[i].buy_order = None;
                    if let Some(residual) =
                        self.state.reservations.remove(&order.client_order_id)
                    {
                        self.state.allocation_remaining += residual;
                    }
                }
            }
            OrderSide::Sell => {
                // 卖出回笼预算，区间释放后买单自动补挂
                self.state.allocation_remaining += fill.price * fill.quantity - fill.fee;
                self.state.levels[i].armed_sell_qty =
                    (self.state.levels[i].armed_sell_qty - fill.quantity).max(0.0);
                log::info!(
                    "📉 网格卖出成交: {} {:.8} @ {:.4}, 预算回笼至 {:.2}",
                    self.symbol,
                    fill.quantity,
                    fill.price,
                    self.state.allocation_remaining
                );
                if order.status.is_terminal() {
                    self.state.levels[i].sell_order = None;
                    self.state.levels[i].armed_sell_qty = 0.0;
                }
            }
        }
    }
}
