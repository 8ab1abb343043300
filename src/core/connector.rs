//! 交易所连接器抽象
//! 核心引擎只依赖该契约，真实交易所的认证与传输在外部实现

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::core::error::BotError;
use crate::core::types::{
    Balance, Fill, Order, OrderIntent, OrderKind, OrderSide, OrderStatus, Result, Ticker,
};

/// 交易所连接器契约
///
/// 错误约定: 网络/限频类失败返回 `BotError::Transient`，
/// 交易所明确拒绝返回 `BotError::Rejected` 或 `InsufficientBalance`
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker>;
    async fn get_balances(&self) -> Result<HashMap<String, Balance>>;
    async fn place_order(&self, intent: &OrderIntent) -> Result<Order>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()>;
    async fn list_open_orders(&self) -> Result<Vec<Order>>;
    /// 返回时间严格大于since的成交事件，按时间升序
    async fn list_fills(&self, since: DateTime<Utc>) -> Result<Vec<Fill>>;
}

/// 拆分交易对符号 "BTC/USD" -> ("BTC", "USD")
pub fn split_symbol(symbol: &str) -> Result<(&str, &str)> {
    symbol
        .split_once('/')
        .ok_or_else(|| BotError::Config(format!("交易对格式错误: {}", symbol)))
}

// ============= 模拟盘连接器 =============

struct PaperState {
    balances: HashMap<String, f64>,
    prices: HashMap<String, f64>,
    orders: HashMap<String, Order>,
    fills: Vec<Fill>,
    order_counter: u64,
}

/// 模拟盘连接器
///
/// 在内存中模拟现货交易所: 市价单立即成交，
/// 限价单挂起，价格穿越时成交
pub struct PaperConnector {
    state: RwLock<PaperState>,
    fee_pct: f64,
    /// 是否在每次行情查询时做随机游走（干跑模式用）
    random_walk: bool,
}

impl PaperConnector {
    pub fn new(initial_quote: f64, quote_currency: &str, initial_prices: HashMap<String, f64>) -> Self {
        let mut balances = HashMap::new();
        balances.insert(quote_currency.to_string(), initial_quote);

        log::info!(
            "📋 模拟盘初始化: {} {:.2}, {} 个交易对",
            quote_currency,
            initial_quote,
            initial_prices.len()
        );

        Self {
            state: RwLock::new(PaperState {
                balances,
                prices: initial_prices,
                orders: HashMap::new(),
                fills: Vec::new(),
                order_counter: 0,
            }),
            fee_pct: 0.0,
            random_walk: false,
        }
    }

    pub fn with_fee(mut self, fee_pct: f64) -> Self {
        self.fee_pct = fee_pct;
        self
    }

    pub fn with_random_walk(mut self, enabled: bool) -> Self {
        self.random_walk = enabled;
        self
    }

    /// 设置价格并撮合被穿越的限价单（测试与回放驱动）
    pub async fn set_price(&self, symbol: &str, price: f64) {
        let mut state = self.state.write().await;
        state.prices.insert(symbol.to_string(), price);
        Self::match_resting_orders(&mut state, symbol, price, self.fee_pct);
    }

    pub async fn deposit(&self, currency: &str, amount: f64) {
        let mut state = self.state.write().await;
        *state.balances.entry(currency.to_string()).or_insert(0.0) += amount;
    }

    /// 撮合价格穿越的限价单
    fn match_resting_orders(state: &mut PaperState, symbol: &str, price: f64, fee_pct: f64) {
        let crossed: Vec<String> = state
            .orders
            .values()
            .filter(|o| {
                o.symbol == symbol
                    && o.status == OrderStatus::Open
                    && o.kind == OrderKind::Limit
                    && match (o.side, o.price) {
                        (OrderSide::Buy, Some(limit)) => price <= limit,
                        (OrderSide::Sell, Some(limit)) => price >= limit,
                        _ => false,
                    }
            })
            .map(|o| o.id.clone())
            .collect();

        for order_id in crossed {
            let (side, limit_price, quantity) = {
                let order = &state.orders[&order_id];
                (order.side, order.price.unwrap_or(price), order.quantity)
            };

            if Self::settle(state, symbol, side, limit_price, quantity, fee_pct).is_err() {
                log::warn!("⚠️ 模拟盘余额不足，限价单 {} 无法成交", order_id);
                continue;
            }

            let fee = limit_price * quantity * fee_pct;
            if let Some(order) = state.orders.get_mut(&order_id) {
                order.filled = order.quantity;
                order.status = OrderStatus::Filled;
                order.updated_at = Utc::now();
            }
            state.fills.push(Fill {
                order_id: order_id.clone(),
                symbol: symbol.to_string(),
                side,
                price: limit_price,
                quantity,
                fee,
                timestamp: Utc::now(),
            });
            log::info!(
                "📊 模拟盘限价单成交: {} {} {:.8} @ {:.4}",
                order_id,
                side,
                quantity,
                limit_price
            );
        }
    }

    /// 结算余额变动，余额不足时返回错误且不做任何改动
    fn settle(
        state: &mut PaperState,
        symbol: &str,
        side: OrderSide,
        price: f64,
        quantity: f64,
        fee_pct: f64,
    ) -> std::result::Result<(), ()> {
        let (base, quote) = match symbol.split_once('/') {
            Some(parts) => parts,
            None => return Err(()),
        };
        let notional = price * quantity;
        let fee = notional * fee_pct;

        match side {
            OrderSide::Buy => {
                let available = *state.balances.get(quote).unwrap_or(&0.0);
                if available < notional + fee {
                    return Err(());
                }
                *state.balances.entry(quote.to_string()).or_insert(0.0) -= notional + fee;
                *state.balances.entry(base.to_string()).or_insert(0.0) += quantity;
            }
            OrderSide::Sell => {
                let available = *state.balances.get(base).unwrap_or(&0.0);
                if available < quantity {
                    return Err(());
                }
                *state.balances.entry(base.to_string()).or_insert(0.0) -= quantity;
                *state.balances.entry(quote.to_string()).or_insert(0.0) += notional - fee;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeConnector for PaperConnector {
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
        let mut state = self.state.write().await;
        let mut price = *state
            .prices
            .get(symbol)
            .ok_or_else(|| BotError::Transient(format!("无{}的价格数据", symbol)))?;

        if self.random_walk {
            let step: f64 = rand::thread_rng().gen_range(-0.002..0.002);
            price *= 1.0 + step;
            state.prices.insert(symbol.to_string(), price);
            Self::match_resting_orders(&mut state, symbol, price, self.fee_pct);
        }

        Ok(Ticker {
            symbol: symbol.to_string(),
            bid: price * 0.9995,
            ask: price * 1.0005,
            last: price,
            timestamp: Utc::now(),
        })
    }

    async fn get_balances(&self) -> Result<HashMap<String, Balance>> {
        let state = self.state.read().await;
        Ok(state
            .balances
            .iter()
            .map(|(currency, amount)| {
                (
                    currency.clone(),
                    Balance {
                        currency: currency.clone(),
                        free: *amount,
                        used: 0.0,
                        total: *amount,
                    },
                )
            })
            .collect())
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<Order> {
        let mut state = self.state.write().await;
        state.order_counter += 1;
        let order_id = format!("paper_{}", state.order_counter);

        let last = *state
            .prices
            .get(&intent.symbol)
            .ok_or_else(|| BotError::Transient(format!("无{}的价格数据", intent.symbol)))?;

        match intent.kind {
            OrderKind::Market => {
                let exec_price = intent.price.unwrap_or(last);
                if Self::settle(
                    &mut state,
                    &intent.symbol,
                    intent.side,
                    exec_price,
                    intent.quantity,
                    self.fee_pct,
                )
                .is_err()
                {
                    return Err(BotError::InsufficientBalance {
                        required: exec_price * intent.quantity,
                        available: 0.0,
                    });
                }

                let mut order = Order::from_intent(intent, order_id.clone(), OrderStatus::Filled);
                order.filled = intent.quantity;
                order.price = Some(exec_price);
                state.fills.push(Fill {
                    order_id: order_id.clone(),
                    symbol: intent.symbol.clone(),
                    side: intent.side,
                    price: exec_price,
                    quantity: intent.quantity,
                    fee: exec_price * intent.quantity * self.fee_pct,
                    timestamp: Utc::now(),
                });
                state.orders.insert(order_id, order.clone());
                log::info!(
                    "📊 模拟盘市价单成交: {} {:.8} {} @ {:.4}",
                    intent.side,
                    intent.quantity,
                    intent.symbol,
                    exec_price
                );
                Ok(order)
            }
            OrderKind::Limit => {
                let limit = intent
                    .price
                    .ok_or_else(|| BotError::Rejected("限价单缺少价格".to_string()))?;
                if limit <= 0.0 || intent.quantity <= 0.0 {
                    return Err(BotError::Rejected(format!(
                        "无效的限价单参数: 价格={} 数量={}",
                        limit, intent.quantity
                    )));
                }

                let order = Order::from_intent(intent, order_id.clone(), OrderStatus::Open);
                state.orders.insert(order_id.clone(), order.clone());

                // 价格已穿越时立即撮合
                Self::match_resting_orders(&mut state, &intent.symbol, last, self.fee_pct);
                let current = state.orders[&order_id].clone();
                Ok(current)
            }
        }
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        match state.orders.get_mut(order_id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = OrderStatus::Cancelled;
                order.updated_at = Utc::now();
                log::info!("🚫 模拟盘撤单: {}", order_id);
                Ok(())
            }
            Some(_) => Ok(()), // 已终态，撤单幂等
            None => Err(BotError::OrderNotFound {
                order_id: order_id.to_string(),
                symbol: symbol.to_string(),
            }),
        }
    }

    async fn list_open_orders(&self) -> Result<Vec<Order>> {
        let state = self.state.read().await;
        Ok(state
            .orders
            .values()
            .filter(|o| matches!(o.status, OrderStatus::Open | OrderStatus::PartiallyFilled))
            .cloned()
            .collect())
    }

    async fn list_fills(&self, since: DateTime<Utc>) -> Result<Vec<Fill>> {
        let state = self.state.read().await;
        let mut fills: Vec<Fill> = state
            .fills
            .iter()
            .filter(|f| f.timestamp > since)
            .cloned()
            .collect();
        fills.sort_by_key(|f| f.timestamp);
        Ok(fills)
    }
}
