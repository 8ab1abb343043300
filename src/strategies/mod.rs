//! 策略模块
//! 策略只产生订单意图，不直接下单；审批、下单与成交回报由执行协调器统一处理

use chrono::{DateTime, Utc};

use crate::core::types::{Fill, Order, OrderIntent, Result, Ticker};

pub mod dca;
pub mod grid;

pub use dca::DcaStrategy;
pub use grid::GridStrategy;

/// 策略在每个周期收到的市场与账户快照
#[derive(Debug, Clone)]
pub struct CycleContext {
    pub ticker: Ticker,
    pub equity: f64,
    pub now: DateTime<Utc>,
}

/// 已注册策略的封闭集合
///
/// 新策略在此追加变体，协调器按配置的优先级顺序轮询
pub enum StrategyKind {
    Grid(GridStrategy),
    Dca(DcaStrategy),
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::Grid(_) => "grid",
            StrategyKind::Dca(_) => "dca",
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            StrategyKind::Grid(s) => s.symbol(),
            StrategyKind::Dca(s) => s.symbol(),
        }
    }

    /// 根据当前快照生成订单意图（可能为空）
    pub fn propose(&mut self, ctx: &CycleContext) -> Vec<OrderIntent> {
        match self {
            StrategyKind::Grid(s) => s.propose(ctx),
            StrategyKind::Dca(s) => s.propose(ctx),
        }
    }

    /// 下单回执（订单已登记，数量可能被风控缩减）
    pub fn on_order_tracked(&mut self, order: &Order) {
        match self {
            StrategyKind::Grid(s) => s.on_order_tracked(order),
            StrategyKind::Dca(_) => {}
        }
    }

    /// 意图被拒绝或订单被取消，释放策略侧的占位
    pub fn on_order_closed(&mut self, client_order_id: &str) {
        match self {
            StrategyKind::Grid(s) => s.on_order_closed(client_order_id),
            StrategyKind::Dca(s) => s.on_order_closed(client_order_id),
        }
    }

    /// 成交回报
    pub fn on_fill(&mut self, order: &Order, fill: &Fill, now: DateTime<Utc>) {
        match self {
            StrategyKind::Grid(s) => s.on_fill(order, fill),
            StrategyKind::Dca(s) => s.on_fill(order, fill, now),
        }
    }

    /// 导出可持久化的策略状态
    pub fn state_value(&self) -> Result<serde_json::Value> {
        let value = match self {
            StrategyKind::Grid(s) => serde_json::to_value(s.state())?,
            StrategyKind::Dca(s) => serde_json::to_value(s.state())?,
        };
        Ok(value)
    }

    /// 从持久化状态恢复
    pub fn load_state(&mut self, value: serde_json::Value) -> Result<()> {
        match self {
            StrategyKind::Grid(s) => s.load_state(serde_json::from_value(value)?),
            StrategyKind::Dca(s) => s.load_state(serde_json::from_value(value)?),
        }
        Ok(())
    }
}
