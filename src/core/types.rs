use chrono::{DateTime, Utc};
/// 统一的类型定义模块
/// 整合了所有交易相关的数据结构
use serde::{Deserialize, Serialize};

// ============= 基础类型定义 =============

/// 结果类型别名
pub type Result<T> = std::result::Result<T, crate::core::error::BotError>;

/// 订单方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// 订单类型
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
}

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    /// 本地与交易所状态不一致，等待人工或下次对账解决
    Unknown,
}

impl OrderStatus {
    /// 终态订单不再接受状态变更
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected
        )
    }
}

// ============= 行情数据 =============

/// 行情快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid: f64,
    pub ask: f64,
    pub last: f64,
    pub timestamp: DateTime<Utc>,
}

/// 账户余额
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub free: f64,
    pub used: f64,
    pub total: f64,
}

// ============= 订单相关 =============

/// 策略生成的订单意图（未经风控审批）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    /// 限价单价格，市价单为None
    pub price: Option<f64>,
    pub quantity: f64,
    /// 所属策略实例名
    pub strategy: String,
    pub reason: String,
}

/// 订单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub price: Option<f64>,
    pub quantity: f64,
    pub filled: f64,
    pub status: OrderStatus,
    /// 所属策略实例名
    pub strategy: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// 由订单意图构造本地订单记录
    pub fn from_intent(intent: &OrderIntent, id: String, status: OrderStatus) -> Self {
        let now = Utc::now();
        Self {
            id,
            client_order_id: intent.client_order_id.clone(),
            symbol: intent.symbol.clone(),
            side: intent.side,
            kind: intent.kind,
            price: intent.price,
            quantity: intent.quantity,
            filled: 0.0,
            status,
            strategy: intent.strategy.clone(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ============= 成交与持仓 =============

/// 成交事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub timestamp: DateTime<Utc>,
}

/// 持仓（仅由已确认成交更新，数量恒 >= 0）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub asset: String,
    pub quantity: f64,
    pub average_cost: f64,
}

impl Position {
    pub fn empty(asset: &str) -> Self {
        Self {
            asset: asset.to_string(),
            quantity: 0.0,
            average_cost: 0.0,
        }
    }
}

/// 成交记录（只追加，绩效统计的唯一数据源）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub filled_price: f64,
    pub filled_quantity: f64,
    pub fee: f64,
    pub realized_pnl: f64,
    pub timestamp: DateTime<Utc>,
}

// ============= 绩效统计 =============

/// 绩效统计（由成交记录汇总）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceStats {
    pub total_trades: u64,
    pub total_bought: f64,
    pub total_sold: f64,
    pub total_fees: f64,
    pub realized_pnl: f64,
    pub equity: f64,
    pub drawdown_pct: f64,
    pub daily_pnl: f64,
    pub trading_paused: bool,
}
