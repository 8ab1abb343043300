use thiserror::Error;

#[derive(Error, Debug)]
pub enum BotError {
    #[error("瞬时错误: {0}")]
    Transient(String),

    #[error("交易所拒绝: {0}")]
    Rejected(String),

    #[error("余额不足: 需要 {required:.8}, 可用 {available:.8}")]
    InsufficientBalance { required: f64, available: f64 },

    #[error("对账不一致: 订单 {order_id} - {detail}")]
    ReconciliationMismatch { order_id: String, detail: String },

    #[error("持久化错误: {0}")]
    Storage(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON序列化错误: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("YAML配置错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("订单未找到: ID {order_id} (交易对: {symbol})")]
    OrderNotFound { order_id: String, symbol: String },

    #[error("超时错误: 操作 '{operation}' 超时 ({timeout_seconds}秒)")]
    Timeout {
        operation: String,
        timeout_seconds: u64,
    },

    #[error("其他错误: {0}")]
    Other(String),
}

impl BotError {
    /// 判断错误是否可以在下个周期重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, BotError::Transient(_) | BotError::Timeout { .. })
    }

    /// 判断错误是否为该意图的终态（不自动重试）
    pub fn is_terminal_rejection(&self) -> bool {
        matches!(
            self,
            BotError::Rejected(_) | BotError::InsufficientBalance { .. }
        )
    }
}
