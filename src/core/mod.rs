// 核心模块 - 类型、错误、配置、连接器与风控
pub mod config;
pub mod connector;
pub mod error;
pub mod order_book;
pub mod risk_ledger;
pub mod types;

pub use config::BotConfig;
pub use error::BotError;
pub use types::Result;
