use crate::core::error::BotError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

/// 交易对配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub min_order_size: f64,
    pub price_precision: u32,
    pub amount_precision: u32,
}

impl PairConfig {
    pub fn round_price(&self, price: f64) -> f64 {
        let factor = 10f64.powi(self.price_precision as i32);
        (price * factor).round() / factor
    }

    /// 数量向下取整，避免超出可用余额
    pub fn round_amount(&self, amount: f64) -> f64 {
        let factor = 10f64.powi(self.amount_precision as i32);
        (amount * factor).floor() / factor
    }
}

/// 网格间距类型
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridSpacing {
    Arithmetic,
    Geometric,
}

/// 网格策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 网格区间数（价位数为 num_grids + 1）
    pub num_grids: u32,
    pub upper_price_pct: f64,
    pub lower_price_pct: f64,
    /// 网格占用净值的比例上限
    pub allocation_pct: f64,
    #[serde(default = "default_spacing")]
    pub spacing: GridSpacing,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            num_grids: 10,
            upper_price_pct: 0.05,
            lower_price_pct: 0.05,
            allocation_pct: 0.3,
            spacing: GridSpacing::Arithmetic,
        }
    }
}

/// 定投策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DcaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub buy_interval_hours: u32,
    pub buy_amount_pct: f64,
    /// 相对上次买入价的跌幅触发加仓
    pub price_drop_trigger_pct: f64,
    pub max_buys_per_day: u32,
}

impl Default for DcaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            buy_interval_hours: 24,
            buy_amount_pct: 0.02,
            price_drop_trigger_pct: 0.03,
            max_buys_per_day: 3,
        }
    }
}

/// 风控配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub max_risk_per_trade_pct: f64,
    pub max_drawdown_pct: f64,
    pub stop_loss_pct: f64,
    pub daily_loss_limit_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_risk_per_trade_pct: 0.02, // 单笔最大风险2%
            max_drawdown_pct: 0.10,       // 回撤10%暂停交易
            stop_loss_pct: 0.03,          // 止损3%
            daily_loss_limit_pct: 0.05,   // 日亏损上限5%
        }
    }
}

/// 模拟盘配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub initial_quote: f64,
    #[serde(default)]
    pub fee_pct: f64,
    /// 各交易对初始价格
    pub initial_prices: HashMap<String, f64>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_quote: 10000.0,
            fee_pct: 0.0,
            initial_prices: HashMap::new(),
        }
    }
}

/// 持久化配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
        }
    }
}

/// 机器人总配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_interval")]
    pub check_interval_secs: u64,
    /// 每隔多少个周期执行一次对账
    #[serde(default = "default_reconcile")]
    pub reconcile_every: u64,
    /// UTC日界小时（日亏损与定投计数在此重置）
    #[serde(default)]
    pub day_boundary_hour: u32,
    #[serde(default = "default_order_timeout")]
    pub order_timeout_secs: u64,
    /// 策略优先级（同一周期内的意图生成顺序）
    #[serde(default = "default_priority")]
    pub strategy_priority: Vec<String>,
    pub pairs: Vec<PairConfig>,
    #[serde(default)]
    pub grid: GridConfig,
    #[serde(default)]
    pub dca: DcaConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_true() -> bool {
    true
}

fn default_spacing() -> GridSpacing {
    GridSpacing::Arithmetic
}

fn default_interval() -> u64 {
    60
}

fn default_reconcile() -> u64 {
    5
}

fn default_order_timeout() -> u64 {
    10
}

fn default_priority() -> Vec<String> {
    vec!["grid".to_string(), "dca".to_string()]
}

impl BotConfig {
    /// 从YAML文件加载配置
    pub fn from_file(path: &str) -> Result<Self, BotError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| BotError::Config(format!("读取配置文件失败: {}", e)))?;

        let config: BotConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BotError> {
        if self.pairs.is_empty() {
            return Err(BotError::Config("至少需要配置一个交易对".to_string()));
        }
        if self.day_boundary_hour >= 24 {
            return Err(BotError::Config(format!(
                "无效的日界小时: {}",
                self.day_boundary_hour
            )));
        }
        if self.reconcile_every == 0 {
            return Err(BotError::Config("对账周期必须大于0".to_string()));
        }
        if self.grid.num_grids == 0 {
            return Err(BotError::Config("网格数量必须大于0".to_string()));
        }
        if self.risk.stop_loss_pct <= 0.0 {
            return Err(BotError::Config("止损比例必须大于0".to_string()));
        }
        Ok(())
    }

    pub fn pair(&self, symbol: &str) -> Option<&PairConfig> {
        self.pairs.iter().find(|p| p.symbol == symbol)
    }
}

/// API密钥配置
#[derive(Debug, Clone)]
pub struct ApiKeys {
    pub api_key: String,
    pub api_secret: String,
}

impl ApiKeys {
    /// 从环境变量加载API密钥
    pub fn from_env(exchange: &str) -> Result<Self, BotError> {
        dotenv::dotenv().ok(); // 加载.env文件，忽略错误

        let exchange_upper = exchange.to_uppercase();

        let api_key = std::env::var(format!("{}_API_KEY", exchange_upper))
            .map_err(|_| BotError::Config(format!("未找到{}的API_KEY环境变量", exchange)))?;

        let api_secret = std::env::var(format!("{}_API_SECRET", exchange_upper))
            .or_else(|_| std::env::var(format!("{}_SECRET_KEY", exchange_upper)))
            .map_err(|_| {
                BotError::Config(format!(
                    "未找到{}的API_SECRET或SECRET_KEY环境变量",
                    exchange
                ))
            })?;

        Ok(ApiKeys {
            api_key,
            api_secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = BotConfig {
            check_interval_secs: 60,
            reconcile_every: 5,
            day_boundary_hour: 0,
            order_timeout_secs: 10,
            strategy_priority: default_priority(),
            pairs: vec![PairConfig {
                symbol: "BTC/USD".to_string(),
                base: "BTC".to_string(),
                quote: "USD".to_string(),
                min_order_size: 0.0001,
                price_precision: 1,
                amount_precision: 8,
            }],
            grid: GridConfig::default(),
            dca: DcaConfig::default(),
            risk: RiskConfig::default(),
            paper: PaperConfig::default(),
            storage: StorageConfig::default(),
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn pair_rounding() {
        let pair = PairConfig {
            symbol: "BTC/USD".to_string(),
            base: "BTC".to_string(),
            quote: "USD".to_string(),
            min_order_size: 0.0001,
            price_precision: 1,
            amount_precision: 4,
        };
        assert_eq!(pair.round_price(100.26), 100.3);
        // 数量向下取整
        assert_eq!(pair.round_amount(0.123_79), 0.1237);
    }
}
