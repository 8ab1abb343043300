//! 持久化模块
//!
//! 两类数据：按键覆盖写的状态快照（风控、策略、活动订单），
//! 以及只追加的成交记录日志。快照采用临时文件+重命名保证原子性，
//! 进程在任何时刻被杀都不会留下半写状态

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::AsyncWriteExt;

use crate::core::error::BotError;
use crate::core::types::{Result, TradeRecord};

/// 状态键名
pub const KEY_RISK_STATE: &str = "risk_state";
pub const KEY_POSITIONS: &str = "positions";
pub const KEY_ORDERS: &str = "orders";
pub const KEY_CURSOR: &str = "cursor";

/// 策略状态键: strategy_{策略名}_{交易对}（斜杠替换为下划线）
pub fn strategy_key(name: &str, symbol: &str) -> String {
    format!("strategy_{}_{}", name, symbol.replace('/', "_"))
}

/// 状态存储接口
#[async_trait]
pub trait StateStore: Send + Sync {
    /// 读取状态快照，键不存在时返回None
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;

    /// 原子覆盖写状态快照
    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<()>;

    /// 追加一条成交记录
    async fn append_trade(&self, record: &TradeRecord) -> Result<()>;

    /// 按写入顺序读取全部成交记录
    async fn load_trades(&self) -> Result<Vec<TradeRecord>>;
}

// ============= 文件存储 =============

/// 基于文件的存储：每个键一个JSON文件，成交记录为JSONL日志
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub async fn new(dir: &str) -> Result<Self> {
        let dir = PathBuf::from(dir);
        tokio::fs::create_dir_all(&dir).await?;
        log::info!("💾 文件存储目录: {}", dir.display());
        Ok(Self { dir })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    fn trades_path(&self) -> PathBuf {
        self.dir.join("trades.jsonl")
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let path = self.key_path(key);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let path = self.key_path(key);
        let tmp = self.dir.join(format!("{}.json.tmp", key));

        let contents = serde_json::to_string_pretty(value)?;
        tokio::fs::write(&tmp, contents.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn append_trade(&self, record: &TradeRecord) -> Result<()> {
        let line = format!("{}\n", serde_json::to_string(record)?);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.trades_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn load_trades(&self) -> Result<Vec<TradeRecord>> {
        let contents = match tokio::fs::read_to_string(self.trades_path()).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (i, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TradeRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    // 崩溃时可能留下半行，只容忍末行损坏
                    if i + 1 == contents.lines().count() {
                        log::warn!("⚠️ 成交日志末行损坏，已跳过: {}", e);
                    } else {
                        return Err(BotError::Storage(format!(
                            "成交日志第{}行损坏: {}",
                            i + 1,
                            e
                        )));
                    }
                }
            }
        }
        Ok(records)
    }
}

// ============= 内存存储 =============

/// 内存存储，用于测试与一次性模拟运行
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<String, serde_json::Value>>,
    trades: Mutex<Vec<TradeRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.states.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        self.states
            .lock()
            .unwrap()
            .insert(key.to_string(), value.clone());
        Ok(())
    }

    async fn append_trade(&self, record: &TradeRecord) -> Result<()> {
        self.trades.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn load_trades(&self) -> Result<Vec<TradeRecord>> {
        Ok(self.trades.lock().unwrap().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::OrderSide;
    use chrono::Utc;
    use rand::Rng;

    fn temp_dir() -> String {
        let suffix: u32 = rand::thread_rng().gen();
        std::env::temp_dir()
            .join(format!("rustspot-test-{}", suffix))
            .to_string_lossy()
            .to_string()
    }

    fn sample_trade(order_id: &str) -> TradeRecord {
        TradeRecord {
            order_id: order_id.to_string(),
            symbol: "BTC/USD".to_string(),
            side: OrderSide::Buy,
            filled_price: 100.0,
            filled_quantity: 1.0,
            fee: 0.1,
            realized_pnl: -0.1,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn file_store_put_get_round_trip() {
        let dir = temp_dir();
        let store = FileStore::new(&dir).await.unwrap();

        assert!(store.get("missing").await.unwrap().is_none());

        let value = serde_json::json!({"equity": 10000.0, "paused": false});
        store.put("risk_state", &value).await.unwrap();
        assert_eq!(store.get("risk_state").await.unwrap(), Some(value));

        // 覆盖写
        let updated = serde_json::json!({"equity": 9500.0, "paused": true});
        store.put("risk_state", &updated).await.unwrap();
        assert_eq!(store.get("risk_state").await.unwrap(), Some(updated));

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn trade_log_appends_in_order() {
        let dir = temp_dir();
        let store = FileStore::new(&dir).await.unwrap();

        store.append_trade(&sample_trade("a")).await.unwrap();
        store.append_trade(&sample_trade("b")).await.unwrap();
        store.append_trade(&sample_trade("c")).await.unwrap();

        let trades = store.load_trades().await.unwrap();
        let ids: Vec<&str> = trades.iter().map(|t| t.order_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn torn_last_line_is_tolerated() {
        let dir = temp_dir();
        let store = FileStore::new(&dir).await.unwrap();
        store.append_trade(&sample_trade("a")).await.unwrap();

        // 模拟崩溃留下的半行
        let path = std::path::Path::new(&dir).join("trades.jsonl");
        let mut contents = tokio::fs::read_to_string(&path).await.unwrap();
        contents.push_str("{\"order_id\":\"tor");
        tokio::fs::write(&path, contents).await.unwrap();

        let trades = store.load_trades().await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].order_id, "a");

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryStore::new();
        let value = serde_json::json!({"buys_today": 2});
        store.put(&strategy_key("dca", "BTC/USD"), &value).await.unwrap();
        assert_eq!(
            store.get("strategy_dca_BTC_USD").await.unwrap(),
            Some(value)
        );

        store.append_trade(&sample_trade("a")).await.unwrap();
        assert_eq!(store.load_trades().await.unwrap().len(), 1);
    }
}
