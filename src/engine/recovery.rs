//! 恢复加载器
//!
//! 启动路径：读取持久化快照（风控、持仓、活动订单、策略状态、
//! 成交游标），与交易所对账，补记停机期间错过的成交，最终交出
//! 可直接进入控制循环的协调器。全程幂等，连续重启不会重复记账

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

use crate::core::config::BotConfig;
use crate::core::connector::ExchangeConnector;
use crate::core::order_book::OrderBook;
use crate::core::risk_ledger::{RiskLedger, RiskState};
use crate::core::types::{Order, Position, Result};
use crate::engine::coordinator::{ExecutionCoordinator, FillCursor};
use crate::storage::{
    strategy_key, StateStore, KEY_CURSOR, KEY_ORDERS, KEY_POSITIONS, KEY_RISK_STATE,
};
use crate::strategies::{DcaStrategy, GridStrategy, StrategyKind};

pub struct RecoveryLoader {
    config: BotConfig,
    connector: Arc<dyn ExchangeConnector>,
    store: Arc<dyn StateStore>,
}

impl RecoveryLoader {
    pub fn new(
        config: BotConfig,
        connector: Arc<dyn ExchangeConnector>,
        store: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            config,
            connector,
            store,
        }
    }

    /// 按配置的优先级顺序为每个交易对实例化启用的策略
    fn build_strategies(config: &BotConfig) -> Vec<StrategyKind> {
        let mut strategies = Vec::new();
        for pair in &config.pairs {
            for name in &config.strategy_priority {
                match name.as_str() {
                    "grid" if config.grid.enabled => {
                        strategies.push(StrategyKind::Grid(GridStrategy::new(
                            &pair.symbol,
                            config.grid.clone(),
                        )));
                    }
                    "dca" if config.dca.enabled => {
                        strategies.push(StrategyKind::Dca(DcaStrategy::new(
                            &pair.symbol,
                            config.dca.clone(),
                            config.day_boundary_hour,
                        )));
                    }
                    _ => {}
                }
            }
        }
        strategies
    }

    fn base_asset(&self, symbol: &str) -> Result<String> {
        match self.config.pair(symbol) {
            Some(pair) => Ok(pair.base.clone()),
            None => Ok(crate::core::connector::split_symbol(symbol)?.0.to_string()),
        }
    }

    /// 首次启动时从交易所计算初始净值
    async fn initial_equity(&self) -> Result<f64> {
        let balances = self.connector.get_balances().await?;
        let mut equity = 0.0;
        let mut counted: HashSet<&str> = HashSet::new();
        for pair in &self.config.pairs {
            if counted.insert(pair.quote.as_str()) {
                if let Some(b) = balances.get(&pair.quote) {
                    equity += b.total;
                }
            }
            if counted.insert(pair.base.as_str()) {
                if let Some(b) = balances.get(&pair.base) {
                    let ticker = self.connector.get_ticker(&pair.symbol).await?;
                    equity += b.total * ticker.last;
                }
            }
        }
        Ok(equity)
    }

    /// 加载全部持久化状态并完成启动对账
    pub async fn bootstrap(self) -> Result<ExecutionCoordinator> {
        let now = Utc::now();
        let trades = self.store.load_trades().await?;
        let recorded: HashSet<(String, i64)> = trades
            .iter()
            .map(|t| (t.order_id.clone(), t.timestamp.timestamp_millis()))
            .collect();

        let mut risk = match self.store.get(KEY_RISK_STATE).await? {
            Some(value) => {
                let state: RiskState = serde_json::from_value(value)?;
                let applied = state.applied_trades as usize;
                let positions: std::collections::HashMap<String, Position> =
                    match self.store.get(KEY_POSITIONS).await? {
                        Some(p) => serde_json::from_value(p)?,
                        // 持仓快照缺失时从已反映在快照中的成交重建
                        None => {
                            let mut ledger = RiskLedger::from_parts(
                                self.config.risk.clone(),
                                self.config.day_boundary_hour,
                                state.clone(),
                                Default::default(),
                            );
                            for record in trades.iter().take(applied) {
                                let base = self.base_asset(&record.symbol)?;
                                ledger.apply_trade(record, &base);
                            }
                            ledger.positions().clone()
                        }
                    };
                log::info!(
                    "📥 风控状态恢复: 净值 {:.2}, 日盈亏 {:.2}, 暂停={}",
                    state.equity_snapshot,
                    state.daily_realized_pnl,
                    state.trading_paused
                );
                RiskLedger::from_parts(
                    self.config.risk.clone(),
                    self.config.day_boundary_hour,
                    state,
                    positions,
                )
            }
            None => {
                let equity = self.initial_equity().await?;
                log::info!("🆕 首次启动，初始净值 {:.2}", equity);
                let mut ledger = RiskLedger::new(
                    self.config.risk.clone(),
                    self.config.day_boundary_hour,
                    equity,
                    now,
                );
                // 无快照但有成交日志：持仓从日志重建，
                // 净值已按交易所实际余额计算，不再重复累计盈亏
                for record in &trades {
                    let base = self.base_asset(&record.symbol)?;
                    ledger.apply_trade(record, &base);
                }
                ledger.mark_applied(trades.len() as u64);
                ledger
            }
        };

        // 快照落后于成交日志时（崩溃发生在成交落盘与快照之间），
        // 把追加的记录补入账本：成交日志是账本的最终事实来源
        let applied = risk.state().applied_trades as usize;
        if trades.len() > applied {
            log::info!("🔁 补放快照之后的 {} 条成交记录", trades.len() - applied);
            for record in trades.iter().skip(applied) {
                let base = self.base_asset(&record.symbol)?;
                risk.replay_trade(record, &base);
            }
        }

        let order_book = match self.store.get(KEY_ORDERS).await? {
            Some(value) => {
                let orders: Vec<Order> = serde_json::from_value(value)?;
                log::info!("📥 恢复 {} 张活动订单", orders.len());
                OrderBook::from_orders(orders)
            }
            None => OrderBook::new(),
        };

        let mut strategies = Self::build_strategies(&self.config);
        for strategy in &mut strategies {
            let key = strategy_key(strategy.name(), strategy.symbol());
            if let Some(value) = self.store.get(&key).await? {
                strategy.load_state(value)?;
            }
        }

        let last_fill_time = match self.store.get(KEY_CURSOR).await? {
            Some(value) => serde_json::from_value::<FillCursor>(value)?.last_fill_time,
            None => now,
        };

        let mut coordinator = ExecutionCoordinator::new(
            self.config,
            self.connector,
            self.store,
            risk,
            order_book,
            strategies,
            last_fill_time,
        );
        coordinator.resync(&recorded).await?;

        log::info!("✅ 恢复完成，进入交易循环");
        Ok(coordinator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{BotConfig, DcaConfig, GridConfig, PairConfig};
    use crate::core::connector::PaperConnector;
    use crate::core::error::BotError;
    use crate::core::types::{
        Balance, Fill, OrderIntent, OrderKind, OrderSide, OrderStatus, Ticker, TradeRecord,
    };
    use crate::storage::MemoryStore;
    use crate::strategies::dca::DcaState;
    use chrono::{DateTime, Duration};
    use std::collections::HashMap;

    fn sample_config() -> BotConfig {
        BotConfig {
            check_interval_secs: 1,
            reconcile_every: 5,
            day_boundary_hour: 0,
            order_timeout_secs: 5,
            strategy_priority: vec!["grid".to_string(), "dca".to_string()],
            pairs: vec![PairConfig {
                symbol: "BTC/USD".to_string(),
                base: "BTC".to_string(),
                quote: "USD".to_string(),
                min_order_size: 0.0001,
                price_precision: 2,
                amount_precision: 8,
            }],
            grid: Default::default(),
            dca: DcaConfig {
                enabled: false,
                ..Default::default()
            },
            risk: Default::default(),
            paper: Default::default(),
            storage: Default::default(),
        }
    }

    fn paper_at(price: f64) -> Arc<PaperConnector> {
        let mut prices = HashMap::new();
        prices.insert("BTC/USD".to_string(), price);
        Arc::new(PaperConnector::new(10_000.0, "USD", prices))
    }

    #[tokio::test]
    async fn fresh_bootstrap_starts_from_exchange_equity() {
        let connector = paper_at(100.0);
        let store = Arc::new(MemoryStore::new());
        let coordinator = RecoveryLoader::new(sample_config(), connector, store)
            .bootstrap()
            .await
            .unwrap();

        assert!((coordinator.risk().state().equity_snapshot - 10_000.0).abs() < 1e-6);
        assert!(!coordinator.risk().is_paused());
    }

    #[tokio::test]
    async fn restart_does_not_duplicate_recorded_fills() {
        let connector = paper_at(100.0);
        let store = Arc::new(MemoryStore::new());

        let mut coordinator =
            RecoveryLoader::new(sample_config(), connector.clone(), store.clone())
                .bootstrap()
                .await
                .unwrap();
        coordinator.run_cycle(Utc::now()).await.unwrap();
        connector.set_price("BTC/USD", 98.5).await;
        coordinator.run_cycle(Utc::now()).await.unwrap();

        let trades_before = store.load_trades().await.unwrap().len();
        assert!(trades_before > 0);
        drop(coordinator);

        // 连续重启两次，成交日志不应增长
        let c2 = RecoveryLoader::new(sample_config(), connector.clone(), store.clone())
            .bootstrap()
            .await
            .unwrap();
        assert_eq!(store.load_trades().await.unwrap().len(), trades_before);
        drop(c2);

        let c3 = RecoveryLoader::new(sample_config(), connector.clone(), store.clone())
            .bootstrap()
            .await
            .unwrap();
        assert_eq!(store.load_trades().await.unwrap().len(), trades_before);
        drop(c3);
    }

    #[tokio::test]
    async fn downtime_fills_are_replayed_on_bootstrap() {
        let connector = paper_at(100.0);
        let store = Arc::new(MemoryStore::new());

        let mut coordinator =
            RecoveryLoader::new(sample_config(), connector.clone(), store.clone())
                .bootstrap()
                .await
                .unwrap();
        coordinator.run_cycle(Utc::now()).await.unwrap();
        let trades_before = store.load_trades().await.unwrap().len();
        drop(coordinator);

        // 停机期间价格下穿，挂在98/99的买单成交
        connector.set_price("BTC/USD", 97.5).await;

        let coordinator =
            RecoveryLoader::new(sample_config(), connector.clone(), store.clone())
                .bootstrap()
                .await
                .unwrap();

        let trades_after = store.load_trades().await.unwrap().len();
        assert!(trades_after > trades_before, "停机期间的成交应被补记");
        assert!(coordinator.risk().position("BTC").quantity > 0.0);
    }

    /// 固定行情与成交数据的连接器，用于精确构造停机场景
    struct StubConnector {
        open: Vec<Order>,
        fills: Vec<Fill>,
    }

    #[async_trait::async_trait]
    impl ExchangeConnector for StubConnector {
        async fn get_ticker(&self, symbol: &str) -> Result<Ticker> {
            Ok(Ticker {
                symbol: symbol.to_string(),
                bid: 99.9,
                ask: 100.1,
                last: 100.0,
                timestamp: Utc::now(),
            })
        }

        async fn get_balances(&self) -> Result<HashMap<String, Balance>> {
            Ok(HashMap::new())
        }

        async fn place_order(&self, _intent: &OrderIntent) -> Result<Order> {
            Err(BotError::Rejected("stub不接受新订单".to_string()))
        }

        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<()> {
            Ok(())
        }

        async fn list_open_orders(&self) -> Result<Vec<Order>> {
            Ok(self.open.clone())
        }

        async fn list_fills(&self, since: DateTime<Utc>) -> Result<Vec<Fill>> {
            Ok(self
                .fills
                .iter()
                .filter(|f| f.timestamp > since)
                .cloned()
                .collect())
        }
    }

    fn sample_fill(order_id: &str, quantity: f64, timestamp: DateTime<Utc>) -> Fill {
        Fill {
            order_id: order_id.to_string(),
            symbol: "BTC/USD".to_string(),
            side: OrderSide::Buy,
            price: 100.0,
            quantity,
            fee: 0.0,
            timestamp,
        }
    }

    #[tokio::test]
    async fn downtime_fill_for_unsnapshotted_order_is_adopted() {
        let connector = paper_at(100.0);
        let store = Arc::new(MemoryStore::new());

        let mut coordinator =
            RecoveryLoader::new(sample_config(), connector.clone(), store.clone())
                .bootstrap()
                .await
                .unwrap();
        coordinator.run_cycle(Utc::now()).await.unwrap();
        assert!(store.load_trades().await.unwrap().is_empty());
        drop(coordinator);

        // 崩溃窗口：订单已发往交易所，但从未进入落盘的快照
        let intent = OrderIntent {
            client_order_id: "GRIDlost1".to_string(),
            symbol: "BTC/USD".to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            price: None,
            quantity: 0.5,
            strategy: "grid".to_string(),
            reason: "test".to_string(),
        };
        connector.place_order(&intent).await.unwrap();

        // 交易所余额已变动，重启后成交必须入账
        let coordinator =
            RecoveryLoader::new(sample_config(), connector.clone(), store.clone())
                .bootstrap()
                .await
                .unwrap();
        let trades = store.load_trades().await.unwrap();
        assert_eq!(trades.len(), 1);
        assert!((coordinator.risk().position("BTC").quantity - 0.5).abs() < 1e-9);
        drop(coordinator);

        // 再次重启不重复入账
        RecoveryLoader::new(sample_config(), connector.clone(), store.clone())
            .bootstrap()
            .await
            .unwrap();
        assert_eq!(store.load_trades().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn trades_appended_after_snapshot_fold_into_recovery() {
        let connector = paper_at(100.0);
        let store = Arc::new(MemoryStore::new());

        let mut coordinator =
            RecoveryLoader::new(sample_config(), connector.clone(), store.clone())
                .bootstrap()
                .await
                .unwrap();
        coordinator.run_cycle(Utc::now()).await.unwrap();
        drop(coordinator);

        // 崩溃发生在成交落盘之后、周期末快照之前：
        // 成交日志里多出一条快照未反映的记录
        store
            .append_trade(&TradeRecord {
                order_id: "o9".to_string(),
                symbol: "BTC/USD".to_string(),
                side: OrderSide::Buy,
                filled_price: 100.0,
                filled_quantity: 1.0,
                fee: 0.5,
                realized_pnl: -0.5,
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        let coordinator =
            RecoveryLoader::new(sample_config(), connector.clone(), store.clone())
                .bootstrap()
                .await
                .unwrap();

        assert!((coordinator.risk().position("BTC").quantity - 1.0).abs() < 1e-9);
        assert!((coordinator.risk().state().daily_realized_pnl - (-0.5)).abs() < 1e-9);
        assert_eq!(coordinator.risk().state().applied_trades, 1);
    }

    #[tokio::test]
    async fn partial_fill_tail_is_replayed_per_fill_event() {
        let now = Utc::now();
        let cursor = now - Duration::seconds(90);
        let fill1 = sample_fill("x7", 1.0, now - Duration::seconds(60));
        let fill2 = sample_fill("x7", 1.0, now - Duration::seconds(30));

        // 崩溃前的状态：第一笔部分成交已入账并落盘
        let config = sample_config();
        let mut ledger = RiskLedger::new(config.risk.clone(), 0, 10_000.0, now);
        let record1 = ledger.record_fill(&fill1, "BTC", now);

        let mut order = Order::from_intent(
            &OrderIntent {
                client_order_id: "GRID7".to_string(),
                symbol: "BTC/USD".to_string(),
                side: OrderSide::Buy,
                kind: OrderKind::Limit,
                price: Some(100.0),
                quantity: 2.0,
                strategy: "grid".to_string(),
                reason: "test".to_string(),
            },
            "x7".to_string(),
            OrderStatus::PartiallyFilled,
        );
        order.filled = 1.0;

        let store = Arc::new(MemoryStore::new());
        store.append_trade(&record1).await.unwrap();
        store
            .put(KEY_RISK_STATE, &serde_json::to_value(ledger.state()).unwrap())
            .await
            .unwrap();
        store
            .put(KEY_POSITIONS, &serde_json::to_value(ledger.positions()).unwrap())
            .await
            .unwrap();
        store
            .put(KEY_ORDERS, &serde_json::to_value(vec![order]).unwrap())
            .await
            .unwrap();
        store
            .put(
                KEY_CURSOR,
                &serde_json::to_value(FillCursor {
                    last_fill_time: cursor,
                })
                .unwrap(),
            )
            .await
            .unwrap();

        // 停机期间订单剩余部分也成交了，交易所已不再挂单
        let connector = Arc::new(StubConnector {
            open: vec![],
            fills: vec![fill1, fill2],
        });

        let coordinator = RecoveryLoader::new(config, connector, store.clone())
            .bootstrap()
            .await
            .unwrap();

        // 第一笔按事件键去重跳过，第二笔补记
        let trades = store.load_trades().await.unwrap();
        assert_eq!(trades.len(), 2);
        assert!((coordinator.risk().position("BTC").quantity - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn expired_unknown_order_releases_dca_slot() {
        let connector = paper_at(100.0);
        let store = Arc::new(MemoryStore::new());

        // 下单超时留下的Unknown占位订单，定投的在途位指向它
        let ghost = Order {
            id: "DCA777".to_string(),
            client_order_id: "DCA777".to_string(),
            symbol: "BTC/USD".to_string(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            price: None,
            quantity: 2.0,
            filled: 0.0,
            status: OrderStatus::Unknown,
            strategy: "dca".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store
            .put(KEY_ORDERS, &serde_json::to_value(vec![ghost]).unwrap())
            .await
            .unwrap();
        let dca_state = DcaState {
            pending_order: Some("DCA777".to_string()),
            ..Default::default()
        };
        store
            .put(
                &strategy_key("dca", "BTC/USD"),
                &serde_json::to_value(&dca_state).unwrap(),
            )
            .await
            .unwrap();

        let config = BotConfig {
            grid: GridConfig {
                enabled: false,
                ..Default::default()
            },
            dca: DcaConfig::default(),
            ..sample_config()
        };
        let mut coordinator = RecoveryLoader::new(config, connector.clone(), store.clone())
            .bootstrap()
            .await
            .unwrap();

        // 在途位占用期间定投不再发单
        for _ in 0..14 {
            coordinator.run_cycle(Utc::now()).await.unwrap();
        }
        assert!(store.load_trades().await.unwrap().is_empty());

        // 第三个对账窗口（第15周期）按撤销处理并释放在途位，
        // 定投随即重新发单，下一周期成交入账
        coordinator.run_cycle(Utc::now()).await.unwrap();
        assert!(coordinator.order_book().get("DCA777").is_none());
        coordinator.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(store.load_trades().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn strategy_state_survives_restart() {
        let connector = paper_at(100.0);
        let store = Arc::new(MemoryStore::new());

        let mut coordinator =
            RecoveryLoader::new(sample_config(), connector.clone(), store.clone())
                .bootstrap()
                .await
                .unwrap();
        coordinator.run_cycle(Utc::now()).await.unwrap();
        let live_before = coordinator.order_book().live_orders().len();
        drop(coordinator);

        let mut coordinator =
            RecoveryLoader::new(sample_config(), connector.clone(), store.clone())
                .bootstrap()
                .await
                .unwrap();

        // 网格价位与活动订单恢复，重启后的周期不重复挂单
        assert_eq!(coordinator.order_book().live_orders().len(), live_before);
        coordinator.run_cycle(Utc::now()).await.unwrap();
        assert_eq!(connector.list_open_orders().await.unwrap().len(), live_before);
    }
}
