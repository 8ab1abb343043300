//! 执行协调器
//!
//! 单写者控制循环：行情、成交回报、风控、策略与持久化全部
//! 由本模块串行驱动，核心状态不需要锁。每个周期的固定顺序为
//! 行情 -> 成交处理 -> 净值更新 -> (对账) -> 策略提议 -> 审批下单 -> 落盘

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::core::config::BotConfig;
use crate::core::connector::ExchangeConnector;
use crate::core::order_book::OrderBook;
use crate::core::risk_ledger::{RiskLedger, RiskVerdict};
use crate::core::types::{
    Fill, Order, OrderIntent, OrderKind, OrderStatus, Result, Ticker,
};
use crate::core::BotError;
use crate::storage::{StateStore, KEY_CURSOR, KEY_ORDERS, KEY_POSITIONS, KEY_RISK_STATE};
use crate::strategies::{CycleContext, StrategyKind};
use crate::utils::generate_order_id;

/// 成交游标（持久化，重启后从此时间点继续拉取成交）
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FillCursor {
    pub last_fill_time: DateTime<Utc>,
}

/// Unknown状态订单在这么多个对账窗口后仍未查明时按已撤销处理
const UNKNOWN_EXPIRE_WINDOWS: u32 = 3;

/// 执行协调器
pub struct ExecutionCoordinator {
    config: BotConfig,
    connector: Arc<dyn ExchangeConnector>,
    store: Arc<dyn StateStore>,
    risk: RiskLedger,
    order_book: OrderBook,
    strategies: Vec<StrategyKind>,
    last_fill_time: DateTime<Utc>,
    cycle_count: u64,
    /// Unknown订单已经历的对账窗口计数
    unknown_windows: HashMap<String, u32>,
}

impl ExecutionCoordinator {
    pub fn new(
        config: BotConfig,
        connector: Arc<dyn ExchangeConnector>,
        store: Arc<dyn StateStore>,
        risk: RiskLedger,
        order_book: OrderBook,
        strategies: Vec<StrategyKind>,
        last_fill_time: DateTime<Utc>,
    ) -> Self {
        Self {
            config,
            connector,
            store,
            risk,
            order_book,
            strategies,
            last_fill_time,
            cycle_count: 0,
            unknown_windows: HashMap::new(),
        }
    }

    pub fn risk(&self) -> &RiskLedger {
        &self.risk
    }

    pub fn risk_mut(&mut self) -> &mut RiskLedger {
        &mut self.risk
    }

    pub fn order_book(&self) -> &OrderBook {
        &self.order_book
    }

    /// 主控制循环，直到收到关停信号或发生致命错误
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        log::info!(
            "🚀 交易循环启动: {} 个策略, 周期 {}s",
            self.strategies.len(),
            self.config.check_interval_secs
        );

        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.check_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle(Utc::now()).await {
                        Ok(()) => {}
                        Err(e) if e.is_retryable() => {
                            log::warn!("⚠️ 周期失败（可重试）: {}", e);
                        }
                        Err(e) => {
                            log::error!("❌ 致命错误，交易循环停止: {}", e);
                            return Err(e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.persist_snapshot().await?;
        log::info!("🛑 交易循环已退出，状态已落盘");
        Ok(())
    }

    /// 执行一个完整周期
    pub async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.cycle_count += 1;

        // 行情获取失败直接跳过本周期，不基于陈旧价格决策
        let tickers = match self.fetch_tickers().await {
            Ok(t) => t,
            Err(e) if e.is_retryable() => {
                log::warn!("⚠️ 行情获取失败，跳过本周期: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.risk.roll_day(now);
        self.process_fills(now).await?;

        match self.compute_equity(&tickers).await {
            Ok(equity) => self.risk.update_equity(equity, now),
            Err(e) if e.is_retryable() => {
                log::warn!("⚠️ 余额获取失败，净值沿用上一快照: {}", e);
            }
            Err(e) => return Err(e),
        }

        if self.cycle_count % self.config.reconcile_every == 0 {
            self.reconcile().await?;
        }

        if self.risk.is_paused() {
            log::debug!(
                "🚫 交易暂停中，跳过策略提议: {}",
                self.risk.state().pause_reason.as_deref().unwrap_or("未知")
            );
        } else {
            self.propose_and_dispatch(&tickers, now).await?;
        }

        self.persist_snapshot().await?;
        Ok(())
    }

    async fn fetch_tickers(&self) -> Result<HashMap<String, Ticker>> {
        let mut tickers = HashMap::new();
        for pair in &self.config.pairs {
            let ticker = self.connector.get_ticker(&pair.symbol).await?;
            tickers.insert(pair.symbol.clone(), ticker);
        }
        Ok(tickers)
    }

    /// 拉取新成交并逐笔入账
    ///
    /// 订单簿的终态幂等语义保证重复回报不会二次记账；
    /// 成交记录落盘失败视为致命（本地账本与交易所将从此分叉）
    async fn process_fills(&mut self, now: DateTime<Utc>) -> Result<()> {
        let fills = self.connector.list_fills(self.last_fill_time).await?;
        for fill in fills {
            if fill.timestamp > self.last_fill_time {
                self.last_fill_time = fill.timestamp;
            }
            self.apply_fill(&fill, now).await?;
        }
        Ok(())
    }

    async fn apply_fill(&mut self, fill: &Fill, now: DateTime<Utc>) -> Result<()> {
        let Some(order) = self.order_book.get(&fill.order_id).cloned() else {
            // 崩溃窗口内下出的订单可能从未进过本地订单簿，
            // 交易所的余额已经变动，成交绝不允许丢失
            log::warn!(
                "⚠️ 成交回报对应的订单未登记，按孤儿成交入账: {}",
                fill.order_id
            );
            return self.record_orphan_fill(fill, now).await;
        };

        let new_filled = order.filled + fill.quantity;
        let status = if new_filled + 1e-12 >= order.quantity {
            OrderStatus::Filled
        } else {
            OrderStatus::PartiallyFilled
        };

        let changed = match self.order_book.update_status(&fill.order_id, status, new_filled) {
            Ok(changed) => changed,
            Err(BotError::ReconciliationMismatch { order_id, detail }) => {
                log::error!("❌ 成交回报与本地状态冲突: {} {}", order_id, detail);
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !changed {
            // 重复回报，幂等跳过
            return Ok(());
        }

        let base = match self.config.pair(&fill.symbol) {
            Some(pair) => pair.base.clone(),
            None => crate::core::connector::split_symbol(&fill.symbol)?.0.to_string(),
        };

        let record = self.risk.record_fill(fill, &base, now);
        // 先落盘再通知策略：崩溃后恢复时以成交日志为准
        self.store.append_trade(&record).await.map_err(|e| {
            BotError::Storage(format!("成交记录落盘失败，停止交易: {}", e))
        })?;

        let updated = self
            .order_book
            .get(&fill.order_id)
            .cloned()
            .unwrap_or(order);
        for strategy in &mut self.strategies {
            if strategy.name() == updated.strategy && strategy.symbol() == updated.symbol {
                strategy.on_fill(&updated, fill, now);
            }
        }
        Ok(())
    }

    /// 把无主成交合成订单并入账（订单簿缺失对应订单的兜底路径）
    async fn record_orphan_fill(&mut self, fill: &Fill, now: DateTime<Utc>) -> Result<()> {
        let order = Order {
            id: fill.order_id.clone(),
            client_order_id: fill.order_id.clone(),
            symbol: fill.symbol.clone(),
            side: fill.side,
            kind: OrderKind::Limit,
            price: Some(fill.price),
            quantity: fill.quantity,
            filled: fill.quantity,
            status: OrderStatus::Filled,
            strategy: "orphan".to_string(),
            created_at: fill.timestamp,
            updated_at: now,
        };
        self.order_book.track(order);

        let base = match self.config.pair(&fill.symbol) {
            Some(pair) => pair.base.clone(),
            None => crate::core::connector::split_symbol(&fill.symbol)?.0.to_string(),
        };
        let record = self.risk.record_fill(fill, &base, now);
        self.store
            .append_trade(&record)
            .await
            .map_err(|e| BotError::Storage(format!("成交记录落盘失败，停止交易: {}", e)))?;
        Ok(())
    }

    /// 净值 = 报价货币余额 + 各基础资产按最新价折算
    async fn compute_equity(&self, tickers: &HashMap<String, Ticker>) -> Result<f64> {
        let balances = self.connector.get_balances().await?;

        let mut equity = 0.0;
        let mut counted: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for pair in &self.config.pairs {
            if counted.insert(pair.quote.as_str()) {
                if let Some(b) = balances.get(&pair.quote) {
                    equity += b.total;
                }
            }
            if counted.insert(pair.base.as_str()) {
                if let (Some(b), Some(t)) = (balances.get(&pair.base), tickers.get(&pair.symbol)) {
                    equity += b.total * t.last;
                }
            }
        }
        Ok(equity)
    }

    /// 与交易所对账，并把被取消/丢失的订单反馈给策略
    async fn reconcile(&mut self) -> Result<()> {
        let exchange_open = match self.connector.list_open_orders().await {
            Ok(orders) => orders,
            Err(e) if e.is_retryable() => {
                log::warn!("⚠️ 对账拉取失败，推迟到下个窗口: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let changed = self.order_book.reconcile(exchange_open, &HashMap::new())?;
        for order in changed {
            match order.status {
                OrderStatus::Cancelled | OrderStatus::Rejected => {
                    self.notify_closed(&order);
                }
                OrderStatus::Unknown => {
                    log::warn!("⚠️ 订单 {} 状态未知，等待下次对账", order.id);
                }
                _ => {}
            }
        }

        // 连续多个对账窗口仍未查明的订单按已撤销处理，释放策略占位
        let mut expired = Vec::new();
        for order in self.order_book.live_orders() {
            if order.status == OrderStatus::Unknown {
                let windows = self.unknown_windows.entry(order.id.clone()).or_insert(0);
                *windows += 1;
                if *windows >= UNKNOWN_EXPIRE_WINDOWS {
                    expired.push(order);
                }
            }
        }
        for order in expired {
            log::warn!(
                "⚠️ 订单 {} 连续 {} 个对账窗口无法查明，按已撤销处理",
                order.id,
                UNKNOWN_EXPIRE_WINDOWS
            );
            self.unknown_windows.remove(&order.id);
            self.order_book
                .update_status(&order.id, OrderStatus::Cancelled, order.filled)?;
            self.notify_closed(&order);
        }
        let book = &self.order_book;
        self.unknown_windows
            .retain(|id, _| matches!(book.get(id).map(|o| o.status), Some(OrderStatus::Unknown)));

        // 终态订单的成交已另行落盘，镜像只保留活动部分
        let pruned = self.order_book.prune_terminal();
        if pruned > 0 {
            log::debug!("🧹 清理 {} 张终态订单", pruned);
        }
        Ok(())
    }

    fn notify_closed(&mut self, order: &Order) {
        for strategy in &mut self.strategies {
            if strategy.name() == order.strategy && strategy.symbol() == order.symbol {
                strategy.on_order_closed(&order.client_order_id);
            }
        }
    }

    /// 按优先级轮询策略，意图经风控审批后下单
    async fn propose_and_dispatch(
        &mut self,
        tickers: &HashMap<String, Ticker>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let equity = self.risk.state().equity_snapshot;

        for idx in 0..self.strategies.len() {
            let symbol = self.strategies[idx].symbol().to_string();
            let Some(ticker) = tickers.get(&symbol) else {
                continue;
            };
            let ctx = CycleContext {
                ticker: ticker.clone(),
                equity,
                now,
            };

            let intents = self.strategies[idx].propose(&ctx);
            for intent in intents {
                self.dispatch_intent(idx, intent, ticker.last, now).await?;
            }

            // 审批中触发的暂停对后续策略立即生效
            if self.risk.is_paused() {
                break;
            }
        }
        Ok(())
    }

    async fn dispatch_intent(
        &mut self,
        idx: usize,
        intent: OrderIntent,
        last_price: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut approved = match self.risk.evaluate(intent.clone(), last_price, now) {
            RiskVerdict::Approved(sized) => sized,
            RiskVerdict::Rejected(reason) => {
                log::info!("🚫 风控拒绝 [{}]: {}", intent.strategy, reason);
                self.track_local_rejection(idx, intent);
                return Ok(());
            }
        };

        // 交易所精度取整与最小下单量检查
        if let Some(pair) = self.config.pair(&approved.symbol) {
            approved.price = approved.price.map(|p| pair.round_price(p));
            approved.quantity = pair.round_amount(approved.quantity);
            if approved.quantity < pair.min_order_size {
                log::info!(
                    "🚫 数量低于最小下单量 [{}]: {:.8} < {:.8}",
                    approved.strategy,
                    approved.quantity,
                    pair.min_order_size
                );
                self.track_local_rejection(idx, approved);
                return Ok(());
            }
        }

        let timeout = Duration::from_secs(self.config.order_timeout_secs);
        match tokio::time::timeout(timeout, self.connector.place_order(&approved)).await {
            Ok(Ok(order)) => {
                log::info!(
                    "✅ 下单成功 [{}]: {} {} {:.8} @ {:?}",
                    order.strategy,
                    order.symbol,
                    order.side,
                    order.quantity,
                    order.price
                );
                // 成交进度只由成交回报管道推进，回执即使已显示成交
                // 也按未成交登记，避免绕过幂等去重二次入账
                let mut tracked = order.clone();
                if tracked.status == OrderStatus::Filled
                    || tracked.status == OrderStatus::PartiallyFilled
                {
                    tracked.status = OrderStatus::Pending;
                    tracked.filled = 0.0;
                }
                self.order_book.track(tracked);
                self.strategies[idx].on_order_tracked(&order);
            }
            Ok(Err(e)) if e.is_terminal_rejection() => {
                log::warn!("🚫 交易所拒单 [{}]: {}", approved.strategy, e);
                self.track_local_rejection(idx, approved);
            }
            Ok(Err(e)) => {
                // 瞬时失败，释放策略占位，下一周期重试
                log::warn!("⚠️ 下单失败（可重试）[{}]: {}", approved.strategy, e);
                self.strategies[idx].on_order_closed(&approved.client_order_id);
            }
            Err(_) => {
                // 超时后订单可能已在交易所生效，登记Unknown交给对账裁决
                log::error!(
                    "⏱️ 下单超时 [{}]: {}，登记为Unknown等待对账",
                    approved.strategy,
                    approved.client_order_id
                );
                let order = Order::from_intent(
                    &approved,
                    approved.client_order_id.clone(),
                    OrderStatus::Unknown,
                );
                self.order_book.track(order);
            }
        }
        Ok(())
    }

    /// 本地拒绝也登记进订单簿，保持完整的意图审计轨迹
    fn track_local_rejection(&mut self, idx: usize, intent: OrderIntent) {
        let order = Order::from_intent(&intent, generate_order_id(), OrderStatus::Rejected);
        self.order_book.track(order);
        self.strategies[idx].on_order_closed(&intent.client_order_id);
    }

    /// 启动对账：同步交易所挂单，补记停机期间错过的成交
    ///
    /// recorded为成交日志中已有的成交事件键（订单ID+成交时刻毫秒），
    /// 按事件而非订单去重，部分成交的订单停机期间的后续成交不会被漏掉
    pub async fn resync(
        &mut self,
        recorded: &std::collections::HashSet<(String, i64)>,
    ) -> Result<()> {
        let exchange_open = self.connector.list_open_orders().await?;
        let changed = self.order_book.reconcile(exchange_open, &HashMap::new())?;
        for order in changed {
            if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Rejected) {
                self.notify_closed(&order);
            }
        }

        let fills = self.connector.list_fills(self.last_fill_time).await?;
        let mut replayed = 0;
        for fill in fills {
            if fill.timestamp > self.last_fill_time {
                self.last_fill_time = fill.timestamp;
            }
            let key = (fill.order_id.clone(), fill.timestamp.timestamp_millis());
            if recorded.contains(&key) {
                continue;
            }
            self.apply_fill(&fill, Utc::now()).await?;
            replayed += 1;
        }
        if replayed > 0 {
            log::info!("🔄 启动对账补记 {} 笔停机期间的成交", replayed);
        }

        self.persist_snapshot().await?;
        Ok(())
    }

    /// 周期末快照落盘（覆盖写，各键独立原子）
    pub async fn persist_snapshot(&self) -> Result<()> {
        self.store
            .put(KEY_RISK_STATE, &serde_json::to_value(self.risk.state())?)
            .await?;
        self.store
            .put(KEY_POSITIONS, &serde_json::to_value(self.risk.positions())?)
            .await?;
        self.store
            .put(KEY_ORDERS, &serde_json::to_value(self.order_book.live_orders())?)
            .await?;
        self.store
            .put(
                KEY_CURSOR,
                &serde_json::to_value(FillCursor {
                    last_fill_time: self.last_fill_time,
                })?,
            )
            .await?;
        for strategy in &self.strategies {
            let key = crate::storage::strategy_key(strategy.name(), strategy.symbol());
            self.store.put(&key, &strategy.state_value()?).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{BotConfig, PairConfig};
    use crate::core::connector::PaperConnector;
    use crate::core::risk_ledger::RiskLedger;
    use crate::storage::MemoryStore;
    use crate::strategies::{DcaStrategy, GridStrategy};
    use crate::core::types::OrderSide;

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
            dca: Default::default(),
            risk: Default::default(),
            paper: Default::default(),
            storage: Default::default(),
        }
    }

    fn sample_coordinator(
        config: BotConfig,
        connector: Arc<PaperConnector>,
    ) -> ExecutionCoordinator {
        let now = Utc::now();
        let strategies = vec![
            StrategyKind::Grid(GridStrategy::new("BTC/USD", config.grid.clone())),
            StrategyKind::Dca(DcaStrategy::new(
                "BTC/USD",
                config.dca.clone(),
                config.day_boundary_hour,
            )),
        ];
        let risk = RiskLedger::new(config.risk.clone(), config.day_boundary_hour, 10_000.0, now);
        ExecutionCoordinator::new(
            config,
            connector,
            Arc::new(MemoryStore::new()),
            risk,
            OrderBook::new(),
            strategies,
            now - chrono::Duration::seconds(1),
        )
    }

    fn paper_at(price: f64) -> Arc<PaperConnector> {
        let mut prices = HashMap::new();
        prices.insert("BTC/USD".to_string(), price);
        Arc::new(PaperConnector::new(10_000.0, "USD", prices))
    }

    #[tokio::test]
    async fn first_cycle_places_grid_and_dca_orders() {
        let connector = paper_at(100.0);
        let mut coordinator = sample_coordinator(sample_config(), connector.clone());

        coordinator.run_cycle(Utc::now()).await.unwrap();

        // 网格在现价下方挂5张限价买单，定投发一张市价买单（立即成交）
        let open = connector.list_open_orders().await.unwrap();
        assert_eq!(open.len(), 5);
        assert!(open.iter().all(|o| o.side == OrderSide::Buy));
        assert!(!coordinator.order_book().live_orders().is_empty());
    }

    #[tokio::test]
    async fn fill_is_recorded_once_and_sell_rearmed() {
        let connector = paper_at(100.0);
        let store = Arc::new(MemoryStore::new());
        let config = sample_config();
        let now = Utc::now();
        let strategies = vec![StrategyKind::Grid(GridStrategy::new(
            "BTC/USD",
            config.grid.clone(),
        ))];
        let risk = RiskLedger::new(config.risk.clone(), 0, 10_000.0, now);
        let mut coordinator = ExecutionCoordinator::new(
            config,
            connector.clone(),
            store.clone(),
            risk,
            OrderBook::new(),
            strategies,
            now - chrono::Duration::seconds(1),
        );

        coordinator.run_cycle(Utc::now()).await.unwrap();

        // 价格跌破99，最高一档买单成交
        connector.set_price("BTC/USD", 98.5).await;
        coordinator.run_cycle(Utc::now()).await.unwrap();

        let trades = store.load_trades().await.unwrap();
        assert!(!trades.is_empty());
        let buys = trades.iter().filter(|t| t.side == OrderSide::Buy).count();
        assert_eq!(buys, trades.len());

        // 同一成交不会二次入账
        let before = store.load_trades().await.unwrap().len();
        coordinator.run_cycle(Utc::now()).await.unwrap();
        let sells_open = connector
            .list_open_orders()
            .await
            .unwrap()
            .into_iter()
            .filter(|o| o.side == OrderSide::Sell)
            .count();
        assert!(sells_open >= 1, "买单成交后应武装卖单");
        assert_eq!(store.load_trades().await.unwrap().len(), before);
    }

    #[tokio::test]
    async fn paused_ledger_blocks_new_orders() {
        let connector = paper_at(100.0);
        let mut coordinator = sample_coordinator(sample_config(), connector.clone());

        // 先触发回撤暂停
        coordinator.risk_mut().update_equity(12_000.0, Utc::now());
        coordinator.risk_mut().update_equity(10_000.0, Utc::now());
        assert!(coordinator.risk().is_paused());

        coordinator.run_cycle(Utc::now()).await.unwrap();
        assert!(connector.list_open_orders().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_store() {
        let connector = paper_at(100.0);
        let store = Arc::new(MemoryStore::new());
        let config = sample_config();
        let now = Utc::now();
        let strategies = vec![StrategyKind::Grid(GridStrategy::new(
            "BTC/USD",
            config.grid.clone(),
        ))];
        let risk = RiskLedger::new(config.risk.clone(), 0, 10_000.0, now);
        let mut coordinator = ExecutionCoordinator::new(
            config,
            connector,
            store.clone(),
            risk,
            OrderBook::new(),
            strategies,
            now,
        );

        coordinator.run_cycle(Utc::now()).await.unwrap();

        assert!(store.get(KEY_RISK_STATE).await.unwrap().is_some());
        assert!(store.get(KEY_ORDERS).await.unwrap().is_some());
        assert!(store
            .get(&crate::storage::strategy_key("grid", "BTC/USD"))
            .await
            .unwrap()
            .is_some());
    }
}
