//! 本地订单簿镜像
//! 跟踪本实例提交的所有订单及其生命周期，交易所为最终事实来源，
//! 本模块负责在两者之间进行对账

use std::collections::HashMap;

use crate::core::error::BotError;
use crate::core::types::{Order, OrderStatus, Result};

/// 订单簿镜像
///
/// 状态机规则:
/// - Pending -> Open/Rejected/Filled/PartiallyFilled/Cancelled/Unknown
/// - Open/PartiallyFilled -> PartiallyFilled/Filled/Cancelled/Unknown
/// - Unknown -> 任意状态（对账解除未知态）
/// - 终态重复同值为幂等空操作，终态改写为对账异常
#[derive(Debug, Default)]
pub struct OrderBook {
    orders: HashMap<String, Order>,
}

impl OrderBook {
    pub fn new() -> Self {
        Self {
            orders: HashMap::new(),
        }
    }

    /// 从持久化的订单列表恢复
    pub fn from_orders(orders: Vec<Order>) -> Self {
        let mut book = Self::new();
        for order in orders {
            book.orders.insert(order.id.clone(), order);
        }
        book
    }

    /// 登记新订单（下单回执或恢复时的交易所挂单）
    pub fn track(&mut self, order: Order) {
        log::debug!(
            "📋 登记订单: {} {} {} {:.8} @ {:?} [{:?}]",
            order.id,
            order.symbol,
            order.side,
            order.quantity,
            order.price,
            order.status
        );
        self.orders.insert(order.id.clone(), order);
    }

    pub fn get(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    pub fn contains(&self, order_id: &str) -> bool {
        self.orders.contains_key(order_id)
    }

    pub fn all_orders(&self) -> Vec<Order> {
        self.orders.values().cloned().collect()
    }

    /// 非终态订单（需要持久化并在重启后对账的部分）
    pub fn live_orders(&self) -> Vec<Order> {
        self.orders
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect()
    }

    /// 指定交易对的未终结订单
    pub fn open_orders_for(&self, symbol: &str) -> Vec<Order> {
        self.orders
            .values()
            .filter(|o| o.symbol == symbol && !o.status.is_terminal())
            .cloned()
            .collect()
    }

    /// 更新订单状态
    ///
    /// 返回Ok(true)表示状态发生变化，Ok(false)表示幂等空操作
    /// （同一成交通知重复到达时调用方据此跳过重复记账）
    pub fn update_status(
        &mut self,
        order_id: &str,
        status: OrderStatus,
        filled: f64,
    ) -> Result<bool> {
        let order = self.orders.get_mut(order_id).ok_or_else(|| {
            BotError::OrderNotFound {
                order_id: order_id.to_string(),
                symbol: String::new(),
            }
        })?;

        if order.status.is_terminal() {
            if order.status == status {
                return Ok(false);
            }
            return Err(BotError::ReconciliationMismatch {
                order_id: order_id.to_string(),
                detail: format!("终态订单 {:?} 收到改写 {:?}", order.status, status),
            });
        }

        let allowed = match order.status {
            OrderStatus::Pending => true,
            OrderStatus::Open | OrderStatus::PartiallyFilled => matches!(
                status,
                OrderStatus::PartiallyFilled
                    | OrderStatus::Filled
                    | OrderStatus::Cancelled
                    | OrderStatus::Unknown
            ),
            OrderStatus::Unknown => true,
            _ => false,
        };
        if !allowed {
            return Err(BotError::ReconciliationMismatch {
                order_id: order_id.to_string(),
                detail: format!("非法状态转移 {:?} -> {:?}", order.status, status),
            });
        }

        log::debug!(
            "📋 订单状态: {} {:?} -> {:?} (成交 {:.8})",
            order_id,
            order.status,
            status,
            filled
        );
        order.status = status;
        order.filled = filled.max(order.filled);
        order.updated_at = chrono::Utc::now();
        Ok(true)
    }

    /// 与交易所对账
    ///
    /// exchange_open: 交易所当前挂单；resolved: 已查明终态的订单提示
    /// 本地非终态但交易所不再挂的订单，按提示落终态，查不到的置Unknown
    /// 交易所有而本地没有的挂单直接登记（重启恢复路径）
    pub fn reconcile(
        &mut self,
        exchange_open: Vec<Order>,
        resolved: &HashMap<String, (OrderStatus, f64)>,
    ) -> Result<Vec<Order>> {
        let mut changed = Vec::new();

        let open_ids: std::collections::HashSet<&str> =
            exchange_open.iter().map(|o| o.id.as_str()).collect();
        let by_client: HashMap<String, Order> = exchange_open
            .iter()
            .map(|o| (o.client_order_id.clone(), o.clone()))
            .collect();

        // 交易所已不挂的本地活动订单
        let stale: Vec<(String, String)> = self
            .orders
            .values()
            .filter(|o| !o.status.is_terminal() && !open_ids.contains(o.id.as_str()))
            .map(|o| (o.id.clone(), o.client_order_id.clone()))
            .collect();

        for (order_id, client_id) in stale {
            // 下单超时的订单以客户端ID占位登记，按客户端ID换绑交易所ID
            if let Some(remote) = by_client.get(&client_id) {
                if remote.id != order_id {
                    log::info!("🔗 对账: 订单 {} 换绑交易所ID {}", order_id, remote.id);
                    self.orders.remove(&order_id);
                    self.track(remote.clone());
                    changed.push(remote.clone());
                    continue;
                }
            }
            let (status, filled) = resolved
                .get(&order_id)
                .cloned()
                .unwrap_or((OrderStatus::Unknown, 0.0));
            if status == OrderStatus::Unknown {
                log::warn!("⚠️ 对账: 订单 {} 交易所查无结果，置为Unknown", order_id);
            }
            if self.update_status(&order_id, status, filled)? {
                changed.push(self.orders[&order_id].clone());
            }
        }

        // 交易所挂单同步进本地镜像
        for remote in exchange_open {
            match self.orders.get_mut(&remote.id) {
                Some(local) => {
                    if !local.status.is_terminal()
                        && (local.status != remote.status || local.filled != remote.filled)
                    {
                        local.status = remote.status;
                        local.filled = remote.filled;
                        local.updated_at = chrono::Utc::now();
                        changed.push(local.clone());
                    }
                }
                None => {
                    log::warn!("⚠️ 对账: 发现未登记的交易所挂单 {}", remote.id);
                    self.track(remote.clone());
                    changed.push(remote);
                }
            }
        }

        Ok(changed)
    }

    /// 清理终态订单（成交记录已另行持久化，镜像只保留活动部分）
    pub fn prune_terminal(&mut self) -> usize {
        let before = self.orders.len();
        self.orders.retain(|_, o| !o.status.is_terminal());
        before - self.orders.len()
    }
}
