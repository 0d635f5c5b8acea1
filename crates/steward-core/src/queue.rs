//! Per-settlement work queues.
//!
//! Build orders carry absolute target levels queued as current + n. The
//! reindex invariant: removing the order at position i decrements the target
//! level of every later order of the same structure by one (its derived id
//! regenerates with it). Orders whose target falls below level 1, and recruit
//! orders whose remaining count reaches 0, are removed.

use contracts::orders::{BuildOrder, RecruitAmount, RecruitOrder};
use contracts::GameCatalog;
use serde_json::Value;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildQueue {
    orders: Vec<BuildOrder>,
}

impl BuildQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_orders(orders: Vec<BuildOrder>) -> Self {
        Self { orders }
    }

    pub fn push(&mut self, order: BuildOrder) {
        self.orders.push(order);
    }

    /// Insert a critical auto-build ahead of the blocked head order.
    pub fn push_front(&mut self, order: BuildOrder) {
        self.orders.insert(0, order);
    }

    pub fn head(&self) -> Option<&BuildOrder> {
        self.orders.first()
    }

    /// Remove the order at `index`, decrementing every later same-structure
    /// order's target level by one. Later orders whose target drops below
    /// level 1 are discarded outright.
    pub fn remove_at(&mut self, index: usize) -> Option<BuildOrder> {
        if index >= self.orders.len() {
            return None;
        }
        let removed = self.orders.remove(index);
        let mut cursor = index;
        while cursor < self.orders.len() {
            if self.orders[cursor].structure == removed.structure {
                self.orders[cursor].target_level -= 1;
                if self.orders[cursor].target_level < 1 {
                    self.orders.remove(cursor);
                    continue;
                }
            }
            cursor += 1;
        }
        Some(removed)
    }

    /// Remove the head as a cancellation (the upgrade never happened), so
    /// later same-structure targets shift down.
    pub fn pop_head(&mut self) -> Option<BuildOrder> {
        self.remove_at(0)
    }

    /// Remove the head after its construction order was accepted. The level
    /// really is rising, so later same-structure targets stay as they are.
    pub fn complete_head(&mut self) -> Option<BuildOrder> {
        if self.orders.is_empty() {
            return None;
        }
        Some(self.orders.remove(0))
    }

    /// Drop the second queued order. Used to break the cycle where a
    /// just-inserted critical order is itself blocked.
    pub fn drop_second(&mut self) -> Option<BuildOrder> {
        self.remove_at(1)
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn orders(&self) -> &[BuildOrder] {
        &self.orders
    }

    /// Drop orders whose structure the catalog does not know. Returns the
    /// discarded ids so the caller can log them.
    pub fn retain_known(&mut self, catalog: &GameCatalog) -> Vec<String> {
        let mut dropped = Vec::new();
        self.orders.retain(|order| {
            if catalog.structure(&order.structure).is_some() {
                true
            } else {
                dropped.push(order.order_id());
                false
            }
        });
        dropped
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecruitQueue {
    orders: Vec<RecruitOrder>,
}

impl RecruitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_orders(orders: Vec<RecruitOrder>) -> Self {
        Self { orders }
    }

    pub fn push(&mut self, order: RecruitOrder) {
        self.orders.push(order);
    }

    pub fn head(&self) -> Option<&RecruitOrder> {
        self.orders.first()
    }

    /// Decrement the head order's remaining count after a successful batch.
    /// The order pops once exhausted; returns `true` when it did.
    pub fn decrement_head(&mut self) -> bool {
        let Some(head) = self.orders.first_mut() else {
            return false;
        };
        let count = match &mut head.amount {
            RecruitAmount::Slots { count } | RecruitAmount::Units { count } => count,
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.orders.remove(0);
            return true;
        }
        false
    }

    pub fn remove_at(&mut self, index: usize) -> Option<RecruitOrder> {
        if index >= self.orders.len() {
            return None;
        }
        Some(self.orders.remove(index))
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    pub fn orders(&self) -> &[RecruitOrder] {
        &self.orders
    }

    pub fn retain_known(&mut self, catalog: &GameCatalog) -> Vec<String> {
        let mut dropped = Vec::new();
        self.orders.retain(|order| {
            if catalog.unit(&order.unit).is_some() {
                true
            } else {
                dropped.push(order.unit.clone());
                false
            }
        });
        dropped
    }
}

impl BuildQueue {
    /// Serialized form for the state store.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.orders).unwrap_or_else(|_| Value::Array(Vec::new()))
    }

    /// Rebuild from a persisted payload, dropping unreadable data and orders
    /// whose structure the catalog no longer knows.
    pub fn from_value(settlement: &str, value: Value, catalog: &GameCatalog) -> Self {
        let orders: Vec<BuildOrder> = match serde_json::from_value(value) {
            Ok(orders) => orders,
            Err(err) => {
                warn!(settlement, %err, "treating unreadable build queue as empty");
                Vec::new()
            }
        };
        let mut queue = Self::from_orders(orders);
        for id in queue.retain_known(catalog) {
            warn!(settlement, order = %id, "dropping persisted build order with unknown structure");
        }
        queue
    }
}

impl RecruitQueue {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(&self.orders).unwrap_or_else(|_| Value::Array(Vec::new()))
    }

    pub fn from_value(settlement: &str, value: Value, catalog: &GameCatalog) -> Self {
        let orders: Vec<RecruitOrder> = match serde_json::from_value(value) {
            Ok(orders) => orders,
            Err(err) => {
                warn!(settlement, %err, "treating unreadable recruit queue as empty");
                Vec::new()
            }
        };
        let mut queue = Self::from_orders(orders);
        for id in queue.retain_known(catalog) {
            warn!(settlement, unit = %id, "dropping persisted recruit order with unknown unit");
        }
        queue
    }
}
