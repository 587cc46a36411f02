//! Order book model.
//!
//! Two views of the same market:
//! - [`OrderBookSnapshot`]: one decoded snapshot message, one entry per price
//!   level, bids best-first and asks best-first. Built by the decoder and
//!   handed to the sink; never merged with earlier snapshots.
//! - [`OrderBook`] / [`Books`]: a live, order-level book per security that
//!   starts from snapshots and then follows incremental updates and executions.
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use crate::protocol::{
    Envelope, NULL_VALUE, OrderBookEntry, OrderBookSnapshotHeader, OrderExecution, OrderUpdate,
    Side, UpdateAction, normalize_price,
};

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookSnapshot {
    pub header: OrderBookSnapshotHeader,
    bids: BTreeMap<Reverse<i64>, OrderBookEntry>,
    asks: BTreeMap<i64, OrderBookEntry>,
}

impl OrderBookSnapshot {
    pub fn new(header: OrderBookSnapshotHeader) -> Self {
        Self {
            header,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
        }
    }

    /// Route an entry to its side, replacing any entry at the same price.
    /// Null prices, empty-book markers and unknown sides are dropped; returns
    /// whether the entry was kept.
    pub fn insert(&mut self, entry: OrderBookEntry) -> bool {
        if entry.order_price == NULL_VALUE {
            return false;
        }
        match entry.side {
            Side::Bid => {
                self.bids.insert(Reverse(entry.order_price), entry);
                true
            }
            Side::Offer => {
                self.asks.insert(entry.order_price, entry);
                true
            }
            Side::EmptyBook | Side::Unknown(_) => false,
        }
    }

    /// Highest price first.
    pub fn bids(&self) -> impl Iterator<Item = &OrderBookEntry> + '_ {
        self.bids.values()
    }

    /// Lowest price first.
    pub fn asks(&self) -> impl Iterator<Item = &OrderBookEntry> + '_ {
        self.asks.values()
    }

    pub fn best_bid(&self) -> Option<&OrderBookEntry> {
        self.bids.values().next()
    }

    pub fn best_ask(&self) -> Option<&OrderBookEntry> {
        self.asks.values().next()
    }

    pub fn len(&self) -> usize {
        self.bids.len() + self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }
}

/// Aggregated price level of a live book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level {
    pub price: i64,
    /// Sum of the resting volumes; wide enough that no count of wire volumes overflows it.
    pub volume: i128,
    pub orders: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RestingOrder {
    side: Side,
    price: i64,
    volume: i64,
}

/// Live order-level book for a single security.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderBook {
    orders: HashMap<i64, RestingOrder>,
    bids: BTreeMap<Reverse<i64>, Level>,
    asks: BTreeMap<i64, Level>,
    last_rpt_seq: u32,
    /// A snapshot for this security spans more datagrams.
    in_snapshot: bool,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last report sequence applied to this book.
    pub fn last_rpt_seq(&self) -> u32 {
        self.last_rpt_seq
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }

    pub fn best_bid(&self) -> Option<&Level> {
        self.bids.values().next()
    }

    pub fn best_ask(&self) -> Option<&Level> {
        self.asks.values().next()
    }

    /// Up to `depth` levels per side, best first.
    pub fn top(&self, depth: usize) -> (Vec<Level>, Vec<Level>) {
        (
            self.bids.values().take(depth).copied().collect(),
            self.asks.values().take(depth).copied().collect(),
        )
    }

    /// Side-by-side table of the top `depth` levels, prices normalized.
    pub fn render_top(&self, depth: usize) -> String {
        let (bids, asks) = self.top(depth);
        let mut out = String::new();
        for i in 0..bids.len().max(asks.len()) {
            let b = bids
                .get(i)
                .map(|l| format!("{:>3}: {:>12.5} x {:>7}", i, normalize_price(l.price), l.volume))
                .unwrap_or_else(|| format!("{:>3}: {:>22}", i, "-"));
            let a = asks
                .get(i)
                .map(|l| format!("{:>12.5} x {:>7}", normalize_price(l.price), l.volume))
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!("{b} | {a}\n"));
        }
        out
    }

    pub fn clear(&mut self) {
        self.orders.clear();
        self.bids.clear();
        self.asks.clear();
        self.in_snapshot = false;
    }

    /// Returns `false` when the message did not change the book.
    pub fn apply_update(&mut self, update: &OrderUpdate) -> bool {
        self.last_rpt_seq = update.rpt_seq;
        match update.action {
            UpdateAction::New | UpdateAction::Update => {
                let removed = self.remove_order(update.order_id).is_some();
                let added = self.add_order(
                    update.order_id,
                    update.side,
                    update.order_price,
                    update.order_volume,
                );
                removed || added
            }
            UpdateAction::Delete => self.remove_order(update.order_id).is_some(),
            UpdateAction::Unknown(_) => false,
        }
    }

    /// Executions shrink the resting order to its remaining quantity; a fully
    /// filled or deleted order leaves the book.
    pub fn apply_execution(&mut self, execution: &OrderExecution) -> bool {
        self.last_rpt_seq = execution.rpt_seq;
        let Some(order) = self.orders.get(&execution.order_id).copied() else {
            return false;
        };
        let remaining = execution.remaining_quantity;
        if execution.action == UpdateAction::Delete || remaining <= 0 || remaining == NULL_VALUE {
            self.remove_order(execution.order_id);
            return true;
        }
        self.remove_order(execution.order_id);
        self.add_order(execution.order_id, order.side, order.price, remaining)
    }

    /// Load the entries of one snapshot message. The book is cleared first
    /// unless the previous snapshot datagram for this security was not its
    /// last fragment.
    pub fn apply_snapshot(&mut self, envelope: &Envelope, snapshot: &OrderBookSnapshot) {
        if !self.in_snapshot {
            self.clear();
        }
        for entry in snapshot.bids().chain(snapshot.asks()) {
            self.remove_order(entry.order_id);
            self.add_order(entry.order_id, entry.side, entry.order_price, entry.order_volume);
        }
        self.last_rpt_seq = snapshot.header.rpt_seq;
        self.in_snapshot = !envelope.is_last_fragment();
    }

    fn add_order(&mut self, order_id: i64, side: Side, price: i64, volume: i64) -> bool {
        // A non-positive volume rests nothing, so the order is simply gone.
        if price == NULL_VALUE || volume == NULL_VALUE || volume <= 0 {
            return false;
        }
        let empty = Level { price, volume: 0, orders: 0 };
        let level = match side {
            Side::Bid => self.bids.entry(Reverse(price)).or_insert(empty),
            Side::Offer => self.asks.entry(price).or_insert(empty),
            Side::EmptyBook | Side::Unknown(_) => return false,
        };
        level.volume += i128::from(volume);
        level.orders += 1;
        self.orders.insert(order_id, RestingOrder { side, price, volume });
        true
    }

    fn remove_order(&mut self, order_id: i64) -> Option<RestingOrder> {
        let order = self.orders.remove(&order_id)?;
        match order.side {
            Side::Bid => {
                if let Some(level) = self.bids.get_mut(&Reverse(order.price)) {
                    level.volume -= i128::from(order.volume);
                    level.orders -= 1;
                    if level.orders == 0 {
                        self.bids.remove(&Reverse(order.price));
                    }
                }
            }
            Side::Offer => {
                if let Some(level) = self.asks.get_mut(&order.price) {
                    level.volume -= i128::from(order.volume);
                    level.orders -= 1;
                    if level.orders == 0 {
                        self.asks.remove(&order.price);
                    }
                }
            }
            Side::EmptyBook | Side::Unknown(_) => {}
        }
        Some(order)
    }
}

/// Live books keyed by security id.
#[derive(Debug, Clone, Default)]
pub struct Books {
    books: BTreeMap<i32, OrderBook>,
}

impl Books {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_update(&mut self, update: &OrderUpdate) -> bool {
        self.books.entry(update.security_id).or_default().apply_update(update)
    }

    pub fn apply_execution(&mut self, execution: &OrderExecution) -> bool {
        self.books
            .entry(execution.security_id)
            .or_default()
            .apply_execution(execution)
    }

    pub fn apply_snapshot(&mut self, envelope: &Envelope, snapshot: &OrderBookSnapshot) {
        self.books
            .entry(snapshot.header.security_id)
            .or_default()
            .apply_snapshot(envelope, snapshot);
    }

    pub fn get(&self, security_id: i32) -> Option<&OrderBook> {
        self.books.get(&security_id)
    }

    /// Books in ascending security id order.
    pub fn iter(&self) -> impl Iterator<Item = (i32, &OrderBook)> + '_ {
        self.books.iter().map(|(id, book)| (*id, book))
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}
