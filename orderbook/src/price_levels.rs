use crate::types::{OrderId, Resting, Side};
use std::collections::BTreeMap;

// Structured price levels, FIFO tracking with BTreeMap
// side determines which end of the map is the best
// - Asks: lowest key is best (front of map)
// - Bids: highest key is best (back of map)
// Inside a level orders are keyed by sequence number, which is the
// arrival order, so the first entry of a level is the oldest.
pub struct PriceLevels {
    /// Bid or ask?
    side: Side,
    /// level key mapped to the orders resting at that price
    levels: BTreeMap<i64, BTreeMap<OrderId, Resting>>,
    len: usize,
}

impl PriceLevels {
    /// Creates empty price levels for given side
    pub fn new(side: Side) -> Self {
        Self {
            side,
            levels: BTreeMap::new(),
            len: 0,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Map key for a price. A zero (market) price sorts as the best
    /// level on either side.
    fn level_key(&self, px_ticks: i64) -> i64 {
        match (self.side, px_ticks) {
            (Side::Bid, 0) => i64::MAX,
            (Side::Ask, 0) => i64::MIN,
            (_, px) => px,
        }
    }

    fn key_price(key: i64) -> i64 {
        if key == i64::MAX || key == i64::MIN {
            0
        } else {
            key
        }
    }

    /// Adds an order to its price level, keeps FIFO intact.
    /// Returns false if the order id is already on this side.
    pub fn push(&mut self, order: Resting) -> bool {
        let key = self.level_key(order.px_ticks);
        let level = self.levels.entry(key).or_default();
        if level.contains_key(&order.id) {
            return false;
        }
        level.insert(order.id, order);
        self.len += 1;
        true
    }

    /// Removes an order resting at `px_ticks`. Returns None if absent.
    pub fn remove(&mut self, id: OrderId, px_ticks: i64) -> Option<Resting> {
        let key = self.level_key(px_ticks);
        let level = self.levels.get_mut(&key)?;
        let order = level.remove(&id)?;
        if level.is_empty() {
            self.levels.remove(&key);
        }
        self.len -= 1;
        Some(order)
    }

    pub fn contains(&self, id: OrderId, px_ticks: i64) -> bool {
        self.levels
            .get(&self.level_key(px_ticks))
            .is_some_and(|level| level.contains_key(&id))
    }

    /// Returns the best price for the side without removing anything.
    /// 0 means a market order is at the front.
    /// Returns None if no price levels currently exist
    pub fn best_price(&self) -> Option<i64> {
        self.best_key().map(Self::key_price)
    }

    fn best_key(&self) -> Option<i64> {
        match self.side {
            Side::Ask => self.levels.first_key_value().map(|(k, _)| *k),
            Side::Bid => self.levels.last_key_value().map(|(k, _)| *k),
        }
    }

    /// Returns how many orders are waiting at best price
    /// Returns 0 if no price levels currently
    pub fn best_level_size(&self) -> usize {
        match self.best_key() {
            Some(key) => self.levels.get(&key).map(|q| q.len()).unwrap_or(0),
            None => 0,
        }
    }

    /// Oldest order at the best price, without removing it.
    pub fn peek_best(&self) -> Option<&Resting> {
        let key = self.best_key()?;
        self.levels.get(&key)?.values().next()
    }

    /// Mutable access to the oldest order at the best price.
    pub fn peek_best_mut(&mut self) -> Option<&mut Resting> {
        let key = self.best_key()?;
        self.levels.get_mut(&key)?.values_mut().next()
    }

    /// Removes and returns the oldest order at the best price.
    /// Cleans up levels when emptied
    pub fn pop_best(&mut self) -> Option<Resting> {
        let key = self.best_key()?;
        let level = self.levels.get_mut(&key)?;
        let (_, order) = level.pop_first()?;
        if level.is_empty() {
            self.levels.remove(&key);
        }
        self.len -= 1;
        Some(order)
    }

    /// Orders in priority order: best level first, FIFO inside a level.
    pub fn iter_best_first(&self) -> Box<dyn Iterator<Item = &Resting> + '_> {
        match self.side {
            Side::Ask => Box::new(self.levels.values().flat_map(|l| l.values())),
            Side::Bid => Box::new(self.levels.values().rev().flat_map(|l| l.values())),
        }
    }

    /// (price, total quantity, order count) per level, best first.
    pub fn iter_levels_best_first(&self) -> Vec<(i64, i64, usize)> {
        let summarize = |(k, l): (&i64, &BTreeMap<OrderId, Resting>)| {
            (Self::key_price(*k), l.values().map(|o| o.qty).sum(), l.len())
        };
        match self.side {
            Side::Ask => self.levels.iter().map(summarize).collect(),
            Side::Bid => self.levels.iter().rev().map(summarize).collect(),
        }
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    /// Total number of resting orders on this side.
    pub fn total_len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
