//! Per-instrument order book for the tick-replay simulator.
//!
//! Core features:
//! - Price-time priority (best price first, then lowest sequence number)
//! - Market orders (price 0) rest at the front of their side and always cross
//! - Sweep of one side against an incoming tick price
//! - Cross of resting bids against resting asks at the maker's price

pub mod types;

pub use types::{AccountId, Cross, Direction, InstrumentId, Order, OrderId, OrderStatus, Resting, Side};
pub mod price_levels;
pub use price_levels::PriceLevels;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BookError {
    #[error("order {0} already in book")]
    Duplicate(OrderId),
}

/// Two-sided book of resting orders for one instrument.
///
/// Not thread-safe - the simulator guards all books with one lock.
pub struct OrderBook {
    /// Buy orders, highest price first
    pub bids: PriceLevels,
    /// Sell orders, lowest price first
    pub asks: PriceLevels,
}

impl Default for OrderBook {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderBook {
    /// Creates empty order book.
    pub fn new() -> Self {
        Self {
            bids: PriceLevels::new(Side::Bid),
            asks: PriceLevels::new(Side::Ask),
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut PriceLevels {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    /// Rests an order on the side given by its direction.
    pub fn insert(&mut self, order: Resting) -> Result<(), BookError> {
        if self.side_mut(order.side).push(order) {
            Ok(())
        } else {
            Err(BookError::Duplicate(order.id))
        }
    }

    /// Takes an order out of the book. None if it was not resting there.
    pub fn remove(&mut self, order: &Resting) -> Option<Resting> {
        self.side_mut(order.side).remove(order.id, order.px_ticks)
    }

    pub fn contains(&self, order: &Resting) -> bool {
        match order.side {
            Side::Bid => self.bids.contains(order.id, order.px_ticks),
            Side::Ask => self.asks.contains(order.id, order.px_ticks),
        }
    }

    /// Removes and returns, in priority order, every order on `side` that
    /// crosses `incoming_px`.
    ///
    /// Bids cross when their limit is at or above the incoming (ask-side)
    /// price, asks when at or below the incoming (bid-side) price. Market
    /// orders always cross. A non-positive incoming price crosses nothing.
    pub fn sweep_crossable(&mut self, side: Side, incoming_px: i64) -> Vec<Resting> {
        let mut swept = Vec::new();
        if incoming_px <= 0 {
            return swept;
        }
        let levels = self.side_mut(side);
        while let Some(best) = levels.peek_best() {
            let crosses = best.px_ticks == 0
                || match side {
                    Side::Bid => best.px_ticks >= incoming_px,
                    Side::Ask => best.px_ticks <= incoming_px,
                };
            if !crosses {
                break;
            }
            match levels.pop_best() {
                Some(o) => swept.push(o),
                None => break,
            }
        }
        swept
    }

    /// Matches resting bids against resting asks until the book is no
    /// longer crossed.
    ///
    /// Each cross trades the smaller remaining quantity at the price of the
    /// older order. Two market orders never trade with each other, and while
    /// both sides are fronted by one, matching stops there: limit orders
    /// queued behind them wait until a tick sweep takes the market orders
    /// out. The simulator always sweeps before crossing, so this only holds
    /// the book up on a tick with a non-positive price.
    pub fn cross_resting(&mut self) -> Vec<Cross> {
        let mut crosses = Vec::new();

        loop {
            let (Some(bid), Some(ask)) = (self.bids.peek_best().copied(), self.asks.peek_best().copied())
            else {
                break; // one side empty
            };

            let px_ticks = match (bid.px_ticks, ask.px_ticks) {
                (0, 0) => break,
                (0, ask_px) => ask_px,
                (bid_px, 0) => bid_px,
                (bid_px, ask_px) if bid_px < ask_px => break, // no cross
                (bid_px, ask_px) => {
                    // Trade at maker's price
                    if bid.id < ask.id {
                        bid_px
                    } else {
                        ask_px
                    }
                }
            };

            let fill = bid.qty.min(ask.qty);
            crosses.push(Cross {
                bid: bid.id,
                ask: ask.id,
                px_ticks,
                qty: fill,
            });

            Self::reduce_best(&mut self.bids, fill);
            Self::reduce_best(&mut self.asks, fill);
        }

        crosses
    }

    fn reduce_best(levels: &mut PriceLevels, fill: i64) {
        let exhausted = match levels.peek_best_mut() {
            Some(o) => {
                o.qty -= fill;
                o.qty <= 0
            }
            None => false,
        };
        if exhausted {
            levels.pop_best();
        }
    }

    /// Returns current best bid price (highest buy price, 0 for market).
    pub fn best_bid(&self) -> Option<i64> {
        self.bids.best_price()
    }

    /// Returns current best ask price (lowest sell price, 0 for market).
    pub fn best_ask(&self) -> Option<i64> {
        self.asks.best_price()
    }

    /// Resting orders on both sides.
    pub fn len(&self) -> usize {
        self.bids.total_len() + self.asks.total_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod ob_tests {
    use super::*;

    fn resting(id: u64, side: Side, px: i64, qty: i64) -> Resting {
        Resting {
            id: OrderId(id),
            side,
            px_ticks: px,
            qty,
        }
    }

    /// Equal prices sweep in sequence order.
    #[test]
    fn sweep_keeps_time_priority() {
        let mut ob = OrderBook::new();
        ob.insert(resting(2, Side::Bid, 11355, 1)).unwrap();
        ob.insert(resting(1, Side::Bid, 11355, 1)).unwrap();
        ob.insert(resting(3, Side::Bid, 11360, 1)).unwrap();
        ob.insert(resting(4, Side::Bid, 11340, 1)).unwrap();

        let swept = ob.sweep_crossable(Side::Bid, 11355);
        let ids: Vec<u64> = swept.iter().map(|o| o.id.0).collect();
        assert_eq!(ids, vec![3, 1, 2]);
        assert_eq!(ob.best_bid(), Some(11340));
    }

    #[test]
    fn sweep_stops_at_first_non_crossing() {
        let mut ob = OrderBook::new();
        ob.insert(resting(1, Side::Ask, 11360, 1)).unwrap();
        ob.insert(resting(2, Side::Ask, 11365, 1)).unwrap();

        assert!(ob.sweep_crossable(Side::Ask, 11355).is_empty());
        let swept = ob.sweep_crossable(Side::Ask, 11362);
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, OrderId(1));
        assert_eq!(ob.len(), 1);
    }

    #[test]
    fn market_orders_always_cross() {
        let mut ob = OrderBook::new();
        ob.insert(resting(1, Side::Bid, 0, 1)).unwrap();
        ob.insert(resting(2, Side::Bid, 100, 1)).unwrap();
        ob.insert(resting(3, Side::Ask, 0, 1)).unwrap();

        let bids = ob.sweep_crossable(Side::Bid, 500);
        assert_eq!(bids.iter().map(|o| o.id.0).collect::<Vec<_>>(), vec![1]);
        let asks = ob.sweep_crossable(Side::Ask, 1);
        assert_eq!(asks.len(), 1);
        // zero incoming price fills nothing
        ob.insert(resting(4, Side::Ask, 0, 1)).unwrap();
        assert!(ob.sweep_crossable(Side::Ask, 0).is_empty());
    }

    #[test]
    fn duplicate_insert_fails_and_remove_is_noop_when_absent() {
        let mut ob = OrderBook::new();
        let o = resting(1, Side::Bid, 100, 1);
        ob.insert(o).unwrap();
        assert_eq!(ob.insert(o), Err(BookError::Duplicate(OrderId(1))));
        assert!(ob.contains(&o));
        assert!(ob.remove(&o).is_some());
        assert!(ob.remove(&o).is_none());
        assert!(ob.is_empty());
    }

    /// Tests crossing resting orders with partial fills.
    #[test]
    fn crossing_and_partials() {
        let mut ob = OrderBook::new();

        // Two asks at same price level - first has time priority
        ob.insert(resting(1, Side::Ask, 100, 50)).unwrap();
        ob.insert(resting(2, Side::Ask, 100, 40)).unwrap();
        // Later bid above them, fills 50 from order 1, then 20 from order 2
        ob.insert(resting(10, Side::Bid, 101, 70)).unwrap();

        let crosses = ob.cross_resting();
        assert_eq!(crosses.len(), 2);
        assert_eq!(crosses[0].ask, OrderId(1));
        assert_eq!(crosses[0].qty, 50);
        assert_eq!(crosses[0].px_ticks, 100); // maker's price
        assert_eq!(crosses[1].ask, OrderId(2));
        assert_eq!(crosses[1].qty, 20);

        // Order 2 should have 20 remaining
        assert_eq!(ob.best_ask(), Some(100));
        assert_eq!(ob.asks.peek_best().map(|o| o.qty), Some(20));
        assert_eq!(ob.best_bid(), None);
    }

    /// Tests non-crossing orders that rest in the book.
    #[test]
    fn market_pair_at_front_blocks_cross_until_swept() {
        let mut ob = OrderBook::new();
        ob.insert(resting(1, Side::Bid, 0, 1)).unwrap();
        ob.insert(resting(2, Side::Ask, 0, 1)).unwrap();
        ob.insert(resting(3, Side::Bid, 105, 1)).unwrap();
        ob.insert(resting(4, Side::Ask, 100, 1)).unwrap();

        assert!(ob.cross_resting().is_empty());
        assert_eq!(ob.len(), 4);

        assert_eq!(ob.sweep_crossable(Side::Bid, 110).len(), 1);
        assert_eq!(ob.sweep_crossable(Side::Ask, 90).len(), 1);
        let crosses = ob.cross_resting();
        assert_eq!(crosses.len(), 1);
        assert_eq!((crosses[0].bid, crosses[0].ask), (OrderId(3), OrderId(4)));
        assert_eq!(crosses[0].px_ticks, 105);
        assert!(ob.is_empty());
    }

    #[test]
    fn non_crossing_rests() {
        let mut ob = OrderBook::new();
        ob.insert(resting(1, Side::Ask, 105, 10)).unwrap();
        ob.insert(resting(2, Side::Bid, 104, 10)).unwrap();

        assert!(ob.cross_resting().is_empty());
        assert_eq!(ob.best_bid(), Some(104));
        assert_eq!(ob.best_ask(), Some(105));
    }

    #[test]
    fn market_against_limit_trades_at_limit() {
        let mut ob = OrderBook::new();
        ob.insert(resting(1, Side::Ask, 0, 5)).unwrap();
        ob.insert(resting(2, Side::Bid, 0, 5)).unwrap();
        assert!(ob.cross_resting().is_empty());

        ob.insert(resting(3, Side::Bid, 99, 2)).unwrap();
        // market bid 2 is still ahead of the limit bid, market vs market stops
        assert!(ob.cross_resting().is_empty());
        ob.remove(&resting(2, Side::Bid, 0, 5));
        let crosses = ob.cross_resting();
        assert_eq!(crosses.len(), 1);
        assert_eq!(crosses[0].px_ticks, 99);
        assert_eq!(crosses[0].qty, 2);
        assert_eq!(ob.asks.peek_best().map(|o| o.qty), Some(3));
    }
}
