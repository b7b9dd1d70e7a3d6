use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

/// Global order sequence number. Issued from 1, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OrderId(pub u64);

/// Simulated broker account handle, 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId(pub u32);

/// Dense instrument handle, 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstrumentId(pub u32);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "acct({})", self.0)
    }
}

/// Order direction. Cover buys back a short, Close sells out a long.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
    Cover,
    Close,
}

impl Direction {
    /// +1 for the buying directions, -1 for the selling ones.
    pub fn sign(self) -> i64 {
        match self {
            Direction::Buy | Direction::Cover => 1,
            Direction::Sell | Direction::Close => -1,
        }
    }

    pub fn side(self) -> Side {
        if self.sign() > 0 {
            Side::Bid
        } else {
            Side::Ask
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Direction::Buy => "Buy",
            Direction::Sell => "Sell",
            Direction::Cover => "Cover",
            Direction::Close => "SellClose",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    Accepted,
    PartiallyFilled,
    Filled,
    Canceled,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled)
    }

    /// Accepted or partially filled, i.e. the order should be in a book.
    pub fn is_resting(self) -> bool {
        matches!(self, OrderStatus::Accepted | OrderStatus::PartiallyFilled)
    }
}

/// Full order record as kept by the ledger.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub account: AccountId,
    pub instrument: InstrumentId,
    pub symbol: String,
    pub direction: Direction,
    pub price: f64,       // limit price, 0 = market
    pub px_ticks: i64,    // integer-scaled limit price
    pub stop_price: f64,  // 0 = none
    pub qty: i64,
    pub qty_filled: i64,
    pub status: OrderStatus,
    pub open_ms: i64,     // sim time the order was accepted
    pub close_ms: i64,    // sim time it became terminal
    pub avg_fill_price: f64,
}

impl Order {
    pub fn remaining(&self) -> i64 {
        self.qty - self.qty_filled
    }

    /// The book entry for this order's unfilled remainder.
    pub fn resting(&self) -> Resting {
        Resting {
            id: self.id,
            side: self.direction.side(),
            px_ticks: self.px_ticks,
            qty: self.remaining(),
        }
    }
}

/// What the book stores for a resting order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resting {
    pub id: OrderId,
    pub side: Side,
    pub px_ticks: i64, // 0 = market
    pub qty: i64,      // unfilled quantity
}

/// A match between two resting orders of opposite sides.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cross {
    pub bid: OrderId,
    pub ask: OrderId,
    pub px_ticks: i64, // maker's price
    pub qty: i64,
}
