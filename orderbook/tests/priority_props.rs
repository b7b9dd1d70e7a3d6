//! Property tests for book priority.
//!
//! 1. Price/time priority: sweeps come out best price first, then by sequence
//! 2. No phantom fills: nothing swept fails to cross the incoming price
//! 3. A cross leaves the book uncrossed

use orderbook::{OrderBook, OrderId, Resting, Side};
use proptest::prelude::*;

fn arb_orders(side: Side) -> impl Strategy<Value = Vec<Resting>> {
    // price 0 is a market order, keep them rare
    prop::collection::vec((prop_oneof![1 => Just(0i64), 9 => 100i64..120], 1i64..10), 1..60).prop_map(
        move |rows| {
            rows.into_iter()
                .enumerate()
                .map(|(i, (px, qty))| Resting {
                    id: OrderId(i as u64 + 1),
                    side,
                    px_ticks: px,
                    qty,
                })
                .collect()
        },
    )
}

proptest! {
    #[test]
    fn bid_sweep_respects_priority_and_crossing(orders in arb_orders(Side::Bid), incoming in 95i64..125) {
        let mut ob = OrderBook::new();
        for o in &orders {
            ob.insert(*o).unwrap();
        }
        let swept = ob.sweep_crossable(Side::Bid, incoming);

        for o in &swept {
            prop_assert!(o.px_ticks == 0 || o.px_ticks >= incoming);
        }
        // priority key: market first, then higher price, then lower sequence
        for w in swept.windows(2) {
            let key = |o: &Resting| (if o.px_ticks == 0 { i64::MAX } else { o.px_ticks }, std::cmp::Reverse(o.id));
            prop_assert!(key(&w[0]) > key(&w[1]));
        }
        // whatever is left does not cross
        if let Some(best) = ob.best_bid() {
            prop_assert!(best != 0 && best < incoming);
        }
        prop_assert_eq!(swept.len() + ob.len(), orders.len());
    }

    #[test]
    fn ask_sweep_never_yields_non_crossing(orders in arb_orders(Side::Ask), incoming in 95i64..125) {
        let mut ob = OrderBook::new();
        for o in &orders {
            ob.insert(*o).unwrap();
        }
        let swept = ob.sweep_crossable(Side::Ask, incoming);
        for o in &swept {
            prop_assert!(o.px_ticks == 0 || o.px_ticks <= incoming);
        }
        for w in swept.windows(2) {
            prop_assert!((w[0].px_ticks, w[0].id) < (w[1].px_ticks, w[1].id));
        }
    }

    #[test]
    fn cross_leaves_book_uncrossed(bids in arb_orders(Side::Bid), asks in arb_orders(Side::Ask)) {
        let mut ob = OrderBook::new();
        for o in bids.iter().filter(|o| o.px_ticks > 0) {
            ob.insert(*o).unwrap();
        }
        for o in asks.iter().filter(|o| o.px_ticks > 0) {
            ob.insert(Resting { id: OrderId(o.id.0 + 1000), ..*o }).unwrap();
        }
        let crosses = ob.cross_resting();
        for c in &crosses {
            prop_assert!(c.qty > 0);
        }
        if let (Some(b), Some(a)) = (ob.best_bid(), ob.best_ask()) {
            prop_assert!(b < a);
        }
    }
}
