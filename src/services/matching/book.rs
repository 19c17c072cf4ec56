//! Order book for a single (market, selection)
//!
//! Two price-indexed sides: back orders matched best-price-descending, lay
//! orders best-price-ascending. Within a price level orders match in FIFO
//! order. Matching is split into a pure planning walk and a separate apply
//! step so callers can persist the outcome before mutating the book.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::models::{Match, Order, OrderSide, OrderStatus};

use super::types::{BookOrder, BookSnapshot, Fill, LevelSnapshot, MakerUpdate, PlacementPlan};

/// In-memory book state, guarded by one lock per (market, selection)
pub struct BookState {
    market_id: String,
    selection_id: String,

    /// price -> FIFO queue; iterated in reverse for best back first
    back: BTreeMap<Decimal, VecDeque<BookOrder>>,

    /// price -> FIFO queue; iterated forward for best lay first
    lay: BTreeMap<Decimal, VecDeque<BookOrder>>,

    /// order id -> (side, price) for O(1) cancellation
    order_index: HashMap<Uuid, (OrderSide, Decimal)>,
}

impl BookState {
    pub fn new(market_id: impl Into<String>, selection_id: impl Into<String>) -> Self {
        Self {
            market_id: market_id.into(),
            selection_id: selection_id.into(),
            back: BTreeMap::new(),
            lay: BTreeMap::new(),
            order_index: HashMap::new(),
        }
    }

    pub fn market_id(&self) -> &str {
        &self.market_id
    }

    pub fn selection_id(&self) -> &str {
        &self.selection_id
    }

    /// Plan a placement: walk the opposite side best-price-first and pair
    /// the incoming order against resting orders without touching the book.
    ///
    /// A back order at P_b is eligible against lay levels with price <= P_b;
    /// a lay order at P_l against back levels with price >= P_l. The walk
    /// halts at the first ineligible level. Each pairing trades at the
    /// resting order's price for the lesser of the two remainders.
    pub fn plan(&self, incoming: &Order) -> PlacementPlan {
        let mut fills = Vec::new();
        let mut matched = incoming.size_matched;
        let mut remaining = incoming.size_remaining;
        let now = Utc::now();

        let opposite: Box<dyn Iterator<Item = (&Decimal, &VecDeque<BookOrder>)> + '_> =
            match incoming.side {
                OrderSide::Back => Box::new(self.lay.iter()),
                OrderSide::Lay => Box::new(self.back.iter().rev()),
            };

        'walk: for (&level_price, queue) in opposite {
            if remaining.is_zero() {
                break;
            }

            let eligible = match incoming.side {
                OrderSide::Back => level_price <= incoming.price,
                OrderSide::Lay => level_price >= incoming.price,
            };
            if !eligible {
                break;
            }

            for maker in queue.iter() {
                if remaining.is_zero() {
                    break 'walk;
                }

                let fill_size = remaining.min(maker.size_remaining);

                let (back_order_id, lay_order_id, back_user_id, lay_user_id) =
                    match incoming.side {
                        OrderSide::Back => (incoming.id, maker.id, incoming.user_id, maker.user_id),
                        OrderSide::Lay => (maker.id, incoming.id, maker.user_id, incoming.user_id),
                    };

                let match_record = Match {
                    id: Uuid::new_v4(),
                    market_id: self.market_id.clone(),
                    selection_id: self.selection_id.clone(),
                    back_order_id,
                    lay_order_id,
                    back_user_id,
                    lay_user_id,
                    price: level_price,
                    size: fill_size,
                    back_liability: fill_size,
                    lay_liability: Match::lay_liability_for(level_price, fill_size),
                    matched_at: now,
                    settled_at: None,
                };

                let maker_remaining = maker.size_remaining - fill_size;
                let maker_status = if maker_remaining.is_zero() {
                    OrderStatus::Matched
                } else {
                    OrderStatus::Partially
                };

                fills.push(Fill {
                    match_record,
                    maker: MakerUpdate {
                        order_id: maker.id,
                        size_matched: maker.size_matched + fill_size,
                        size_remaining: maker_remaining,
                        status: maker_status,
                        version: maker.version,
                    },
                });

                matched += fill_size;
                remaining -= fill_size;
            }
        }

        let taker_status = if remaining.is_zero() {
            OrderStatus::Matched
        } else if !fills.is_empty() {
            OrderStatus::Partially
        } else {
            OrderStatus::Pending
        };

        PlacementPlan {
            fills,
            taker_size_matched: matched,
            taker_size_remaining: remaining,
            taker_status,
        }
    }

    /// Apply a committed plan: consume maker fills, pop exactly-filled
    /// resting orders (erasing levels as they empty) and rest the residual
    /// of the incoming order at the tail of its price level.
    pub fn apply(&mut self, incoming: &Order, plan: &PlacementPlan) {
        for fill in &plan.fills {
            self.apply_maker_fill(&fill.maker);
        }

        if !plan.taker_size_remaining.is_zero() {
            let mut resting = BookOrder::from(incoming);
            resting.size_matched = plan.taker_size_matched;
            resting.size_remaining = plan.taker_size_remaining;
            self.insert_resting(resting);
        }
    }

    fn apply_maker_fill(&mut self, update: &MakerUpdate) {
        let Some(&(side, price)) = self.order_index.get(&update.order_id) else {
            return;
        };

        let levels = match side {
            OrderSide::Back => &mut self.back,
            OrderSide::Lay => &mut self.lay,
        };

        let Some(queue) = levels.get_mut(&price) else {
            return;
        };

        if let Some(pos) = queue.iter().position(|o| o.id == update.order_id) {
            if update.size_remaining.is_zero() {
                queue.remove(pos);
                self.order_index.remove(&update.order_id);
            } else if let Some(maker) = queue.get_mut(pos) {
                maker.size_matched = update.size_matched;
                maker.size_remaining = update.size_remaining;
                maker.version += 1;
            }
        }

        if queue.is_empty() {
            levels.remove(&price);
        }
    }

    /// Append a live order at the tail of its price level, creating the
    /// level if this is a new price point.
    pub fn insert_resting(&mut self, order: BookOrder) {
        let side = order.side;
        let price = order.price;

        let levels = match side {
            OrderSide::Back => &mut self.back,
            OrderSide::Lay => &mut self.lay,
        };

        self.order_index.insert(order.id, (side, price));
        levels.entry(price).or_default().push_back(order);
    }

    /// Remove a live order. Returns the removed entry, or None when the
    /// order is not in the book. Never produces a match.
    pub fn cancel(&mut self, order_id: Uuid) -> Option<BookOrder> {
        let (side, price) = self.order_index.remove(&order_id)?;

        let levels = match side {
            OrderSide::Back => &mut self.back,
            OrderSide::Lay => &mut self.lay,
        };

        let queue = levels.get_mut(&price)?;
        let pos = queue.iter().position(|o| o.id == order_id)?;
        let removed = queue.remove(pos);

        if queue.is_empty() {
            levels.remove(&price);
        }

        removed
    }

    /// Aggregated price ladders
    pub fn snapshot(&self) -> BookSnapshot {
        let aggregate = |queue: &VecDeque<BookOrder>, price: Decimal| LevelSnapshot {
            price,
            total_size: queue.iter().map(|o| o.size_remaining).sum(),
            order_count: queue.len(),
        };

        BookSnapshot {
            market_id: self.market_id.clone(),
            selection_id: self.selection_id.clone(),
            back_levels: self
                .back
                .iter()
                .rev()
                .map(|(&p, q)| aggregate(q, p))
                .collect(),
            lay_levels: self.lay.iter().map(|(&p, q)| aggregate(q, p)).collect(),
            updated_at: Utc::now(),
        }
    }

    pub fn best_back(&self) -> Option<Decimal> {
        self.back.keys().next_back().copied()
    }

    pub fn best_lay(&self) -> Option<Decimal> {
        self.lay.keys().next().copied()
    }

    pub fn contains(&self, order_id: Uuid) -> bool {
        self.order_index.contains_key(&order_id)
    }

    pub fn order_count(&self) -> usize {
        self.order_index.len()
    }

    pub fn total_size_remaining(&self, side: OrderSide) -> Decimal {
        let levels = match side {
            OrderSide::Back => &self.back,
            OrderSide::Lay => &self.lay,
        };
        levels
            .values()
            .flat_map(|q| q.iter())
            .map(|o| o.size_remaining)
            .sum()
    }

    /// Plan and immediately apply, mutating the incoming order in place.
    /// For in-memory flows; the transactional path plans first, persists,
    /// then applies.
    pub fn place(&mut self, order: &mut Order) -> PlacementPlan {
        let plan = self.plan(order);

        order.size_matched = plan.taker_size_matched;
        order.size_remaining = plan.taker_size_remaining;
        order.status = plan.taker_status;
        if plan.has_fills() {
            order.matched_at = Some(Utc::now());
        }

        self.apply(order, &plan);
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn new_order(side: OrderSide, price: Decimal, size: Decimal) -> Order {
        Order {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            market_id: "match-winner".to_string(),
            selection_id: "team-a".to_string(),
            side,
            price,
            size,
            size_matched: Decimal::ZERO,
            size_remaining: size,
            status: OrderStatus::Pending,
            reservation_id: None,
            saga_id: None,
            idempotency_key: Uuid::new_v4().to_string(),
            placed_at: Utc::now(),
            matched_at: None,
            cancelled_at: None,
            version: 1,
        }
    }

    fn book() -> BookState {
        BookState::new("match-winner", "team-a")
    }

    #[test]
    fn test_place_back_on_empty_book_rests() {
        let mut state = book();
        let mut order = new_order(OrderSide::Back, dec!(2.5), dec!(10));

        let plan = state.place(&mut order);

        assert!(plan.fills.is_empty());
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.size_remaining, dec!(10));
        assert_eq!(state.best_back(), Some(dec!(2.5)));
        assert_eq!(state.order_count(), 1);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.back_levels.len(), 1);
        assert_eq!(snapshot.back_levels[0].order_count, 1);
        assert_eq!(snapshot.back_levels[0].total_size, dec!(10));
        assert!(snapshot.lay_levels.is_empty());
    }

    #[test]
    fn test_lay_walks_backs_best_price_first_and_rests_residual() {
        // Resting BACK 5@3.0 and 5@2.8; incoming LAY 8@2.9 takes the 3.0
        // level in full, cannot reach 2.8, rests 3@2.9.
        let mut state = book();
        let mut back_high = new_order(OrderSide::Back, dec!(3.0), dec!(5));
        let mut back_low = new_order(OrderSide::Back, dec!(2.8), dec!(5));
        state.place(&mut back_high);
        state.place(&mut back_low);

        let mut lay = new_order(OrderSide::Lay, dec!(2.9), dec!(8));
        let plan = state.place(&mut lay);

        assert_eq!(plan.fills.len(), 1);
        let m = &plan.fills[0].match_record;
        assert_eq!(m.price, dec!(3.0));
        assert_eq!(m.size, dec!(5));
        assert_eq!(m.back_liability, dec!(5));
        assert_eq!(m.lay_liability, dec!(10.0));
        assert_eq!(m.back_order_id, back_high.id);
        assert_eq!(m.lay_order_id, lay.id);

        assert_eq!(lay.status, OrderStatus::Partially);
        assert_eq!(lay.size_matched, dec!(5));
        assert_eq!(lay.size_remaining, dec!(3));

        assert_eq!(state.best_back(), Some(dec!(2.8)));
        assert_eq!(state.best_lay(), Some(dec!(2.9)));
        assert!(!state.contains(back_high.id));
        assert!(state.contains(back_low.id));
        // Book no longer crosses: best back < best lay
        assert!(state.best_back().unwrap() < state.best_lay().unwrap());
    }

    #[test]
    fn test_fifo_within_level() {
        // Two resting lays at the same price; an incoming back consumes the
        // earlier in full and the later partially.
        let mut state = book();
        let mut lay_first = new_order(OrderSide::Lay, dec!(2.0), dec!(10));
        let mut lay_second = new_order(OrderSide::Lay, dec!(2.0), dec!(10));
        state.place(&mut lay_first);
        state.place(&mut lay_second);

        let mut back = new_order(OrderSide::Back, dec!(2.0), dec!(15));
        let plan = state.place(&mut back);

        assert_eq!(plan.fills.len(), 2);
        assert_eq!(plan.fills[0].maker.order_id, lay_first.id);
        assert_eq!(plan.fills[0].match_record.size, dec!(10));
        assert_eq!(plan.fills[0].maker.status, OrderStatus::Matched);
        assert_eq!(plan.fills[1].maker.order_id, lay_second.id);
        assert_eq!(plan.fills[1].match_record.size, dec!(5));
        assert_eq!(plan.fills[1].maker.status, OrderStatus::Partially);
        assert_eq!(plan.fills[1].maker.size_remaining, dec!(5));

        assert_eq!(back.status, OrderStatus::Matched);
        assert_eq!(back.size_remaining, Decimal::ZERO);
        assert!(!state.contains(lay_first.id));
        assert!(state.contains(lay_second.id));
        assert_eq!(state.total_size_remaining(OrderSide::Lay), dec!(5));
    }

    #[test]
    fn test_equal_price_is_eligible() {
        let mut state = book();
        let mut lay = new_order(OrderSide::Lay, dec!(2.5), dec!(10));
        state.place(&mut lay);

        let mut back = new_order(OrderSide::Back, dec!(2.5), dec!(10));
        let plan = state.place(&mut back);

        assert_eq!(plan.fills.len(), 1);
        assert_eq!(back.status, OrderStatus::Matched);
        assert_eq!(state.order_count(), 0);
    }

    #[test]
    fn test_exact_fill_matches_both_sides_in_one_step() {
        let mut state = book();
        let mut back = new_order(OrderSide::Back, dec!(3.0), dec!(7));
        state.place(&mut back);

        let mut lay = new_order(OrderSide::Lay, dec!(3.0), dec!(7));
        let plan = state.place(&mut lay);

        assert_eq!(plan.fills.len(), 1);
        assert_eq!(plan.fills[0].maker.status, OrderStatus::Matched);
        assert_eq!(lay.status, OrderStatus::Matched);
        assert_eq!(state.order_count(), 0);
        assert!(state.best_back().is_none());
        assert!(state.best_lay().is_none());
    }

    #[test]
    fn test_match_price_is_resting_orders_price() {
        // Incoming back at 3.0 against a resting lay at 2.0 trades at 2.0.
        let mut state = book();
        let mut lay = new_order(OrderSide::Lay, dec!(2.0), dec!(10));
        state.place(&mut lay);

        let mut back = new_order(OrderSide::Back, dec!(3.0), dec!(10));
        let plan = state.place(&mut back);

        assert_eq!(plan.fills[0].match_record.price, dec!(2.0));
        assert_eq!(plan.fills[0].match_record.lay_liability, dec!(10.0));
    }

    #[test]
    fn test_walk_halts_at_first_ineligible_level() {
        // Lays at 2.0 and 3.0; a back at 2.5 takes 2.0 but not 3.0.
        let mut state = book();
        let mut lay_cheap = new_order(OrderSide::Lay, dec!(2.0), dec!(5));
        let mut lay_dear = new_order(OrderSide::Lay, dec!(3.0), dec!(5));
        state.place(&mut lay_cheap);
        state.place(&mut lay_dear);

        let mut back = new_order(OrderSide::Back, dec!(2.5), dec!(10));
        let plan = state.place(&mut back);

        assert_eq!(plan.fills.len(), 1);
        assert_eq!(plan.fills[0].match_record.price, dec!(2.0));
        assert_eq!(back.status, OrderStatus::Partially);
        assert_eq!(back.size_remaining, dec!(5));
        assert!(state.contains(lay_dear.id));
    }

    #[test]
    fn test_plan_does_not_mutate_book() {
        let mut state = book();
        let mut lay = new_order(OrderSide::Lay, dec!(2.0), dec!(10));
        state.place(&mut lay);

        let back = new_order(OrderSide::Back, dec!(2.0), dec!(10));
        let plan = state.plan(&back);

        assert_eq!(plan.fills.len(), 1);
        // The book is untouched until apply
        assert!(state.contains(lay.id));
        assert_eq!(state.total_size_remaining(OrderSide::Lay), dec!(10));

        let plan_again = state.plan(&back);
        assert_eq!(plan_again.fills.len(), 1);
        assert_eq!(plan_again.fills[0].match_record.size, dec!(10));
    }

    #[test]
    fn test_cancel_removes_order_and_erases_empty_level() {
        let mut state = book();
        let mut order = new_order(OrderSide::Back, dec!(2.5), dec!(10));
        state.place(&mut order);

        let removed = state.cancel(order.id).expect("order should be in book");
        assert_eq!(removed.id, order.id);
        assert_eq!(state.order_count(), 0);
        assert!(state.best_back().is_none());

        // Second cancel is a distinct not-found outcome
        assert!(state.cancel(order.id).is_none());
    }

    #[test]
    fn test_cancel_leaves_other_orders_at_level() {
        let mut state = book();
        let mut first = new_order(OrderSide::Lay, dec!(2.0), dec!(10));
        let mut second = new_order(OrderSide::Lay, dec!(2.0), dec!(4));
        state.place(&mut first);
        state.place(&mut second);

        state.cancel(first.id).unwrap();

        assert!(state.contains(second.id));
        assert_eq!(state.best_lay(), Some(dec!(2.0)));
        assert_eq!(state.total_size_remaining(OrderSide::Lay), dec!(4));
    }

    #[test]
    fn test_matched_sizes_balance_across_sides() {
        let mut state = book();
        let mut lay_a = new_order(OrderSide::Lay, dec!(2.0), dec!(6));
        let mut lay_b = new_order(OrderSide::Lay, dec!(2.2), dec!(6));
        state.place(&mut lay_a);
        state.place(&mut lay_b);

        let mut back = new_order(OrderSide::Back, dec!(2.2), dec!(9));
        let plan = state.place(&mut back);

        let maker_matched: Decimal = plan.fills.iter().map(|f| f.match_record.size).sum();
        assert_eq!(maker_matched, back.size_matched);
        assert_eq!(back.size_matched + back.size_remaining, back.size);
        for fill in &plan.fills {
            assert_eq!(
                fill.maker.size_matched + fill.maker.size_remaining,
                dec!(6)
            );
            assert_eq!(fill.match_record.back_liability, fill.match_record.size);
            assert_eq!(
                fill.match_record.lay_liability,
                fill.match_record.size * (fill.match_record.price - Decimal::ONE)
            );
        }
    }

    #[test]
    fn test_maker_version_tracks_updates() {
        let mut state = book();
        let mut lay = new_order(OrderSide::Lay, dec!(2.0), dec!(10));
        state.place(&mut lay);

        // First partial fill: plan sees version 1
        let mut back1 = new_order(OrderSide::Back, dec!(2.0), dec!(4));
        let plan1 = state.place(&mut back1);
        assert_eq!(plan1.fills[0].maker.version, 1);

        // Second fill: the book's copy was bumped to match the row
        let mut back2 = new_order(OrderSide::Back, dec!(2.0), dec!(4));
        let plan2 = state.place(&mut back2);
        assert_eq!(plan2.fills[0].maker.version, 2);
        assert_eq!(plan2.fills[0].maker.size_matched, dec!(8));
    }
}
