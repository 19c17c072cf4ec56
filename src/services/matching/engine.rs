//! Matching engine
//!
//! Registry of per-(market, selection) order books. Books are created on
//! demand and rebuilt from the durable order log on startup; each book is
//! guarded by its own async lock so placements and cancels for one selection
//! are fully serialized while other selections proceed in parallel.

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::OrderSide;
use crate::repository::OrderRepository;

use super::book::BookState;
use super::types::{BookOrder, BookSnapshot};

/// A book guarded by its exclusive placement/cancel lock
pub type Book = RwLock<BookState>;

pub struct MatchingEngine {
    /// book key ("market_id:selection_id") -> book
    books: DashMap<String, Arc<Book>>,
}

impl MatchingEngine {
    pub fn new() -> Self {
        Self {
            books: DashMap::new(),
        }
    }

    fn book_key(market_id: &str, selection_id: &str) -> String {
        format!("{}:{}", market_id, selection_id)
    }

    /// Get or create the book for a (market, selection)
    pub fn book(&self, market_id: &str, selection_id: &str) -> Arc<Book> {
        self.books
            .entry(Self::book_key(market_id, selection_id))
            .or_insert_with(|| Arc::new(RwLock::new(BookState::new(market_id, selection_id))))
            .clone()
    }

    /// Get the book only if it already exists
    pub fn get_book(&self, market_id: &str, selection_id: &str) -> Option<Arc<Book>> {
        self.books
            .get(&Self::book_key(market_id, selection_id))
            .map(|b| Arc::clone(b.value()))
    }

    /// Aggregated ladders for one book; None when no book exists yet
    pub async fn snapshot(&self, market_id: &str, selection_id: &str) -> Option<BookSnapshot> {
        let book = self.get_book(market_id, selection_id)?;
        let state = book.read().await;
        Some(state.snapshot())
    }

    /// Rebuild every book from the pending orders in the store.
    ///
    /// Orders arrive in placed_at order (id tiebreak) so time priority is
    /// preserved. Returns the number of orders restored.
    pub async fn recover(&self, orders: &OrderRepository) -> anyhow::Result<usize> {
        info!("starting order book recovery");

        let active = orders.get_active_books().await?;
        let mut markets: Vec<String> = active.iter().map(|(m, _)| m.clone()).collect();
        markets.sort();
        markets.dedup();

        let mut recovered = 0usize;

        for market_id in &markets {
            let pending = orders.get_pending_orders(market_id).await?;

            for order in &pending {
                if order.size_remaining <= Decimal::ZERO {
                    warn!(order_id = %order.id, "pending order has no remaining size, skipping");
                    continue;
                }

                let book = self.book(&order.market_id, &order.selection_id);
                let mut state = book.write().await;
                state.insert_resting(BookOrder::from(order));
                recovered += 1;
            }
        }

        info!(
            recovered,
            books = self.books.len(),
            "order book recovery complete"
        );

        Ok(recovered)
    }

    /// Engine-wide statistics
    pub async fn stats(&self) -> EngineStats {
        let mut total_orders = 0usize;
        let mut total_back_size = Decimal::ZERO;
        let mut total_lay_size = Decimal::ZERO;

        for entry in self.books.iter() {
            let state = entry.value().read().await;
            total_orders += state.order_count();
            total_back_size += state.total_size_remaining(OrderSide::Back);
            total_lay_size += state.total_size_remaining(OrderSide::Lay);
        }

        EngineStats {
            books: self.books.len(),
            total_orders,
            total_back_size,
            total_lay_size,
        }
    }
}

impl Default for MatchingEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct EngineStats {
    pub books: usize,
    pub total_orders: usize,
    pub total_back_size: Decimal,
    pub total_lay_size: Decimal,
}
