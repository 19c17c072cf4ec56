//! Price-time priority matching for betting-exchange order books

pub mod book;
pub mod engine;
pub mod types;

pub use book::BookState;
pub use engine::{Book, MatchingEngine};
pub use types::{BookOrder, BookSnapshot, Fill, LevelSnapshot, MakerUpdate, PlacementPlan};
