//! Trading strategies.

pub mod grid;

pub use grid::{FollowUpAction, GridLevel, GridOrder, GridStrategy, InitialOrders};
