//! Data models for traders, clients, and positions.

mod client;
mod position;
mod trader;

pub use client::{Credentials, SubscriptionSpec};
pub use position::{round_to_lot, Position, PositionSet};
pub use trader::TraderProfile;
