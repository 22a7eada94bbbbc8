//! Copy engine: trader monitors, client mirrors, sizing and retry.

mod config;
mod mirror;
mod monitor;
mod position_sizer;
mod retry;

pub use config::EngineConfig;
pub use mirror::{ClientMirror, ClientStatus};
pub use monitor::TraderMonitor;
