//! Exchange gateways: the shared trait, the Binance futures session and the
//! paper venue used for dry runs.

mod binance;
mod gateway;
mod paper;
mod rate_limit;
#[cfg(test)]
pub(crate) mod scripted;
mod types;

pub use binance::{BinanceGateway, FUTURES_BASE_URL};
pub use gateway::{new_client_order_id, Account, ExchangeError, ExchangeGateway, OrderAck};
pub use paper::PaperExchange;
