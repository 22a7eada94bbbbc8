//! API request/response types for the Binance futures and leaderboard endpoints.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Response from /fapi/v1/exchangeInfo.
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeInfoResponse {
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolFilter {
    pub filter_type: String,
    #[serde(default)]
    pub step_size: Option<Decimal>,
}

impl SymbolInfo {
    /// Quantity step from the LOT_SIZE filter.
    pub fn lot_size(&self) -> Option<Decimal> {
        self.filters
            .iter()
            .find(|f| f.filter_type == "LOT_SIZE")
            .and_then(|f| f.step_size)
            .filter(|s| *s > Decimal::ZERO)
    }
}

/// Body of the leaderboard getOtherPosition request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardPositionRequest<'a> {
    pub encrypted_uid: &'a str,
    pub trade_type: &'a str,
}

/// Envelope of the leaderboard getOtherPosition response.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaderboardPositionResponse {
    #[serde(default)]
    pub data: Option<LeaderboardPositionData>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardPositionData {
    #[serde(default)]
    pub other_position_ret_list: Option<Vec<LeaderboardPosition>>,
}

/// One open position of a leaderboard trader.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardPosition {
    pub symbol: String,
    /// Signed amount (negative for shorts)
    pub amount: Decimal,
}

/// Row of /fapi/v2/positionRisk.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRiskResponse {
    pub symbol: String,
    pub position_amt: Decimal,
}

/// Response from POST /fapi/v1/order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderResponse {
    pub order_id: i64,
    pub symbol: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub client_order_id: String,
    #[serde(default)]
    pub orig_qty: Decimal,
}

/// Error body returned by Binance on 4xx.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    pub code: i64,
    pub msg: String,
}
