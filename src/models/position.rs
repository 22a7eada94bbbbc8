//! Position model: signed holdings per symbol and snapshot diffing.

use std::collections::BTreeMap;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Net position in a perpetual contract. The sign of `size` encodes the side
/// (positive = long, negative = short).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Contract symbol (e.g., "BTCUSDT")
    pub symbol: String,

    /// Signed contract quantity
    pub size: Decimal,
}

impl Position {
    pub fn new(symbol: impl Into<String>, size: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            size,
        }
    }
}

/// Change of a single symbol between two snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolChange {
    pub symbol: String,
    pub new_size: Decimal,
}

/// Full position snapshot of one account, keyed by symbol.
///
/// Flat positions are never stored, so a missing symbol means size zero.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSet {
    positions: BTreeMap<String, Decimal>,
}

impl PositionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the size of a symbol, removing it when flat.
    pub fn set(&mut self, symbol: impl Into<String>, size: Decimal) {
        let symbol = symbol.into();
        if size.is_zero() {
            self.positions.remove(&symbol);
        } else {
            self.positions.insert(symbol, size.normalize());
        }
    }

    /// Add `delta` to the current size of a symbol.
    pub fn apply(&mut self, symbol: &str, delta: Decimal) {
        let next = self.size_of(symbol) + delta;
        self.set(symbol, next);
    }

    /// Size held in `symbol`, zero when absent.
    pub fn size_of(&self, symbol: &str) -> Decimal {
        self.positions.get(symbol).copied().unwrap_or(Decimal::ZERO)
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.positions.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Decimal)> {
        self.positions.iter().map(|(s, q)| (s.as_str(), *q))
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Symbols whose size differs between `self` (old) and `next`.
    ///
    /// Symbols present only in `self` are reported with `new_size == 0`.
    pub fn diff(&self, next: &PositionSet) -> Vec<SymbolChange> {
        let mut changes = Vec::new();

        for (symbol, size) in next.iter() {
            if self.size_of(symbol) != size {
                changes.push(SymbolChange {
                    symbol: symbol.to_string(),
                    new_size: size,
                });
            }
        }

        for symbol in self.symbols() {
            if !next.contains(symbol) {
                changes.push(SymbolChange {
                    symbol: symbol.to_string(),
                    new_size: Decimal::ZERO,
                });
            }
        }

        changes
    }
}

impl FromIterator<Position> for PositionSet {
    fn from_iter<I: IntoIterator<Item = Position>>(iter: I) -> Self {
        let mut set = PositionSet::new();
        for p in iter {
            // Hedge-mode accounts report one row per side; fold them into a net size.
            set.apply(&p.symbol, p.size);
        }
        set
    }
}

/// Round `size` to the nearest multiple of `lot`.
///
/// A non-positive lot leaves the size untouched.
pub fn round_to_lot(size: Decimal, lot: Decimal) -> Decimal {
    if lot <= Decimal::ZERO {
        return size;
    }
    let lots = (size / lot).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    (lots * lot).normalize()
}
