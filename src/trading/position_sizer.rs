//! Target sizing: scale trader positions by subscription ratios and round to
//! the venue lot.

use rust_decimal::Decimal;

use crate::models::round_to_lot;

/// Calculator for client target sizes and corrective order quantities.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    default_lot: Decimal,
}

impl PositionSizer {
    pub fn new(default_lot: Decimal) -> Self {
        Self { default_lot }
    }

    /// Venue lot when known, the configured default otherwise.
    pub fn lot_for(&self, venue_lot: Option<Decimal>) -> Decimal {
        venue_lot
            .filter(|l| *l > Decimal::ZERO)
            .unwrap_or(self.default_lot)
    }

    /// Aggregate target for one symbol.
    ///
    /// `contributions` yields `(trader_size, ratio)` for every subscription of
    /// the client; the ratio-weighted sum is rounded once to `lot`.
    pub fn aggregate_target<I>(&self, contributions: I, lot: Decimal) -> Decimal
    where
        I: IntoIterator<Item = (Decimal, Decimal)>,
    {
        let raw: Decimal = contributions
            .into_iter()
            .map(|(size, ratio)| size * ratio)
            .sum();
        round_to_lot(raw, lot)
    }

    /// Signed quantity that moves `live` to `target`, or `None` when the gap
    /// is below one tradable lot.
    pub fn correction(&self, target: Decimal, live: Decimal, lot: Decimal) -> Option<Decimal> {
        let delta = round_to_lot(target - live, lot);
        if delta.is_zero() || delta.abs() < lot {
            None
        } else {
            Some(delta)
        }
    }
}

impl Default for PositionSizer {
    fn default() -> Self {
        Self::new(Decimal::new(1, 3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_single_trader_target_is_scaled_and_rounded() {
        let sizer = PositionSizer::default();
        let lot = dec!(0.001);

        for (size, ratio, expected) in [
            (dec!(1.0), dec!(0.5), dec!(0.5)),
            (dec!(0.4), dec!(0.5), dec!(0.2)),
            (dec!(-3.3333), dec!(0.3), dec!(-1.0)),
            (dec!(0.0015), dec!(1), dec!(0.002)),
            (dec!(2), dec!(0.0001), dec!(0)),
        ] {
            let target = sizer.aggregate_target([(size, ratio)], lot);
            assert_eq!(target, round_to_lot(size * ratio, lot));
            assert_eq!(target, expected, "size {} ratio {}", size, ratio);
        }
    }

    #[test]
    fn test_two_traders_sum_to_weighted_total() {
        let sizer = PositionSizer::default();
        let target = sizer.aggregate_target(
            [(dec!(1.0), dec!(0.5)), (dec!(-0.4), dec!(2))],
            dec!(0.001),
        );
        // 0.5 - 0.8
        assert_eq!(target, dec!(-0.3));
    }

    #[test]
    fn test_correction_respects_min_step() {
        let sizer = PositionSizer::default();
        let lot = dec!(0.001);

        assert_eq!(sizer.correction(dec!(0.2), dec!(0.5), lot), Some(dec!(-0.3)));
        assert_eq!(sizer.correction(dec!(0.5), dec!(0.5), lot), None);
        // Off-lot live position left by a manual trade: gap under one lot.
        assert_eq!(sizer.correction(dec!(0.5), dec!(0.5004), lot), None);
        assert_eq!(sizer.correction(Decimal::ZERO, dec!(3), lot), Some(dec!(-3)));
    }

    #[test]
    fn test_lot_fallback() {
        let sizer = PositionSizer::new(dec!(0.01));
        assert_eq!(sizer.lot_for(Some(dec!(0.1))), dec!(0.1));
        assert_eq!(sizer.lot_for(Some(Decimal::ZERO)), dec!(0.01));
        assert_eq!(sizer.lot_for(None), dec!(0.01));
    }
}
