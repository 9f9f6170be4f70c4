//! Precision-safe decimal types for trading.
//!
//! Uses `rust_decimal` for exact arithmetic. Lighter transmits prices and
//! amounts as integers scaled by a per-market number of decimals, so both
//! types convert to and from that wire form without going through floats.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Sub};
use std::str::FromStr;

use crate::error::{CoreError, Result};

fn scale_factor(decimals: u32) -> Decimal {
    Decimal::from(10u64.pow(decimals))
}

/// Scale `value` into an integer with `decimals` implied places.
///
/// Fails when the value carries more precision than the wire allows or
/// does not fit in an i64.
fn to_wire(value: Decimal, decimals: u32) -> Result<i64> {
    let scaled = value * scale_factor(decimals);
    if !scaled.fract().is_zero() {
        return Err(CoreError::WirePrecision {
            value: value.to_string(),
            decimals,
        });
    }
    scaled.to_i64().ok_or_else(|| CoreError::WirePrecision {
        value: value.to_string(),
        decimals,
    })
}

fn from_wire(raw: i64, decimals: u32) -> Decimal {
    Decimal::from_i128_with_scale(i128::from(raw), decimals).normalize()
}

/// Price with exact decimal precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Price(pub Decimal);

impl Price {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Round down to the tick grid.
    #[inline]
    pub fn floor_to_tick(&self, tick_size: Price) -> Self {
        if tick_size.is_zero() {
            return *self;
        }
        Self((self.0 / tick_size.0).floor() * tick_size.0)
    }

    /// Round up to the tick grid.
    #[inline]
    pub fn ceil_to_tick(&self, tick_size: Price) -> Self {
        if tick_size.is_zero() {
            return *self;
        }
        Self((self.0 / tick_size.0).ceil() * tick_size.0)
    }

    pub fn to_wire(&self, decimals: u32) -> Result<i64> {
        to_wire(self.0, decimals)
    }

    pub fn from_wire(raw: i64, decimals: u32) -> Self {
        Self(from_wire(raw, decimals))
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Price {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Price {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

impl Add for Price {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Price {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Mul<Decimal> for Price {
    type Output = Self;

    fn mul(self, rhs: Decimal) -> Self::Output {
        Self(self.0 * rhs)
    }
}

/// Size/quantity with exact decimal precision. Defaults to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Size(pub Decimal);

impl Size {
    pub const ZERO: Self = Self(Decimal::ZERO);

    #[inline]
    pub fn new(value: Decimal) -> Self {
        Self(value)
    }

    #[inline]
    pub fn inner(&self) -> Decimal {
        self.0
    }

    #[inline]
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Round down to the step size.
    #[inline]
    pub fn floor_to_step(&self, step_size: Size) -> Self {
        if step_size.is_zero() {
            return *self;
        }
        Self((self.0 / step_size.0).floor() * step_size.0)
    }

    /// Notional value: size * price.
    #[inline]
    pub fn notional(&self, price: Price) -> Decimal {
        self.0 * price.0
    }

    pub fn to_wire(&self, decimals: u32) -> Result<i64> {
        to_wire(self.0, decimals)
    }

    pub fn from_wire(raw: i64, decimals: u32) -> Self {
        Self(from_wire(raw, decimals))
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Size {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl From<Decimal> for Size {
    fn from(d: Decimal) -> Self {
        Self(d)
    }
}

impl Add for Size {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Size {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_price_tick_rounding() {
        let price = Price::new(dec!(12345.6789));
        let tick = Price::new(dec!(0.01));

        assert_eq!(price.floor_to_tick(tick).0, dec!(12345.67));
        assert_eq!(price.ceil_to_tick(tick).0, dec!(12345.68));
    }

    #[test]
    fn test_size_floor_to_step() {
        let size = Size::new(dec!(1.2345));
        let step = Size::new(dec!(0.001));

        assert_eq!(size.floor_to_step(step).0, dec!(1.234));
    }

    #[test]
    fn test_size_default_is_zero() {
        assert_eq!(Size::default(), Size::ZERO);
        assert!(Size::default().is_zero());
    }

    #[test]
    fn test_wire_scaling() {
        assert_eq!(Price::new(dec!(3012.45)).to_wire(2).unwrap(), 301_245);
        assert_eq!(Size::new(dec!(0.5)).to_wire(4).unwrap(), 5_000);
        assert_eq!(Price::from_wire(301_245, 2), Price::new(dec!(3012.45)));
        assert_eq!(Size::from_wire(5_000, 4), Size::new(dec!(0.5)));
    }

    #[test]
    fn test_wire_scaling_rejects_excess_precision() {
        let err = Price::new(dec!(1.005)).to_wire(2).unwrap_err();
        assert!(matches!(err, CoreError::WirePrecision { decimals: 2, .. }));
    }

    #[test]
    fn test_serde_transparent() {
        let price: Price = serde_json::from_str("\"101.5\"").unwrap();
        assert_eq!(price.0, dec!(101.5));
    }
}
