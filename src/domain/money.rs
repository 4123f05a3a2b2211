use core::ops::{Add, AddAssign, Neg, Sub, SubAssign};
use core::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Fixed-point amount in minor units (kopecks). Matches the NUMERIC(15, 2)
/// columns the bank stores balances in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(pub i64);

impl Money {
    pub const SCALE: i64 = 100; // 2 decimal places
    pub const TARGET_DECIMALS: u32 = 2;
    pub const ZERO: Money = Money(0);

    pub fn from_major(units: i64) -> Self {
        Self(units * Self::SCALE)
    }

    pub fn as_minor(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn checked_add(self, other: Money) -> Option<Money> {
        self.0.checked_add(other.0).map(Money)
    }

    pub fn checked_sub(self, other: Money) -> Option<Money> {
        self.0.checked_sub(other.0).map(Money)
    }

    pub fn from_scaled_i128(value: i128, scale: u32) -> Option<Self> {
        if scale == Self::TARGET_DECIMALS {
            return i64::try_from(value).ok().map(Self);
        }
        if scale < Self::TARGET_DECIMALS {
            let factor = 10i128.pow(Self::TARGET_DECIMALS - scale);
            let widened = value.checked_mul(factor)?;
            return i64::try_from(widened).ok().map(Self);
        }
        // scale > TARGET_DECIMALS: need rounding
        let factor = 10i128.checked_pow(scale - Self::TARGET_DECIMALS)?;
        let div = value / factor; // truncated toward zero
        let rem = value % factor;
        if rem == 0 {
            return i64::try_from(div).ok().map(Self);
        }
        let half = factor / 2;
        let abs_rem = rem.abs();
        let mut adjusted = div;
        if abs_rem > half || (abs_rem == half && div & 1 != 0) {
            // ties go to the even neighbour
            adjusted += if value.is_negative() { -1 } else { 1 };
        }
        i64::try_from(adjusted).ok().map(Self)
    }

    pub fn from_decimal(value: Decimal) -> Option<Self> {
        Self::from_scaled_i128(value.mantissa(), value.scale())
    }

    pub fn from_decimal_str(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        let value = Decimal::from_str(s).ok()?;
        Self::from_decimal(value)
    }
}

impl Add for Money {
    type Output = Money;

    fn add(self, rhs: Money) -> Money {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Money) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}

impl SubAssign for Money {
    fn sub_assign(&mut self, rhs: Money) {
        self.0 -= rhs.0;
    }
}

impl Neg for Money {
    type Output = Money;

    fn neg(self) -> Money {
        Money(-self.0)
    }
}

impl core::iter::Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money {
        iter.fold(Money::ZERO, Add::add)
    }
}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let minor = self.0;
        let abs = minor.unsigned_abs();
        let int_part = abs / Self::SCALE as u64;
        let frac_part = abs % Self::SCALE as u64;
        if minor < 0 {
            write!(f, "-{}.{:02}", int_part, frac_part)
        } else {
            write!(f, "{}.{:02}", int_part, frac_part)
        }
    }
}

impl FromStr for Money {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Money::from_decimal_str(s).ok_or_else(|| format!("Invalid Money format: {}", s))
    }
}

impl<'de> Deserialize<'de> for Money {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Money::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl Serialize for Money {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}
