use std::{
    fmt::{self, Display},
    iter::Sum,
    ops::{Add, AddAssign, Div, Mul, Sub},
};

use datasize::DataSize;
use serde::{Deserialize, Serialize};

/// A vote weight.
#[derive(
    Copy, Clone, DataSize, Debug, Default, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize,
    Deserialize,
)]
pub struct Weight(pub u64);

impl Weight {
    /// Returns the sum, or `None` if it would overflow.
    pub fn checked_add(self, rhs: Weight) -> Option<Weight> {
        self.0.checked_add(rhs.0).map(Weight)
    }

    /// Returns `true` if this is the zero weight.
    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Display for Weight {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Weight {
    type Output = Weight;

    fn add(self, rhs: Weight) -> Weight {
        Weight(self.0 + rhs.0)
    }
}

impl AddAssign for Weight {
    fn add_assign(&mut self, rhs: Weight) {
        self.0 += rhs.0;
    }
}

impl Sub for Weight {
    type Output = Weight;

    fn sub(self, rhs: Weight) -> Weight {
        Weight(self.0 - rhs.0)
    }
}

impl Mul<u64> for Weight {
    type Output = Weight;

    fn mul(self, rhs: u64) -> Weight {
        Weight(self.0 * rhs)
    }
}

impl Div<u64> for Weight {
    type Output = Weight;

    fn div(self, rhs: u64) -> Weight {
        Weight(self.0 / rhs)
    }
}

impl Sum for Weight {
    fn sum<I: Iterator<Item = Weight>>(iter: I) -> Weight {
        iter.fold(Weight(0), Add::add)
    }
}

impl From<Weight> for u64 {
    fn from(weight: Weight) -> u64 {
        weight.0
    }
}

impl From<Weight> for u128 {
    fn from(weight: Weight) -> u128 {
        u128::from(weight.0)
    }
}

impl From<u64> for Weight {
    fn from(w: u64) -> Weight {
        Weight(w)
    }
}
