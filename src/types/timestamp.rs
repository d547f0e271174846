use std::{
    fmt::{self, Display},
    num::ParseIntError,
    ops::{Add, AddAssign, Div, Mul, Rem, Shl, Shr, Sub},
    str::FromStr,
    time::{Duration, SystemTime},
};

use datasize::DataSize;
use derive_more::{Add, AddAssign, From, Sub, SubAssign, Sum};
use serde::{Deserialize, Serialize};

/// A timestamp type, representing a concrete moment in time.
#[derive(
    DataSize, Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
    Hash, From,
)]
pub struct Timestamp(u64);

/// A time difference between two timestamps.
#[derive(
    DataSize, Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Add, AddAssign,
    Sub, SubAssign, Sum, From, Serialize, Deserialize,
)]
pub struct TimeDiff(u64);

impl Timestamp {
    /// Returns the timestamp of the current moment.
    pub fn now() -> Self {
        let millis = SystemTime::UNIX_EPOCH.elapsed().unwrap().as_millis() as u64;
        Timestamp(millis)
    }

    /// Returns a zero timestamp.
    pub fn zero() -> Self {
        Timestamp(0)
    }

    /// Returns the timestamp as the number of milliseconds since the Unix epoch.
    pub fn millis(&self) -> u64 {
        self.0
    }

    /// Returns the difference between `self` and `other`, or `0` if `self` is earlier than
    /// `other`.
    pub fn saturating_sub(self, other: Timestamp) -> TimeDiff {
        TimeDiff(self.0.saturating_sub(other.0))
    }

    /// Returns the sum, or `None` if it would overflow.
    pub fn checked_add(self, diff: TimeDiff) -> Option<Timestamp> {
        self.0.checked_add(diff.0).map(Timestamp)
    }
}

impl TimeDiff {
    /// Returns the time difference as the number of milliseconds.
    pub fn millis(&self) -> u64 {
        self.0
    }

    /// Creates a time difference from a number of seconds.
    pub fn from_seconds(seconds: u32) -> Self {
        TimeDiff(u64::from(seconds) * 1_000)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for TimeDiff {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

impl FromStr for Timestamp {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str(s).map(Timestamp)
    }
}

impl Sub<Timestamp> for Timestamp {
    type Output = TimeDiff;

    fn sub(self, other: Timestamp) -> TimeDiff {
        TimeDiff(self.0 - other.0)
    }
}

impl Add<TimeDiff> for Timestamp {
    type Output = Timestamp;

    fn add(self, diff: TimeDiff) -> Timestamp {
        Timestamp(self.0 + diff.0)
    }
}

impl AddAssign<TimeDiff> for Timestamp {
    fn add_assign(&mut self, diff: TimeDiff) {
        self.0 += diff.0;
    }
}

impl Sub<TimeDiff> for Timestamp {
    type Output = Timestamp;

    fn sub(self, diff: TimeDiff) -> Timestamp {
        Timestamp(self.0 - diff.0)
    }
}

impl Div<TimeDiff> for Timestamp {
    type Output = u64;

    fn div(self, rhs: TimeDiff) -> u64 {
        self.0 / rhs.0
    }
}

impl Rem<TimeDiff> for Timestamp {
    type Output = TimeDiff;

    fn rem(self, diff: TimeDiff) -> TimeDiff {
        TimeDiff(self.0 % diff.0)
    }
}

impl Shl<u8> for Timestamp {
    type Output = Timestamp;

    fn shl(self, rhs: u8) -> Timestamp {
        Timestamp(self.0 << rhs)
    }
}

impl Shr<u8> for Timestamp {
    type Output = Timestamp;

    fn shr(self, rhs: u8) -> Timestamp {
        Timestamp(self.0 >> rhs)
    }
}

impl Mul<u64> for TimeDiff {
    type Output = TimeDiff;

    fn mul(self, rhs: u64) -> TimeDiff {
        TimeDiff(self.0 * rhs)
    }
}

impl Div<u64> for TimeDiff {
    type Output = TimeDiff;

    fn div(self, rhs: u64) -> TimeDiff {
        TimeDiff(self.0 / rhs)
    }
}

impl From<TimeDiff> for Duration {
    fn from(diff: TimeDiff) -> Duration {
        Duration::from_millis(diff.0)
    }
}
