//! Various functions and types that are not limited to a particular module, but are too small to
//! warrant being factored out into standalone crates.

use std::{
    fmt::{self, Display, Formatter},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Returns the base-2 logarithm of `x`, rounded down,
/// i.e. the greatest `i` such that `2.pow(i) <= x`.
pub(crate) fn log2(x: u64) -> u32 {
    // The least power of two that is strictly greater than x.
    let next_pow2 = (x + 1).next_power_of_two();
    // It's twice as big as the greatest power of two that is less or equal than x.
    let prev_pow2 = next_pow2 >> 1;
    // The number of trailing zeros is its base-2 logarithm.
    prev_pow2.trailing_zeros()
}

/// Returns the weighted median of the values, i.e. the greatest `value` such that the total
/// weight of entries greater or equal to `value` exceeds half the total weight.
///
/// Returns `None` if the iterator is empty.
pub fn weighted_median<T, W, I>(items: I) -> Option<T>
where
    T: Ord + Copy,
    W: Into<u128> + Copy,
    I: IntoIterator<Item = (T, W)>,
{
    let mut entries: Vec<(T, W)> = items.into_iter().collect();
    if entries.is_empty() {
        return None;
    }
    entries.sort_by_key(|(value, _)| *value);
    let total: u128 = entries.iter().map(|(_, w)| (*w).into()).sum();
    let mut remaining = total;
    for (value, weight) in entries {
        remaining = remaining.saturating_sub(weight.into());
        if remaining * 2 < total {
            return Some(value);
        }
    }
    None
}

/// A cooperative cancellation token.
///
/// Long-running operations (initial sync, DAG traversals that call into storage) check
/// `is_cancelled` between steps and return early when it is set. Cloning is cheap; all clones
/// observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Creates a new, untriggered token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A display-helper that shows iterators display joined by ",".
#[derive(Debug)]
pub(crate) struct DisplayIter<T>(std::cell::RefCell<Option<T>>);

impl<T> DisplayIter<T> {
    pub(crate) fn new(item: T) -> Self {
        DisplayIter(std::cell::RefCell::new(Some(item)))
    }
}

impl<I, T> Display for DisplayIter<I>
where
    I: IntoIterator<Item = T>,
    T: Display,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(src) = self.0.borrow_mut().take() {
            let mut first = true;
            for item in src.into_iter().take(f.width().unwrap_or(usize::MAX)) {
                if first {
                    first = false;
                    write!(f, "{}", item)?;
                } else {
                    write!(f, ", {}", item)?;
                }
            }

            Ok(())
        } else {
            write!(f, "DisplayIter:GONE")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log2() {
        assert_eq!(2, log2(0b100));
        assert_eq!(2, log2(0b101));
        assert_eq!(2, log2(0b111));
        assert_eq!(3, log2(0b1000));
    }

    #[test]
    fn test_weighted_median() {
        assert_eq!(None, weighted_median(Vec::<(u8, u64)>::new()));
        assert_eq!(Some(1), weighted_median(vec![(1u8, 1u64)]));
        // 5 has more than half of the total weight of 9 behind or at it.
        assert_eq!(Some(5), weighted_median(vec![(1u8, 4u64), (5, 3), (9, 2)]));
        // With the weights flipped, the median moves down.
        assert_eq!(Some(1), weighted_median(vec![(1u8, 5u64), (5, 2), (9, 2)]));
    }

    #[test]
    fn cancellation_token() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
