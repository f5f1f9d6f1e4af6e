//! Fractional keys for the derived layer order.
//!
//! Each shape carries an order-key register; the layer order is all
//! live shapes sorted by (key, shape id). Reordering writes new keys
//! only for shapes that are out of place, so two concurrent reorders
//! merge per shape instead of one list clobbering the other.

/// A key strictly between `lo` and `hi` (either side open-ended).
///
/// Returns `None` when f64 midpoints are exhausted between two
/// adjacent keys; the caller falls back to reassigning the whole list.
pub fn key_between(lo: Option<f64>, hi: Option<f64>) -> Option<f64> {
    match (lo, hi) {
        (None, None) => Some(1.0),
        (Some(a), None) => Some(a + 1.0),
        (None, Some(b)) => Some(b - 1.0),
        (Some(a), Some(b)) => {
            if !(a < b) {
                return None;
            }
            let mid = a + (b - a) / 2.0;
            if mid > a && mid < b {
                Some(mid)
            } else {
                None
            }
        }
    }
}

/// Evenly spaced keys for a full reassignment of `n` shapes.
pub fn spread_keys(n: usize) -> Vec<f64> {
    (1..=n).map(|i| i as f64).collect()
}
