//! Caller-side 32-bit view over the raw 64-bit counter.
//!
//! The shared counter itself never wraps; consumers that need a bounded
//! identifier space fold the raw value modularly instead. The fold maps
//! into `0..i32::MAX`, so the value after `i32::MAX - 1` is `0`.

use std::sync::Arc;

use super::error::CoordinationError;
use super::SharedCounter;

const FOLD_MODULUS: i64 = i32::MAX as i64;

/// Folds a raw counter value into the non-negative 32-bit range.
pub fn fold32(raw: i64) -> i32 {
    raw.rem_euclid(FOLD_MODULUS) as i32
}

/// 32-bit folding wrapper around a [`SharedCounter`].
pub struct Counter32 {
    inner: Arc<dyn SharedCounter>,
}

impl Counter32 {
    pub fn new(inner: Arc<dyn SharedCounter>) -> Self {
        Self { inner }
    }

    /// Returns the next identifier, folded into `0..i32::MAX`.
    pub async fn next(&self) -> Result<i32, CoordinationError> {
        Ok(fold32(self.inner.get_and_increment().await?))
    }
}
