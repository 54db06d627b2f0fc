//! Merging of two values that describe the same entity observed from different sources.

use std::fmt::Debug;

use crate::FailoverError;

/// Tie-breaking rules for [`reconcile`]. All rules are off by default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// When exactly one value is present: `None` or `Some(true)` keeps it, `Some(false)` yields
    /// no value.
    pub resolve_defined: Option<bool>,
    /// For two different booleans, the boolean to return.
    pub resolve_true_over_false: Option<bool>,
    /// For two different numbers, take the maximum (`Some(true)`) or the minimum (`Some(false)`).
    pub resolve_max: Option<bool>,
}

impl ReconcileOptions {
    /// Creates options with every rule off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets [`resolve_defined`](Self::resolve_defined).
    pub fn with_resolve_defined(mut self, resolve_defined: bool) -> Self {
        self.resolve_defined = Some(resolve_defined);
        self
    }

    /// Sets [`resolve_true_over_false`](Self::resolve_true_over_false).
    pub fn with_resolve_true_over_false(mut self, value: bool) -> Self {
        self.resolve_true_over_false = Some(value);
        self
    }

    /// Sets [`resolve_max`](Self::resolve_max).
    pub fn with_resolve_max(mut self, resolve_max: bool) -> Self {
        self.resolve_max = Some(resolve_max);
        self
    }
}

/// A value that [`reconcile`] knows how to merge.
///
/// Types only need to provide [`resolve`](Reconcilable::resolve) if some option can settle two
/// different values; otherwise different values are a conflict.
pub trait Reconcilable: PartialEq + Debug + Clone {
    /// Picks a value for two different inputs, or `None` if the options don't cover the case.
    fn resolve(_a: &Self, _b: &Self, _options: &ReconcileOptions) -> Option<Self> {
        None
    }
}

impl Reconcilable for bool {
    fn resolve(_a: &Self, _b: &Self, options: &ReconcileOptions) -> Option<Self> {
        options.resolve_true_over_false
    }
}

macro_rules! impl_reconcilable_number {
    ($($ty:ty),*) => {
        $(
            impl Reconcilable for $ty {
                fn resolve(a: &Self, b: &Self, options: &ReconcileOptions) -> Option<Self> {
                    options.resolve_max.map(|max| {
                        let a_wins = if max { a > b } else { a < b };
                        if a_wins { *a } else { *b }
                    })
                }
            }
        )*
    };
}

impl_reconcilable_number!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64);

impl Reconcilable for std::time::Duration {
    fn resolve(a: &Self, b: &Self, options: &ReconcileOptions) -> Option<Self> {
        options
            .resolve_max
            .map(|max| if max { *a.max(b) } else { *a.min(b) })
    }
}

impl Reconcilable for String {}

impl Reconcilable for char {}

impl<T: PartialEq + Debug + Clone> Reconcilable for Vec<T> {}

/// Merges two possibly-absent values.
///
/// - Equal values (including two absent ones) are returned as is.
/// - If exactly one is present it is returned, unless `resolve_defined` is `Some(false)`.
/// - Different values are settled by the type's [`Reconcilable::resolve`]; if that can't settle
///   them the call fails with [`FailoverError::ReconciliationConflict`].
pub fn reconcile<T: Reconcilable>(
    a: Option<T>,
    b: Option<T>,
    options: ReconcileOptions,
) -> Result<Option<T>, FailoverError> {
    match (a, b) {
        (a, b) if a == b => Ok(a),
        (Some(value), None) | (None, Some(value)) => {
            if options.resolve_defined == Some(false) {
                Ok(None)
            } else {
                Ok(Some(value))
            }
        }
        (Some(a), Some(b)) => T::resolve(&a, &b, &options).map(Some).ok_or_else(|| {
            FailoverError::ReconciliationConflict {
                left: format!("{a:?}"),
                right: format!("{b:?}"),
                resolve_defined: options.resolve_defined,
                resolve_true_over_false: options.resolve_true_over_false,
                resolve_max: options.resolve_max,
            }
        }),
        (None, None) => Ok(None),
    }
}
