// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Contains the [`PriorityItem`] trait, implemented by every unit of telemetry that can be
//! retained by a reservoir.

use std::{cmp::Ordering, rc::Rc, sync::Arc};

/// A sampled unit of telemetry (a transaction, span, error or custom event) that carries the
/// retention priority assigned by its producer.
///
/// Higher priorities are more strongly preferred when a reservoir is at capacity. Reservoirs never
/// assign or change priorities, and never mutate the item itself; they only decide whether to keep
/// it.
///
/// # Example
/// ```
/// # use reservoir_core::PriorityItem;
/// struct ErrorEvent {
///     message: String,
///     priority: f32,
/// }
///
/// impl PriorityItem for ErrorEvent {
///     fn priority(&self) -> f32 {
///         self.priority
///     }
/// }
/// ```
pub trait PriorityItem {
    /// The retention priority of this item. Higher survives longer under capacity pressure.
    ///
    /// Priorities are compared with [`f32::total_cmp`], so a NaN priority ranks above every
    /// finite value. Producers should not emit NaN.
    fn priority(&self) -> f32;

    /// Orders two items with the *same* priority. [`Ordering::Greater`] means `self` is the more
    /// valuable of the two and should be retained in preference to `other`.
    ///
    /// Defaults to [`Ordering::Equal`], in which case reservoirs fall back to insertion order
    /// (the earlier item is retained).
    fn cmp_secondary(&self, other: &Self) -> Ordering {
        let _ = other;
        Ordering::Equal
    }
}

impl<T: PriorityItem + ?Sized> PriorityItem for Box<T> {
    fn priority(&self) -> f32 {
        (**self).priority()
    }

    fn cmp_secondary(&self, other: &Self) -> Ordering {
        (**self).cmp_secondary(other)
    }
}

impl<T: PriorityItem + ?Sized> PriorityItem for Arc<T> {
    fn priority(&self) -> f32 {
        (**self).priority()
    }

    fn cmp_secondary(&self, other: &Self) -> Ordering {
        (**self).cmp_secondary(other)
    }
}

impl<T: PriorityItem + ?Sized> PriorityItem for Rc<T> {
    fn priority(&self) -> f32 {
        (**self).priority()
    }

    fn cmp_secondary(&self, other: &Self) -> Ordering {
        (**self).cmp_secondary(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Span {
        priority: f32,
        external: bool,
    }

    impl PriorityItem for Span {
        fn priority(&self) -> f32 {
            self.priority
        }

        fn cmp_secondary(&self, other: &Self) -> Ordering {
            self.external.cmp(&other.external)
        }
    }

    #[test]
    fn smart_pointers_forward_to_the_item() {
        let a = Arc::new(Span {
            priority: 0.5,
            external: true,
        });
        let b = Arc::new(Span {
            priority: 0.5,
            external: false,
        });
        assert_eq!(a.priority(), 0.5);
        assert_eq!(a.cmp_secondary(&b), Ordering::Greater);

        let boxed = Box::new(Span {
            priority: 1.25,
            external: false,
        });
        assert_eq!(boxed.priority(), 1.25);
    }

    #[test]
    fn default_secondary_order_is_equal() {
        struct Plain(f32);
        impl PriorityItem for Plain {
            fn priority(&self) -> f32 {
                self.0
            }
        }
        assert_eq!(Plain(0.1).cmp_secondary(&Plain(0.9)), Ordering::Equal);
    }
}
