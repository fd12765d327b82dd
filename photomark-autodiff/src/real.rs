//! The scalar capability shared by both solver back ends.

use crate::Value;

/// Arithmetic scalar the residual formulas are written against.
///
/// Implemented by `f64` (plain evaluation, initialization, diagnostics) and
/// by [`Value`] (reverse-mode AD). Constant lifting goes through an existing
/// scalar because a [`Value`] constant must be recorded on the same tape.
pub trait Real:
    Copy
    + std::ops::Add<Output = Self>
    + std::ops::Sub<Output = Self>
    + std::ops::Mul<Output = Self>
    + std::ops::Div<Output = Self>
    + std::ops::Neg<Output = Self>
{
    /// A constant in the same evaluation context as `self`.
    fn lift(&self, c: f64) -> Self;

    /// Current numeric value, for branching (e.g. cheirality checks).
    fn scalar(&self) -> f64;

    fn sqrt(self) -> Self;
    fn sin(self) -> Self;
    fn cos(self) -> Self;
    fn acos(self) -> Self;
    fn atan2(self, x: Self) -> Self;
}

impl Real for f64 {
    #[inline]
    fn lift(&self, c: f64) -> Self {
        c
    }

    #[inline]
    fn scalar(&self) -> f64 {
        *self
    }

    #[inline]
    fn sqrt(self) -> Self {
        f64::sqrt(self)
    }

    #[inline]
    fn sin(self) -> Self {
        f64::sin(self)
    }

    #[inline]
    fn cos(self) -> Self {
        f64::cos(self)
    }

    #[inline]
    fn acos(self) -> Self {
        // Clamped like the Value implementation so both back ends agree at
        // the domain edge.
        f64::acos(self.clamp(-1.0, 1.0))
    }

    #[inline]
    fn atan2(self, x: Self) -> Self {
        f64::atan2(self, x)
    }
}

impl<'t> Real for Value<'t> {
    #[inline]
    fn lift(&self, c: f64) -> Self {
        self.tape.constant(c)
    }

    #[inline]
    fn scalar(&self) -> f64 {
        self.value()
    }

    #[inline]
    fn sqrt(self) -> Self {
        Value::sqrt(self)
    }

    #[inline]
    fn sin(self) -> Self {
        Value::sin(self)
    }

    #[inline]
    fn cos(self) -> Self {
        Value::cos(self)
    }

    #[inline]
    fn acos(self) -> Self {
        Value::acos(self)
    }

    #[inline]
    fn atan2(self, x: Self) -> Self {
        Value::atan2(self, x)
    }
}
