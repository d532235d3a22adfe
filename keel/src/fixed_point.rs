//! 17.14 fixed-point arithmetic.
//!
//! The kernel has no floating point, so the MLFQS scheduler keeps its load
//! average and recent CPU estimates in a signed 32-bit fixed-point format with
//! 14 fractional bits.
//!
//! ```
//! use keel::fixed_point::Fixed;
//!
//! let x = Fixed::from_int(59) / 60;
//! assert_eq!((x * 60).round(), 59);
//! ```

use core::ops::{Add, AddAssign, Div, Mul, Neg, Sub};

/// Number of fractional bits.
pub const Q: u32 = 14;
/// The representation of 1.
pub const F: i32 = 1 << Q;

/// A 17.14 fixed-point number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Fixed(i32);

impl Fixed {
    pub const ZERO: Fixed = Fixed(0);
    pub const ONE: Fixed = Fixed(F);

    pub const fn from_int(n: i32) -> Self {
        Fixed(n * F)
    }

    /// Builds a number from its raw representation.
    pub const fn from_raw(raw: i32) -> Self {
        Fixed(raw)
    }

    pub const fn into_raw(self) -> i32 {
        self.0
    }

    /// Converts to an integer, rounding toward zero.
    pub const fn trunc(self) -> i32 {
        self.0 / F
    }

    /// Converts to an integer, rounding half away from zero.
    pub const fn round(self) -> i32 {
        if self.0 >= 0 {
            (self.0 + F / 2) / F
        } else {
            (self.0 - F / 2) / F
        }
    }
}

impl Add for Fixed {
    type Output = Fixed;
    fn add(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 + rhs.0)
    }
}

impl Add<i32> for Fixed {
    type Output = Fixed;
    fn add(self, rhs: i32) -> Fixed {
        Fixed(self.0 + rhs * F)
    }
}

impl AddAssign<i32> for Fixed {
    fn add_assign(&mut self, rhs: i32) {
        *self = *self + rhs;
    }
}

impl Sub for Fixed {
    type Output = Fixed;
    fn sub(self, rhs: Fixed) -> Fixed {
        Fixed(self.0 - rhs.0)
    }
}

impl Sub<i32> for Fixed {
    type Output = Fixed;
    fn sub(self, rhs: i32) -> Fixed {
        Fixed(self.0 - rhs * F)
    }
}

impl Mul for Fixed {
    type Output = Fixed;
    fn mul(self, rhs: Fixed) -> Fixed {
        Fixed((self.0 as i64 * rhs.0 as i64 / F as i64) as i32)
    }
}

impl Mul<i32> for Fixed {
    type Output = Fixed;
    fn mul(self, rhs: i32) -> Fixed {
        Fixed(self.0 * rhs)
    }
}

impl Div for Fixed {
    type Output = Fixed;
    fn div(self, rhs: Fixed) -> Fixed {
        Fixed((self.0 as i64 * F as i64 / rhs.0 as i64) as i32)
    }
}

impl Div<i32> for Fixed {
    type Output = Fixed;
    fn div(self, rhs: i32) -> Fixed {
        Fixed(self.0 / rhs)
    }
}

impl Neg for Fixed {
    type Output = Fixed;
    fn neg(self) -> Fixed {
        Fixed(-self.0)
    }
}
