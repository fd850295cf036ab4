//! Value Range Lattice
//!
//! Integer ranges over a fixed two's-complement width with overflow-safe
//! arithmetic. Every operation that could wrap widens its result to the full
//! width (BOTTOM) instead of producing a narrow but wrong range.
//!
//! # Lattice Structure
//!
//! ```text
//!        BOTTOM  [MIN, MAX]  (unconstrained)
//!          /           \
//!      [a, b]        [c, d]
//!          \           /
//!            [x, x]  (constant)
//!              |
//!             TOP    (empty / unreachable)
//! ```
//!
//! All arithmetic is carried out in `i128` so that the 64-bit width has the
//! same exactness guarantees as the 32-bit one.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ir::CmpOp;

/// Integer width of a value: Java `int` or `long`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Width {
    I32,
    I64,
}

impl Width {
    pub fn bits(self) -> u32 {
        match self {
            Width::I32 => 32,
            Width::I64 => 64,
        }
    }

    pub fn min(self) -> i64 {
        match self {
            Width::I32 => i32::MIN as i64,
            Width::I64 => i64::MIN,
        }
    }

    pub fn max(self) -> i64 {
        match self {
            Width::I32 => i32::MAX as i64,
            Width::I64 => i64::MAX,
        }
    }

    /// Largest unsigned bit pattern of this width
    pub fn umax(self) -> u64 {
        match self {
            Width::I32 => u32::MAX as u64,
            Width::I64 => u64::MAX,
        }
    }

    /// Check whether an exact value is representable
    pub fn fits(self, value: i128) -> bool {
        value >= self.min() as i128 && value <= self.max() as i128
    }

    /// Two's-complement wrap of an exact value into this width
    pub fn wrap(self, value: i128) -> i64 {
        match self {
            Width::I32 => value as i32 as i64,
            Width::I64 => value as i64,
        }
    }

    /// Reinterpret a signed value of this width as its unsigned bit pattern
    pub fn to_unsigned(self, value: i64) -> u64 {
        match self {
            Width::I32 => value as i32 as u32 as u64,
            Width::I64 => value as u64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Width::I32 => "i32",
            Width::I64 => "i64",
        }
    }

    /// Parse a width name (`i32`/`int`, `i64`/`long`)
    pub fn from_name(s: &str) -> Option<Width> {
        match s {
            "i32" | "int" => Some(Width::I32),
            "i64" | "long" => Some(Width::I64),
            _ => None,
        }
    }
}

impl fmt::Display for Width {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A provable range of signed integer values of one width.
///
/// The empty range (TOP) is encoded HotSpot-style as `lo > hi`; every
/// constructor canonicalizes it to `[MAX, MIN]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntRange {
    lo: i64,
    hi: i64,
    width: Width,
}

impl IntRange {
    /// Build `[lo, hi]`, clamped to the width. `lo > hi` yields TOP.
    pub fn new(lo: i64, hi: i64, width: Width) -> Self {
        let lo = lo.max(width.min());
        let hi = hi.min(width.max());
        if lo > hi {
            Self::top(width)
        } else {
            Self { lo, hi, width }
        }
    }

    /// Build a range from exact bounds; anything outside the width is BOTTOM
    pub fn exact(lo: i128, hi: i128, width: Width) -> Self {
        if lo > hi {
            return Self::top(width);
        }
        if width.fits(lo) && width.fits(hi) {
            Self { lo: lo as i64, hi: hi as i64, width }
        } else {
            Self::bottom(width)
        }
    }

    pub fn constant(value: i64, width: Width) -> Self {
        Self::new(value, value, width)
    }

    /// Empty range (unreachable)
    pub fn top(width: Width) -> Self {
        Self { lo: width.max(), hi: width.min(), width }
    }

    /// Unconstrained range (full width)
    pub fn bottom(width: Width) -> Self {
        Self { lo: width.min(), hi: width.max(), width }
    }

    pub fn non_negative(width: Width) -> Self {
        Self::new(0, width.max(), width)
    }

    pub fn lo(&self) -> i64 {
        self.lo
    }

    pub fn hi(&self) -> i64 {
        self.hi
    }

    pub fn width(&self) -> Width {
        self.width
    }

    pub fn is_top(&self) -> bool {
        self.lo > self.hi
    }

    pub fn is_bottom(&self) -> bool {
        self.lo == self.width.min() && self.hi == self.width.max()
    }

    pub fn as_constant(&self) -> Option<i64> {
        (!self.is_top() && self.lo == self.hi).then_some(self.lo)
    }

    pub fn contains(&self, value: i64) -> bool {
        !self.is_top() && value >= self.lo && value <= self.hi
    }

    /// True when every value of `self` is also in `other`
    pub fn is_subset_of(&self, other: &IntRange) -> bool {
        self.is_top() || (!other.is_top() && self.lo >= other.lo && self.hi <= other.hi)
    }

    /// Smallest range containing both (control-flow merge)
    pub fn join(&self, other: &IntRange) -> IntRange {
        if self.width != other.width {
            return Self::bottom(std::cmp::max(self.width, other.width));
        }
        if self.is_top() {
            return *other;
        }
        if other.is_top() {
            return *self;
        }
        Self::new(self.lo.min(other.lo), self.hi.max(other.hi), self.width)
    }

    /// Intersection (combining a fact with a branch condition)
    pub fn meet(&self, other: &IntRange) -> IntRange {
        if self.width != other.width {
            return Self::top(self.width);
        }
        if self.is_top() || other.is_top() {
            return Self::top(self.width);
        }
        Self::new(self.lo.max(other.lo), self.hi.min(other.hi), self.width)
    }

    /// Add a constant; widens to BOTTOM if either bound would overflow
    pub fn add_overflow_safe(&self, k: i64) -> IntRange {
        if self.is_top() {
            return *self;
        }
        Self::exact(self.lo as i128 + k as i128, self.hi as i128 + k as i128, self.width)
    }

    /// Range addition with the same overflow rule
    pub fn add(&self, other: &IntRange) -> IntRange {
        if self.is_top() || other.is_top() {
            return Self::top(self.width);
        }
        Self::exact(
            self.lo as i128 + other.lo as i128,
            self.hi as i128 + other.hi as i128,
            self.width,
        )
    }

    pub fn sub(&self, other: &IntRange) -> IntRange {
        if self.is_top() || other.is_top() {
            return Self::top(self.width);
        }
        Self::exact(
            self.lo as i128 - other.hi as i128,
            self.hi as i128 - other.lo as i128,
            self.width,
        )
    }

    pub fn neg(&self) -> IntRange {
        if self.is_top() {
            return *self;
        }
        Self::exact(-(self.hi as i128), -(self.lo as i128), self.width)
    }

    /// Multiply by a constant.
    ///
    /// A scale equal to the width's minimum is refused outright (its
    /// negation is not representable); any product outside the width yields
    /// BOTTOM. Negative scales swap the bounds.
    pub fn scale_safe(&self, k: i64) -> IntRange {
        if self.is_top() {
            return *self;
        }
        if k == self.width.min() {
            return Self::bottom(self.width);
        }
        let a = self.lo as i128 * k as i128;
        let b = self.hi as i128 * k as i128;
        Self::exact(a.min(b), a.max(b), self.width)
    }

    /// Multiply two ranges (corner products)
    pub fn mul(&self, other: &IntRange) -> IntRange {
        if self.is_top() || other.is_top() {
            return Self::top(self.width);
        }
        if let Some(k) = other.as_constant() {
            return self.scale_safe(k);
        }
        if let Some(k) = self.as_constant() {
            return other.scale_safe(k);
        }
        let corners = [
            self.lo as i128 * other.lo as i128,
            self.lo as i128 * other.hi as i128,
            self.hi as i128 * other.lo as i128,
            self.hi as i128 * other.hi as i128,
        ];
        let lo = corners.iter().copied().min().unwrap_or(i128::MIN);
        let hi = corners.iter().copied().max().unwrap_or(i128::MAX);
        Self::exact(lo, hi, self.width)
    }

    /// Left shift by a constant amount, Java semantics (amount masked)
    pub fn shl_safe(&self, amount: i64) -> IntRange {
        let masked = (amount as u32) & (self.width.bits() - 1);
        let k = self.width.wrap(1i128 << masked);
        self.scale_safe(k)
    }

    /// Sign-extend an `i32` range to `i64`
    pub fn to_long(&self) -> IntRange {
        if self.is_top() {
            return Self::top(Width::I64);
        }
        Self::new(self.lo, self.hi, Width::I64)
    }

    /// Reinterpret as unsigned bit patterns
    pub fn as_unsigned(&self) -> UnsignedRange {
        let w = self.width;
        if self.is_top() {
            return UnsignedRange::empty(w);
        }
        if self.lo >= 0 {
            UnsignedRange::new(self.lo as u64, self.hi as u64, w)
        } else if self.hi < 0 {
            UnsignedRange::new(w.to_unsigned(self.lo), w.to_unsigned(self.hi), w)
        } else {
            UnsignedRange::full(w)
        }
    }

    /// Values of `self` that can satisfy `x op bound`
    pub fn filter(&self, op: CmpOp, bound: &IntRange) -> IntRange {
        if self.is_top() || bound.is_top() {
            return Self::top(self.width);
        }
        let w = self.width;
        let (lo, hi) = match op {
            CmpOp::Lt => (w.min() as i128, bound.hi as i128 - 1),
            CmpOp::Le => (w.min() as i128, bound.hi as i128),
            CmpOp::Gt => (bound.lo as i128 + 1, w.max() as i128),
            CmpOp::Ge => (bound.lo as i128, w.max() as i128),
            CmpOp::Eq => (bound.lo as i128, bound.hi as i128),
            CmpOp::Ne => {
                return match bound.as_constant() {
                    Some(c) if c == self.lo && c == self.hi => Self::top(w),
                    Some(c) if c == self.lo => Self::new(self.lo + 1, self.hi, w),
                    Some(c) if c == self.hi => Self::new(self.lo, self.hi - 1, w),
                    _ => *self,
                };
            }
        };
        if lo > hi {
            return Self::top(w);
        }
        let clamp = |v: i128| v.clamp(w.min() as i128, w.max() as i128) as i64;
        self.meet(&Self::new(clamp(lo), clamp(hi), w))
    }

    /// Statically decide `x op y` for all `x` in `self`, `y` in `other`
    pub fn compare(&self, op: CmpOp, other: &IntRange) -> Option<bool> {
        if self.is_top() || other.is_top() {
            return None;
        }
        match op {
            CmpOp::Lt => {
                if self.hi < other.lo {
                    Some(true)
                } else if self.lo >= other.hi {
                    Some(false)
                } else {
                    None
                }
            }
            CmpOp::Le => {
                if self.hi <= other.lo {
                    Some(true)
                } else if self.lo > other.hi {
                    Some(false)
                } else {
                    None
                }
            }
            CmpOp::Gt => other.compare(CmpOp::Lt, self),
            CmpOp::Ge => other.compare(CmpOp::Le, self),
            CmpOp::Eq => match (self.as_constant(), other.as_constant()) {
                (Some(a), Some(b)) => Some(a == b),
                _ if self.meet(other).is_top() => Some(false),
                _ => None,
            },
            CmpOp::Ne => self.compare(CmpOp::Eq, other).map(|b| !b),
        }
    }
}

impl fmt::Display for IntRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_top() {
            write!(f, "top:{}", self.width)
        } else if self.is_bottom() {
            write!(f, "{}", self.width)
        } else if let Some(c) = self.as_constant() {
            write!(f, "{c}:{}", self.width)
        } else {
            write!(f, "[{}..{}]:{}", self.lo, self.hi, self.width)
        }
    }
}

/// A range of unsigned bit patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnsignedRange {
    lo: u64,
    hi: u64,
    width: Width,
}

impl UnsignedRange {
    pub fn new(lo: u64, hi: u64, width: Width) -> Self {
        let hi = hi.min(width.umax());
        if lo > hi {
            Self::empty(width)
        } else {
            Self { lo, hi, width }
        }
    }

    pub fn empty(width: Width) -> Self {
        Self { lo: width.umax(), hi: 0, width }
    }

    pub fn full(width: Width) -> Self {
        Self { lo: 0, hi: width.umax(), width }
    }

    pub fn lo(&self) -> u64 {
        self.lo
    }

    pub fn hi(&self) -> u64 {
        self.hi
    }

    pub fn is_empty(&self) -> bool {
        self.lo > self.hi
    }

    pub fn is_full(&self) -> bool {
        self.lo == 0 && self.hi == self.width.umax()
    }

    pub fn contains(&self, value: u64) -> bool {
        !self.is_empty() && value >= self.lo && value <= self.hi
    }
}

impl fmt::Display for UnsignedRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "top:u{}", self.width.bits())
        } else {
            write!(f, "[{}..{}]:u{}", self.lo, self.hi, self.width.bits())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r32(lo: i64, hi: i64) -> IntRange {
        IntRange::new(lo, hi, Width::I32)
    }

    #[test]
    fn test_new_canonicalizes_empty() {
        let r = r32(5, 1);
        assert!(r.is_top());
        assert_eq!(r, IntRange::top(Width::I32));
    }

    #[test]
    fn test_new_clamps_to_width() {
        let r = IntRange::new(i64::MIN, 10, Width::I32);
        assert_eq!(r.lo(), i32::MIN as i64);
        assert_eq!(r.hi(), 10);
    }

    #[test]
    fn test_join_and_meet() {
        let a = r32(0, 10);
        let b = r32(5, 20);
        assert_eq!(a.join(&b), r32(0, 20));
        assert_eq!(a.meet(&b), r32(5, 10));
        assert!(a.meet(&r32(11, 12)).is_top());
    }

    #[test]
    fn test_top_is_join_identity() {
        let a = r32(3, 4);
        assert_eq!(IntRange::top(Width::I32).join(&a), a);
        assert_eq!(a.join(&IntRange::top(Width::I32)), a);
    }

    #[test]
    fn test_add_overflow_widens() {
        let r = r32(0, i32::MAX as i64);
        assert!(r.add_overflow_safe(1).is_bottom());
        assert_eq!(r32(0, 10).add_overflow_safe(5), r32(5, 15));
        assert!(r32(i32::MIN as i64, 0).add_overflow_safe(-1).is_bottom());
    }

    #[test]
    fn test_add_overflow_long() {
        let r = IntRange::new(i64::MAX - 1, i64::MAX - 1, Width::I64);
        assert!(r.add_overflow_safe(2).is_bottom());
        assert_eq!(
            r.add_overflow_safe(1),
            IntRange::constant(i64::MAX, Width::I64)
        );
    }

    #[test]
    fn test_scale_negative_swaps_bounds() {
        assert_eq!(r32(-2, 5).scale_safe(-3), r32(-15, 6));
        assert_eq!(r32(0, 99).scale_safe(2), r32(0, 198));
    }

    #[test]
    fn test_scale_min_is_bottom() {
        assert!(r32(0, 0).scale_safe(i32::MIN as i64).is_bottom());
        assert!(
            IntRange::constant(1, Width::I64)
                .scale_safe(i64::MIN)
                .is_bottom()
        );
    }

    #[test]
    fn test_scale_overflow_is_bottom() {
        assert!(r32(0, 1 << 30).scale_safe(4).is_bottom());
        assert!(r32(-(1 << 30), 0).scale_safe(-4).is_bottom());
    }

    #[test]
    fn test_shl_matches_java_masking() {
        assert_eq!(r32(1, 2).shl_safe(3), r32(8, 16));
        // 1 << 31 is i32::MIN in Java, which is refused
        assert!(r32(1, 1).shl_safe(31).is_bottom());
        // shift amounts are masked to the width
        assert_eq!(r32(1, 1).shl_safe(33), r32(2, 2));
    }

    #[test]
    fn test_as_unsigned() {
        assert_eq!(r32(0, 5).as_unsigned(), UnsignedRange::new(0, 5, Width::I32));
        let neg = r32(-2, -1).as_unsigned();
        assert_eq!(neg.lo(), u32::MAX as u64 - 1);
        assert_eq!(neg.hi(), u32::MAX as u64);
        assert!(r32(-1, 1).as_unsigned().is_full());
    }

    #[test]
    fn test_filter() {
        let r = r32(-128, 127);
        assert_eq!(r.filter(CmpOp::Lt, &r32(0, 0)), r32(-128, -1));
        assert_eq!(r.filter(CmpOp::Ge, &r32(0, 0)), r32(0, 127));
        assert_eq!(r.filter(CmpOp::Ne, &r32(127, 127)), r32(-128, 126));
        assert!(r.filter(CmpOp::Gt, &r32(127, 127)).is_top());
    }

    #[test]
    fn test_compare() {
        assert_eq!(r32(0, 5).compare(CmpOp::Lt, &r32(6, 9)), Some(true));
        assert_eq!(r32(0, 5).compare(CmpOp::Lt, &r32(5, 9)), None);
        assert_eq!(r32(7, 9).compare(CmpOp::Lt, &r32(0, 7)), Some(false));
        assert_eq!(r32(7, 9).compare(CmpOp::Gt, &r32(0, 6)), Some(true));
        assert_eq!(r32(1, 1).compare(CmpOp::Eq, &r32(1, 1)), Some(true));
        assert_eq!(r32(1, 2).compare(CmpOp::Ne, &r32(3, 4)), Some(true));
    }

    #[test]
    fn test_display() {
        assert_eq!(r32(0, 99).to_string(), "[0..99]:i32");
        assert_eq!(IntRange::constant(7, Width::I64).to_string(), "7:i64");
        assert_eq!(IntRange::bottom(Width::I32).to_string(), "i32");
        assert_eq!(IntRange::top(Width::I32).to_string(), "top:i32");
    }
}
