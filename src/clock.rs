//! Monotonic 32.32 fixed-point timestamps.
//!
//! The whole protocol speaks in these: 64 bits, upper half whole seconds
//! from the monotonic clock, lower half binary fraction. Zero is reserved
//! to mean "unset", so the time source coerces an exact zero to the
//! smallest nonzero stamp.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use nix::time::{clock_gettime, ClockId};

const FRAC_BITS: u32 = 32;

/// An instant on the monotonic clock. `Ts::UNSET` (zero) means "never".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ts(pub u64);

/// A span of time in the same 32.32 representation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Dur(pub u64);

impl Ts {
    pub const UNSET: Ts = Ts(0);

    pub fn now() -> Ts {
        // CLOCK_MONOTONIC starts at boot, so 0.0 can only be seen in the
        // first nanoseconds of a very eager init; still, keep 0 reserved.
        let spec = match clock_gettime(ClockId::CLOCK_MONOTONIC) {
            Ok(spec) => spec,
            Err(_) => return Ts(1),
        };
        let whole = (spec.tv_sec() as u64) << FRAC_BITS;
        let frac = ((spec.tv_nsec() as u64) << FRAC_BITS) / 1_000_000_000;
        Ts((whole | frac).max(1))
    }

    pub fn is_set(&self) -> bool {
        self.0 != 0
    }

    pub fn whole_secs(&self) -> u64 {
        self.0 >> FRAC_BITS
    }

    pub fn saturating_sub(self, rhs: Ts) -> Dur {
        Dur(self.0.saturating_sub(rhs.0))
    }
}

impl Dur {
    pub const ZERO: Dur = Dur(0);

    pub fn from_secs(secs: u64) -> Dur {
        Dur(secs << FRAC_BITS)
    }

    pub fn whole_secs(&self) -> u64 {
        self.0 >> FRAC_BITS
    }

    pub fn as_millis(&self) -> u64 {
        ((self.0 as u128 * 1_000) >> FRAC_BITS) as u64
    }

    /// Parses decimal seconds, optionally fractional: `"2"`, `"2.5"`,
    /// `"0.1"`. Rounds to the nearest representable value so short decimal
    /// fractions survive a round-trip through [`fmt::Display`].
    pub fn parse(s: &str) -> Option<Dur> {
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return None;
        }
        let whole: u64 = if whole.is_empty() {
            0
        } else {
            whole.parse().ok()?
        };
        if whole > u32::MAX as u64 {
            return None;
        }
        let mut value = whole << FRAC_BITS;
        if !frac.is_empty() {
            if frac.len() > 9 || !frac.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let digits: u64 = frac.parse().ok()?;
            let scale = 10u64.pow(frac.len() as u32);
            value |= (((digits as u128) << FRAC_BITS) + (scale as u128) / 2) as u64 / scale;
        }
        Some(Dur(value))
    }
}

impl fmt::Display for Dur {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let micros = (((self.0 & 0xffff_ffff) as u128 * 1_000_000 + (1 << 31)) >> FRAC_BITS) as u64;
        if micros == 0 {
            write!(f, "{}", self.whole_secs())
        } else {
            let frac = format!("{micros:06}");
            write!(f, "{}.{}", self.whole_secs(), frac.trim_end_matches('0'))
        }
    }
}

impl fmt::Display for Ts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.whole_secs())
    }
}

impl Add<Dur> for Ts {
    type Output = Ts;
    fn add(self, rhs: Dur) -> Ts {
        Ts(self.0.saturating_add(rhs.0))
    }
}

impl AddAssign<Dur> for Ts {
    fn add_assign(&mut self, rhs: Dur) {
        *self = *self + rhs;
    }
}

impl Add for Dur {
    type Output = Dur;
    fn add(self, rhs: Dur) -> Dur {
        Dur(self.0.saturating_add(rhs.0))
    }
}

impl Sub for Ts {
    type Output = Dur;
    fn sub(self, rhs: Ts) -> Dur {
        Dur(self.0.saturating_sub(rhs.0))
    }
}

// === Tests === //
