//! Calendar matching for recurring run clauses
//!
//! A run clause is six fixed-width bitsets (hour, day of month, month,
//! weekday, week of month, week of year) plus the minute of the hour to start
//! at. An instant matches when every one of the six fields has its bit set.

use chrono::{DateTime, Datelike, TimeZone, Timelike};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fixed-width set of small indices, `N <= 64`
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BitSet<const N: usize>(u64);

impl<const N: usize> BitSet<N> {
    /// No bits set; never matches
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every bit set; matches any value
    pub const fn full() -> Self {
        Self(u64::MAX >> (64 - N))
    }

    /// Build a set from indices, rejecting anything outside `0..N`
    pub fn from_indices<I: IntoIterator<Item = usize>>(indices: I) -> Result<Self, usize> {
        let mut bits = Self::empty();
        for index in indices {
            if index >= N {
                return Err(index);
            }
            bits.set(index);
        }
        Ok(bits)
    }

    pub fn set(&mut self, index: usize) {
        if index < N {
            self.0 |= 1 << index;
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < N {
            self.0 &= !(1 << index);
        }
    }

    pub fn is_set(&self, index: usize) -> bool {
        index < N && self.0 & (1 << index) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_full(&self) -> bool {
        *self == Self::full()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..N).filter(move |i| self.is_set(*i))
    }
}

impl<const N: usize> Default for BitSet<N> {
    fn default() -> Self {
        Self::full()
    }
}

impl<const N: usize> fmt::Debug for BitSet<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_full() {
            return f.write_str("*");
        }
        f.debug_set().entries(self.iter()).finish()
    }
}

/// The calendar fields of an instant as the bitsets index them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarFields {
    pub hour: usize,
    /// Zero based day of month
    pub mday: usize,
    /// Zero based month
    pub month: usize,
    /// Days since Sunday
    pub wday: usize,
    /// `mday / 7`
    pub wom: usize,
    /// ISO 8601 week number
    pub woy: usize,
}

impl CalendarFields {
    pub fn of<Tz: TimeZone>(instant: &DateTime<Tz>) -> Self {
        let mday = instant.day0() as usize;
        Self {
            hour: instant.hour() as usize,
            mday,
            month: instant.month0() as usize,
            wday: instant.weekday().num_days_from_sunday() as usize,
            wom: mday / 7,
            woy: instant.iso_week().week() as usize,
        }
    }
}

/// When a run clause fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Calendar {
    pub hour: BitSet<24>,
    pub mday: BitSet<31>,
    pub month: BitSet<12>,
    pub wday: BitSet<7>,
    pub wom: BitSet<5>,
    pub woy: BitSet<54>,
    pub minute: u32,
}

impl Calendar {
    /// Every hour of every day at the given minute
    pub fn hourly(minute: u32) -> Self {
        Self {
            minute,
            ..Self::default()
        }
    }

    /// Every day at `hour:minute`
    pub fn daily(hour: usize, minute: u32) -> Self {
        let mut hours = BitSet::empty();
        hours.set(hour);
        Self {
            hour: hours,
            minute,
            ..Self::default()
        }
    }

    /// All six fields of the instant's local breakdown have their bit set
    pub fn matches<Tz: TimeZone>(&self, instant: &DateTime<Tz>) -> bool {
        self.matches_fields(&CalendarFields::of(instant))
    }

    pub fn matches_fields(&self, fields: &CalendarFields) -> bool {
        self.hour.is_set(fields.hour)
            && self.mday.is_set(fields.mday)
            && self.wday.is_set(fields.wday)
            && self.month.is_set(fields.month)
            && self.wom.is_set(fields.wom)
            && self.woy.is_set(fields.woy)
    }
}
