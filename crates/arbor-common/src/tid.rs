use crate::error::StrParseError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::{SmolStr, SmolStrBuilder};
use std::fmt;
use std::sync::LazyLock;
use std::{ops::Deref, str::FromStr};

const S32_CHAR: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";

/// Largest timestamp representable in the 53 timestamp bits
const MAX_MICROS: u64 = (1 << 53) - 1;

/// Largest clock identifier (10 bits)
pub const MAX_CLOCK_ID: u16 = 0x3FF;

fn s32_encode(mut i: u64) -> SmolStr {
    let mut buf = [0u8; 13];
    for slot in buf.iter_mut().rev() {
        *slot = S32_CHAR[(i & 0x1F) as usize];
        i >>= 5;
    }

    let mut builder = SmolStrBuilder::new();
    for c in buf {
        builder.push(c as char);
    }
    builder.finish()
}

fn s32_decode(s: &str) -> u64 {
    s.bytes().fold(0u64, |acc, c| {
        let digit = S32_CHAR.iter().position(|&x| x == c).unwrap_or(0) as u64;
        (acc << 5) | digit
    })
}

static TID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[234567abcdefghij][234567abcdefghijklmnopqrstuvwxyz]{12}$").unwrap()
});

/// A timestamp identifier.
///
/// 64-bit value rendered as 13 characters of sortable base32: the top bit is
/// zero, then 53 bits of microseconds since the UNIX epoch, then a 10-bit clock
/// identifier. Because the encoding is fixed-width and the alphabet is in
/// ascending byte order, string comparison agrees with numeric comparison.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Hash)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Tid(SmolStr);

impl Tid {
    /// Parses a `TID` from the given string.
    pub fn new(tid: impl AsRef<str>) -> Result<Self, StrParseError> {
        let tid = tid.as_ref();
        if tid.len() > 13 {
            Err(StrParseError::too_long("tid", tid, 13, tid.len()))
        } else if tid.len() < 13 {
            Err(StrParseError::too_short("tid", tid, 13, tid.len()))
        } else if !TID_REGEX.is_match(tid) {
            Err(StrParseError::regex("tid", tid, "didn't match base32-sortable alphabet"))
        } else {
            Ok(Self(SmolStr::new_inline(tid)))
        }
    }

    /// Build a TID from a microsecond timestamp and clock identifier.
    ///
    /// Out of range inputs are masked to their bit widths.
    pub fn from_parts(micros: u64, clock_id: u16) -> Self {
        // 0TTTTTTTTTTTTTTT TTTTTTTTTTTTTTTT TTTTTTTTTTTTTTTT TTTTTTCCCCCCCCCC
        let value = ((micros & MAX_MICROS) << 10) | (clock_id & MAX_CLOCK_ID) as u64;
        Self(s32_encode(value))
    }

    /// Construct a TID for the current wall-clock time.
    ///
    /// Two calls in the same microsecond return the same value; use [`Ticker`]
    /// when strictly increasing identifiers are required.
    pub fn now(clock_id: u16) -> Self {
        Self::from_parts(now_micros(), clock_id)
    }

    /// The numeric value of this TID
    pub fn as_u64(&self) -> u64 {
        s32_decode(&self.0)
    }

    /// Microseconds since the UNIX epoch
    pub fn timestamp_micros(&self) -> u64 {
        self.as_u64() >> 10
    }

    /// Clock identifier
    pub fn clock_id(&self) -> u16 {
        (self.as_u64() & MAX_CLOCK_ID as u64) as u16
    }

    /// Returns the TID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn now_micros() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}

impl FromStr for Tid {
    type Err = StrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Tid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(&value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Tid> for SmolStr {
    fn from(value: Tid) -> Self {
        value.0
    }
}

impl AsRef<str> for Tid {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Tid {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

/// Monotonic TID generator.
///
/// Every TID returned by [`Ticker::next`] is strictly greater than every TID
/// this ticker returned before, and strictly greater than the `prev` hint
/// supplied by the caller. When the wall clock stalls or runs backwards the
/// timestamp is bumped by one microsecond instead.
#[derive(Debug, Clone)]
pub struct Ticker {
    last_micros: Option<u64>,
    clock_id: u16,
}

impl Ticker {
    /// New ticker with a random clock identifier
    pub fn new() -> Self {
        Self::with_clock_id(rand::random::<u16>() & MAX_CLOCK_ID)
    }

    /// New ticker with a fixed clock identifier
    pub fn with_clock_id(clock_id: u16) -> Self {
        Self {
            last_micros: None,
            clock_id: clock_id & MAX_CLOCK_ID,
        }
    }

    /// The clock identifier stamped into every TID from this ticker
    pub fn clock_id(&self) -> u16 {
        self.clock_id
    }

    /// Next identifier, strictly after both the last one issued and `prev`
    ///
    /// `None` once the 53-bit timestamp space is used up; no later TID exists.
    pub fn next(&mut self, prev: Option<&Tid>) -> Option<Tid> {
        let mut micros = now_micros().min(MAX_MICROS);
        if let Some(last) = self.last_micros {
            if micros <= last {
                micros = last.checked_add(1).filter(|m| *m <= MAX_MICROS)?;
            }
        }

        let mut tid = Tid::from_parts(micros, self.clock_id);
        if let Some(prev) = prev {
            if tid <= *prev {
                micros = prev
                    .timestamp_micros()
                    .checked_add(1)
                    .filter(|m| *m <= MAX_MICROS)?;
                tid = Tid::from_parts(micros, self.clock_id);
            }
        }

        self.last_micros = Some(micros);
        Some(tid)
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}
