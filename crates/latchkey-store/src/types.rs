use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Wall-clock time as the lock owner sees it. Persisted without a zone.
pub type Timestamp = chrono::NaiveDateTime;

/// Sortable text format used for every persisted timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Formats accepted on input, in order of preference. The `T` forms are what
/// a `datetime-local` form field submits.
const INPUT_FORMATS: &[&str] = &[
    TIMESTAMP_FORMAT,
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

pub fn format_timestamp(ts: &Timestamp) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(input: &str) -> Result<Timestamp, StoreError> {
    let trimmed = input.trim();
    INPUT_FORMATS
        .iter()
        .find_map(|fmt| Timestamp::parse_from_str(trimmed, fmt).ok())
        .ok_or_else(|| StoreError::InvalidTimestamp(input.to_owned()))
}

/// A numbered credential location on the lock. Slots start at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Slot(u16);

impl Slot {
    pub fn new(n: u16) -> Result<Self, StoreError> {
        if n == 0 {
            return Err(StoreError::InvalidSlot("slot numbers start at 1".to_owned()));
        }
        Ok(Self(n))
    }

    #[inline]
    pub fn get(self) -> u16 {
        self.0
    }

    /// Every slot in `1..=count`, ascending.
    pub fn range(count: u16) -> impl Iterator<Item = Slot> {
        (1..=count).map(Slot)
    }
}

impl TryFrom<u16> for Slot {
    type Error = StoreError;

    fn try_from(n: u16) -> Result<Self, Self::Error> {
        Slot::new(n)
    }
}

impl From<Slot> for u16 {
    fn from(slot: Slot) -> Self {
        slot.0
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Slot {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n: u16 = s
            .trim()
            .parse()
            .map_err(|_| StoreError::InvalidSlot(s.to_owned()))?;
        Slot::new(n)
    }
}

/// Serde adapter writing timestamps in [`TIMESTAMP_FORMAT`].
pub mod timestamp_format {
    use super::{format_timestamp, parse_timestamp, Timestamp};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Timestamp, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}
