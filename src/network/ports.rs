//! Port ranges and canonical port sets

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use super::FilterError;

/// Inclusive port interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

impl PortRange {
    pub const ANY: PortRange = PortRange {
        from: 0,
        to: u16::MAX,
    };

    pub fn new(from: u16, to: u16) -> Result<Self, FilterError> {
        if from > to {
            return Err(FilterError::InvalidPort(format!("{}-{}", from, to)));
        }
        Ok(Self { from, to })
    }

    pub fn single(port: u16) -> Self {
        Self {
            from: port,
            to: port,
        }
    }

    pub fn is_any(&self) -> bool {
        *self == Self::ANY
    }

    pub fn contains(&self, port: u16) -> bool {
        self.from <= port && port <= self.to
    }

    /// Decompose into `(value, mask)` pairs for u32 classifier matches
    ///
    /// Each pair covers an aligned power-of-two block; together they cover
    /// the range exactly.
    pub fn masks(&self) -> Vec<(u16, u16)> {
        let mut blocks = Vec::new();
        let mut start = u32::from(self.from);
        let end = u32::from(self.to);
        while start <= end {
            let mut size = if start == 0 {
                1u32 << 16
            } else {
                start & start.wrapping_neg()
            };
            while start + size - 1 > end {
                size >>= 1;
            }
            let mask = !(size - 1) & 0xffff;
            blocks.push((start as u16, mask as u16));
            start += size;
        }
        blocks
    }
}

impl FromStr for PortRange {
    type Err = FilterError;

    /// `"53"` or `"1000-2000"`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || FilterError::InvalidPort(s.to_string());
        match s.split_once('-') {
            Some((from, to)) => {
                let from = from.trim().parse().map_err(|_| invalid())?;
                let to = to.trim().parse().map_err(|_| invalid())?;
                PortRange::new(from, to).map_err(|_| invalid())
            }
            None => s.parse().map(PortRange::single).map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == self.to {
            write!(f, "{}", self.from)
        } else {
            write!(f, "{}-{}", self.from, self.to)
        }
    }
}

impl Serialize for PortRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Sorted, merged set of port ranges
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PortSet {
    ranges: Vec<PortRange>,
}

impl PortSet {
    /// Canonicalise: sort, then merge overlapping and adjacent ranges
    pub fn from_ranges(mut ranges: Vec<PortRange>) -> Self {
        ranges.sort();
        let mut merged: Vec<PortRange> = Vec::with_capacity(ranges.len());
        for range in ranges {
            match merged.last_mut() {
                Some(last) if u32::from(range.from) <= u32::from(last.to) + 1 => {
                    last.to = last.to.max(range.to);
                }
                _ => merged.push(range),
            }
        }
        Self { ranges: merged }
    }

    /// Parse user port specs; an empty list means every port
    pub fn parse<S: AsRef<str>>(specs: &[S]) -> Result<Self, FilterError> {
        let ranges = specs
            .iter()
            .map(|s| s.as_ref())
            .filter(|s| !s.trim().is_empty())
            .map(str::parse)
            .collect::<Result<Vec<PortRange>, _>>()?;
        if ranges.is_empty() {
            return Ok(Self::any());
        }
        Ok(Self::from_ranges(ranges))
    }

    pub fn any() -> Self {
        Self {
            ranges: vec![PortRange::ANY],
        }
    }

    pub fn ranges(&self) -> &[PortRange] {
        &self.ranges
    }

    pub fn is_any(&self) -> bool {
        self.ranges.len() == 1 && self.ranges[0].is_any()
    }
}

impl fmt::Display for PortSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<String> = self.ranges.iter().map(ToString::to_string).collect();
        f.write_str(&rendered.join(","))
    }
}
