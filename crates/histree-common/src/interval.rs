//! The interval value type stored in history tree nodes.

use crate::error::{Result, StateHistoryError};
use crate::types::{read_i64, Quark, StateValue, Timestamp};
use serde::{Deserialize, Serialize};

/// A closed time range `[start, end]` during which one attribute held one value.
///
/// Layout on disk (21 bytes + value payload):
/// - attribute: 4 bytes
/// - start: 8 bytes
/// - end: 8 bytes
/// - value tag: 1 byte
/// - value payload: variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    attribute: Quark,
    start: Timestamp,
    end: Timestamp,
    value: StateValue,
}

impl Interval {
    /// Size of the fixed part (attribute, start, end) in bytes.
    pub const FIXED_SIZE: usize = 20;

    /// Creates an interval, rejecting `start > end`.
    pub fn new(attribute: Quark, start: Timestamp, end: Timestamp, value: StateValue) -> Result<Self> {
        if start > end {
            return Err(StateHistoryError::time_range(
                start,
                end,
                "interval ends before it starts",
            ));
        }
        Ok(Self {
            attribute,
            start,
            end,
            value,
        })
    }

    /// Interval carrying a null value, used to answer queries on attributes without state.
    pub fn null(attribute: Quark, start: Timestamp, end: Timestamp) -> Self {
        Self {
            attribute,
            start: start.min(end),
            end: start.max(end),
            value: StateValue::Null,
        }
    }

    #[inline]
    pub fn attribute(&self) -> Quark {
        self.attribute
    }

    #[inline]
    pub fn start(&self) -> Timestamp {
        self.start
    }

    #[inline]
    pub fn end(&self) -> Timestamp {
        self.end
    }

    #[inline]
    pub fn value(&self) -> &StateValue {
        &self.value
    }

    pub fn into_value(self) -> StateValue {
        self.value
    }

    /// Returns true if `t` lies in `[start, end]`.
    #[inline]
    pub fn intersects(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }

    /// Returns true if this interval overlaps `[t1, t2]`.
    #[inline]
    pub fn overlaps(&self, t1: Timestamp, t2: Timestamp) -> bool {
        self.start <= t2 && t1 <= self.end
    }

    /// Size of this interval once serialized in a node.
    pub fn size_on_disk(&self) -> usize {
        Self::FIXED_SIZE + self.value.encoded_size()
    }

    /// Serializes the interval into `buf`. Returns the number of bytes written.
    pub fn encode_into(&self, buf: &mut [u8]) -> usize {
        buf[0..4].copy_from_slice(&self.attribute.to_le_bytes());
        buf[4..12].copy_from_slice(&self.start.to_le_bytes());
        buf[12..20].copy_from_slice(&self.end.to_le_bytes());
        Self::FIXED_SIZE + self.value.encode_into(&mut buf[Self::FIXED_SIZE..])
    }

    /// Deserializes an interval from the start of `buf`.
    ///
    /// Returns the interval and the number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < Self::FIXED_SIZE {
            return Err(StateHistoryError::Format("truncated interval".to_string()));
        }
        let attribute = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let start = read_i64(&buf[4..12]);
        let end = read_i64(&buf[12..20]);
        if start > end {
            return Err(StateHistoryError::Format(format!(
                "interval for attribute {} has start {} after end {}",
                attribute, start, end
            )));
        }
        let (value, consumed) = StateValue::decode(&buf[Self::FIXED_SIZE..])?;
        Ok((
            Self {
                attribute,
                start,
                end,
                value,
            },
            Self::FIXED_SIZE + consumed,
        ))
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {}], attribute = {}, value = {}",
            self.start, self.end, self.attribute, self.value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_new() {
        let interval = Interval::new(3, 10, 20, StateValue::Int(1)).unwrap();
        assert_eq!(interval.attribute(), 3);
        assert_eq!(interval.start(), 10);
        assert_eq!(interval.end(), 20);
        assert_eq!(interval.value(), &StateValue::Int(1));
    }

    #[test]
    fn test_interval_zero_length() {
        let interval = Interval::new(0, 5, 5, StateValue::Null).unwrap();
        assert!(interval.intersects(5));
        assert!(!interval.intersects(4));
        assert!(!interval.intersects(6));
    }

    #[test]
    fn test_interval_rejects_inverted_bounds() {
        let err = Interval::new(0, 20, 10, StateValue::Null).unwrap_err();
        assert!(matches!(err, StateHistoryError::TimeRange { start: 20, end: 10, .. }));
    }

    #[test]
    fn test_interval_overlaps() {
        let interval = Interval::new(0, 10, 20, StateValue::Null).unwrap();
        assert!(interval.overlaps(0, 10));
        assert!(interval.overlaps(20, 30));
        assert!(interval.overlaps(12, 15));
        assert!(interval.overlaps(0, 100));
        assert!(!interval.overlaps(0, 9));
        assert!(!interval.overlaps(21, 30));
    }

    #[test]
    fn test_null_interval() {
        let interval = Interval::null(4, 30, 30);
        assert_eq!(interval.start(), 30);
        assert_eq!(interval.end(), 30);
        assert!(interval.value().is_null());
    }

    #[test]
    fn test_size_on_disk() {
        let interval = Interval::new(0, 0, 1, StateValue::Null).unwrap();
        assert_eq!(interval.size_on_disk(), 21);

        let interval = Interval::new(0, 0, 1, StateValue::from("abcd")).unwrap();
        assert_eq!(interval.size_on_disk(), 21 + 4 + 4);
    }

    #[test]
    fn test_encode_decode() {
        let interval = Interval::new(77, -5, 1_000_000, StateValue::from("SYSCALL")).unwrap();
        let mut buf = vec![0u8; interval.size_on_disk() + 8];
        let written = interval.encode_into(&mut buf);
        assert_eq!(written, interval.size_on_disk());

        let (decoded, consumed) = Interval::decode(&buf).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(decoded, interval);
    }

    #[test]
    fn test_decode_rejects_inverted_bounds() {
        let interval = Interval::new(1, 10, 20, StateValue::Null).unwrap();
        let mut buf = vec![0u8; interval.size_on_disk()];
        interval.encode_into(&mut buf);
        // Corrupt end so it precedes start
        buf[12..20].copy_from_slice(&0i64.to_le_bytes());
        assert!(matches!(
            Interval::decode(&buf),
            Err(StateHistoryError::Format(_))
        ));
    }

    #[test]
    fn test_decode_truncated() {
        assert!(Interval::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_display() {
        let interval = Interval::new(2, 0, 25, StateValue::Int(42)).unwrap();
        assert_eq!(interval.to_string(), "[0, 25], attribute = 2, value = 42");
    }
}
