//! Decoding of the record returned by `read(2)` on a perf group leader opened
//! with `PERF_FORMAT_GROUP | PERF_FORMAT_TOTAL_TIME_ENABLED |
//! PERF_FORMAT_TOTAL_TIME_RUNNING | PERF_FORMAT_ID`.
//!
//! ```text
//! struct read_format {
//!     u64 nr;
//!     u64 time_enabled;
//!     u64 time_running;
//!     struct { u64 value; u64 id; } values[nr];
//! };
//! ```
//!
//! See the "Reading results" section of `perf_event_open(2)`.

/// Size of the `nr`, `time_enabled` and `time_running` header.
pub const HEADER_SIZE: usize = 24;

/// Size of each `{ value, id }` entry following the header.
pub const VALUE_SIZE: usize = 16;

/// Error types for group record decoding
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
    #[error("group reported {actual} values, expected {expected}")]
    CountMismatch { expected: usize, actual: u64 },
}

/// Number of bytes a group read returns for a group of `events` members.
pub const fn record_size(events: usize) -> usize {
    HEADER_SIZE + VALUE_SIZE * events
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Value {
    pub value: u64,
    pub id: u64,
}

/// A decoded group read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupReadFormat {
    pub nr: u64,
    pub time_enabled: u64,
    pub time_running: u64,
    pub values: Vec<Value>,
}

impl GroupReadFormat {
    /// Decode a group read for a group with exactly `events` members. The
    /// buffer must be exactly `record_size(events)` bytes and the record must
    /// report `events` values.
    pub fn decode(data: &[u8], events: usize) -> Result<Self, DecodeError> {
        let expected = record_size(events);

        if data.len() != expected {
            return Err(DecodeError::ShortRead {
                expected,
                actual: data.len(),
            });
        }

        let nr = read_u64(data, 0);
        let time_enabled = read_u64(data, 8);
        let time_running = read_u64(data, 16);

        if nr != events as u64 {
            return Err(DecodeError::CountMismatch {
                expected: events,
                actual: nr,
            });
        }

        let values = data[HEADER_SIZE..]
            .chunks_exact(VALUE_SIZE)
            .map(|entry| Value {
                value: read_u64(entry, 0),
                id: read_u64(entry, 8),
            })
            .collect();

        Ok(Self {
            nr,
            time_enabled,
            time_running,
            values,
        })
    }

    /// The fraction of the enabled time the group was actually scheduled on
    /// the PMU. A group that was never enabled is treated as fully scheduled.
    pub fn scaling_ratio(&self) -> f64 {
        scaling_ratio(self.time_enabled, self.time_running)
    }
}

pub fn scaling_ratio(time_enabled: u64, time_running: u64) -> f64 {
    if time_enabled == 0 {
        return 1.0;
    }

    time_running as f64 / time_enabled as f64
}

/// Correct a raw counter value for time multiplexing. A zero ratio means the
/// event was enabled but never ran, in which case the raw value is reported.
pub fn scale(raw: u64, ratio: f64) -> u64 {
    if ratio == 0.0 {
        return raw;
    }

    (raw as f64 / ratio).round() as u64
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

#[cfg(test)]
pub(crate) fn encode(time_enabled: u64, time_running: u64, values: &[(u64, u64)]) -> Vec<u8> {
    let mut data = Vec::with_capacity(record_size(values.len()));
    data.extend_from_slice(&(values.len() as u64).to_le_bytes());
    data.extend_from_slice(&time_enabled.to_le_bytes());
    data.extend_from_slice(&time_running.to_le_bytes());
    for (value, id) in values {
        data.extend_from_slice(&value.to_le_bytes());
        data.extend_from_slice(&id.to_le_bytes());
    }
    data
}
