//! Sortable message-id generation.
//!
//! Ids look like `20260210-051902-0003`: UTC second plus a four-digit
//! sequence within that second. Lexicographic order on the id string equals
//! the generation order within one process, and filenames carry the
//! timestamp so directory scans can be bounded without parsing file bodies.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Mutex;
use thiserror::Error;

/// Highest sequence number that fits the fixed four-digit counter.
pub const MAX_SEQUENCE: u32 = 9_999;

/// The per-second counter overflowed; retry after the wall clock advances.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("message id sequence exhausted within second {second}")]
pub struct SequenceExhausted {
    /// The second (formatted `YYYYMMDD-HHMMSS`) that ran out of ids.
    pub second: String,
}

/// Wall clock supplying UTC time. A plain function pointer so tests can pin
/// the clock without pulling in a mocking layer.
pub type Clock = fn() -> DateTime<Utc>;

#[derive(Debug)]
struct IdState {
    last_second: i64,
    counter: u32,
}

/// Thread-safe, monotonic id generator. One per process, passed explicitly
/// to the components that need it.
#[derive(Debug)]
pub struct IdGenerator {
    state: Mutex<IdState>,
    clock: Clock,
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerator {
    /// Generator backed by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Utc::now)
    }

    /// Generator backed by an injected clock (tests, replay tooling).
    pub fn with_clock(clock: Clock) -> Self {
        Self {
            state: Mutex::new(IdState {
                last_second: i64::MIN,
                counter: 0,
            }),
            clock,
        }
    }

    /// Produce the next id.
    ///
    /// When the clock has advanced past the last observed second the counter
    /// resets to 1; otherwise it increments, which also covers a clock that
    /// stepped backwards (ids keep ascending within the old second).
    pub fn next_id(&self) -> Result<String, SequenceExhausted> {
        let now = (self.clock)().timestamp();
        let mut state = self.state.lock().expect("id generator lock poisoned");
        if now > state.last_second {
            state.last_second = now;
            state.counter = 1;
        } else {
            state.counter = state.counter.saturating_add(1);
        }
        if state.counter > MAX_SEQUENCE {
            return Err(SequenceExhausted {
                second: format_second(state.last_second),
            });
        }
        Ok(format!(
            "{}-{:04}",
            format_second(state.last_second),
            state.counter
        ))
    }
}

fn format_second(epoch: i64) -> String {
    match Utc.timestamp_opt(epoch, 0).single() {
        Some(t) => t.format("%Y%m%d-%H%M%S").to_string(),
        None => "00000000-000000".to_string(),
    }
}

/// True if `s` has the `YYYYMMDD-HHMMSS-NNNN` shape of a message id.
pub fn is_message_id(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 20 || bytes[8] != b'-' || bytes[15] != b'-' {
        return false;
    }
    bytes
        .iter()
        .enumerate()
        .all(|(i, b)| matches!(i, 8 | 15) || b.is_ascii_digit())
}

/// RFC3339 timestamp (second resolution) carried by a message id, or `None`
/// for malformed input. The id is authoritative for ordering; this is the
/// human-readable echo stored in the record.
pub fn id_timestamp_rfc3339(id: &str) -> Option<String> {
    if !is_message_id(id) {
        return None;
    }
    Some(format!(
        "{}-{}-{}T{}:{}:{}Z",
        &id[0..4],
        &id[4..6],
        &id[6..8],
        &id[9..11],
        &id[11..13],
        &id[13..15]
    ))
}

/// Lexicographic lower bound for ids generated at or after `t`.
pub fn id_floor(t: DateTime<Utc>) -> String {
    format!("{}-0000", t.format("%Y%m%d-%H%M%S"))
}
