//! Distributed timestamps: a `(time, id)` pair with a total order that every
//! node computes the same way, without synchronized clocks.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// When and where an action was produced.
///
/// Ordered by `time`, then by the byte-wise lexical order of `id`.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DistributedTimestamp {
    /// Milliseconds since the Unix epoch, as seen by the producing node.
    pub time: u64,
    /// Globally unique; contains the producing node's identifier.
    pub id: String,
}

impl DistributedTimestamp {
    pub fn new(time: u64, id: impl Into<String>) -> Self {
        Self {
            time,
            id: id.into(),
        }
    }

    /// True if `self` sorts strictly before `other`.
    pub fn is_earlier_than(&self, other: &DistributedTimestamp) -> bool {
        is_earlier(self, other)
    }
}

impl Ord for DistributedTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.id.as_bytes().cmp(other.id.as_bytes()))
    }
}

impl PartialOrd for DistributedTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for DistributedTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ts({}, {:?})", self.time, self.id)
    }
}

/// Strict total order on timestamps: earlier `time` wins, equal times fall
/// back to the `id` tie-break.
pub fn is_earlier(a: &DistributedTimestamp, b: &DistributedTimestamp) -> bool {
    a.cmp(b) == Ordering::Less
}

struct ClockState {
    last_time: u64,
    seq: u64,
}

/// Produces strictly increasing timestamps for a single node.
pub struct TimestampClock {
    node: String,
    state: Mutex<ClockState>,
}

impl TimestampClock {
    pub fn new(node: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            state: Mutex::new(ClockState {
                last_time: 0,
                seq: 0,
            }),
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Next timestamp. `time` never repeats or goes backwards on this node,
    /// even if the wall clock does.
    pub fn now(&self) -> DistributedTimestamp {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut state = self.state.lock();
        let time = wall.max(state.last_time + 1);
        state.last_time = time;
        state.seq += 1;

        DistributedTimestamp {
            time,
            id: format!("{} {} {}", time, self.node, state.seq),
        }
    }
}
