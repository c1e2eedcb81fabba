//! Frames that have been sent and whose deadline has not been reclaimed.
//!
//! This table is the only state shared between the outbound and inbound
//! flows. Register, resolve, sweep and drain each hold the lock for their
//! whole critical section, so an entry is never observed half-registered.
//!
//! An answered entry stays in the table until its deadline passes. A
//! ModelServer may restate a result, and a restatement that arrives in time
//! is as usable as the first answer.
//!
//! An entry that expires unanswered is reported once and then kept as a
//! tombstone for the late window, so a result that trails the sweep is
//! still recognised as late.

use crate::error::LinkError;
use crate::message::Identifier;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::time::{Duration, Instant};

/// Stand-in for deadlines too large to represent as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

pub const DEFAULT_LATE_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Sent, no answer yet.
    Pending,
    /// Answered at least once before the deadline.
    Answered,
    /// Reported as expired; only kept to classify a trailing result.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutstandingEntry {
    pub identifier: Identifier,
    pub deadline: Instant,
    pub sent_at: Instant,
    pub state: EntryState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Arrived at or before the deadline.
    OnTime { latency: Duration },
    /// Arrived after the deadline of a frame that was never answered, within
    /// the late window.
    Late { overdue: Duration },
    /// Nothing outstanding under that identifier, or a restatement of a
    /// frame whose deadline has already passed.
    Unmatched,
}

#[derive(Debug, Default)]
struct Entries {
    map: HashMap<Identifier, OutstandingEntry>,
    closed: bool,
}

#[derive(Debug)]
pub struct OutstandingTable {
    entries: Mutex<Entries>,
    late_window: Duration,
}

impl Default for OutstandingTable {
    fn default() -> Self {
        Self::with_late_window(DEFAULT_LATE_WINDOW)
    }
}

impl OutstandingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_late_window(late_window: Duration) -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            late_window,
        }
    }

    /// Fails with `DuplicateIdentifier` while an entry for the identifier is
    /// pending or answered. A tombstone is replaced.
    pub fn register(
        &self,
        identifier: Identifier,
        deadline: Duration,
        now: Instant,
    ) -> Result<OutstandingEntry, LinkError> {
        let mut entries = self.entries.lock();
        if entries.closed {
            return Err(LinkError::Connection("session is closed".to_string()));
        }
        if let Some(existing) = entries.map.get(&identifier) {
            if existing.state != EntryState::Expired {
                return Err(LinkError::DuplicateIdentifier(identifier));
            }
        }
        let entry = OutstandingEntry {
            identifier,
            deadline: now
                .checked_add(deadline)
                .unwrap_or_else(|| now + FAR_FUTURE),
            sent_at: now,
            state: EntryState::Pending,
        };
        entries.map.insert(identifier, entry);
        Ok(entry)
    }

    /// Removes the entry for a frame that never reached the wire.
    pub fn withdraw(&self, identifier: &Identifier) -> Option<OutstandingEntry> {
        self.entries.lock().map.remove(identifier)
    }

    pub fn resolve(&self, identifier: &Identifier, now: Instant) -> Resolution {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.map.get_mut(identifier) else {
            return Resolution::Unmatched;
        };

        if entry.state != EntryState::Expired && now <= entry.deadline {
            entry.state = EntryState::Answered;
            return Resolution::OnTime {
                latency: now.saturating_duration_since(entry.sent_at),
            };
        }

        let entry = *entry;
        entries.map.remove(identifier);
        match entry.state {
            EntryState::Answered => Resolution::Unmatched,
            EntryState::Pending | EntryState::Expired => Resolution::Late {
                overdue: now.saturating_duration_since(entry.deadline),
            },
        }
    }

    /// Returns every pending entry whose deadline has passed, oldest deadline
    /// first. Each is reported once and left behind as a tombstone; answered
    /// entries past their deadline and tombstones past the late window are
    /// dropped.
    pub fn sweep(&self, now: Instant) -> Vec<OutstandingEntry> {
        let late_window = self.late_window;
        let mut expired = Vec::new();
        self.entries.lock().map.retain(|_, entry| {
            if entry.deadline >= now {
                return true;
            }
            match entry.state {
                EntryState::Pending => {
                    entry.state = EntryState::Expired;
                    expired.push(*entry);
                    true
                }
                EntryState::Answered => false,
                EntryState::Expired => {
                    now.saturating_duration_since(entry.deadline) <= late_window
                }
            }
        });
        expired.sort_by_key(|entry| entry.deadline);
        expired
    }

    /// Empties the table for connection teardown, returning the pending
    /// entries. Nothing can be registered afterwards.
    pub fn drain(&self) -> Vec<OutstandingEntry> {
        let mut entries = self.entries.lock();
        entries.closed = true;
        let mut drained: Vec<_> = entries
            .map
            .drain()
            .map(|(_, entry)| entry)
            .filter(|entry| entry.state == EntryState::Pending)
            .collect();
        drained.sort_by_key(|entry| entry.deadline);
        drained
    }

    /// Number of frames still waiting for their first answer.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .map
            .values()
            .filter(|entry| entry.state == EntryState::Pending)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
