//! Retry Policy
//!
//! Bounded, constant-delay retry decisions shared by reconnects, descriptor
//! writes and control characteristic reads/writes. The policy only decides;
//! scheduling the delayed retry and resetting counters is the caller's job.

use crate::domain::settings::{RetryLimit, RetrySettings};
use std::fmt;
use std::time::Duration;

/// Operation kinds with independent retry budgets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Reconnect,
    DescriptorWrite,
    CharacteristicRead,
    CharacteristicWrite,
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        Self::Reconnect,
        Self::DescriptorWrite,
        Self::CharacteristicRead,
        Self::CharacteristicWrite,
    ];

    fn index(self) -> usize {
        match self {
            Self::Reconnect => 0,
            Self::DescriptorWrite => 1,
            Self::CharacteristicRead => 2,
            Self::CharacteristicWrite => 3,
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Reconnect => "reconnect",
            Self::DescriptorWrite => "descriptor write",
            Self::CharacteristicRead => "characteristic read",
            Self::CharacteristicWrite => "characteristic write",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Exhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    limits: [RetryLimit; 4],
}

impl RetryPolicy {
    pub fn new(settings: &RetrySettings) -> Self {
        Self {
            limits: [
                settings.reconnect,
                settings.descriptor_write,
                settings.characteristic_read,
                settings.characteristic_write,
            ],
        }
    }

    pub fn limit(&self, kind: OperationKind) -> RetryLimit {
        self.limits[kind.index()]
    }

    /// Decide whether failure number `attempts + 1` of `kind` may be retried
    pub fn should_retry(&self, kind: OperationKind, attempts: u32) -> RetryDecision {
        let limit = self.limit(kind);
        if attempts < limit.max_attempts {
            RetryDecision::RetryAfter(limit.delay())
        } else {
            RetryDecision::Exhausted
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetrySettings::default())
    }
}

/// Per-kind failure counters. Kinds never share state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryCounters {
    attempts: [u32; 4],
}

impl RetryCounters {
    pub fn get(&self, kind: OperationKind) -> u32 {
        self.attempts[kind.index()]
    }

    pub fn reset(&mut self, kind: OperationKind) {
        self.attempts[kind.index()] = 0;
    }

    pub fn reset_all(&mut self) {
        self.attempts = [0; 4];
    }

    /// Consult `policy` for a fresh failure of `kind`.
    ///
    /// Returns the delay before the retry and counts the attempt, or `None`
    /// once the bound is reached. The counter never passes the bound.
    pub fn next_retry(&mut self, policy: &RetryPolicy, kind: OperationKind) -> Option<Duration> {
        match policy.should_retry(kind, self.get(kind)) {
            RetryDecision::RetryAfter(delay) => {
                self.attempts[kind.index()] += 1;
                Some(delay)
            }
            RetryDecision::Exhausted => None,
        }
    }
}
