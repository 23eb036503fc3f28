//! Lifecycle enums shared by the store and the engine.
//!
//! Each enum round-trips through its snake_case string form, which is what
//! the store writes to TEXT columns.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {}: {other}", stringify!($name))),
                }
            }
        }
    };
}

/// Protocol state of one wake cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeState {
    HelloReceived,
    AckSent,
    CaptureRequested,
    MetadataReceived,
    CollectingChunks,
    Complete,
    Failed,
    Timeout,
    SleepOnly,
}

string_enum!(WakeState {
    HelloReceived => "hello_received",
    AckSent => "ack_sent",
    CaptureRequested => "capture_requested",
    MetadataReceived => "metadata_received",
    CollectingChunks => "collecting_chunks",
    Complete => "complete",
    Failed => "failed",
    Timeout => "timeout",
    SleepOnly => "sleep_only",
});

impl WakeState {
    pub const NON_TERMINAL: [WakeState; 5] = [
        WakeState::HelloReceived,
        WakeState::AckSent,
        WakeState::CaptureRequested,
        WakeState::MetadataReceived,
        WakeState::CollectingChunks,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::Timeout | Self::SleepOnly
        )
    }

    /// Terminal states a retry may be queued from.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::Timeout)
    }

    /// Forward transitions of the wake protocol. Every non-terminal state may
    /// fall to `failed` or `timeout`; terminal states only move through an
    /// explicit retry reset, which is checked by [`WakeState::can_reset_for_retry`].
    pub fn can_transition_to(self, next: WakeState) -> bool {
        use WakeState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed | Timeout) {
            return true;
        }
        matches!(
            (self, next),
            (HelloReceived, AckSent)
                | (HelloReceived, SleepOnly)
                | (AckSent, CaptureRequested)
                | (CaptureRequested, MetadataReceived)
                | (MetadataReceived, CollectingChunks)
                | (MetadataReceived, Complete)
                | (CollectingChunks, Complete)
        )
    }

    pub fn can_reset_for_retry(self) -> bool {
        self.is_failure()
    }
}

/// Status of a chunk reassembly buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferStatus {
    Receiving,
    Complete,
    Failed,
    Timeout,
}

string_enum!(BufferStatus {
    Receiving => "receiving",
    Complete => "complete",
    Failed => "failed",
    Timeout => "timeout",
});

/// Status of a site-day session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    InProgress,
    Locked,
}

string_enum!(SessionStatus {
    InProgress => "in_progress",
    Locked => "locked",
});

/// How a finished wake cycle counts toward its session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakeOutcome {
    Completed,
    Failed,
    Overage,
}

string_enum!(WakeOutcome {
    Completed => "completed",
    Failed => "failed",
    Overage => "overage",
});

/// Lifecycle of a queued retry command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    Pending,
    Dispatched,
    Expired,
}

string_enum!(RetryStatus {
    Pending => "pending",
    Dispatched => "dispatched",
    Expired => "expired",
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_state_string_roundtrip() {
        for state in [
            WakeState::HelloReceived,
            WakeState::AckSent,
            WakeState::CaptureRequested,
            WakeState::MetadataReceived,
            WakeState::CollectingChunks,
            WakeState::Complete,
            WakeState::Failed,
            WakeState::Timeout,
            WakeState::SleepOnly,
        ] {
            assert_eq!(state.as_str().parse::<WakeState>().unwrap(), state);
        }
        assert!("bogus".parse::<WakeState>().is_err());
    }

    #[test]
    fn happy_path_transitions_allowed() {
        use WakeState::*;
        let path = [
            HelloReceived,
            AckSent,
            CaptureRequested,
            MetadataReceived,
            CollectingChunks,
            Complete,
        ];
        for w in path.windows(2) {
            assert!(w[0].can_transition_to(w[1]), "{} -> {}", w[0], w[1]);
        }
    }

    #[test]
    fn backwards_transitions_rejected() {
        use WakeState::*;
        assert!(!CollectingChunks.can_transition_to(CaptureRequested));
        assert!(!MetadataReceived.can_transition_to(HelloReceived));
        assert!(!CaptureRequested.can_transition_to(SleepOnly));
    }

    #[test]
    fn terminal_states_are_sticky() {
        use WakeState::*;
        for terminal in [Complete, Failed, Timeout, SleepOnly] {
            assert!(terminal.is_terminal());
            for next in WakeState::NON_TERMINAL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn any_non_terminal_can_fail_or_time_out() {
        for state in WakeState::NON_TERMINAL {
            assert!(state.can_transition_to(WakeState::Failed));
            assert!(state.can_transition_to(WakeState::Timeout));
        }
    }

    #[test]
    fn only_failures_reset_for_retry() {
        assert!(WakeState::Failed.can_reset_for_retry());
        assert!(WakeState::Timeout.can_reset_for_retry());
        assert!(!WakeState::Complete.can_reset_for_retry());
        assert!(!WakeState::SleepOnly.can_reset_for_retry());
    }

    #[test]
    fn outcome_and_status_strings() {
        assert_eq!(WakeOutcome::Overage.to_string(), "overage");
        assert_eq!("locked".parse::<SessionStatus>().unwrap(), SessionStatus::Locked);
        assert_eq!(BufferStatus::Receiving.as_str(), "receiving");
        assert_eq!("expired".parse::<RetryStatus>().unwrap(), RetryStatus::Expired);
    }
}
