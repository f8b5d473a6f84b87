//! Chat selection state machine for chatsync.
//!
//! This module provides a pure, side-effect-free state machine for the
//! lifecycle of the selected chat: load, live streaming, resync after a
//! dropped subscription, and teardown. The state machine takes events as
//! input and produces a new state plus a list of actions to execute.
//!
//! Every subscribe/fetch cycle runs under an epoch handed in by the caller.
//! Results tagged with any other epoch are ignored, so a fetch that
//! completes after the user moved on cannot touch the new selection.
//!
//! The actual I/O (fetching, subscribing) is performed by chatsync-client,
//! not by this module.

use std::time::Duration;

use chatsync_types::{ChatId, SyncError};

/// Default number of resync attempts before giving up.
pub const DEFAULT_MAX_RESYNC_ATTEMPTS: u32 = 5;

/// Resync retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncPolicy {
    /// Attempts before the selection moves to `Error`.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles per attempt.
    pub base_delay: Duration,
    /// Upper bound on the exponential part of the delay.
    pub max_delay: Duration,
}

impl Default for ResyncPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RESYNC_ATTEMPTS,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ResyncPolicy {
    /// Delay after the given failed attempt.
    ///
    /// Formula: min(max_delay, base_delay * 2^(attempt-1)) + random(0..=base_delay)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let jitter_cap = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        base + Duration::from_millis(random_jitter_ms(jitter_cap))
    }
}

/// Selection state machine - NO I/O, just state transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionState {
    /// No chat selected.
    Unselected,
    /// Initial fetch in progress.
    Loading {
        /// Selected chat.
        chat_id: ChatId,
        /// Current subscribe/fetch cycle.
        epoch: u64,
    },
    /// Window loaded and streaming.
    Live {
        /// Selected chat.
        chat_id: ChatId,
        /// Current subscribe/fetch cycle.
        epoch: u64,
    },
    /// A stream dropped; resubscribing and refetching.
    Resyncing {
        /// Selected chat.
        chat_id: ChatId,
        /// Current subscribe/fetch cycle.
        epoch: u64,
        /// Resync attempt, starting at 1.
        attempt: u32,
    },
    /// Load or resync failed for good. Selecting the chat again retries.
    Error {
        /// Selected chat.
        chat_id: ChatId,
        /// Last failure.
        error: SyncError,
    },
}

impl SelectionState {
    /// Create a new state machine in the Unselected state.
    pub fn new() -> Self {
        Self::Unselected
    }

    /// Process an event and return the new state plus actions to execute.
    ///
    /// This is a pure function - no side effects.
    pub fn on_event(self, event: Event, policy: &ResyncPolicy) -> (Self, Vec<Action>) {
        match (self, event) {
            // Selecting the chat that is already active
            (
                state @ (Self::Loading { .. } | Self::Live { .. } | Self::Resyncing { .. }),
                Event::SelectRequested { chat_id, .. },
            ) if state.chat_id() == Some(chat_id) => (state, vec![]),

            (state, Event::SelectRequested { chat_id, epoch }) => {
                let mut actions = state.teardown_actions();
                actions.extend([
                    Action::Subscribe { chat_id, epoch },
                    Action::FetchMessages { chat_id, epoch },
                    Action::EmitEvent(EngineEvent::Selected { chat_id }),
                ]);
                (Self::Loading { chat_id, epoch }, actions)
            }

            // From Loading
            (Self::Loading { chat_id, epoch }, Event::LoadSucceeded { epoch: e }) if e == epoch => (
                Self::Live { chat_id, epoch },
                vec![Action::EmitEvent(EngineEvent::Live { chat_id })],
            ),
            (Self::Loading { chat_id, epoch }, Event::LoadFailed { epoch: e, error })
                if e == epoch =>
            {
                (
                    Self::Error {
                        chat_id,
                        error: error.clone(),
                    },
                    vec![
                        Action::Unsubscribe,
                        Action::DiscardWindow,
                        Action::EmitEvent(EngineEvent::SelectionFailed { chat_id, error }),
                    ],
                )
            }
            (Self::Loading { chat_id, .. }, Event::SubscriptionLost { next_epoch, .. }) => (
                Self::Loading {
                    chat_id,
                    epoch: next_epoch,
                },
                resubscribe(chat_id, next_epoch),
            ),

            // From Live
            (Self::Live { chat_id, .. }, Event::SubscriptionLost { reason, next_epoch }) => {
                let mut actions = vec![Action::EmitEvent(EngineEvent::Resyncing {
                    chat_id,
                    attempt: 1,
                    reason,
                })];
                actions.extend(resubscribe(chat_id, next_epoch));
                (
                    Self::Resyncing {
                        chat_id,
                        epoch: next_epoch,
                        attempt: 1,
                    },
                    actions,
                )
            }

            // From Resyncing
            (Self::Resyncing { chat_id, epoch, .. }, Event::LoadSucceeded { epoch: e })
                if e == epoch =>
            {
                (
                    Self::Live { chat_id, epoch },
                    vec![Action::EmitEvent(EngineEvent::Resynced { chat_id })],
                )
            }
            (
                Self::Resyncing {
                    chat_id,
                    epoch,
                    attempt,
                },
                Event::LoadFailed { epoch: e, error },
            ) if e == epoch => {
                if attempt >= policy.max_attempts {
                    (
                        Self::Error {
                            chat_id,
                            error: error.clone(),
                        },
                        vec![
                            Action::Unsubscribe,
                            Action::DiscardWindow,
                            Action::EmitEvent(EngineEvent::SelectionFailed { chat_id, error }),
                        ],
                    )
                } else {
                    (
                        Self::Resyncing {
                            chat_id,
                            epoch,
                            attempt: attempt.saturating_add(1),
                        },
                        vec![
                            Action::Unsubscribe,
                            Action::EmitEvent(EngineEvent::ResyncFailed {
                                chat_id,
                                attempt,
                                error,
                            }),
                            Action::StartResyncTimer {
                                delay: policy.backoff(attempt),
                            },
                        ],
                    )
                }
            }
            (Self::Resyncing { chat_id, attempt, .. }, Event::RetryTimer { next_epoch }) => (
                Self::Resyncing {
                    chat_id,
                    epoch: next_epoch,
                    attempt,
                },
                vec![
                    Action::Subscribe {
                        chat_id,
                        epoch: next_epoch,
                    },
                    Action::FetchMessages {
                        chat_id,
                        epoch: next_epoch,
                    },
                ],
            ),
            (
                Self::Resyncing {
                    chat_id, attempt, ..
                },
                Event::SubscriptionLost { next_epoch, .. },
            ) => (
                Self::Resyncing {
                    chat_id,
                    epoch: next_epoch,
                    attempt,
                },
                vec![
                    Action::CancelResyncTimer,
                    Action::Unsubscribe,
                    Action::Subscribe {
                        chat_id,
                        epoch: next_epoch,
                    },
                    Action::FetchMessages {
                        chat_id,
                        epoch: next_epoch,
                    },
                ],
            ),

            // Teardown
            (Self::Unselected, Event::DeselectRequested) => (Self::Unselected, vec![]),
            (state, Event::DeselectRequested) => {
                let chat_id = state.chat_id();
                let mut actions = state.teardown_actions();
                if let Some(chat_id) = chat_id {
                    actions.push(Action::EmitEvent(EngineEvent::Deselected { chat_id }));
                }
                (Self::Unselected, actions)
            }

            // Stale results and invalid transitions - stay in current state
            (state, _) => (state, vec![]),
        }
    }

    /// The selected chat, if any.
    pub fn chat_id(&self) -> Option<ChatId> {
        match self {
            Self::Unselected => None,
            Self::Loading { chat_id, .. }
            | Self::Live { chat_id, .. }
            | Self::Resyncing { chat_id, .. }
            | Self::Error { chat_id, .. } => Some(*chat_id),
        }
    }

    /// The current subscribe/fetch cycle, if one is active.
    pub fn epoch(&self) -> Option<u64> {
        match self {
            Self::Loading { epoch, .. }
            | Self::Live { epoch, .. }
            | Self::Resyncing { epoch, .. } => Some(*epoch),
            Self::Unselected | Self::Error { .. } => None,
        }
    }

    /// Check if the selected chat is live.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Live { .. })
    }

    /// Check if a fetch for the selection is outstanding.
    pub fn is_syncing(&self) -> bool {
        matches!(self, Self::Loading { .. } | Self::Resyncing { .. })
    }

    fn teardown_actions(&self) -> Vec<Action> {
        match self {
            Self::Unselected | Self::Error { .. } => vec![Action::DiscardWindow],
            Self::Loading { .. } | Self::Live { .. } => {
                vec![Action::Unsubscribe, Action::DiscardWindow]
            }
            Self::Resyncing { .. } => vec![
                Action::CancelResyncTimer,
                Action::Unsubscribe,
                Action::DiscardWindow,
            ],
        }
    }
}

impl Default for SelectionState {
    fn default() -> Self {
        Self::new()
    }
}

fn resubscribe(chat_id: ChatId, epoch: u64) -> Vec<Action> {
    vec![
        Action::Unsubscribe,
        Action::Subscribe { chat_id, epoch },
        Action::FetchMessages { chat_id, epoch },
    ]
}

/// Events that can occur in the selection lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// User selected a chat. `epoch` must be fresh.
    SelectRequested {
        /// Chat to select.
        chat_id: ChatId,
        /// Epoch for the new cycle.
        epoch: u64,
    },
    /// Message fetch returned.
    LoadSucceeded {
        /// Epoch the fetch ran under.
        epoch: u64,
    },
    /// Message fetch failed.
    LoadFailed {
        /// Epoch the fetch ran under.
        epoch: u64,
        /// The failure.
        error: SyncError,
    },
    /// A change stream of the current cycle dropped.
    SubscriptionLost {
        /// Transport error message.
        reason: String,
        /// Epoch for the replacement cycle.
        next_epoch: u64,
    },
    /// Resync timer fired.
    RetryTimer {
        /// Epoch for the replacement cycle.
        next_epoch: u64,
    },
    /// User cleared the selection.
    DeselectRequested,
}

/// Actions to be executed by the engine.
///
/// These are instructions, not side effects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Open message, reaction and typing streams for the chat.
    Subscribe {
        /// Chat to stream.
        chat_id: ChatId,
        /// Epoch the stream pumps run under.
        epoch: u64,
    },
    /// Close all streams of the selection.
    Unsubscribe,
    /// Fetch the full message window.
    FetchMessages {
        /// Chat to fetch.
        chat_id: ChatId,
        /// Epoch the fetch runs under.
        epoch: u64,
    },
    /// Drop the message window.
    DiscardWindow,
    /// Start a timer for the next resync attempt.
    StartResyncTimer {
        /// Delay before the next attempt.
        delay: Duration,
    },
    /// Cancel any pending resync timer.
    CancelResyncTimer,
    /// Emit an event to the application.
    EmitEvent(EngineEvent),
}

/// Events emitted to the application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A chat was selected and is loading.
    Selected {
        /// Selected chat.
        chat_id: ChatId,
    },
    /// The selected chat finished loading.
    Live {
        /// Selected chat.
        chat_id: ChatId,
    },
    /// A stream dropped and resync started.
    Resyncing {
        /// Selected chat.
        chat_id: ChatId,
        /// Attempt number.
        attempt: u32,
        /// Transport error message.
        reason: String,
    },
    /// A resync attempt failed; another is scheduled.
    ResyncFailed {
        /// Selected chat.
        chat_id: ChatId,
        /// Attempt that failed.
        attempt: u32,
        /// The failure.
        error: SyncError,
    },
    /// The selected chat is live again after a resync.
    Resynced {
        /// Selected chat.
        chat_id: ChatId,
    },
    /// Load or resync failed for good.
    SelectionFailed {
        /// Selected chat.
        chat_id: ChatId,
        /// The failure.
        error: SyncError,
    },
    /// The selection was cleared.
    Deselected {
        /// Previously selected chat.
        chat_id: ChatId,
    },
}

/// Generate random jitter between 0 and `max` milliseconds.
fn random_jitter_ms(max: u64) -> u64 {
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return 0;
    }
    u64::from_le_bytes(bytes) % max.saturating_add(1)
}
