//! Per-subscription buffers and overflow policies.

use crate::destination::Destination;
use crate::error::StreamError;
use crate::message::IncomingMessage;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use tokio::sync::Notify;

/// Rule for handling data arriving faster than a subscriber consumes it.
///
/// Chosen per subscription; one subscriber's policy never affects another
/// subscriber of the same destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OverflowPolicy {
    /// Buffer everything
    #[default]
    Unbounded,
    /// Keep only the most recent pending message, dropping older ones
    LatestOnly,
    /// Reject new messages while the buffer is full
    DropNewest,
    /// Terminate the subscription with an overflow error when the buffer is full
    Fail,
}

impl OverflowPolicy {
    /// Get the snake_case name of the policy.
    pub fn as_str(&self) -> &'static str {
        match self {
            OverflowPolicy::Unbounded => "unbounded",
            OverflowPolicy::LatestOnly => "latest_only",
            OverflowPolicy::DropNewest => "drop_newest",
            OverflowPolicy::Fail => "fail",
        }
    }
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unbounded" | "buffer" => Ok(OverflowPolicy::Unbounded),
            "latest_only" | "latest" => Ok(OverflowPolicy::LatestOnly),
            "drop_newest" | "drop" => Ok(OverflowPolicy::DropNewest),
            "fail" | "error" => Ok(OverflowPolicy::Fail),
            other => Err(format!("unknown overflow policy '{}'", other)),
        }
    }
}

/// What happened to a message offered to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    /// Queued for the subscriber
    Accepted,
    /// Queued, replacing an older pending message
    Replaced,
    /// Discarded because the buffer was full
    Dropped,
    /// The buffer overflowed and the subscription was terminated
    Overflowed,
    /// The subscription has already ended
    Closed,
}

#[derive(Debug)]
enum StreamEnd {
    Completed,
    Failed(StreamError),
    Delivered,
}

#[derive(Debug, Default)]
struct BufferState {
    items: VecDeque<IncomingMessage<Bytes>>,
    end: Option<StreamEnd>,
    dropped: u64,
}

/// Single-consumer buffer owned by one subscription.
///
/// Producers never block: every push is decided immediately by the policy.
#[derive(Debug)]
pub(crate) struct SubscriberBuffer {
    destination: Destination,
    policy: OverflowPolicy,
    capacity: usize,
    state: Mutex<BufferState>,
    notify: Notify,
}

impl SubscriberBuffer {
    pub(crate) fn new(destination: Destination, policy: OverflowPolicy, capacity: usize) -> Self {
        Self {
            destination,
            policy,
            capacity: capacity.max(1),
            state: Mutex::new(BufferState::default()),
            notify: Notify::new(),
        }
    }

    pub(crate) fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub(crate) fn push(&self, message: IncomingMessage<Bytes>) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.end.is_some() {
                return PushOutcome::Closed;
            }

            match self.policy {
                OverflowPolicy::Unbounded => {
                    state.items.push_back(message);
                    PushOutcome::Accepted
                }
                OverflowPolicy::LatestOnly => {
                    let replaced = !state.items.is_empty();
                    if replaced {
                        state.dropped += state.items.len() as u64;
                        state.items.clear();
                    }
                    state.items.push_back(message);
                    if replaced {
                        PushOutcome::Replaced
                    } else {
                        PushOutcome::Accepted
                    }
                }
                OverflowPolicy::DropNewest => {
                    if state.items.len() >= self.capacity {
                        state.dropped += 1;
                        return PushOutcome::Dropped;
                    }
                    state.items.push_back(message);
                    PushOutcome::Accepted
                }
                OverflowPolicy::Fail => {
                    if state.items.len() >= self.capacity {
                        state.dropped += 1;
                        state.end = Some(StreamEnd::Failed(StreamError::Overflow {
                            destination: self.destination.clone(),
                            capacity: self.capacity,
                        }));
                        PushOutcome::Overflowed
                    } else {
                        state.items.push_back(message);
                        PushOutcome::Accepted
                    }
                }
            }
        };

        self.notify.notify_one();
        outcome
    }

    /// End the stream normally, discarding anything still pending.
    pub(crate) fn complete(&self) {
        {
            let mut state = self.state.lock();
            state.items.clear();
            if state.end.is_none() {
                state.end = Some(StreamEnd::Completed);
            }
        }
        self.notify.notify_one();
    }

    /// End the stream with a terminal error, after pending messages drain.
    pub(crate) fn fail(&self, error: StreamError) {
        {
            let mut state = self.state.lock();
            if state.end.is_none() {
                state.end = Some(StreamEnd::Failed(error));
            }
        }
        self.notify.notify_one();
    }

    /// Take the next item without waiting.
    ///
    /// `None` means nothing is available yet; `Some(None)` means the stream
    /// has ended.
    pub(crate) fn poll_next(&self) -> Option<Option<Result<IncomingMessage<Bytes>, StreamError>>> {
        let mut state = self.state.lock();
        if let Some(message) = state.items.pop_front() {
            return Some(Some(Ok(message)));
        }

        match state.end.take() {
            None => None,
            Some(StreamEnd::Completed) | Some(StreamEnd::Delivered) => {
                state.end = Some(StreamEnd::Delivered);
                Some(None)
            }
            Some(StreamEnd::Failed(error)) => {
                state.end = Some(StreamEnd::Delivered);
                Some(Some(Err(error)))
            }
        }
    }

    pub(crate) async fn recv(&self) -> Option<Result<IncomingMessage<Bytes>, StreamError>> {
        loop {
            if let Some(next) = self.poll_next() {
                return next;
            }
            // notify_one keeps a permit when nobody waits, so a push between
            // poll_next and here is not lost.
            self.notify.notified().await;
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.state.lock().end.is_some()
    }
}
