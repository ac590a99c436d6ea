//! In-memory loopback transport.

use parking_lot::Mutex;
use reactive_messaging::{Destination, InboundSink, TransportAdapter, TransportError, TransportMessage};
use std::collections::{HashMap, HashSet};

#[derive(Default)]
struct TransportState {
    sinks: HashMap<Destination, InboundSink>,
    connects: HashMap<Destination, usize>,
    disconnects: HashMap<Destination, usize>,
    sent: Vec<(Destination, TransportMessage)>,
    refuse_connect: HashSet<Destination>,
    refuse_send: HashSet<Destination>,
    violations: Vec<String>,
}

/// Transport that keeps everything in process.
///
/// `send` records the message and, if the destination is connected, delivers
/// it to that connection right away, so a client and a server on the same
/// transport talk to each other. Connection lifecycle calls are counted per
/// destination, and a connect for an already connected destination (or a
/// disconnect for one that is not connected) is recorded as a violation.
///
/// # Example
///
/// ```rust,ignore
/// let transport = Arc::new(InMemoryTransport::new());
/// let multiplexer = Multiplexer::with_transport(transport.clone());
///
/// let mut sub = multiplexer.subscribe("quotes", OverflowPolicy::Unbounded);
/// transport.inject("quotes", TransportMessage::new("1.25"));
///
/// assert_eq!(transport.connect_count("quotes"), 1);
/// ```
#[derive(Default)]
pub struct InMemoryTransport {
    state: Mutex<TransportState>,
}

impl InMemoryTransport {
    /// Create a new transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an inbound message on `destination`'s open connection.
    ///
    /// Returns `false` if the destination is not connected.
    pub fn inject(&self, destination: impl Into<Destination>, message: TransportMessage) -> bool {
        let destination = destination.into();
        let sink = self.state.lock().sinks.get(&destination).cloned();
        match sink {
            Some(sink) => {
                sink.deliver(message);
                true
            }
            None => false,
        }
    }

    /// Drop `destination`'s connection as if the peer went away.
    ///
    /// Returns `false` if the destination is not connected.
    pub fn lose_connection(&self, destination: impl Into<Destination>, reason: &str) -> bool {
        let destination = destination.into();
        let sink = self.state.lock().sinks.get(&destination).cloned();
        match sink {
            Some(sink) => {
                sink.fail(TransportError::connection_lost(&destination, reason));
                true
            }
            None => false,
        }
    }

    /// Make connects to `destination` fail until cleared.
    pub fn refuse_connect(&self, destination: impl Into<Destination>, refuse: bool) {
        let destination = destination.into();
        let mut state = self.state.lock();
        if refuse {
            state.refuse_connect.insert(destination);
        } else {
            state.refuse_connect.remove(&destination);
        }
    }

    /// Make sends to `destination` fail until cleared.
    pub fn refuse_send(&self, destination: impl Into<Destination>, refuse: bool) {
        let destination = destination.into();
        let mut state = self.state.lock();
        if refuse {
            state.refuse_send.insert(destination);
        } else {
            state.refuse_send.remove(&destination);
        }
    }

    /// Check if `destination` has an open connection.
    pub fn is_connected(&self, destination: impl Into<Destination>) -> bool {
        self.state.lock().sinks.contains_key(&destination.into())
    }

    /// Number of successful connects for `destination`.
    pub fn connect_count(&self, destination: impl Into<Destination>) -> usize {
        let destination = destination.into();
        self.state.lock().connects.get(&destination).copied().unwrap_or(0)
    }

    /// Number of disconnects for `destination`.
    pub fn disconnect_count(&self, destination: impl Into<Destination>) -> usize {
        let destination = destination.into();
        self.state.lock().disconnects.get(&destination).copied().unwrap_or(0)
    }

    /// Messages sent to `destination`, in order.
    pub fn sent_to(&self, destination: impl Into<Destination>) -> Vec<TransportMessage> {
        let destination = destination.into();
        self.state
            .lock()
            .sent
            .iter()
            .filter(|(dest, _)| *dest == destination)
            .map(|(_, message)| message.clone())
            .collect()
    }

    /// Total number of messages sent.
    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    /// Lifecycle contract violations seen so far.
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().violations.clone()
    }
}

impl TransportAdapter for InMemoryTransport {
    fn connect(&self, destination: &Destination, inbound: InboundSink) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.refuse_connect.contains(destination) {
            return Err(TransportError::connect(destination, "connection refused"));
        }
        if state.sinks.contains_key(destination) {
            state
                .violations
                .push(format!("connect for already connected destination {}", destination));
        }
        state.sinks.insert(destination.clone(), inbound);
        *state.connects.entry(destination.clone()).or_default() += 1;
        tracing::trace!(destination = %destination, "in-memory connect");
        Ok(())
    }

    fn disconnect(&self, destination: &Destination) {
        let mut state = self.state.lock();
        if state.sinks.remove(destination).is_none() {
            state
                .violations
                .push(format!("disconnect for unconnected destination {}", destination));
        }
        *state.disconnects.entry(destination.clone()).or_default() += 1;
        tracing::trace!(destination = %destination, "in-memory disconnect");
    }

    fn send(&self, destination: &Destination, message: TransportMessage) -> Result<(), TransportError> {
        let sink = {
            let mut state = self.state.lock();
            if state.refuse_send.contains(destination) {
                return Err(TransportError::send(destination, "send refused"));
            }
            state.sent.push((destination.clone(), message.clone()));
            state.sinks.get(destination).cloned()
        };

        // Delivery happens outside the lock; the receiving side may send again.
        if let Some(sink) = sink {
            sink.deliver(message);
        }
        Ok(())
    }
}
