//! Transport interface between the event loop and the socket layer
//!
//! The event loop only ever talks to peers through [`Transport`]. Everything
//! the socket layer reports back arrives on one of three bounded queues,
//! created together by [`daemon_channels`].

use crate::daemon::connections::ConnectionError;
use crate::network::disconnect::DisconnectReason;
use crate::network::message::Message;
use thiserror::Error;
use tokio::sync::mpsc;

/// Transport errors
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Dial to {0} timed out")]
    DialTimeout(String),
    #[error("Not connected to {0}")]
    NotConnected(String),
    #[error("Write queue for {0} is full")]
    QueueFull(String),
    #[error("Registry error: {0}")]
    Registry(#[from] ConnectionError),
    #[error("Transport is shut down")]
    Closed,
}

/// Connection lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        addr: String,
        outgoing: bool,
    },
    Disconnected {
        addr: String,
        reason: DisconnectReason,
    },
}

/// An outgoing dial that never produced a connection
#[derive(Debug)]
pub struct DialFailure {
    pub addr: String,
    pub error: TransportError,
}

/// A message that passed `handle` and waits for `process`
#[derive(Debug, Clone)]
pub struct ReadyMessage {
    pub addr: String,
    pub message: Message,
}

/// Checks run on a connection's reading task before a message is queued.
/// An error closes the connection with that reason.
pub trait InboundHandler: Send + Sync + 'static {
    fn handle(&self, addr: &str, message: &Message) -> Result<(), DisconnectReason>;
}

/// Socket layer as seen from the event loop
pub trait Transport: Send + Sync {
    /// Start dialing `addr`. The outcome arrives as a `Connected` event or a
    /// [`DialFailure`].
    fn dial(&self, addr: &str) -> Result<(), TransportError>;

    /// Queue `message` for `addr` without waiting for the socket
    fn send(&self, addr: &str, message: Message) -> Result<(), TransportError>;

    /// Close `addr`, telling the peer why when the reason allows it. The
    /// matching `Disconnected` event follows once the connection is gone.
    fn disconnect(&self, addr: &str, reason: DisconnectReason);

    /// Close every connection and stop accepting new ones
    fn shutdown(&self);
}

/// Producer side of the daemon queues, held by the transport
#[derive(Debug, Clone)]
pub struct DaemonSenders {
    pub ready: mpsc::Sender<ReadyMessage>,
    pub events: mpsc::Sender<ConnectionEvent>,
    pub dial_failures: mpsc::Sender<DialFailure>,
}

/// Consumer side of the daemon queues, owned by the event loop
#[derive(Debug)]
pub struct DaemonReceivers {
    pub ready: mpsc::Receiver<ReadyMessage>,
    pub events: mpsc::Receiver<ConnectionEvent>,
    pub dial_failures: mpsc::Receiver<DialFailure>,
}

/// Create the bounded queues feeding the event loop
pub fn daemon_channels(
    ready_capacity: usize,
    event_capacity: usize,
    dial_failure_capacity: usize,
) -> (DaemonSenders, DaemonReceivers) {
    let (ready_tx, ready_rx) = mpsc::channel(ready_capacity);
    let (events_tx, events_rx) = mpsc::channel(event_capacity);
    let (dial_tx, dial_rx) = mpsc::channel(dial_failure_capacity);

    (
        DaemonSenders {
            ready: ready_tx,
            events: events_tx,
            dial_failures: dial_tx,
        },
        DaemonReceivers {
            ready: ready_rx,
            events: events_rx,
            dial_failures: dial_rx,
        },
    )
}
