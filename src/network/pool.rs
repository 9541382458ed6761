//! TCP connection pool
//!
//! Accepts incoming peer connections, dials outgoing ones and runs one
//! reader and one writer task per socket. Readers decode frames, run the
//! inbound handler and push messages onto the bounded ready queue; writers
//! drain a bounded per-connection queue.

use crate::daemon::connections::ConnectionRegistry;
use crate::network::codec::FrameCodec;
use crate::network::disconnect::DisconnectReason;
use crate::network::message::{DisconnectMessage, Message};
use crate::network::registry::MessageRegistry;
use crate::network::transport::{
    ConnectionEvent, DaemonSenders, DialFailure, InboundHandler, ReadyMessage, Transport,
    TransportError,
};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// How long a closing connection waits for its goodbye to be written
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Pool settings
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Incoming connections are refused past this many registered connections
    pub max_connections: usize,
    pub write_queue_size: usize,
    pub dial_timeout: Duration,
    pub max_message_length: usize,
}

enum Outbound {
    Message(Message),
    Close(DisconnectReason),
}

struct WriterHandle {
    tx: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    /// Reason given by `disconnect`, reported once the worker exits
    closing: Option<DisconnectReason>,
}

struct PoolInner {
    config: PoolConfig,
    connections: Arc<ConnectionRegistry>,
    codec: FrameCodec,
    handler: Arc<dyn InboundHandler>,
    senders: DaemonSenders,
    writers: Mutex<HashMap<String, WriterHandle>>,
    shutdown: CancellationToken,
}

/// TCP implementation of [`Transport`]
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        connections: Arc<ConnectionRegistry>,
        messages: Arc<MessageRegistry>,
        handler: Arc<dyn InboundHandler>,
        senders: DaemonSenders,
    ) -> Self {
        let codec = FrameCodec::new(messages, config.max_message_length);
        Self {
            inner: Arc::new(PoolInner {
                config,
                connections,
                codec,
                handler,
                senders,
                writers: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Bind `addr` and start accepting peers. Returns the bound address.
    pub async fn listen(&self, addr: &str) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        log::info!("Listening for peers on {}", local);

        let inner = self.inner.clone();
        tokio::spawn(async move { inner.accept_loop(listener).await });
        Ok(local)
    }

    /// Number of sockets with a running writer
    pub fn open_len(&self) -> usize {
        self.inner.writers.lock().len()
    }
}

impl PoolInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        if self.connections.len() >= self.config.max_connections {
                            log::info!(
                                "Refusing {}: {} connections open",
                                addr,
                                self.config.max_connections
                            );
                            continue;
                        }
                        log::debug!("Incoming connection from {}", addr);
                        let inner = self.clone();
                        tokio::spawn(async move {
                            inner.run_connection(stream, addr.to_string(), false).await
                        });
                    }
                    Err(e) => log::error!("Accept error: {}", e),
                }
            }
        }
        log::debug!("Accept loop stopped");
    }

    async fn dial(self: Arc<Self>, addr: String) {
        match timeout(self.config.dial_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => self.run_connection(stream, addr, true).await,
            Ok(Err(e)) => self.report_dial_failure(addr, e.into()).await,
            Err(_) => {
                let error = TransportError::DialTimeout(addr.clone());
                self.report_dial_failure(addr, error).await
            }
        }
    }

    async fn report_dial_failure(&self, addr: String, error: TransportError) {
        log::debug!("Failed to connect to {}: {}", addr, error);
        let _ = self
            .senders
            .dial_failures
            .send(DialFailure { addr, error })
            .await;
    }

    /// Drive one socket until it closes, then report why
    async fn run_connection(self: Arc<Self>, stream: TcpStream, addr: String, outgoing: bool) {
        if let Err(e) = self.connections.connected(&addr) {
            log::warn!("Dropping connection {}: {}", addr, e);
            return;
        }

        let cancel = self.shutdown.child_token();
        let (tx, mut rx) = mpsc::channel(self.config.write_queue_size);
        self.writers.lock().insert(
            addr.clone(),
            WriterHandle {
                tx: tx.clone(),
                cancel: cancel.clone(),
                closing: None,
            },
        );

        let (mut sink, mut frames) = Framed::new(stream, self.codec.clone()).split();

        let peer = addr.clone();
        let mut writer = tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                match outbound {
                    Outbound::Message(message) => {
                        if let Err(e) = sink.send(message).await {
                            log::debug!("Failed to write to {}: {}", peer, e);
                            return Some(DisconnectReason::FailedSend);
                        }
                    }
                    Outbound::Close(reason) => {
                        if reason.notify_peer() {
                            let goodbye = Message::Disconnect(DisconnectMessage {
                                reason: reason.code(),
                                reserved: Vec::new(),
                            });
                            let _ = sink.send(goodbye).await;
                        }
                        let _ = sink.close().await;
                        return Some(reason);
                    }
                }
            }
            None
        });

        let event = ConnectionEvent::Connected {
            addr: addr.clone(),
            outgoing,
        };
        if self.senders.events.send(event).await.is_err() {
            cancel.cancel();
        }

        let mut writer_done = false;
        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break DisconnectReason::PoolShutdown,
                written = &mut writer => {
                    writer_done = true;
                    break written.ok().flatten().unwrap_or(DisconnectReason::FailedSend);
                }
                frame = frames.next() => match frame {
                    Some(Ok(message)) => {
                        if let Err(reason) = self.handler.handle(&addr, &message) {
                            break reason;
                        }
                        let ready = ReadyMessage { addr: addr.clone(), message };
                        tokio::select! {
                            _ = cancel.cancelled() => break DisconnectReason::PoolShutdown,
                            sent = self.senders.ready.send(ready) => {
                                if sent.is_err() {
                                    break DisconnectReason::PoolShutdown;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        log::debug!("Failed to read from {}: {}", addr, e);
                        break DisconnectReason::from_wire_error(&e);
                    }
                    None => break DisconnectReason::ReadFailed,
                }
            }
        };

        let closing = self.writers.lock().remove(&addr).and_then(|h| h.closing);
        let reason = closing.unwrap_or(reason);

        if !writer_done {
            if tx.try_send(Outbound::Close(reason)).is_ok() {
                let _ = timeout(CLOSE_LINGER, &mut writer).await;
            }
            writer.abort();
        }

        log::info!("Connection {} closed: {}", addr, reason);
        let _ = self
            .senders
            .events
            .send(ConnectionEvent::Disconnected { addr, reason })
            .await;
    }
}

impl Transport for ConnectionPool {
    fn dial(&self, addr: &str) -> Result<(), TransportError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.inner.connections.pending(addr)?;

        log::debug!("Dialing {}", addr);
        let inner = self.inner.clone();
        tokio::spawn(inner.dial(addr.to_string()));
        Ok(())
    }

    fn send(&self, addr: &str, message: Message) -> Result<(), TransportError> {
        let writers = self.inner.writers.lock();
        let handle = writers
            .get(addr)
            .ok_or_else(|| TransportError::NotConnected(addr.to_string()))?;

        handle
            .tx
            .try_send(Outbound::Message(message))
            .map_err(|e| match e {
                TrySendError::Full(_) => TransportError::QueueFull(addr.to_string()),
                TrySendError::Closed(_) => TransportError::NotConnected(addr.to_string()),
            })
    }

    fn disconnect(&self, addr: &str, reason: DisconnectReason) {
        let mut writers = self.inner.writers.lock();
        let Some(handle) = writers.get_mut(addr) else {
            log::debug!("Disconnect {}: not connected", addr);
            return;
        };
        if handle.closing.is_some() {
            return;
        }

        handle.closing = Some(reason);
        if handle.tx.try_send(Outbound::Close(reason)).is_err() {
            handle.cancel.cancel();
        }
    }

    fn shutdown(&self) {
        log::info!("Shutting down connection pool");
        self.inner.shutdown.cancel();
    }
}
