//! Message transport between an event subscriber and the validator.
//!
//! Frames messages with `events-proto` over a byte stream (TCP in
//! production) and pairs requests with responses by correlation id.
//!
//! ## Receive Model
//!
//! 1. Every read decodes all complete frames into an ordered inbox
//! 2. [`Transport::recv`] pops the oldest message, whatever its id
//! 3. [`Transport::recv_correlated`] removes the first message carrying the
//!    requested id and leaves everything else queued in arrival order
//!
//! Both receive calls only await on the socket read, so dropping the future
//! (e.g. from `tokio::select!`) never loses a decoded message.

use std::collections::VecDeque;
use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use events_proto::{CorrelationId, Decoder, ProtocolError, RawMessage};

const READ_BUF_SIZE: usize = 64 * 1024;

/// Errors returned by the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("framing error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection closed")]
    Closed,

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// A validator address of the form `tcp://host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn parse(address: &str) -> Result<Self, TransportError> {
        let url = url::Url::parse(address)
            .map_err(|e| TransportError::InvalidEndpoint(format!("{address}: {e}")))?;
        if url.scheme() != "tcp" {
            return Err(TransportError::InvalidEndpoint(format!(
                "{address}: unsupported scheme {:?}",
                url.scheme()
            )));
        }
        let host = match url.host() {
            Some(url::Host::Ipv6(addr)) => addr.to_string(),
            Some(host) => host.to_string(),
            None => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "{address}: missing host"
                )));
            }
        };
        let port = url
            .port()
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("{address}: missing port")))?;
        Ok(Self { host, port })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}

/// Request/response messaging with correlation ids.
#[async_trait]
pub trait Transport: Send {
    /// Send a message and return the correlation id its response will carry.
    ///
    /// A fresh id is issued unless `correlation_hint` is given.
    async fn send(
        &mut self,
        msg_type: u16,
        correlation_hint: Option<CorrelationId>,
        payload: &[u8],
    ) -> Result<CorrelationId, TransportError>;

    /// Receive the next message in arrival order.
    async fn recv(&mut self) -> Result<RawMessage, TransportError>;

    /// Receive the message carrying `id`, queueing any others.
    async fn recv_correlated(&mut self, id: &CorrelationId) -> Result<RawMessage, TransportError>;

    /// Release the connection. Calling it again is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;
}

/// Issue a new random correlation id.
pub fn new_correlation_id() -> CorrelationId {
    CorrelationId::new(uuid::Uuid::new_v4().to_string())
}

/// A framed connection over any async byte stream.
pub struct Connection<S = TcpStream> {
    stream: S,
    decoder: Decoder,
    /// Decoded messages not yet handed out, oldest first.
    inbox: VecDeque<RawMessage>,
    closed: bool,
    /// Reusable read buffer (avoids inflating async Future size).
    read_buf: Box<[u8; READ_BUF_SIZE]>,
}

impl Connection<TcpStream> {
    /// Open a TCP connection to the validator.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(%endpoint, "Connected to validator");
        Ok(Self::from_stream(stream))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn from_stream(stream: S) -> Self {
        Self {
            stream,
            decoder: Decoder::new(),
            inbox: VecDeque::new(),
            closed: false,
            read_buf: Box::new([0u8; READ_BUF_SIZE]),
        }
    }

    /// Number of received messages not yet handed out.
    pub fn queued(&self) -> usize {
        self.inbox.len()
    }

    /// Send a message without a correlation id (server push).
    pub async fn send_unsolicited(
        &mut self,
        msg_type: u16,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.write_frame(msg_type, None, payload).await
    }

    async fn write_frame(
        &mut self,
        msg_type: u16,
        correlation_id: Option<&CorrelationId>,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        let data = events_proto::encode(msg_type, correlation_id, payload)?;
        self.stream.write_all(&data).await?;
        Ok(())
    }

    /// Read one chunk from the stream and queue every complete message in it.
    async fn fill_inbox(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        // Frames decoded ahead of a bad one are already queued
        if let Some(e) = self.decoder.take_error() {
            return Err(e.into());
        }
        let n = self.stream.read(self.read_buf.as_mut()).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        let messages = self
            .decoder
            // n <= read_buf.len() is guaranteed by read()
            .decode(self.read_buf.get(..n).unwrap_or_default())?;
        self.inbox.extend(messages);
        Ok(())
    }
}

#[async_trait]
impl<S> Transport for Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(
        &mut self,
        msg_type: u16,
        correlation_hint: Option<CorrelationId>,
        payload: &[u8],
    ) -> Result<CorrelationId, TransportError> {
        let id = correlation_hint.unwrap_or_else(new_correlation_id);
        self.write_frame(msg_type, Some(&id), payload).await?;
        tracing::trace!(
            msg_type = events_proto::message_type_name(msg_type),
            correlation_id = %id,
            "Sent message"
        );
        Ok(id)
    }

    async fn recv(&mut self) -> Result<RawMessage, TransportError> {
        loop {
            if let Some(msg) = self.inbox.pop_front() {
                return Ok(msg);
            }
            self.fill_inbox().await?;
        }
    }

    async fn recv_correlated(&mut self, id: &CorrelationId) -> Result<RawMessage, TransportError> {
        loop {
            let found = self
                .inbox
                .iter()
                .position(|m| m.correlation_id.as_ref() == Some(id));
            if let Some(msg) = found.and_then(|pos| self.inbox.remove(pos)) {
                return Ok(msg);
            }
            self.fill_inbox().await?;
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream.shutdown().await?;
        Ok(())
    }
}
