//! Length-delimited frames over any byte stream.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::{Connection, ConnectionState, TransportError};

/// Largest accepted frame.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// A [`Connection`] speaking length-prefixed frames over a stream.
pub struct FramedConnection<S> {
    remote: String,
    framed: Framed<S, LengthDelimitedCodec>,
    state: watch::Sender<ConnectionState>,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    /// Wrap an established stream.
    pub fn new(stream: S, remote: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self::with_state(stream, remote, state)
    }

    /// Wrap an established stream, reporting on an existing state channel.
    pub fn with_state(
        stream: S,
        remote: impl Into<String>,
        state: watch::Sender<ConnectionState>,
    ) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        state.send_replace(ConnectionState::Connected);
        Self {
            remote: remote.into(),
            framed: Framed::new(stream, codec),
            state,
        }
    }

    fn is_closed(&self) -> bool {
        *self.state.borrow() == ConnectionState::Disconnected
    }

    fn mark_disconnected(&self) {
        if !self.is_closed() {
            self.state.send_replace(ConnectionState::Disconnected);
            tracing::debug!(remote = %self.remote, "connection disconnected");
        }
    }
}

#[async_trait]
impl<S> Connection for FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Sync,
{
    fn remote(&self) -> &str {
        &self.remote
    }

    fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn send(&mut self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if let Err(e) = self.framed.send(frame).await {
            self.mark_disconnected();
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Bytes, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(frame.freeze()),
            Some(Err(e)) => {
                self.mark_disconnected();
                Err(TransportError::Io(e))
            }
            None => {
                self.mark_disconnected();
                Err(TransportError::Closed)
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.is_closed() {
            return;
        }
        if let Err(e) = SinkExt::<Bytes>::close(&mut self.framed).await {
            tracing::debug!(remote = %self.remote, error = %e, "error while closing connection");
        }
        self.mark_disconnected();
    }
}
