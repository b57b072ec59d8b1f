//! The buffered protocol stream and the per-statement connection driver.

use std::collections::HashMap;
use std::io::{Read, Write};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{ServerFailure, StreamError};
use crate::messages::{backend, frontend};
use crate::packstream;
use crate::result_stream::{ControlRequest, RunStream, StreamEvent, RECORD_BUFFER_CAPACITY};
use crate::value::Value;

/// A low level protocol stream with buffered message building.
///
/// Request messages are appended to an internal buffer via the `put_*`
/// methods and sent together on `flush`, minimizing syscalls.
pub struct BoltStream<S> {
    stream: S,
    buf: BytesMut,
}

impl<S> BoltStream<S> {
    /// Creates a new protocol stream from an underlying stream.
    pub fn from_stream(stream: S) -> Self {
        BoltStream {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Consumes the stream and returns the underlying stream and buffered data.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.buf.to_vec())
    }

    /// Writes raw bytes directly to the buffer without framing.
    pub fn put_bytes(&mut self, src: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(src);
        self
    }

    /// Adds an INIT message to the buffer.
    ///
    /// # Arguments
    ///
    /// * `user_agent` - Client identification, e.g. `"bolt_stream/0.1"`
    /// * `auth_token` - Authentication map (`scheme`, `principal`, ...)
    pub fn put_init(&mut self, user_agent: &str, auth_token: &HashMap<String, Value>) -> &mut Self {
        frontend::Signature::INIT.message(&mut self.buf, 2, |b| {
            packstream::encode_string(user_agent, b);
            packstream::encode_map(auth_token, b);
        });
        self
    }

    /// Adds a RUN message to the buffer, submitting a statement.
    ///
    /// # Arguments
    ///
    /// * `statement` - The statement text
    /// * `params` - Named statement parameters (empty map for none)
    pub fn put_run(&mut self, statement: &str, params: &HashMap<String, Value>) -> &mut Self {
        frontend::Signature::RUN.message(&mut self.buf, 2, |b| {
            packstream::encode_string(statement, b);
            packstream::encode_map(params, b);
        });
        self
    }

    /// Adds a PULL_ALL message to the buffer, requesting all records of the
    /// preceding RUN.
    pub fn put_pull_all(&mut self) -> &mut Self {
        frontend::Signature::PULL_ALL.message(&mut self.buf, 0, |_| {});
        self
    }

    /// Adds a DISCARD_ALL message to the buffer, dropping all records of the
    /// preceding RUN without transferring them.
    pub fn put_discard_all(&mut self) -> &mut Self {
        frontend::Signature::DISCARD_ALL.message(&mut self.buf, 0, |_| {});
        self
    }

    /// Adds an ACK_FAILURE message to the buffer, acknowledging a FAILURE so
    /// the server leaves its ignoring state.
    pub fn put_ack_failure(&mut self) -> &mut Self {
        frontend::Signature::ACK_FAILURE.message(&mut self.buf, 0, |_| {});
        self
    }

    /// Adds a RESET message to the buffer, returning the connection to a
    /// clean state regardless of what preceded it.
    pub fn put_reset(&mut self) -> &mut Self {
        frontend::Signature::RESET.message(&mut self.buf, 0, |_| {});
        self
    }
}

impl<S: Write> BoltStream<S> {
    /// Flushes the buffered messages to the stream (blocking).
    pub fn flush_blocking(&mut self) -> std::io::Result<()> {
        self.stream.write_all(&self.buf)?;
        self.buf.clear();
        self.stream.flush()
    }
}

impl<S: Read> BoltStream<S> {
    /// Reads a single response message from the stream (blocking).
    pub fn read_message_blocking(&mut self) -> std::io::Result<backend::BoltMessage> {
        backend::read_message_blocking(&mut self.stream)
    }
}

impl<S: AsyncWrite + Unpin> BoltStream<S> {
    /// Flushes the buffered messages to the stream.
    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.stream.write_all(&self.buf).await?;
        self.buf.clear();
        self.stream.flush().await
    }
}

impl<S: AsyncRead + Unpin> BoltStream<S> {
    /// Reads a single response message from the stream.
    pub async fn read_message(&mut self) -> std::io::Result<backend::BoltMessage> {
        backend::read_message(&mut self.stream).await
    }
}

impl<S> BoltStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Submits a statement and returns the result stream over its records.
    ///
    /// The connection is dedicated to the statement until the stream ends,
    /// fails, or is closed; there is no multiplexing. A task pumps decoded
    /// server messages into the stream through a bounded buffer, so a slow
    /// consumer holds the decoder back instead of buffering without limit.
    pub fn run(mut self, statement: impl Into<String>, params: HashMap<String, Value>) -> RunStream {
        let statement = statement.into();
        let (events_tx, events_rx) = mpsc::channel(RECORD_BUFFER_CAPACITY);
        let (control_tx, control_rx) = mpsc::channel(1);

        tokio::spawn(async move {
            self.put_run(&statement, &params);
            self.put_pull_all();
            if let Err(err) = drive(self, &events_tx, control_rx).await {
                let _ = events_tx.send(StreamEvent::Fail(err)).await;
            }
        });

        RunStream::new(events_rx, control_tx)
    }
}

/// Pumps server messages for one statement into the stream's event channel.
///
/// Returns `Ok` when the statement concluded (ended, failed with the failure
/// already delivered, or was aborted); transport and protocol errors are
/// returned for the caller to deliver as the stream failure.
async fn drive<S>(
    mut conn: BoltStream<S>,
    events: &mpsc::Sender<StreamEvent>,
    mut control: mpsc::Receiver<ControlRequest>,
) -> Result<(), StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = control.recv() => return Ok(()),
        res = conn.flush() => res?,
    }

    let mut header_seen = false;
    loop {
        let msg = tokio::select! {
            biased;
            _ = control.recv() => {
                abort(&mut conn).await;
                return Ok(());
            }
            msg = conn.read_message() => msg?,
        };

        match msg.signature {
            backend::Signature::SUCCESS if !header_seen => {
                header_seen = true;
                let fields = header_fields(&msg);
                if !deliver(events, &mut control, StreamEvent::Header(fields)).await {
                    abort(&mut conn).await;
                    return Ok(());
                }
            }
            backend::Signature::SUCCESS => {
                let summary = msg.metadata().cloned().unwrap_or_default();
                let _ = deliver(events, &mut control, StreamEvent::End(summary)).await;
                return Ok(());
            }
            backend::Signature::RECORD => {
                let values = msg.into_record_values().ok_or_else(|| {
                    StreamError::Protocol("malformed record message".to_string())
                })?;
                if !header_seen {
                    return Err(StreamError::Protocol(
                        "record arrived before the result header".to_string(),
                    ));
                }
                if !deliver(events, &mut control, StreamEvent::Record(values)).await {
                    abort(&mut conn).await;
                    return Ok(());
                }
            }
            backend::Signature::FAILURE => {
                let failure = ServerFailure::from_metadata(msg.metadata());
                acknowledge_failure(&mut conn).await;
                let _ = deliver(
                    events,
                    &mut control,
                    StreamEvent::Fail(StreamError::Server(failure)),
                )
                .await;
                return Ok(());
            }
            sig => {
                return Err(StreamError::Protocol(format!(
                    "unexpected message {sig} in result stream"
                )));
            }
        }
    }
}

/// Sends an event, watching for an abort request while the buffer is full.
///
/// Returns false when the stream asked for a discard or went away.
async fn deliver(
    events: &mpsc::Sender<StreamEvent>,
    control: &mut mpsc::Receiver<ControlRequest>,
    event: StreamEvent,
) -> bool {
    tokio::select! {
        biased;
        _ = control.recv() => false,
        res = events.send(event) => res.is_ok(),
    }
}

/// Acknowledges a FAILURE so the server stops ignoring requests, swallowing
/// the IGNORED responses of any requests that were already in flight.
async fn acknowledge_failure<S>(conn: &mut BoltStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.put_ack_failure();
    if let Err(err) = conn.flush().await {
        debug!(error = %err, "failed to send failure acknowledgement");
        return;
    }

    // At most one request (the PULL_ALL) can still be outstanding.
    for _ in 0..4 {
        match conn.read_message().await {
            Ok(msg) if msg.signature == backend::Signature::IGNORED => continue,
            Ok(_) => break,
            Err(err) => {
                debug!(error = %err, "failed reading failure acknowledgement");
                break;
            }
        }
    }
}

/// Best-effort abort of a statement mid-stream.
///
/// The connection is dropped after an abort, so no attempt is made to
/// resynchronise with the server beyond the reset request.
async fn abort<S>(conn: &mut BoltStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.buf.clear();
    conn.put_reset();
    if let Err(err) = conn.flush().await {
        debug!(error = %err, "failed to send reset during abort");
    }
}

fn header_fields(msg: &backend::BoltMessage) -> Vec<String> {
    match msg.metadata().and_then(|m| m.get("fields")) {
        Some(Value::List(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
