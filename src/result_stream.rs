//! The result stream abstraction.
//!
//! A result stream is the channel between the protocol decoder and the
//! consumer of a submitted statement: a lazy iterator of [`Record`]s plus the
//! result metadata (field names) and the failure state of the statement.
//!
//! [`ResultStream`] is the capability set every stream implementation
//! provides. [`RunStream`] is the live implementation, fed by the connection
//! driver through a bounded event channel; [`ErrorStream`] is a
//! pre-materialised failure for statements that never reached the server.

use std::collections::HashMap;
use std::sync::Weak;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{FailureKind, StreamError};
use crate::record::{Record, RowCell};
use crate::value::Value;

/// How many decoded records may sit between the decoder and the consumer
/// before the decoder is held back.
pub(crate) const RECORD_BUFFER_CAPACITY: usize = 64;

/// An event pushed by the connection driver into a stream.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    /// The statement was accepted; carries the result field names.
    Header(Vec<String>),
    /// One decoded record, in server-emission order.
    Record(Vec<Value>),
    /// The stream completed; carries the summary metadata.
    End(HashMap<String, Value>),
    /// The stream failed. Terminal; no further events follow.
    Fail(StreamError),
}

/// A request sent from a stream back to its connection driver.
#[derive(Debug)]
pub(crate) enum ControlRequest {
    /// Abort the statement: stop forwarding records and discard the rest.
    Discard,
}

/// The operations every result stream supports.
///
/// A stream is single-consumer: all methods take `&mut self` and records are
/// delivered exactly once, in server-emission order. Failures are sticky:
/// once a stream has failed, every subsequent operation reports the same
/// failure (records buffered before the failure remain fetchable first).
#[async_trait]
pub trait ResultStream: Send {
    /// Checks if the stream has failed.
    ///
    /// Returns `None` while the stream is healthy. Never blocks.
    fn check_failure(&self) -> Option<FailureKind>;

    /// The error code sent by the server.
    ///
    /// Only present when [`check_failure`](ResultStream::check_failure)
    /// reports [`FailureKind::StatementEvaluationFailed`].
    fn error_code(&self) -> Option<&str>;

    /// The error message sent by the server.
    ///
    /// Same availability as [`error_code`](ResultStream::error_code).
    fn error_message(&self) -> Option<&str>;

    /// The number of fields in each record.
    ///
    /// Blocks until the result header has been decoded or the stream fails.
    async fn nfields(&mut self) -> Result<usize, StreamError>;

    /// The name of the `index`-th result field.
    ///
    /// Blocks like [`nfields`](ResultStream::nfields). An out-of-range index
    /// is an error and does not poison the stream.
    async fn fieldname(&mut self, index: usize) -> Result<&str, StreamError>;

    /// Fetches the next record.
    ///
    /// Returns `None` once the stream is exhausted; further calls keep
    /// returning `None`. Advancing invalidates the previously returned
    /// record unless it was retained.
    async fn fetch_next(&mut self) -> Result<Option<Record>, StreamError>;

    /// Closes the stream.
    ///
    /// Aborts the underlying request (best effort), drains buffered records
    /// and invalidates every record and value obtained from this stream,
    /// retained or not.
    async fn close(&mut self) -> Result<(), StreamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    HeaderPending,
    Streaming,
    Ended,
    Failed,
    Closed,
}

/// A live result stream over a submitted statement.
///
/// Produced by [`BoltStream::run`](crate::BoltStream::run). The connection
/// driver decodes server messages into events; this type owns the consumer
/// half: state machine, record lifetimes and the close protocol.
#[derive(Debug)]
pub struct RunStream {
    events: mpsc::Receiver<StreamEvent>,
    control: mpsc::Sender<ControlRequest>,
    state: State,
    fields: Option<Vec<String>>,
    summary: Option<HashMap<String, Value>>,
    failure: Option<StreamError>,
    current: Option<Weak<RowCell>>,
    handed: Vec<Weak<RowCell>>,
}

impl RunStream {
    pub(crate) fn new(
        events: mpsc::Receiver<StreamEvent>,
        control: mpsc::Sender<ControlRequest>,
    ) -> Self {
        RunStream {
            events,
            control,
            state: State::HeaderPending,
            fields: None,
            summary: None,
            failure: None,
            current: None,
            handed: Vec::new(),
        }
    }

    /// The summary metadata sent when the stream completed, if it has.
    pub fn summary(&self) -> Option<&HashMap<String, Value>> {
        self.summary.as_ref()
    }

    fn fail(&mut self, err: StreamError) -> StreamError {
        debug!(error = %err, "result stream failed");
        self.state = State::Failed;
        self.failure = Some(err.clone());
        err
    }

    fn retire_current(&mut self) {
        if let Some(cell) = self.current.take().and_then(|weak| weak.upgrade()) {
            cell.mark_passed();
        }
    }

    async fn await_header(&mut self) -> Result<(), StreamError> {
        if self.fields.is_some() {
            return Ok(());
        }
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if self.state == State::Closed {
            return Err(StreamError::Closed);
        }

        match self.events.recv().await {
            Some(StreamEvent::Header(fields)) => {
                self.fields = Some(fields);
                Ok(())
            }
            Some(StreamEvent::Fail(err)) => Err(self.fail(err)),
            Some(event) => {
                let err =
                    StreamError::Protocol(format!("expected result header, got {event:?}"));
                Err(self.fail(err))
            }
            None => Err(self.fail(StreamError::ConnectionClosed)),
        }
    }
}

#[async_trait]
impl ResultStream for RunStream {
    fn check_failure(&self) -> Option<FailureKind> {
        self.failure.as_ref().and_then(StreamError::kind)
    }

    fn error_code(&self) -> Option<&str> {
        match &self.failure {
            Some(StreamError::Server(failure)) => Some(failure.code()),
            _ => None,
        }
    }

    fn error_message(&self) -> Option<&str> {
        match &self.failure {
            Some(StreamError::Server(failure)) => Some(failure.message()),
            _ => None,
        }
    }

    async fn nfields(&mut self) -> Result<usize, StreamError> {
        self.await_header().await?;
        Ok(self.fields.as_ref().map(Vec::len).unwrap_or(0))
    }

    async fn fieldname(&mut self, index: usize) -> Result<&str, StreamError> {
        self.await_header().await?;
        let fields = self.fields.as_deref().unwrap_or_default();
        fields
            .get(index)
            .map(String::as_str)
            .ok_or(StreamError::FieldOutOfRange {
                index,
                nfields: fields.len(),
            })
    }

    async fn fetch_next(&mut self) -> Result<Option<Record>, StreamError> {
        match self.state {
            State::Closed => return Err(StreamError::Closed),
            State::Ended => return Ok(None),
            State::Failed => {
                let err = self.failure.clone().unwrap_or(StreamError::Closed);
                return Err(err);
            }
            State::HeaderPending | State::Streaming => {}
        }

        self.retire_current();

        loop {
            match self.events.recv().await {
                Some(StreamEvent::Header(fields)) => {
                    if self.fields.is_none() {
                        self.fields = Some(fields);
                    }
                }
                Some(StreamEvent::Record(values)) => {
                    self.state = State::Streaming;
                    let record = Record::new(values);
                    self.current = Some(record.downgrade());
                    self.handed.push(record.downgrade());
                    return Ok(Some(record));
                }
                Some(StreamEvent::End(summary)) => {
                    self.state = State::Ended;
                    self.summary = Some(summary);
                    return Ok(None);
                }
                Some(StreamEvent::Fail(err)) => return Err(self.fail(err)),
                None => return Err(self.fail(StreamError::ConnectionClosed)),
            }
        }
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        if self.state == State::Closed {
            return Ok(());
        }

        // Ask the driver to abort the request. It may have exited already,
        // in which case there is nothing left to abort.
        let _ = self.control.try_send(ControlRequest::Discard);

        // Refuse further events and drain what is buffered so the driver is
        // never left blocked on a full channel.
        self.events.close();
        while self.events.recv().await.is_some() {}

        self.retire_current();
        for cell in self.handed.drain(..) {
            if let Some(cell) = cell.upgrade() {
                cell.invalidate();
            }
        }

        debug!("result stream closed");
        self.state = State::Closed;
        Ok(())
    }
}

/// A stream that failed before any server response was received.
///
/// Used when statement submission itself fails: the consumer gets a stream
/// whose every operation reports the recorded failure.
#[derive(Debug)]
pub struct ErrorStream {
    failure: StreamError,
    closed: bool,
}

impl ErrorStream {
    pub fn new(failure: StreamError) -> Self {
        ErrorStream {
            failure,
            closed: false,
        }
    }
}

#[async_trait]
impl ResultStream for ErrorStream {
    fn check_failure(&self) -> Option<FailureKind> {
        self.failure.kind()
    }

    fn error_code(&self) -> Option<&str> {
        match &self.failure {
            StreamError::Server(failure) => Some(failure.code()),
            _ => None,
        }
    }

    fn error_message(&self) -> Option<&str> {
        match &self.failure {
            StreamError::Server(failure) => Some(failure.message()),
            _ => None,
        }
    }

    async fn nfields(&mut self) -> Result<usize, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        Err(self.failure.clone())
    }

    async fn fieldname(&mut self, _index: usize) -> Result<&str, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        Err(self.failure.clone())
    }

    async fn fetch_next(&mut self) -> Result<Option<Record>, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        Err(self.failure.clone())
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.closed = true;
        Ok(())
    }
}
