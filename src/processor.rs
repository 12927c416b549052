//! Request processing.
//!
//! A [`Processor`] performs one request/response cycle per call: it reads a request
//! envelope from the input protocol, dispatches it to application code, and writes the
//! response envelope to the output protocol. Servers call it in a loop for as long as it
//! returns `Ok(true)`.
//!
//! # Failure handling
//!
//! Whether a connection survives a failure depends on where the failure happened:
//!
//! - The peer ended the stream between requests: `Ok(false)`, an orderly close.
//! - The envelope itself could not be read, including a stream that ends partway
//!   through it: [`ProcessError::Framing`]. Nothing sensible can be written back, so the
//!   server drops the connection.
//! - The arguments were malformed but fully consumed, or the method failed: an
//!   `Exception` envelope carrying an [`ApplicationError`] is written and the connection
//!   stays open.
//! - The stream broke mid-message: [`ProcessError::Protocol`], connection dropped.
//!
//! # Key Components
//!
//! - [`Processor`]: the contract servers drive.
//! - [`MethodProcessor`]: dispatches calls by method name to registered [`Handler`]s.
//! - [`ApplicationError`]: the error payload sent back to clients.
use std::collections::HashMap;

use log::{debug, trace, warn};
use thiserror::Error;

use crate::protocol::{
    FieldHeader, MessageHeader, MessageKind, Protocol, ProtocolError, ValueType, skip,
};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("malformed message envelope: {0}")]
    Framing(#[source] ProtocolError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ProcessError {
    pub fn is_end_of_stream(&self) -> bool {
        match self {
            ProcessError::Framing(e) | ProcessError::Protocol(e) => e.is_end_of_stream(),
        }
    }
}

/// Binds a protocol pair to application logic.
///
/// Implementations are shared between worker threads and must not rely on being called
/// from any particular thread.
pub trait Processor: Send + Sync {
    /// Serves one request. Returns `Ok(false)` when the session should end.
    fn process(
        &self,
        input: &mut dyn Protocol,
        output: &mut dyn Protocol,
    ) -> Result<bool, ProcessError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationErrorKind {
    Unknown,
    UnknownMethod,
    InvalidMessageKind,
    WrongMethodName,
    BadSequenceId,
    MissingResult,
    InternalError,
    ProtocolError,
}

impl From<ApplicationErrorKind> for i32 {
    fn from(kind: ApplicationErrorKind) -> Self {
        match kind {
            ApplicationErrorKind::Unknown => 0,
            ApplicationErrorKind::UnknownMethod => 1,
            ApplicationErrorKind::InvalidMessageKind => 2,
            ApplicationErrorKind::WrongMethodName => 3,
            ApplicationErrorKind::BadSequenceId => 4,
            ApplicationErrorKind::MissingResult => 5,
            ApplicationErrorKind::InternalError => 6,
            ApplicationErrorKind::ProtocolError => 7,
        }
    }
}

impl From<i32> for ApplicationErrorKind {
    fn from(code: i32) -> Self {
        match code {
            1 => ApplicationErrorKind::UnknownMethod,
            2 => ApplicationErrorKind::InvalidMessageKind,
            3 => ApplicationErrorKind::WrongMethodName,
            4 => ApplicationErrorKind::BadSequenceId,
            5 => ApplicationErrorKind::MissingResult,
            6 => ApplicationErrorKind::InternalError,
            7 => ApplicationErrorKind::ProtocolError,
            _ => ApplicationErrorKind::Unknown,
        }
    }
}

/// Error reported to the client inside an `Exception` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct ApplicationError {
    pub kind: ApplicationErrorKind,
    pub message: String,
}

impl ApplicationError {
    pub fn new(kind: ApplicationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn write(&self, output: &mut dyn Protocol) -> Result<(), ProtocolError> {
        output.write_struct_begin("ApplicationError")?;
        output.write_field_begin(ValueType::String, 1)?;
        output.write_string(&self.message)?;
        output.write_field_end()?;
        output.write_field_begin(ValueType::I32, 2)?;
        output.write_i32(self.kind.into())?;
        output.write_field_end()?;
        output.write_field_stop()?;
        output.write_struct_end()
    }

    pub fn read(input: &mut dyn Protocol) -> Result<Self, ProtocolError> {
        let mut err = ApplicationError::new(ApplicationErrorKind::Unknown, "");
        read_struct(input, |input, field| match (field.id, field.ty) {
            (1, ValueType::String) => {
                err.message = input.read_string()?;
                Ok(true)
            }
            (2, ValueType::I32) => {
                err.kind = input.read_i32()?.into();
                Ok(true)
            }
            _ => Ok(false),
        })?;
        Ok(err)
    }
}

/// Reads one struct, handing each field to `on_field`. Fields for which `on_field`
/// returns `false` are skipped, so unknown or mistyped fields leave the stream in sync.
pub fn read_struct<F>(input: &mut dyn Protocol, mut on_field: F) -> Result<(), ProtocolError>
where
    F: FnMut(&mut dyn Protocol, FieldHeader) -> Result<bool, ProtocolError>,
{
    input.read_struct_begin()?;
    loop {
        let field = input.read_field_begin()?;
        if field.is_stop() {
            break;
        }
        if !on_field(input, field)? {
            skip(input, field.ty)?;
        }
        input.read_field_end()?;
    }
    input.read_struct_end()
}

type ReplyWriter = Box<dyn FnOnce(&mut dyn Protocol) -> Result<(), ProtocolError> + Send>;

/// Deferred writer for a method's result struct.
pub struct Reply(ReplyWriter);

impl Reply {
    pub fn new<F>(write: F) -> Self
    where
        F: FnOnce(&mut dyn Protocol) -> Result<(), ProtocolError> + Send + 'static,
    {
        Self(Box::new(write))
    }

    /// Result of a method with no return value.
    pub fn empty() -> Self {
        Self::new(|output| {
            output.write_struct_begin("result")?;
            output.write_field_stop()?;
            output.write_struct_end()
        })
    }

    pub fn write(self, output: &mut dyn Protocol) -> Result<(), ProtocolError> {
        (self.0)(output)
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    /// Arguments were read completely but are unusable.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error(transparent)]
    Application(#[from] ApplicationError),
    /// The input stream is no longer usable.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One service method: decodes its argument struct and runs.
pub trait Handler: Send + Sync {
    fn call(&self, args: &mut dyn Protocol) -> Result<Reply, HandlerError>;
}

impl<F> Handler for F
where
    F: Fn(&mut dyn Protocol) -> Result<Reply, HandlerError> + Send + Sync,
{
    fn call(&self, args: &mut dyn Protocol) -> Result<Reply, HandlerError> {
        self(args)
    }
}

/// Processor that routes calls to handlers by method name.
pub struct MethodProcessor {
    service: String,
    methods: HashMap<String, Box<dyn Handler>>,
}

impl MethodProcessor {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            methods: HashMap::new(),
        }
    }

    pub fn method<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut dyn Protocol) -> Result<Reply, HandlerError> + Send + Sync + 'static,
    {
        self.handler(name, handler)
    }

    pub fn handler(mut self, name: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.methods.insert(name.into(), Box::new(handler));
        self
    }

    fn write_exception(
        &self,
        output: &mut dyn Protocol,
        request: &MessageHeader,
        err: &ApplicationError,
    ) -> Result<(), ProtocolError> {
        debug!(
            "{}.{} #{} failed: {err}",
            self.service, request.name, request.seq_id
        );
        let header = MessageHeader::new(
            request.name.clone(),
            MessageKind::Exception,
            request.seq_id,
        );
        output.write_message_begin(&header)?;
        err.write(output)?;
        output.write_message_end()?;
        output.flush()
    }
}

impl Processor for MethodProcessor {
    fn process(
        &self,
        input: &mut dyn Protocol,
        output: &mut dyn Protocol,
    ) -> Result<bool, ProcessError> {
        let request = match input.read_message_begin() {
            Ok(header) => header,
            Err(e) if e.is_end_of_stream() => return Ok(false),
            Err(e) => return Err(ProcessError::Framing(e)),
        };
        trace!(
            "{}.{} #{} ({:?})",
            self.service, request.name, request.seq_id, request.kind
        );

        let oneway = match request.kind {
            MessageKind::Call => false,
            MessageKind::Oneway => true,
            kind => {
                return Err(ProcessError::Framing(ProtocolError::InvalidData(format!(
                    "expected a call, got {kind:?}"
                ))));
            }
        };

        let Some(handler) = self.methods.get(&request.name) else {
            skip(input, ValueType::Struct)?;
            input.read_message_end()?;
            if !oneway {
                let err = ApplicationError::new(
                    ApplicationErrorKind::UnknownMethod,
                    format!("unknown method '{}'", request.name),
                );
                self.write_exception(output, &request, &err)?;
            }
            return Ok(true);
        };

        let err = match handler.call(input) {
            Ok(reply) => {
                input.read_message_end()?;
                if oneway {
                    return Ok(true);
                }
                let header =
                    MessageHeader::new(request.name.clone(), MessageKind::Reply, request.seq_id);
                output.write_message_begin(&header)?;
                reply.write(output)?;
                output.write_message_end()?;
                output.flush()?;
                return Ok(true);
            }
            Err(HandlerError::Protocol(e)) => return Err(e.into()),
            Err(HandlerError::InvalidArguments(reason)) => {
                warn!("{}.{}: {reason}", self.service, request.name);
                ApplicationError::new(ApplicationErrorKind::ProtocolError, reason)
            }
            Err(HandlerError::Application(e)) => e,
        };

        input.read_message_end()?;
        if !oneway {
            self.write_exception(output, &request, &err)?;
        }
        Ok(true)
    }
}
