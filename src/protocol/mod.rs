//! Typed values over a transport.
//!
//! A [`Protocol`] owns one [`Transport`] and turns typed values into bytes on it and
//! back. The serving core only depends on this contract; the concrete encoding is a
//! property of the protocol implementation, and two peers must simply agree on one.
//!
//! # Messages
//!
//! Every request and response is wrapped in an envelope described by a
//! [`MessageHeader`]: the method name, a [`MessageKind`] and a sequence id the client
//! uses to match replies. The body between `*_message_begin` and `*_message_end` is
//! normally one struct: the call arguments, the result, or an
//! [`ApplicationError`](crate::processor::ApplicationError).
//!
//! # Aggregates
//!
//! Structs are sequences of fields, each announced by a [`FieldHeader`] and terminated
//! by a [`ValueType::Stop`] marker. Lists, sets and maps announce their element types
//! and length up front. Because every aggregate is self-describing, [`skip`] can
//! discard any value without knowing its schema, which lets readers tolerate unknown
//! fields.
//!
//! # Key Components
//!
//! - [`Protocol`]: the encode/decode contract.
//! - [`ProtocolFactory`]: builds one protocol per connection half.
//! - [`BinaryProtocol`]: bincode-backed implementation.
mod binary;

use std::io;

use bincode::error::{DecodeError, EncodeError};
use thiserror::Error;

use crate::transport::{Transport, TransportError};

pub use binary::{BinaryProtocol, BinaryProtocolFactory, SIZE_LIMIT};

/// Deepest aggregate nesting [`skip`] will follow.
pub const MAX_SKIP_DEPTH: usize = 64;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("peer closed the stream")]
    EndOfStream,
    #[error("failed to encode value: {0}")]
    Encode(EncodeError),
    #[error("failed to decode value: {0}")]
    Decode(DecodeError),
    #[error("value exceeds the protocol size limit")]
    SizeLimit,
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("values nested too deeply to skip")]
    DepthLimit,
}

impl ProtocolError {
    /// Whether the peer ended the stream.
    pub fn is_end_of_stream(&self) -> bool {
        matches!(
            self,
            ProtocolError::EndOfStream | ProtocolError::Transport(TransportError::EndOfStream)
        )
    }
}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Io { inner, .. } => from_io(inner),
            DecodeError::LimitExceeded => ProtocolError::SizeLimit,
            e => ProtocolError::Decode(e),
        }
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        match e {
            EncodeError::Io { inner, .. } => from_io(inner),
            e => ProtocolError::Encode(e),
        }
    }
}

/// Recovers the transport error tunnelled through `std::io` by the codec.
fn from_io(inner: io::Error) -> ProtocolError {
    if inner.kind() == io::ErrorKind::UnexpectedEof {
        return ProtocolError::EndOfStream;
    }
    match inner.downcast::<TransportError>() {
        Ok(e) => ProtocolError::Transport(e),
        Err(inner) => ProtocolError::Transport(TransportError::Io(inner)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Call,
    Reply,
    Exception,
    /// A call that expects no reply.
    Oneway,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Call => 1,
            MessageKind::Reply => 2,
            MessageKind::Exception => 3,
            MessageKind::Oneway => 4,
        }
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::Call),
            2 => Ok(MessageKind::Reply),
            3 => Ok(MessageKind::Exception),
            4 => Ok(MessageKind::Oneway),
            v => Err(ProtocolError::InvalidData(format!("unknown message kind {v}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub name: String,
    pub kind: MessageKind,
    pub seq_id: i32,
}

impl MessageHeader {
    pub fn new(name: impl Into<String>, kind: MessageKind, seq_id: i32) -> Self {
        Self {
            name: name.into(),
            kind,
            seq_id,
        }
    }
}

/// Wire type of a value, as announced by field and collection headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Ends a struct's field list.
    Stop,
    Bool,
    Byte,
    I16,
    I32,
    I64,
    Double,
    /// UTF-8 strings and raw binary.
    String,
    Struct,
    Map,
    Set,
    List,
}

impl From<ValueType> for u8 {
    fn from(ty: ValueType) -> Self {
        match ty {
            ValueType::Stop => 0,
            ValueType::Bool => 1,
            ValueType::Byte => 2,
            ValueType::I16 => 3,
            ValueType::I32 => 4,
            ValueType::I64 => 5,
            ValueType::Double => 6,
            ValueType::String => 7,
            ValueType::Struct => 8,
            ValueType::Map => 9,
            ValueType::Set => 10,
            ValueType::List => 11,
        }
    }
}

impl TryFrom<u8> for ValueType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => ValueType::Stop,
            1 => ValueType::Bool,
            2 => ValueType::Byte,
            3 => ValueType::I16,
            4 => ValueType::I32,
            5 => ValueType::I64,
            6 => ValueType::Double,
            7 => ValueType::String,
            8 => ValueType::Struct,
            9 => ValueType::Map,
            10 => ValueType::Set,
            11 => ValueType::List,
            v => return Err(ProtocolError::InvalidData(format!("unknown value type {v}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHeader {
    pub ty: ValueType,
    pub id: i16,
}

impl FieldHeader {
    pub const STOP: FieldHeader = FieldHeader {
        ty: ValueType::Stop,
        id: 0,
    };

    pub fn is_stop(&self) -> bool {
        self.ty == ValueType::Stop
    }
}

/// Header of a list or set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListHeader {
    pub element: ValueType,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapHeader {
    pub key: ValueType,
    pub value: ValueType,
    pub len: usize,
}

/// Encode/decode contract over an owned transport.
///
/// The `*_end` and struct begin methods default to no-ops for encodings that do not
/// need explicit terminators.
pub trait Protocol: Send {
    fn write_message_begin(&mut self, header: &MessageHeader) -> Result<(), ProtocolError>;

    fn write_message_end(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn write_struct_begin(&mut self, _name: &str) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn write_struct_end(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn write_field_begin(&mut self, ty: ValueType, id: i16) -> Result<(), ProtocolError>;

    fn write_field_end(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn write_field_stop(&mut self) -> Result<(), ProtocolError>;

    fn write_list_begin(&mut self, element: ValueType, len: usize) -> Result<(), ProtocolError>;

    fn write_list_end(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn write_set_begin(&mut self, element: ValueType, len: usize) -> Result<(), ProtocolError>;

    fn write_set_end(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn write_map_begin(
        &mut self,
        key: ValueType,
        value: ValueType,
        len: usize,
    ) -> Result<(), ProtocolError>;

    fn write_map_end(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn write_bool(&mut self, value: bool) -> Result<(), ProtocolError>;
    fn write_byte(&mut self, value: i8) -> Result<(), ProtocolError>;
    fn write_i16(&mut self, value: i16) -> Result<(), ProtocolError>;
    fn write_i32(&mut self, value: i32) -> Result<(), ProtocolError>;
    fn write_i64(&mut self, value: i64) -> Result<(), ProtocolError>;
    fn write_double(&mut self, value: f64) -> Result<(), ProtocolError>;
    fn write_string(&mut self, value: &str) -> Result<(), ProtocolError>;
    fn write_binary(&mut self, value: &[u8]) -> Result<(), ProtocolError>;

    /// Reads an envelope. End of stream is reported only when the stream ends before
    /// the envelope's first byte; a partial envelope is invalid data.
    fn read_message_begin(&mut self) -> Result<MessageHeader, ProtocolError>;

    fn read_message_end(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn read_struct_begin(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn read_struct_end(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Returns [`FieldHeader::STOP`] at the end of a struct.
    fn read_field_begin(&mut self) -> Result<FieldHeader, ProtocolError>;

    fn read_field_end(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn read_list_begin(&mut self) -> Result<ListHeader, ProtocolError>;

    fn read_list_end(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn read_set_begin(&mut self) -> Result<ListHeader, ProtocolError>;

    fn read_set_end(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn read_map_begin(&mut self) -> Result<MapHeader, ProtocolError>;

    fn read_map_end(&mut self) -> Result<(), ProtocolError> {
        Ok(())
    }

    fn read_bool(&mut self) -> Result<bool, ProtocolError>;
    fn read_byte(&mut self) -> Result<i8, ProtocolError>;
    fn read_i16(&mut self) -> Result<i16, ProtocolError>;
    fn read_i32(&mut self) -> Result<i32, ProtocolError>;
    fn read_i64(&mut self) -> Result<i64, ProtocolError>;
    fn read_double(&mut self) -> Result<f64, ProtocolError>;
    fn read_string(&mut self) -> Result<String, ProtocolError>;
    fn read_binary(&mut self) -> Result<Vec<u8>, ProtocolError>;

    fn flush(&mut self) -> Result<(), ProtocolError> {
        self.transport().flush()?;
        Ok(())
    }

    /// The transport this protocol reads from and writes to.
    fn transport(&mut self) -> &mut dyn Transport;
}

/// Builds the protocol for one connection half.
pub trait ProtocolFactory: Send + Sync {
    fn protocol(&self, transport: Box<dyn Transport>) -> Box<dyn Protocol>;
}

/// Reads and discards one value of type `ty`.
pub fn skip(protocol: &mut dyn Protocol, ty: ValueType) -> Result<(), ProtocolError> {
    skip_nested(protocol, ty, MAX_SKIP_DEPTH)
}

fn skip_nested(
    protocol: &mut dyn Protocol,
    ty: ValueType,
    depth: usize,
) -> Result<(), ProtocolError> {
    if depth == 0 {
        return Err(ProtocolError::DepthLimit);
    }

    match ty {
        ValueType::Stop => {
            return Err(ProtocolError::InvalidData(
                "stop marker outside a struct".to_string(),
            ));
        }
        ValueType::Bool => {
            protocol.read_bool()?;
        }
        ValueType::Byte => {
            protocol.read_byte()?;
        }
        ValueType::I16 => {
            protocol.read_i16()?;
        }
        ValueType::I32 => {
            protocol.read_i32()?;
        }
        ValueType::I64 => {
            protocol.read_i64()?;
        }
        ValueType::Double => {
            protocol.read_double()?;
        }
        ValueType::String => {
            protocol.read_binary()?;
        }
        ValueType::Struct => {
            protocol.read_struct_begin()?;
            loop {
                let field = protocol.read_field_begin()?;
                if field.is_stop() {
                    break;
                }
                skip_nested(protocol, field.ty, depth - 1)?;
                protocol.read_field_end()?;
            }
            protocol.read_struct_end()?;
        }
        ValueType::List => {
            let header = protocol.read_list_begin()?;
            for _ in 0..header.len {
                skip_nested(protocol, header.element, depth - 1)?;
            }
            protocol.read_list_end()?;
        }
        ValueType::Set => {
            let header = protocol.read_set_begin()?;
            for _ in 0..header.len {
                skip_nested(protocol, header.element, depth - 1)?;
            }
            protocol.read_set_end()?;
        }
        ValueType::Map => {
            let header = protocol.read_map_begin()?;
            for _ in 0..header.len {
                skip_nested(protocol, header.key, depth - 1)?;
                skip_nested(protocol, header.value, depth - 1)?;
            }
            protocol.read_map_end()?;
        }
    }
    Ok(())
}
