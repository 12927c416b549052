//! Echo service and client shared by the unit tests.
use std::net::SocketAddr;

use crate::{
    processor::{
        ApplicationError, ApplicationErrorKind, HandlerError, MethodProcessor, Reply, read_struct,
    },
    protocol::{BinaryProtocol, MessageHeader, MessageKind, Protocol, ProtocolError, ValueType},
    transport::{BufferedTransport, Duplex, SocketTransport, Transport},
};

pub(crate) fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn read_value(args: &mut dyn Protocol) -> Result<String, HandlerError> {
    let mut value = None;
    read_struct(args, |args, field| match (field.id, field.ty) {
        (1, ValueType::String) => {
            value = Some(args.read_string()?);
            Ok(true)
        }
        _ => Ok(false),
    })?;
    value.ok_or_else(|| HandlerError::InvalidArguments("missing field 1".to_string()))
}

/// `echo` returns its argument; `fail` raises it as an internal error.
pub(crate) fn echo_processor() -> MethodProcessor {
    MethodProcessor::new("Echo")
        .method("echo", |args| {
            let value = read_value(args)?;
            Ok(Reply::new(move |out| {
                out.write_struct_begin("echo_result")?;
                out.write_field_begin(ValueType::String, 0)?;
                out.write_string(&value)?;
                out.write_field_end()?;
                out.write_field_stop()?;
                out.write_struct_end()
            }))
        })
        .method("fail", |args| {
            let value = read_value(args)?;
            Err(ApplicationError::new(ApplicationErrorKind::InternalError, value).into())
        })
}

pub(crate) fn write_echo_call(
    out: &mut dyn Protocol,
    method: &str,
    seq_id: i32,
    value: Option<&str>,
) -> Result<(), ProtocolError> {
    out.write_message_begin(&MessageHeader::new(method, MessageKind::Call, seq_id))?;
    out.write_struct_begin("args")?;
    if let Some(value) = value {
        out.write_field_begin(ValueType::String, 1)?;
        out.write_string(value)?;
        out.write_field_end()?;
    }
    out.write_field_stop()?;
    out.write_struct_end()?;
    out.write_message_end()?;
    out.flush()
}

pub(crate) type EchoReply = (MessageHeader, Result<String, ApplicationError>);

pub(crate) fn read_echo_reply(input: &mut dyn Protocol) -> Result<EchoReply, ProtocolError> {
    let header = input.read_message_begin()?;
    let reply = match header.kind {
        MessageKind::Reply => {
            let mut value = String::new();
            read_struct(input, |input, field| match (field.id, field.ty) {
                (0, ValueType::String) => {
                    value = input.read_string()?;
                    Ok(true)
                }
                _ => Ok(false),
            })?;
            Ok(value)
        }
        MessageKind::Exception => Err(ApplicationError::read(input)?),
        kind => {
            return Err(ProtocolError::InvalidData(format!(
                "unexpected {kind:?} message"
            )));
        }
    };
    input.read_message_end()?;
    Ok((header, reply))
}

/// Blocking echo client over TCP.
pub(crate) struct EchoClient {
    input: BinaryProtocol,
    output: BinaryProtocol,
    next_seq: i32,
}

impl EchoClient {
    pub(crate) fn connect(addr: SocketAddr) -> Result<Self, ProtocolError> {
        let mut socket = SocketTransport::new(addr);
        socket.open()?;
        let Duplex { input, output } = socket.split()?;
        Ok(Self {
            input: BinaryProtocol::new(input),
            output: BinaryProtocol::new(Box::new(BufferedTransport::new(output))),
            next_seq: 0,
        })
    }

    pub(crate) fn echo(&mut self, value: &str) -> Result<String, ProtocolError> {
        let seq_id = self.next_seq;
        self.next_seq += 1;
        write_echo_call(&mut self.output, "echo", seq_id, Some(value))?;

        let (header, reply) = read_echo_reply(&mut self.input)?;
        if header.seq_id != seq_id {
            return Err(ProtocolError::InvalidData(format!(
                "expected reply #{seq_id}, got #{}",
                header.seq_id
            )));
        }
        reply.map_err(|e| ProtocolError::InvalidData(e.to_string()))
    }

    pub(crate) fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        let transport = self.output.transport();
        transport.write(bytes)?;
        transport.flush()?;
        Ok(())
    }

    pub(crate) fn close(mut self) {
        let _ = self.output.transport().close();
        let _ = self.input.transport().close();
    }
}
