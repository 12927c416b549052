use std::io::{self, Read, Write};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_std_read, encode_into_std_write,
};

use crate::transport::Transport;

use super::{
    FieldHeader, ListHeader, MapHeader, MessageHeader, MessageKind, Protocol, ProtocolError,
    ProtocolFactory, ValueType,
};

/// Largest single value (string, binary, collection length) the protocol will decode.
pub const SIZE_LIMIT: usize = 16 * 1024 * 1024;

/// Leading marker of every envelope.
const MAGIC: u16 = 0x7468;

type WireConfig = Configuration<BigEndian, Fixint, Limit<SIZE_LIMIT>>;

/// Adapts a [`Transport`] to `std::io` for the codec.
struct Io<'a>(&'a mut dyn Transport);

impl Read for Io<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf).map_err(io::Error::other)
    }
}

impl Write for Io<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush().map_err(io::Error::other)
    }
}

/// Compact big-endian protocol encoded with bincode.
///
/// Integers are fixed width, strings and binaries carry a 64-bit length prefix, and
/// every envelope starts with a two-byte magic so a peer speaking something else is
/// rejected at the first message.
pub struct BinaryProtocol {
    transport: Box<dyn Transport>,
    config: WireConfig,
}

impl BinaryProtocol {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding()
            .with_limit::<SIZE_LIMIT>();
        Self { transport, config }
    }

    pub fn into_inner(self) -> Box<dyn Transport> {
        self.transport
    }

    fn encode<E: Encode>(&mut self, value: E) -> Result<(), ProtocolError> {
        encode_into_std_write(value, &mut Io(&mut *self.transport), self.config)?;
        Ok(())
    }

    fn decode<D: Decode<()>>(&mut self) -> Result<D, ProtocolError> {
        Ok(decode_from_std_read(
            &mut Io(&mut *self.transport),
            self.config,
        )?)
    }

    fn encode_len(&mut self, len: usize) -> Result<(), ProtocolError> {
        if len > SIZE_LIMIT {
            return Err(ProtocolError::SizeLimit);
        }
        self.encode(len as u32)
    }

    fn decode_len(&mut self) -> Result<usize, ProtocolError> {
        let len = self.decode::<u32>()? as usize;
        if len > SIZE_LIMIT {
            return Err(ProtocolError::SizeLimit);
        }
        Ok(len)
    }

    /// Rest of an envelope whose first byte has already been read.
    fn read_envelope(&mut self, first: u8) -> Result<MessageHeader, ProtocolError> {
        let magic = u16::from_be_bytes([first, self.decode::<u8>()?]);
        if magic != MAGIC {
            return Err(ProtocolError::InvalidData(format!(
                "bad envelope marker {magic:#06x}"
            )));
        }
        let kind = MessageKind::try_from(self.decode::<u8>()?)?;
        let name = self.decode::<String>()?;
        let seq_id = self.decode::<i32>()?;
        Ok(MessageHeader { name, kind, seq_id })
    }

    fn decode_type(&mut self) -> Result<ValueType, ProtocolError> {
        ValueType::try_from(self.decode::<u8>()?)
    }
}

impl Protocol for BinaryProtocol {
    fn write_message_begin(&mut self, header: &MessageHeader) -> Result<(), ProtocolError> {
        self.encode(MAGIC)?;
        self.encode(u8::from(header.kind))?;
        self.encode(header.name.as_str())?;
        self.encode(header.seq_id)
    }

    fn write_field_begin(&mut self, ty: ValueType, id: i16) -> Result<(), ProtocolError> {
        self.encode(u8::from(ty))?;
        self.encode(id)
    }

    fn write_field_stop(&mut self) -> Result<(), ProtocolError> {
        self.encode(u8::from(ValueType::Stop))
    }

    fn write_list_begin(&mut self, element: ValueType, len: usize) -> Result<(), ProtocolError> {
        self.encode(u8::from(element))?;
        self.encode_len(len)
    }

    fn write_set_begin(&mut self, element: ValueType, len: usize) -> Result<(), ProtocolError> {
        self.write_list_begin(element, len)
    }

    fn write_map_begin(
        &mut self,
        key: ValueType,
        value: ValueType,
        len: usize,
    ) -> Result<(), ProtocolError> {
        self.encode(u8::from(key))?;
        self.encode(u8::from(value))?;
        self.encode_len(len)
    }

    fn write_bool(&mut self, value: bool) -> Result<(), ProtocolError> {
        self.encode(value)
    }

    fn write_byte(&mut self, value: i8) -> Result<(), ProtocolError> {
        self.encode(value)
    }

    fn write_i16(&mut self, value: i16) -> Result<(), ProtocolError> {
        self.encode(value)
    }

    fn write_i32(&mut self, value: i32) -> Result<(), ProtocolError> {
        self.encode(value)
    }

    fn write_i64(&mut self, value: i64) -> Result<(), ProtocolError> {
        self.encode(value)
    }

    fn write_double(&mut self, value: f64) -> Result<(), ProtocolError> {
        self.encode(value)
    }

    fn write_string(&mut self, value: &str) -> Result<(), ProtocolError> {
        self.encode(value)
    }

    fn write_binary(&mut self, value: &[u8]) -> Result<(), ProtocolError> {
        self.encode(value)
    }

    fn read_message_begin(&mut self) -> Result<MessageHeader, ProtocolError> {
        // Only a stream that ends before the envelope starts is a clean close.
        let mut first = [0u8; 1];
        if self.transport.read(&mut first)? == 0 {
            return Err(ProtocolError::EndOfStream);
        }
        self.read_envelope(first[0]).map_err(|e| {
            if e.is_end_of_stream() {
                ProtocolError::InvalidData("truncated message envelope".to_string())
            } else {
                e
            }
        })
    }

    fn read_field_begin(&mut self) -> Result<FieldHeader, ProtocolError> {
        let ty = self.decode_type()?;
        if ty == ValueType::Stop {
            return Ok(FieldHeader::STOP);
        }
        let id = self.decode::<i16>()?;
        Ok(FieldHeader { ty, id })
    }

    fn read_list_begin(&mut self) -> Result<ListHeader, ProtocolError> {
        let element = self.decode_type()?;
        let len = self.decode_len()?;
        Ok(ListHeader { element, len })
    }

    fn read_set_begin(&mut self) -> Result<ListHeader, ProtocolError> {
        self.read_list_begin()
    }

    fn read_map_begin(&mut self) -> Result<MapHeader, ProtocolError> {
        let key = self.decode_type()?;
        let value = self.decode_type()?;
        let len = self.decode_len()?;
        Ok(MapHeader { key, value, len })
    }

    fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        self.decode()
    }

    fn read_byte(&mut self) -> Result<i8, ProtocolError> {
        self.decode()
    }

    fn read_i16(&mut self) -> Result<i16, ProtocolError> {
        self.decode()
    }

    fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        self.decode()
    }

    fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        self.decode()
    }

    fn read_double(&mut self) -> Result<f64, ProtocolError> {
        self.decode()
    }

    fn read_string(&mut self) -> Result<String, ProtocolError> {
        self.decode()
    }

    fn read_binary(&mut self) -> Result<Vec<u8>, ProtocolError> {
        self.decode()
    }

    fn transport(&mut self) -> &mut dyn Transport {
        &mut *self.transport
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryProtocolFactory;

impl ProtocolFactory for BinaryProtocolFactory {
    fn protocol(&self, transport: Box<dyn Transport>) -> Box<dyn Protocol> {
        Box::new(BinaryProtocol::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        protocol::skip,
        transport::{MemoryHandle, MemoryTransport},
    };

    use super::*;

    fn writer() -> (BinaryProtocol, MemoryHandle) {
        let transport = MemoryTransport::new(Vec::new());
        let handle = transport.handle();
        (BinaryProtocol::new(Box::new(transport)), handle)
    }

    fn reader(bytes: Vec<u8>) -> BinaryProtocol {
        BinaryProtocol::new(Box::new(MemoryTransport::new(bytes)))
    }

    #[test]
    fn read_write_message() {
        let (mut out, handle) = writer();
        let header = MessageHeader::new("echoString", MessageKind::Call, 7);

        out.write_message_begin(&header).unwrap();
        out.write_struct_begin("args").unwrap();
        out.write_field_begin(ValueType::String, 1).unwrap();
        out.write_string("hello").unwrap();
        out.write_field_end().unwrap();
        out.write_field_begin(ValueType::Double, 2).unwrap();
        out.write_double(2.5).unwrap();
        out.write_field_end().unwrap();
        out.write_field_stop().unwrap();
        out.write_struct_end().unwrap();
        out.write_message_end().unwrap();

        let mut input = reader(handle.written());
        assert_eq!(input.read_message_begin().unwrap(), header);
        assert_eq!(
            input.read_field_begin().unwrap(),
            FieldHeader {
                ty: ValueType::String,
                id: 1
            }
        );
        assert_eq!(input.read_string().unwrap(), "hello");
        assert_eq!(input.read_field_begin().unwrap().id, 2);
        assert_eq!(input.read_double().unwrap(), 2.5);
        assert!(input.read_field_begin().unwrap().is_stop());
    }

    #[test]
    fn integers_are_big_endian_fixed_width() {
        let (mut out, handle) = writer();

        out.write_i32(1).unwrap();
        out.write_i16(-2).unwrap();

        assert_eq!(handle.written(), vec![0, 0, 0, 1, 0xff, 0xfe]);
    }

    #[test]
    fn skip_discards_nested_values() {
        let (mut out, handle) = writer();

        out.write_field_begin(ValueType::Map, 1).unwrap();
        out.write_map_begin(ValueType::I32, ValueType::List, 2).unwrap();
        for key in 0..2 {
            out.write_i32(key).unwrap();
            out.write_list_begin(ValueType::String, 2).unwrap();
            out.write_string("a").unwrap();
            out.write_string("bc").unwrap();
        }
        out.write_field_begin(ValueType::I64, 2).unwrap();
        out.write_i64(99).unwrap();
        out.write_field_stop().unwrap();
        out.write_i32(1234).unwrap();

        let mut input = reader(handle.written());
        skip(&mut input, ValueType::Struct).unwrap();
        assert_eq!(input.read_i32().unwrap(), 1234);
    }

    #[test]
    fn bad_marker_is_rejected() {
        let mut input = reader(vec![0xde, 0xad, 1, 0, 0]);

        assert!(matches!(
            input.read_message_begin(),
            Err(ProtocolError::InvalidData(_))
        ));
    }

    #[test]
    fn empty_stream_is_end_of_stream() {
        let mut input = reader(Vec::new());

        assert!(input.read_message_begin().unwrap_err().is_end_of_stream());
    }

    #[test]
    fn truncated_envelope_is_invalid_data() {
        for len in 1..7 {
            let mut input = reader(vec![0x74, 0x68, 1, 0, 0, 0, 0, 0][..len].to_vec());

            assert!(
                matches!(
                    input.read_message_begin(),
                    Err(ProtocolError::InvalidData(_))
                ),
                "{len} bytes"
            );
        }
    }

    #[test]
    fn oversized_collection_is_rejected() {
        let mut bytes = vec![u8::from(ValueType::Byte)];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        let mut input = reader(bytes);

        assert!(matches!(
            input.read_list_begin(),
            Err(ProtocolError::SizeLimit)
        ));
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(SIZE_LIMIT as u64 + 1).to_be_bytes());
        let mut input = reader(bytes);

        assert!(matches!(
            input.read_string(),
            Err(ProtocolError::SizeLimit)
        ));
    }

    #[test]
    fn closed_transport_surfaces_as_transport_error() {
        let mut transport = MemoryTransport::new(Vec::new());
        transport.close().unwrap();
        let mut out = BinaryProtocol::new(Box::new(transport));

        assert!(matches!(
            out.write_i32(1),
            Err(ProtocolError::Transport(crate::transport::TransportError::NotOpen))
        ));
    }
}
