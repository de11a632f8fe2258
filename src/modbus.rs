use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

/// The largest register count a single read request may ask for.
pub const MAX_READ_COUNT: u16 = 123;

/// The exception code a gateway answers with when it is still busy with another request.
pub const SERVER_BUSY: u8 = 6;

#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub device_id: u8,
    pub transaction_id: u16,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    ReadRegisters { kind: RegisterKind, address: u16, count: u16 },
}

/// Which register table a read is directed at.
///
/// The Kita controller exposes its readings as input registers, but some Modbus gateways remap
/// them into the holding register table.
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegisterKind {
    Holding,
    #[default]
    Input,
}

impl RegisterKind {
    pub const fn function_code(self) -> u8 {
        match self {
            RegisterKind::Holding => 3,
            RegisterKind::Input => 4,
        }
    }

    pub const fn from_function_code(code: u8) -> Option<Self> {
        match code {
            3 => Some(RegisterKind::Holding),
            4 => Some(RegisterKind::Input),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub device_id: u8,
    pub transaction_id: u16,
    pub kind: ResponseKind,
}

impl Response {
    pub fn exception_code(&self) -> Option<u8> {
        match &self.kind {
            ResponseKind::ErrorCode(c) => Some(*c),
            ResponseKind::Registers { .. } => None,
        }
    }

    pub fn is_server_busy(&self) -> bool {
        self.exception_code() == Some(SERVER_BUSY)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseKind {
    ErrorCode(u8),
    /// Big-endian register words, two bytes per register.
    Registers { values: Vec<u8> },
}

pub struct ModbusTCPCodec {}

impl Encoder<Request> for ModbusTCPCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match req.operation {
            Operation::ReadRegisters { kind, address, count } => {
                dst.extend(req.transaction_id.to_be_bytes());
                // Protocol identifier, then the length of what follows the length field.
                dst.extend([0, 0, 0, 6, req.device_id, kind.function_code()]);
                dst.extend(address.to_be_bytes());
                dst.extend(count.to_be_bytes());
            }
        };
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for ModbusTCPCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            trace!(message = "attempt at decoding", buffer = ?src);
            let Some((header, _)) = src.split_first_chunk::<8>() else {
                return Ok(None);
            };
            let transaction_id = u16::from_be_bytes([header[0], header[1]]);
            let proto = u16::from_be_bytes([header[2], header[3]]);
            let length = usize::from(u16::from_be_bytes([header[4], header[5]]));
            // Anything shorter than unit id, function code and one byte of data can't be a
            // response we know how to interpret; resynchronize byte by byte.
            if proto != 0 || length < 3 {
                src.advance(1);
                continue;
            }
            let frame_length = 6 + length;
            if src.len() < frame_length {
                src.reserve(frame_length - src.len());
                return Ok(None);
            }
            let frame = src.split_to(frame_length);
            let (device_id, function_code) = (frame[6], frame[7]);
            if function_code & 0x80 != 0 {
                return Ok(Some(Response {
                    device_id,
                    transaction_id,
                    kind: ResponseKind::ErrorCode(frame[8]),
                }));
            }
            if RegisterKind::from_function_code(function_code).is_none() {
                trace!(message = "skipping a response to an unknown function", function_code);
                continue;
            }
            // NOTE: `frame[8]` is the payload byte count. The MBAP length already bounds the
            // payload, and some gateways fill the byte count in sloppily, so it is not consulted.
            return Ok(Some(Response {
                device_id,
                transaction_id,
                kind: ResponseKind::Registers { values: frame[9..].to_vec() },
            }));
        }
    }
}
