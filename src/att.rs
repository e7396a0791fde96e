//! ATT request/response model and the wire codec used by the transport.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::{
    Handle,
    error::{DecodeError, EncodeError, RequestError},
};

/// ATT opcodes this server understands or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    ErrorRsp = 0x01,
    ExchangeMtuReq = 0x02,
    ExchangeMtuRsp = 0x03,
    ReadByTypeReq = 0x08,
    ReadByTypeRsp = 0x09,
    ReadReq = 0x0A,
    ReadRsp = 0x0B,
    ReadBlobReq = 0x0C,
    ReadBlobRsp = 0x0D,
    ReadMultipleReq = 0x0E,
    ReadMultipleRsp = 0x0F,
    WriteReq = 0x12,
    WriteRsp = 0x13,
    PrepareWriteReq = 0x16,
    PrepareWriteRsp = 0x17,
    ExecuteWriteReq = 0x18,
    ExecuteWriteRsp = 0x19,
    HandleValueNtf = 0x1B,
    HandleValueInd = 0x1D,
    HandleValueCfm = 0x1E,
    ReadMultipleVariableReq = 0x20,
    ReadMultipleVariableRsp = 0x21,
    WriteCmd = 0x52,
    SignedWriteCmd = 0xD2,
}

/// Set in the opcode of PDUs that never get a response.
pub const COMMAND_FLAG: u8 = 0x40;

/// Attribute type as carried by Read By Type requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeType {
    Uuid16(u16),
    Uuid128([u8; 16]),
}

impl AttributeType {
    pub const CLIENT_CHARACTERISTIC_CONFIG: Self = Self::Uuid16(0x2902);

    /// Parses a little-endian UUID of 2 or 16 bytes.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.len() {
            2 => Some(Self::Uuid16(u16::from_le_bytes([bytes[0], bytes[1]]))),
            16 => {
                let mut uuid = [0; 16];
                uuid.copy_from_slice(bytes);
                Some(Self::Uuid128(uuid))
            }
            _ => None,
        }
    }
}

/// Little-endian handle list of a Read Multiple request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleList<'a>(&'a [u8]);

impl<'a> HandleList<'a> {
    pub fn from_le_bytes(bytes: &'a [u8]) -> Self {
        Self(bytes)
    }

    pub fn iter(&self) -> impl Iterator<Item = Handle> + 'a {
        let bytes: &'a [u8] = self.0;
        bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
    }

    pub fn first(&self) -> Option<Handle> {
        self.iter().next()
    }
}

/// One decoded inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request<'a> {
    /// Read or Read Blob.
    Read {
        handle: Handle,
        offset: u16,
        blob: bool,
    },
    ReadByType {
        start: Handle,
        end: Handle,
        attribute_type: AttributeType,
    },
    /// Read Multiple, or Read Multiple Variable when `variable` is set.
    ReadMultiple {
        handles: HandleList<'a>,
        variable: bool,
    },
    /// Write Request when `ack` is set, otherwise a Write Command.
    Write {
        handle: Handle,
        value: &'a [u8],
        ack: bool,
    },
    PrepareWrite {
        handle: Handle,
        offset: u16,
        value: &'a [u8],
    },
    /// Execute Write; `commit == false` cancels the queued fragments.
    ExecuteWrite { commit: bool },
    ExchangeMtu { mtu: u16 },
    /// Handle Value Confirmation for an indication we sent.
    Confirmation,
    Unsupported { opcode: u8 },
}

impl<'a> Request<'a> {
    /// Decodes an ATT PDU received from the peer.
    pub fn decode(pdu: &'a [u8]) -> Result<Self, DecodeError> {
        let (&opcode, body) = pdu.split_first().ok_or(DecodeError::Empty)?;
        let Ok(op) = Opcode::try_from(opcode) else {
            return Ok(Request::Unsupported { opcode });
        };
        let need = |n: usize| {
            if body.len() < n {
                Err(DecodeError::Truncated(opcode))
            } else {
                Ok(())
            }
        };
        let u16_at = |i: usize| u16::from_le_bytes([body[i], body[i + 1]]);

        let request = match op {
            Opcode::ExchangeMtuReq => {
                need(2)?;
                Request::ExchangeMtu { mtu: u16_at(0) }
            }
            Opcode::ReadByTypeReq => {
                need(6)?;
                let attribute_type = AttributeType::from_le_bytes(&body[4..])
                    .ok_or(DecodeError::Malformed(opcode))?;
                Request::ReadByType {
                    start: u16_at(0),
                    end: u16_at(2),
                    attribute_type,
                }
            }
            Opcode::ReadReq => {
                need(2)?;
                Request::Read {
                    handle: u16_at(0),
                    offset: 0,
                    blob: false,
                }
            }
            Opcode::ReadBlobReq => {
                need(4)?;
                Request::Read {
                    handle: u16_at(0),
                    offset: u16_at(2),
                    blob: true,
                }
            }
            Opcode::ReadMultipleReq | Opcode::ReadMultipleVariableReq => {
                need(2)?;
                if body.len() % 2 != 0 {
                    return Err(DecodeError::Malformed(opcode));
                }
                Request::ReadMultiple {
                    handles: HandleList(body),
                    variable: op == Opcode::ReadMultipleVariableReq,
                }
            }
            Opcode::WriteReq | Opcode::WriteCmd => {
                need(2)?;
                Request::Write {
                    handle: u16_at(0),
                    value: &body[2..],
                    ack: op == Opcode::WriteReq,
                }
            }
            Opcode::SignedWriteCmd => {
                const SIGNATURE_LEN: usize = 12;
                need(2 + SIGNATURE_LEN)?;
                Request::Write {
                    handle: u16_at(0),
                    value: &body[2..body.len() - SIGNATURE_LEN],
                    ack: false,
                }
            }
            Opcode::PrepareWriteReq => {
                need(4)?;
                Request::PrepareWrite {
                    handle: u16_at(0),
                    offset: u16_at(2),
                    value: &body[4..],
                }
            }
            Opcode::ExecuteWriteReq => {
                need(1)?;
                match body[0] {
                    0x00 => Request::ExecuteWrite { commit: false },
                    0x01 => Request::ExecuteWrite { commit: true },
                    _ => return Err(DecodeError::Malformed(opcode)),
                }
            }
            Opcode::HandleValueCfm => Request::Confirmation,
            _ => Request::Unsupported { opcode },
        };
        Ok(request)
    }

    /// The request opcode echoed in an Error Response.
    pub fn opcode(&self) -> u8 {
        let op = match self {
            Request::Read { blob: false, .. } => Opcode::ReadReq,
            Request::Read { blob: true, .. } => Opcode::ReadBlobReq,
            Request::ReadByType { .. } => Opcode::ReadByTypeReq,
            Request::ReadMultiple {
                variable: false, ..
            } => Opcode::ReadMultipleReq,
            Request::ReadMultiple { variable: true, .. } => Opcode::ReadMultipleVariableReq,
            Request::Write { ack: true, .. } => Opcode::WriteReq,
            Request::Write { ack: false, .. } => Opcode::WriteCmd,
            Request::PrepareWrite { .. } => Opcode::PrepareWriteReq,
            Request::ExecuteWrite { .. } => Opcode::ExecuteWriteReq,
            Request::ExchangeMtu { .. } => Opcode::ExchangeMtuReq,
            Request::Confirmation => Opcode::HandleValueCfm,
            Request::Unsupported { opcode } => return *opcode,
        };
        op.into()
    }

    /// The handle reported alongside a failure of this request.
    pub fn handle(&self) -> Handle {
        match self {
            Request::Read { handle, .. }
            | Request::Write { handle, .. }
            | Request::PrepareWrite { handle, .. } => *handle,
            Request::ReadByType { start, .. } => *start,
            Request::ReadMultiple { handles, .. } => handles.first().unwrap_or(0),
            _ => 0,
        }
    }

    /// Whether the peer expects an answer, error or not.
    pub fn expects_response(&self) -> bool {
        match self {
            Request::Write { ack: false, .. } | Request::Confirmation => false,
            Request::Unsupported { opcode } => opcode & COMMAND_FLAG == 0,
            _ => true,
        }
    }
}

/// One outbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<'a> {
    Read {
        value: &'a [u8],
        blob: bool,
    },
    /// `data` holds back-to-back `(handle, value)` pairs of `pair_len` bytes each.
    ReadByType {
        pair_len: u8,
        data: &'a [u8],
    },
    ReadMultiple {
        data: &'a [u8],
        variable: bool,
    },
    Write,
    PrepareWrite {
        handle: Handle,
        offset: u16,
        value: &'a [u8],
    },
    ExecuteWrite,
    ExchangeMtu {
        mtu: u16,
    },
    Error(RequestError),
}

impl Response<'_> {
    /// Encodes the response PDU into `buf`, returning its length.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, EncodeError> {
        let mut w = PduWriter::new(buf);
        match *self {
            Response::Read { value, blob } => {
                w.op(if blob {
                    Opcode::ReadBlobRsp
                } else {
                    Opcode::ReadRsp
                })?;
                w.bytes(value)?;
            }
            Response::ReadByType { pair_len, data } => {
                w.op(Opcode::ReadByTypeRsp)?;
                w.u8(pair_len)?;
                w.bytes(data)?;
            }
            Response::ReadMultiple { data, variable } => {
                w.op(if variable {
                    Opcode::ReadMultipleVariableRsp
                } else {
                    Opcode::ReadMultipleRsp
                })?;
                w.bytes(data)?;
            }
            Response::Write => w.op(Opcode::WriteRsp)?,
            Response::PrepareWrite {
                handle,
                offset,
                value,
            } => {
                w.op(Opcode::PrepareWriteRsp)?;
                w.u16(handle)?;
                w.u16(offset)?;
                w.bytes(value)?;
            }
            Response::ExecuteWrite => w.op(Opcode::ExecuteWriteRsp)?,
            Response::ExchangeMtu { mtu } => {
                w.op(Opcode::ExchangeMtuRsp)?;
                w.u16(mtu)?;
            }
            Response::Error(err) => {
                w.op(Opcode::ErrorRsp)?;
                w.u8(err.opcode)?;
                w.u16(err.handle)?;
                w.u8(err.kind.code())?;
            }
        }
        Ok(w.len())
    }
}

/// Encodes a Handle Value Notification, or an Indication when `indicate` is set.
pub fn encode_handle_value(
    handle: Handle,
    value: &[u8],
    indicate: bool,
    buf: &mut [u8],
) -> Result<usize, EncodeError> {
    let mut w = PduWriter::new(buf);
    w.op(if indicate {
        Opcode::HandleValueInd
    } else {
        Opcode::HandleValueNtf
    })?;
    w.u16(handle)?;
    w.bytes(value)?;
    Ok(w.len())
}

struct PduWriter<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl<'b> PduWriter<'b> {
    fn new(buf: &'b mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn op(&mut self, op: Opcode) -> Result<(), EncodeError> {
        self.u8(op.into())
    }

    fn u8(&mut self, v: u8) -> Result<(), EncodeError> {
        self.bytes(&[v])
    }

    fn u16(&mut self, v: u16) -> Result<(), EncodeError> {
        self.bytes(&v.to_le_bytes())
    }

    fn bytes(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        let end = self.pos + data.len();
        let dst = self
            .buf
            .get_mut(self.pos..end)
            .ok_or(EncodeError::BufferTooSmall)?;
        dst.copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    fn len(&self) -> usize {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AttError;

    #[test]
    fn decode_read_blob() {
        let req = Request::decode(&[0x0C, 0x10, 0x00, 0x04, 0x00]).unwrap();
        assert_eq!(
            req,
            Request::Read {
                handle: 0x10,
                offset: 4,
                blob: true
            }
        );
        assert_eq!(req.opcode(), 0x0C);
    }

    #[test]
    fn decode_read_by_type_with_128_bit_uuid() {
        let mut pdu = [0u8; 21];
        pdu[0] = 0x08;
        pdu[1..3].copy_from_slice(&1u16.to_le_bytes());
        pdu[3..5].copy_from_slice(&0xffffu16.to_le_bytes());
        pdu[5..].copy_from_slice(&[0xAB; 16]);
        let req = Request::decode(&pdu).unwrap();
        assert_eq!(
            req,
            Request::ReadByType {
                start: 1,
                end: 0xffff,
                attribute_type: AttributeType::Uuid128([0xAB; 16]),
            }
        );
    }

    #[test]
    fn decode_read_by_type_rejects_odd_uuid() {
        let pdu = [0x08, 0x01, 0x00, 0xff, 0xff, 0x00, 0x29, 0x00];
        assert_eq!(Request::decode(&pdu), Err(DecodeError::Malformed(0x08)));
    }

    #[test]
    fn decode_signed_write_strips_signature() {
        let mut pdu = [0u8; 3 + 2 + 12];
        pdu[0] = 0xD2;
        pdu[1] = 0x08;
        pdu[3] = 0x55;
        pdu[4] = 0x66;
        let req = Request::decode(&pdu).unwrap();
        assert_eq!(
            req,
            Request::Write {
                handle: 0x08,
                value: &[0x55, 0x66],
                ack: false
            }
        );
        assert!(!req.expects_response());
    }

    #[test]
    fn decode_execute_write_flags() {
        assert_eq!(
            Request::decode(&[0x18, 0x00]).unwrap(),
            Request::ExecuteWrite { commit: false }
        );
        assert_eq!(
            Request::decode(&[0x18, 0x02]),
            Err(DecodeError::Malformed(0x18))
        );
    }

    #[test]
    fn decode_unknown_and_truncated() {
        assert_eq!(
            Request::decode(&[0x10, 0x01, 0x00, 0xff, 0xff, 0x00, 0x28]).unwrap(),
            Request::Unsupported { opcode: 0x10 }
        );
        assert_eq!(
            Request::decode(&[0x16, 0x01]),
            Err(DecodeError::Truncated(0x16))
        );
        assert_eq!(Request::decode(&[]), Err(DecodeError::Empty));
    }

    #[test]
    fn read_multiple_handles_iterate_in_order() {
        let req = Request::decode(&[0x0E, 0x03, 0x00, 0x08, 0x00, 0x05, 0x00]).unwrap();
        let Request::ReadMultiple { handles, variable } = req else {
            panic!("unexpected {req:?}");
        };
        assert!(!variable);
        assert_eq!(handles.iter().collect::<Vec<_>>(), vec![3, 8, 5]);
        assert_eq!(req.handle(), 3);
    }

    #[test]
    fn encode_error_response() {
        let mut buf = [0u8; 8];
        let rsp = Response::Error(RequestError::new(0x0A, 0x0123, AttError::InvalidOffset));
        let len = rsp.encode(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x01, 0x0A, 0x23, 0x01, 0x07]);
    }

    #[test]
    fn encode_prepare_write_echo() {
        let mut buf = [0u8; 16];
        let rsp = Response::PrepareWrite {
            handle: 0x0F,
            offset: 18,
            value: &[1, 2, 3],
        };
        let len = rsp.encode(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x17, 0x0F, 0x00, 18, 0x00, 1, 2, 3]);
    }

    #[test]
    fn encode_reports_short_buffer() {
        let mut buf = [0u8; 2];
        let rsp = Response::ExchangeMtu { mtu: 247 };
        assert_eq!(rsp.encode(&mut buf), Err(EncodeError::BufferTooSmall));
    }

    #[test]
    fn encode_indication() {
        let mut buf = [0u8; 8];
        let len = encode_handle_value(0x0C, &[0x00], true, &mut buf).unwrap();
        assert_eq!(&buf[..len], &[0x1D, 0x0C, 0x00, 0x00]);
    }
}
