//! Binary packet codec.
//!
//! ```text
//! [u8 packet_type] [u8 instruction_type | 0xFF]
//! [u8 flags (bit0: sequence present)] [u32 LE sequence, if flagged]
//! [u16 LE tx_id_len] [tx_id UTF-8]
//! [u32 LE headers_len] [headers: encoded Value::Map]
//! [u32 LE body_len] [body: encoded Value]
//! ```
//!
//! Encoding fails with [`ProtocolError::TooLarge`] when a field does not
//! fit its length prefix. Decoding validates the per-type field rules
//! ([`Packet::validate`]).

use crate::error::ProtocolError;
use crate::value::{self, Value};

use super::{InstructionType, Packet, PacketType};

/// Instruction byte meaning "no instruction type".
const NO_INSTRUCTION: u8 = 0xFF;

/// Flag bit: a sequence number follows.
const FLAG_SEQUENCE: u8 = 0x01;

/// Encode a packet.
///
/// # Errors
///
/// [`ProtocolError::TooLarge`] if the transaction id exceeds `u16::MAX`
/// bytes or the headers or body exceed `u32::MAX` bytes.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    let headers = value::encode(&Value::Map(packet.headers.clone()));
    let body = value::encode(&packet.body);
    let tx = packet.transaction_id.as_bytes();
    let tx_len = u16::try_from(tx.len()).map_err(|_overflow| ProtocolError::TooLarge {
        what: "transaction id",
        len: tx.len(),
        max: usize::from(u16::MAX),
    })?;
    let headers_len = length_u32("headers", &headers)?;
    let body_len = length_u32("body", &body)?;

    let mut buf = Vec::with_capacity(3 + 4 + 2 + tx.len() + 4 + headers.len() + 4 + body.len());
    buf.push(packet.packet_type.code());
    buf.push(packet.instruction_type.map_or(NO_INSTRUCTION, InstructionType::code));
    match packet.sequence {
        Some(seq) => {
            buf.push(FLAG_SEQUENCE);
            buf.extend_from_slice(&seq.to_le_bytes());
        }
        None => buf.push(0),
    }
    buf.extend_from_slice(&tx_len.to_le_bytes());
    buf.extend_from_slice(tx);
    buf.extend_from_slice(&headers_len.to_le_bytes());
    buf.extend_from_slice(&headers);
    buf.extend_from_slice(&body_len.to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

fn length_u32(what: &'static str, bytes: &[u8]) -> Result<u32, ProtocolError> {
    u32::try_from(bytes.len()).map_err(|_overflow| ProtocolError::TooLarge {
        what,
        len: bytes.len(),
        max: u32::MAX as usize,
    })
}

/// Cursor over a packet buffer that fails with `Malformed` on short reads.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.bytes.len()).ok_or_else(|| {
            ProtocolError::Malformed(format!("truncated {what} at offset {}", self.pos))
        })?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> Result<u8, ProtocolError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16, ProtocolError> {
        let b = self.take(2, what)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, what: &str) -> Result<u32, ProtocolError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn value(&mut self, what: &str) -> Result<Value, ProtocolError> {
        let len = self.u32(what)? as usize;
        let bytes = self.take(len, what)?;
        value::decode(bytes).map_err(|e| ProtocolError::Malformed(format!("{what}: {e}")))
    }
}

/// Decode a packet occupying all of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<Packet, ProtocolError> {
    let mut r = Reader { bytes, pos: 0 };

    let packet_type = PacketType::from_code(r.u8("packet type")?)?;
    let instruction_type = match r.u8("instruction type")? {
        NO_INSTRUCTION => None,
        code => Some(InstructionType::from_code(code)?),
    };
    let flags = r.u8("flags")?;
    if flags & !FLAG_SEQUENCE != 0 {
        return Err(ProtocolError::Malformed(format!("unknown flags 0x{flags:02x}")));
    }
    let sequence = if flags & FLAG_SEQUENCE != 0 { Some(r.u32("sequence")?) } else { None };

    let tx_len = usize::from(r.u16("transaction id length")?);
    let transaction_id = std::str::from_utf8(r.take(tx_len, "transaction id")?)
        .map_err(|e| ProtocolError::Malformed(format!("transaction id: {e}")))?
        .to_string();

    let headers = match r.value("headers")? {
        Value::Map(map) => map,
        other => {
            return Err(ProtocolError::Malformed(format!(
                "headers must be a map, got {}",
                other.type_name()
            )))
        }
    };
    let body = r.value("body")?;

    if r.pos != bytes.len() {
        return Err(ProtocolError::Malformed(format!(
            "{} trailing bytes after packet",
            bytes.len() - r.pos
        )));
    }

    let packet = Packet { transaction_id, packet_type, instruction_type, sequence, headers, body };
    packet.validate()?;
    Ok(packet)
}
