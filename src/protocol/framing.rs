//! Length-prefixed framing for byte-stream transports (TCP, Unix sockets).
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! Frame types:
//! - `0x01`: packet (see [`super::packet`])
//!
//! On decode, zero-length frames, frames over [`MAX_FRAME_SIZE`] and
//! unknown frame types are protocol errors; the connection is dropped.
//! On encode, an oversized packet is refused before it reaches the wire,
//! so only that packet fails.

use crate::error::ProtocolError;

use super::{packet, Packet};

/// Maximum frame payload size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame type constants.
pub mod frame_type {
    /// Encoded [`Packet`](crate::protocol::Packet).
    pub const PACKET: u8 = 0x01;
}

/// Encode a packet as a complete frame.
///
/// # Errors
///
/// [`ProtocolError::TooLarge`] if the packet does not encode or the frame
/// would exceed [`MAX_FRAME_SIZE`].
pub fn encode_frame(packet: &Packet) -> Result<Vec<u8>, ProtocolError> {
    let payload = packet::encode(packet)?;
    let length = payload.len() + 1;
    if length > MAX_FRAME_SIZE as usize {
        return Err(ProtocolError::TooLarge { what: "frame", len: length, max: MAX_FRAME_SIZE as usize });
    }
    Ok(encode_raw(frame_type::PACKET, &payload))
}

/// Encode a raw frame with type byte and payload.
fn encode_raw(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32; // +1 for type byte
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(frame_type);
    buf.extend_from_slice(payload);
    buf
}

fn decode_frame(frame_type: u8, payload: &[u8]) -> Result<Packet, ProtocolError> {
    match frame_type {
        frame_type::PACKET => packet::decode(payload),
        other => Err(ProtocolError::Frame(format!("unknown frame type: 0x{other:02x}"))),
    }
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`FrameDecoder::feed`] and extract complete packets.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create a new decoder with empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the decoder and extract all complete packets.
    ///
    /// Incomplete data is buffered for the next call.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is malformed or exceeds the size limit.
    /// The decoder must not be reused after an error.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Packet>, ProtocolError> {
        self.buf.extend_from_slice(bytes);
        let mut packets = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);

            if length == 0 {
                return Err(ProtocolError::Frame("zero length".into()));
            }
            if length > MAX_FRAME_SIZE {
                return Err(ProtocolError::Frame(format!(
                    "frame too large: {length} bytes (max {MAX_FRAME_SIZE})"
                )));
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break;
            }

            let packet = decode_frame(self.buf[4], &self.buf[5..total])?;
            packets.push(packet);
            self.buf.drain(..total);
        }

        Ok(packets)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn sample(tx: &str) -> Packet {
        Packet::call_method(tx, "t1", "encode", [("text", "hi")].into_iter().collect())
    }

    #[test]
    fn test_single_frame() {
        let packet = sample("a");
        let mut decoder = FrameDecoder::new();
        let packets = decoder.feed(&encode_frame(&packet).unwrap()).unwrap();
        assert_eq!(packets, vec![packet]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut bytes = encode_frame(&sample("a")).unwrap();
        bytes.extend(encode_frame(&sample("b")).unwrap());
        bytes.extend(encode_frame(&Packet::respond_execute("a", 0, true, Value::Null)).unwrap());
        let packets = FrameDecoder::new().feed(&bytes).unwrap();
        let ids: Vec<&str> = packets.iter().map(|p| p.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let packet = sample("slow");
        let encoded = encode_frame(&packet).unwrap();
        let mut decoder = FrameDecoder::new();
        let mut out = Vec::new();
        for byte in &encoded {
            out.extend(decoder.feed(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(out, vec![packet]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_partial_frame_buffers() {
        let encoded = encode_frame(&sample("p")).unwrap();
        let (head, tail) = encoded.split_at(encoded.len() / 2);
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(head).unwrap().is_empty());
        assert!(decoder.has_partial());
        assert_eq!(decoder.feed(tail).unwrap().len(), 1);
    }

    #[test]
    fn test_zero_length_rejected() {
        let err = FrameDecoder::new().feed(&0u32.to_le_bytes()).unwrap_err();
        assert!(matches!(err, ProtocolError::Frame(_)));
    }

    #[test]
    fn test_oversized_rejected() {
        let err = FrameDecoder::new().feed(&(MAX_FRAME_SIZE + 1).to_le_bytes()).unwrap_err();
        assert!(matches!(err, ProtocolError::Frame(_)));
    }

    #[test]
    fn test_oversized_packet_not_encoded() {
        let big = "x".repeat(MAX_FRAME_SIZE as usize);
        let packet = Packet::respond_execute("big", 0, true, Value::from(big.as_str()));
        let err = encode_frame(&packet).unwrap_err();
        assert!(matches!(err, ProtocolError::TooLarge { what: "frame", .. }), "{err:?}");

        let small = Packet::respond_execute("small", 0, true, Value::from("x"));
        assert!(encode_frame(&small).is_ok());
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let err = FrameDecoder::new().feed(&encode_raw(0x7f, b"x")).unwrap_err();
        assert!(matches!(err, ProtocolError::Frame(_)));
    }

    #[test]
    fn test_malformed_packet_payload_rejected() {
        let err = FrameDecoder::new().feed(&encode_raw(frame_type::PACKET, &[99])).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownPacketType(99));
    }
}
