//! Length-prefixed framing for the stream transport.
//!
//! Each encoded message travels as one frame: a 4-byte big-endian payload
//! length followed by the payload bytes. The decoder reassembles frames from
//! a byte stream that may deliver partial or coalesced chunks.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;

/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum accepted payload size on a stream (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Incremental decoder for length-prefixed frames.
///
/// Per frame the decoder moves through awaiting-length (fewer than 4 bytes
/// buffered), awaiting-body (length known, body incomplete), and
/// message-ready (payload emitted), then re-arms for the next frame. Feed it
/// after every socket read and call [`FrameDecoder::decode`] until it
/// returns `Ok(None)`; a single read may surface zero, one, or many frames.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder with the protocol frame limit
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom frame limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one payload from `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A length prefix over
    /// the limit returns [`WireError::FrameTooLarge`]; the stream is
    /// unparseable past that point and the connection must be terminated.
    /// The claimed body size is never reserved before the limit check
    /// passes.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at the payload length without consuming it
        let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if payload_len > self.max_frame_size {
            return Err(WireError::FrameTooLarge(payload_len));
        }

        if buf.len() < LENGTH_PREFIX_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(buf.split_to(payload_len).freeze()))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode one payload as a length-prefixed frame
pub fn encode_frame(payload: &[u8]) -> Result<Bytes, WireError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn framing_round_trip() {
        let msg = Message::chat("hello", "alice");
        let framed = encode_frame(&msg.encode().unwrap()).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&framed[..]);
        let payload = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(Message::decode(&payload).unwrap(), msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn one_byte_chunks_yield_one_frame() {
        let msg = Message::chat("partial reads", "bob");
        let framed = encode_frame(&msg.encode().unwrap()).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        let mut emitted = Vec::new();

        for (i, byte) in framed.iter().enumerate() {
            buf.put_u8(*byte);
            if let Some(payload) = decoder.decode(&mut buf).unwrap() {
                emitted.push(payload);
                assert_eq!(i, framed.len() - 1);
            }
        }

        assert_eq!(emitted.len(), 1);
        assert_eq!(Message::decode(&emitted[0]).unwrap(), msg);
    }

    #[test]
    fn coalesced_frames_all_emitted() {
        let first = Message::chat("one", "a");
        let second = Message::status("two");
        let third = Message::chat("three", "c");

        let mut buf = BytesMut::new();
        for msg in [&first, &second, &third] {
            buf.extend_from_slice(&encode_frame(&msg.encode().unwrap()).unwrap());
        }

        let mut decoder = FrameDecoder::new();
        let mut emitted = Vec::new();
        while let Some(payload) = decoder.decode(&mut buf).unwrap() {
            emitted.push(Message::decode(&payload).unwrap());
        }

        assert_eq!(emitted, vec![first, second, third]);
        assert!(buf.is_empty());
    }

    #[test]
    fn read_ending_mid_frame_waits_for_rest() {
        let msg = Message::chat("split across reads", "dana");
        let framed = encode_frame(&msg.encode().unwrap()).unwrap();
        let (head, tail) = framed.split_at(7);

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(head);
        assert!(decoder.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(tail);
        let payload = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(Message::decode(&payload).unwrap(), msg);
    }

    #[test]
    fn oversized_length_prefix_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(b"body never arrives");

        let mut decoder = FrameDecoder::new();
        match decoder.decode(&mut buf) {
            Err(WireError::FrameTooLarge(len)) => assert_eq!(len, MAX_FRAME_SIZE + 1),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn oversized_payload_refuses_to_encode() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode_frame(&payload),
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn frame_at_limit_is_accepted() {
        let payload = vec![b'x'; MAX_FRAME_SIZE];
        let framed = encode_frame(&payload).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&framed[..]);
        let decoded = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn decoder_rearms_after_each_frame() {
        let msg = Message::chat("again", "eve");
        let framed = encode_frame(&msg.encode().unwrap()).unwrap();

        let mut decoder = FrameDecoder::new();
        for _ in 0..3 {
            let mut buf = BytesMut::from(&framed[..]);
            assert!(decoder.decode(&mut buf).unwrap().is_some());
            assert!(decoder.decode(&mut buf).unwrap().is_none());
        }
    }
}
