//! Binary primitives and message framing atop a [`ByteStream`].
//!
//! All multi-byte integers are big-endian. Strings use a dynamic count
//! prefix whose width grows with the string length, so short strings (the
//! overwhelming majority of protocol traffic) cost one byte of overhead
//! instead of four.

use crate::error::{WireError, WireResult};
use crate::message::Message;
use crate::stream::ByteStream;

/// Reads big-endian numeric and string primitives from a [`ByteStream`].
pub struct FramedReader<'s> {
    stream: &'s mut dyn ByteStream,
}

/// Writes big-endian numeric and string primitives to a [`ByteStream`].
pub struct FramedWriter<'s> {
    stream: &'s mut dyn ByteStream,
}

/// Upgrades a `Closed` result into `Corrupt`, for use once a frame's first
/// byte has already been read successfully: any further disconnect is now a
/// truncation, not a clean close.
fn mid_frame<T>(result: WireResult<T>) -> WireResult<T> {
    result.map_err(|e| match e {
        WireError::Closed => WireError::Corrupt {
            reason: "stream closed mid-frame",
        },
        other => other,
    })
}

impl<'s> FramedReader<'s> {
    pub fn new(stream: &'s mut dyn ByteStream) -> Self {
        Self { stream }
    }

    pub fn read_bool(&mut self) -> WireResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u8(&mut self) -> WireResult<u8> {
        let mut buf = [0u8; 1];
        self.stream.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    pub fn read_i8(&mut self) -> WireResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> WireResult<u16> {
        let mut buf = [0u8; 2];
        self.stream.read_exact(&mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    pub fn read_i16(&mut self) -> WireResult<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_u32(&mut self) -> WireResult<u32> {
        let mut buf = [0u8; 4];
        self.stream.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    pub fn read_i32(&mut self) -> WireResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> WireResult<u64> {
        let mut buf = [0u8; 8];
        self.stream.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    pub fn read_i64(&mut self) -> WireResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> WireResult<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> WireResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Reads the dynamic count prefix described in the module's framing
    /// table and returns the decoded length. This is the first read of a new
    /// frame; a clean peer close here surfaces as `WireError::Closed`, the
    /// normal end of a steady-state read loop. Every read this function or
    /// any of its callers perform afterward is mid-frame and upgrades a
    /// `Closed` into `Corrupt`.
    pub fn read_dynamic_count(&mut self) -> WireResult<u64> {
        let mut marker_buf = [0u8; 1];
        self.stream.read_exact(&mut marker_buf)?;
        let marker = marker_buf[0] as i8;
        match marker {
            0..=127 => Ok(marker as u64),
            -1 => {
                let mut buf = [0u8; 2];
                mid_frame(self.stream.read_exact(&mut buf))?;
                Ok(u16::from_be_bytes(buf) as u64)
            }
            -2 => {
                let mut buf = [0u8; 4];
                mid_frame(self.stream.read_exact(&mut buf))?;
                Ok(u32::from_be_bytes(buf) as u64)
            }
            -3 => {
                let mut buf = [0u8; 8];
                mid_frame(self.stream.read_exact(&mut buf))?;
                Ok(u64::from_be_bytes(buf))
            }
            _ => Err(WireError::Corrupt {
                reason: "invalid dynamic count marker byte",
            }),
        }
    }

    /// Reads a dynamic-count-prefixed, length-followed-by-UTF-8-bytes
    /// string. A decode error (non-UTF-8 content) is corruption, not a
    /// transport failure.
    pub fn read_string_dynamic(&mut self) -> WireResult<String> {
        let len = self.read_dynamic_count()?;
        self.read_string_body(len as usize)
    }

    /// Reads the fixed-width (always 4-byte) length-prefixed string form
    /// kept for compatibility with callers that don't want variable-width
    /// prefixes.
    pub fn read_string_fixed32(&mut self) -> WireResult<String> {
        let len = self.read_u32()? as usize;
        self.read_string_body(len)
    }

    fn read_string_body(&mut self, len: usize) -> WireResult<String> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf)?;
        String::from_utf8(buf).map_err(|_| WireError::Corrupt {
            reason: "string body was not valid UTF-8",
        })
    }

    /// Reads a length-prefixed byte blob (used for message payloads, whose
    /// content is opaque to the framing layer).
    pub fn read_bytes_dynamic(&mut self) -> WireResult<Vec<u8>> {
        let len = self.read_dynamic_count()? as usize;
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<'s> FramedWriter<'s> {
    pub fn new(stream: &'s mut dyn ByteStream) -> Self {
        Self { stream }
    }

    pub fn write_bool(&mut self, v: bool) -> WireResult<()> {
        self.write_u8(if v { 1 } else { 0 })
    }

    pub fn write_u8(&mut self, v: u8) -> WireResult<()> {
        self.stream.write_all(&[v])
    }

    pub fn write_i8(&mut self, v: i8) -> WireResult<()> {
        self.write_u8(v as u8)
    }

    pub fn write_u16(&mut self, v: u16) -> WireResult<()> {
        self.stream.write_all(&v.to_be_bytes())
    }

    pub fn write_i16(&mut self, v: i16) -> WireResult<()> {
        self.write_u16(v as u16)
    }

    pub fn write_u32(&mut self, v: u32) -> WireResult<()> {
        self.stream.write_all(&v.to_be_bytes())
    }

    pub fn write_i32(&mut self, v: i32) -> WireResult<()> {
        self.write_u32(v as u32)
    }

    pub fn write_u64(&mut self, v: u64) -> WireResult<()> {
        self.stream.write_all(&v.to_be_bytes())
    }

    pub fn write_i64(&mut self, v: i64) -> WireResult<()> {
        self.write_u64(v as u64)
    }

    pub fn write_f32(&mut self, v: f32) -> WireResult<()> {
        self.write_u32(v.to_bits())
    }

    pub fn write_f64(&mut self, v: f64) -> WireResult<()> {
        self.write_u64(v.to_bits())
    }

    /// Writes the dynamic count prefix, choosing the narrowest width that
    /// can represent `len`.
    pub fn write_dynamic_count(&mut self, len: u64) -> WireResult<()> {
        if len <= 127 {
            self.write_i8(len as i8)
        } else if len <= i16::MAX as u64 {
            self.write_i8(-1)?;
            self.write_u16(len as u16)
        } else if len <= u32::MAX as u64 / 2 {
            self.write_i8(-2)?;
            self.write_u32(len as u32)
        } else {
            self.write_i8(-3)?;
            self.write_u64(len)
        }
    }

    pub fn write_string_dynamic(&mut self, s: &str) -> WireResult<()> {
        self.write_dynamic_count(s.len() as u64)?;
        self.stream.write_all(s.as_bytes())
    }

    pub fn write_string_fixed32(&mut self, s: &str) -> WireResult<()> {
        self.write_u32(s.len() as u32)?;
        self.stream.write_all(s.as_bytes())
    }

    pub fn write_bytes_dynamic(&mut self, bytes: &[u8]) -> WireResult<()> {
        self.write_dynamic_count(bytes.len() as u64)?;
        self.stream.write_all(bytes)
    }
}

/// A protocol's hook for serializing the (length, id, payload) tuple onto
/// the wire. The framing layer above only supplies the primitives; each
/// application picks its own frame layout by implementing this trait.
pub trait MessageCodec: Send + Sync {
    fn encode_message(&self, stream: &mut dyn ByteStream, message: &Message) -> WireResult<()>;
    fn decode_message(&self, stream: &mut dyn ByteStream) -> WireResult<Message>;
}

/// The common frame layout named in the framing primitives' documentation:
/// a dynamic-count payload length, a 32-bit message id, then the raw
/// payload bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCodec;

impl MessageCodec for DefaultCodec {
    fn encode_message(&self, stream: &mut dyn ByteStream, message: &Message) -> WireResult<()> {
        let mut w = FramedWriter::new(stream);
        w.write_dynamic_count(message.payload().len() as u64)?;
        w.write_i32(message.id())?;
        w.stream.write_all(message.payload())
    }

    fn decode_message(&self, stream: &mut dyn ByteStream) -> WireResult<Message> {
        let mut r = FramedReader::new(stream);
        let len = r.read_dynamic_count()? as usize;
        let id = mid_frame(r.read_i32())?;
        let mut payload = vec![0u8; len];
        mid_frame(r.stream.read_exact(&mut payload))?;
        Ok(Message::with_payload(id, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::TcpByteStream;
    use std::net::{TcpListener, TcpStream};
    use std::thread;

    fn loopback_pair() -> (TcpByteStream, TcpByteStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || TcpStream::connect(addr).unwrap());
        let (server, _) = listener.accept().unwrap();
        (TcpByteStream::new(server), TcpByteStream::new(client.join().unwrap()))
    }

    #[test]
    fn dynamic_count_boundaries_round_trip() {
        for &n in &[0u64, 1, 127, 128, 32767, 32768, (1u64 << 31) - 1, 1u64 << 31, (1u64 << 31) + 1] {
            let (mut server, mut client) = loopback_pair();
            let writer_n = n;
            let handle = thread::spawn(move || {
                let mut w = FramedWriter::new(&mut client);
                w.write_dynamic_count(writer_n).unwrap();
            });
            let mut r = FramedReader::new(&mut server);
            let decoded = r.read_dynamic_count().unwrap();
            handle.join().unwrap();
            assert_eq!(decoded, n, "round trip failed for n={n}");
        }
    }

    #[test]
    fn dynamic_count_prefix_width_matches_table() {
        // 0..=127 uses a single byte; 128 requires the -1 marker plus 2 bytes.
        let (mut server, mut client) = loopback_pair();
        let handle = thread::spawn(move || {
            let mut w = FramedWriter::new(&mut client);
            w.write_dynamic_count(127).unwrap();
            w.write_dynamic_count(128).unwrap();
        });
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf[..1]).unwrap();
        assert_eq!(buf[0], 127);
        server.read_exact(&mut buf[..3]).unwrap();
        assert_eq!(buf[0], 0xFF);
        assert_eq!(u16::from_be_bytes([buf[1], buf[2]]), 128);
        handle.join().unwrap();
    }

    #[test]
    fn numeric_primitives_round_trip() {
        let (mut server, mut client) = loopback_pair();
        let handle = thread::spawn(move || {
            let mut w = FramedWriter::new(&mut client);
            w.write_u8(200).unwrap();
            w.write_i32(-12345).unwrap();
            w.write_u64(u64::MAX).unwrap();
            w.write_f64(std::f64::consts::PI).unwrap();
            w.write_bool(true).unwrap();
        });
        let mut r = FramedReader::new(&mut server);
        assert_eq!(r.read_u8().unwrap(), 200);
        assert_eq!(r.read_i32().unwrap(), -12345);
        assert_eq!(r.read_u64().unwrap(), u64::MAX);
        assert_eq!(r.read_f64().unwrap(), std::f64::consts::PI);
        assert!(r.read_bool().unwrap());
        handle.join().unwrap();
    }

    #[test]
    fn string_dynamic_round_trips() {
        let (mut server, mut client) = loopback_pair();
        let text = "hello, world".to_string();
        let to_write = text.clone();
        let handle = thread::spawn(move || {
            let mut w = FramedWriter::new(&mut client);
            w.write_string_dynamic(&to_write).unwrap();
        });
        let mut r = FramedReader::new(&mut server);
        assert_eq!(r.read_string_dynamic().unwrap(), text);
        handle.join().unwrap();
    }

    #[test]
    fn string_fixed32_round_trips() {
        let (mut server, mut client) = loopback_pair();
        let handle = thread::spawn(move || {
            let mut w = FramedWriter::new(&mut client);
            w.write_string_fixed32("fixed").unwrap();
        });
        let mut r = FramedReader::new(&mut server);
        assert_eq!(r.read_string_fixed32().unwrap(), "fixed");
        handle.join().unwrap();
    }

    #[test]
    fn default_codec_round_trips_a_message() {
        let (mut server, mut client) = loopback_pair();
        let codec = DefaultCodec;
        let msg = Message::with_payload(42, b"hello\0\0\0".to_vec());
        let handle = thread::spawn(move || {
            codec.encode_message(&mut client, &msg).unwrap();
        });
        let decoded = DefaultCodec.decode_message(&mut server).unwrap();
        assert_eq!(decoded.id(), 42);
        assert_eq!(decoded.payload(), b"hello\0\0\0");
        handle.join().unwrap();
    }

    #[test]
    fn clean_close_before_frame_is_closed() {
        let (mut server, client) = loopback_pair();
        drop(client);
        match DefaultCodec.decode_message(&mut server) {
            Err(WireError::Closed) => {}
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn truncated_mid_frame_is_corrupt() {
        let (mut server, mut client) = loopback_pair();
        // Write a length prefix promising 10 bytes, then vanish.
        let mut w = FramedWriter::new(&mut client);
        w.write_dynamic_count(10).unwrap();
        drop(client);
        match DefaultCodec.decode_message(&mut server) {
            Err(WireError::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }
}
