//! Stream codecs for the three metric wire formats.
//!
//! All decoders plug into `tokio_util::codec::FramedRead` and yield one record
//! per frame:
//! - `TextCodec`: `name;group;time;value[;source]` lines. Bad lines are
//!   dropped, counted and logged; the stream keeps going. Overlong lines end
//!   the stream unless the codec was told to skip them.
//! - `JsonCodec`: back-to-back JSON objects, framed by the JSON grammar itself.
//! - `MsgpackCodec<T>`: back-to-back MessagePack maps. Generic so plugin
//!   roster records share the framing with metrics.

use std::cmp;
use std::fmt;
use std::io::{self, Cursor};
use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::metric::Metric;

/// Largest single line/object accepted before the connection is dropped
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary decode error: {0}")]
    Msgpack(#[from] rmp_serde::decode::Error),
    #[error("binary encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("frame exceeds {0} bytes")]
    TooLong(usize),
}

/// The wire formats an inbound listener can speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WireCodec {
    Text,
    Json,
    Binary,
}

impl WireCodec {
    pub const ALL: [WireCodec; 3] = [WireCodec::Text, WireCodec::Json, WireCodec::Binary];
}

impl fmt::Display for WireCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Binary => write!(f, "binary"),
        }
    }
}

/// Line-delimited text metrics
#[derive(Debug)]
pub struct TextCodec {
    next_index: usize,
    max_length: usize,
    rejected: usize,
    skip_long: bool,
    // inside an overlong line, dropping bytes up to its newline
    discarding: bool,
}

impl Default for TextCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl TextCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_FRAME_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            next_index: 0,
            max_length,
            rejected: 0,
            skip_long: false,
            discarding: false,
        }
    }

    /// Drop and count lines over the limit instead of failing the stream
    pub fn skip_long_lines(mut self) -> Self {
        self.skip_long = true;
        self
    }

    /// Lines dropped because they did not parse or were too long
    pub fn rejected(&self) -> usize {
        self.rejected
    }

    fn parse(&mut self, raw: &[u8]) -> Option<Metric> {
        let line = String::from_utf8_lossy(raw);
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match Metric::from_line(line) {
            Ok(metric) => Some(metric),
            Err(e) => {
                self.rejected += 1;
                warn!(line = %line, error = %e, "dropping unparseable metric line");
                None
            }
        }
    }
}

impl Decoder for TextCodec {
    type Item = Metric;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Metric>, CodecError> {
        loop {
            // never look past the limit, so the verdict does not depend on read sizes
            let read_to = cmp::min(self.max_length.saturating_add(1), buf.len());
            let newline = buf[self.next_index..read_to].iter().position(|b| *b == b'\n');
            match (self.discarding, newline) {
                (true, Some(offset)) => {
                    buf.advance(self.next_index + offset + 1);
                    self.next_index = 0;
                    self.discarding = false;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(offset)) => {
                    let end = self.next_index + offset;
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    if let Some(metric) = self.parse(&line[..end]) {
                        return Ok(Some(metric));
                    }
                }
                (false, None) if buf.len() > self.max_length => {
                    if !self.skip_long {
                        return Err(CodecError::TooLong(self.max_length));
                    }
                    self.rejected += 1;
                    self.discarding = true;
                    warn!(limit = self.max_length, "dropping overlong metric line");
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Metric>, CodecError> {
        if let Some(metric) = self.decode(buf)? {
            return Ok(Some(metric));
        }
        // Trailing line without a newline
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let rest = buf.split();
        Ok(self.parse(&rest))
    }
}

/// Concatenated JSON metric objects
#[derive(Debug)]
pub struct JsonCodec {
    max_length: usize,
}

impl Default for JsonCodec {
    fn default() -> Self {
        Self {
            max_length: MAX_FRAME_BYTES,
        }
    }
}

impl Decoder for JsonCodec {
    type Item = Metric;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Metric>, CodecError> {
        let (next, consumed) = {
            let mut stream = serde_json::Deserializer::from_slice(&buf[..]).into_iter::<Metric>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            Some(Ok(metric)) => {
                buf.advance(consumed);
                Ok(Some(metric))
            }
            Some(Err(e)) if e.is_eof() => {
                if buf.len() > self.max_length {
                    return Err(CodecError::TooLong(self.max_length));
                }
                Ok(None)
            }
            Some(Err(e)) => Err(CodecError::Json(e)),
            None => {
                // Only whitespace left
                buf.clear();
                Ok(None)
            }
        }
    }
}

/// Concatenated MessagePack records of type `T`
pub struct MsgpackCodec<T> {
    max_length: usize,
    _record: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for MsgpackCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgpackCodec")
            .field("max_length", &self.max_length)
            .finish()
    }
}

impl<T> Default for MsgpackCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MsgpackCodec<T> {
    pub fn new() -> Self {
        Self {
            max_length: MAX_FRAME_BYTES,
            _record: PhantomData,
        }
    }
}

/// The record was cut short; wait for more bytes
fn is_incomplete(e: &rmp_serde::decode::Error) -> bool {
    use rmp_serde::decode::Error;
    match e {
        Error::InvalidMarkerRead(err) | Error::InvalidDataRead(err) => {
            err.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

impl<T: DeserializeOwned> Decoder for MsgpackCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<T>, CodecError> {
        if buf.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&buf[..]);
        let result = {
            let mut de = rmp_serde::Deserializer::new(&mut cursor);
            T::deserialize(&mut de)
        };

        match result {
            Ok(record) => {
                let consumed = cursor.position() as usize;
                buf.advance(consumed);
                Ok(Some(record))
            }
            Err(e) if is_incomplete(&e) => {
                if buf.len() > self.max_length {
                    return Err(CodecError::TooLong(self.max_length));
                }
                Ok(None)
            }
            Err(e) => Err(CodecError::Msgpack(e)),
        }
    }
}

impl<T: Serialize> Encoder<T> for MsgpackCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, record: T, dst: &mut BytesMut) -> Result<(), CodecError> {
        let bytes = rmp_serde::to_vec_named(&record)?;
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio_util::codec::FramedRead;

    fn sample(name: &str, source: &str) -> Metric {
        Metric::new(name, "host1", source, Some(1_700_000_000_000_000_000), 0.42)
    }

    #[test]
    fn test_text_decode_partial_lines() {
        let mut codec = TextCodec::new();
        let mut buf = BytesMut::from("cpu.load;host1;1700000000000000000;0.4");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"2\nmem;host1;1;3\n");
        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.name, "cpu.load");
        assert_eq!(first.value, 0.42);
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.name, "mem");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_text_drops_bad_lines_and_continues() {
        let mut codec = TextCodec::new();
        let mut buf = BytesMut::from("garbage\na;b;1;nope\n\nok;g;1;1\n");
        let metric = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(metric.name, "ok");
        assert_eq!(codec.rejected(), 2);
    }

    #[test]
    fn test_text_trailing_line_at_eof() {
        let mut codec = TextCodec::new();
        let mut buf = BytesMut::from("last;g;5;9");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let metric = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(metric.time, 5);
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_text_line_too_long() {
        let mut codec = TextCodec::with_max_length(8);
        let mut buf = BytesMut::from("0123456789");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::TooLong(8))
        ));
    }

    #[test]
    fn test_text_limit_ignores_chunking() {
        // a newline past the limit does not rescue the line
        let mut codec = TextCodec::with_max_length(8);
        let mut buf = BytesMut::from("0123456789\nok;g;1;1\n");
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::TooLong(8))
        ));

        let mut codec = TextCodec::with_max_length(8);
        let mut buf = BytesMut::from("a;b;1;23\n");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().value, 23.0);
    }

    #[test]
    fn test_text_skips_long_lines() {
        let mut codec = TextCodec::with_max_length(8).skip_long_lines();
        let mut buf = BytesMut::from("0123456789");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(codec.rejected(), 1);

        // the rest of the long line arrives later
        buf.extend_from_slice(b"abcdef\nok;g;1;1\n");
        let metric = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(metric.name, "ok");
        assert_eq!(codec.rejected(), 1);
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_text_skips_long_lines_in_stream() {
        let mut raw = vec![b'x'; 400_000];
        raw.extend_from_slice(b"\nok;g;1;1\n");
        raw.extend(vec![b'y'; 70_000]);
        raw.extend_from_slice(b"\nlast;g;2;2");

        let mut frames = FramedRead::new(std::io::Cursor::new(raw), TextCodec::new().skip_long_lines());
        let mut names = Vec::new();
        while let Some(metric) = frames.next().await {
            names.push(metric.unwrap().name);
        }
        assert_eq!(names, ["ok", "last"]);
        assert_eq!(frames.decoder().rejected(), 2);
    }

    #[test]
    fn test_json_stream_of_objects() {
        let a = sample("a", "");
        let b = sample("b", "peer-b");
        let mut raw = a.to_json().unwrap();
        raw.extend_from_slice(b"\n  ");
        raw.extend_from_slice(&b.to_json().unwrap());

        let mut codec = JsonCodec::default();
        let split = raw.len() - 5;
        let mut buf = BytesMut::from(&raw[..split]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), a);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&raw[split..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), b);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_json_garbage_is_an_error() {
        let mut codec = JsonCodec::default();
        let mut buf = BytesMut::from("{\"name\": oops}");
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Json(_))));
    }

    #[test]
    fn test_msgpack_partial_record() {
        let m = sample("net.rx", "edge-1");
        let raw = m.to_binary().unwrap();

        let mut codec = MsgpackCodec::<Metric>::new();
        let mut buf = BytesMut::new();
        for byte in &raw[..raw.len() - 1] {
            buf.put_u8(*byte);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.put_u8(raw[raw.len() - 1]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), m);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_msgpack_encoder_matches_metric_binary() {
        let m = sample("x", "");
        let mut codec = MsgpackCodec::<Metric>::new();
        let mut dst = BytesMut::new();
        codec.encode(m.clone(), &mut dst).unwrap();
        assert_eq!(&dst[..], &m.to_binary().unwrap()[..]);
    }

    #[tokio::test]
    async fn test_framed_read_over_async_reader() {
        let mut raw = Vec::new();
        for i in 0..3 {
            raw.extend(sample(&format!("m{}", i), "").to_binary().unwrap());
        }
        let reader = std::io::Cursor::new(raw);
        let frames = FramedRead::new(reader, MsgpackCodec::<Metric>::new());
        let names: Vec<String> = frames
            .map(|m| m.unwrap().name)
            .collect::<Vec<_>>()
            .await;
        assert_eq!(names, vec!["m0", "m1", "m2"]);
    }
}
