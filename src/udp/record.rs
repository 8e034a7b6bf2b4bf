//! UDP record framing
//!
//! ```text
//! +---------+-------------+--------------+-----------------+-----------+
//! | version | src_len u16 | src (utf-8)  | payload_len u32 | payload   |
//! +---------+-------------+--------------+-----------------+-----------+
//! ```
//!
//! All integers are big-endian. `src` is the flow's `host:port` string.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Current record format version
pub const RECORD_VERSION: u8 = 1;

const HEADER_LEN: usize = 1 + 2;

/// One datagram tagged with the flow it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub source: String,
    pub payload: Bytes,
}

impl Record {
    pub fn new(source: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            source: source.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported record version {0}")]
    UnsupportedVersion(u8),

    #[error("record payload of {len} bytes exceeds {max}")]
    Oversized { len: usize, max: usize },

    #[error("record source is not valid")]
    InvalidSource,
}

/// Length-prefixed record codec with a payload ceiling
#[derive(Debug, Clone)]
pub struct RecordCodec {
    max_payload: usize,
}

impl RecordCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Decoder for RecordCodec {
    type Item = Record;
    type Error = RecordError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Record>, RecordError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let version = src[0];
        if version != RECORD_VERSION {
            return Err(RecordError::UnsupportedVersion(version));
        }
        let src_len = u16::from_be_bytes([src[1], src[2]]) as usize;
        if src_len == 0 {
            return Err(RecordError::InvalidSource);
        }

        let payload_at = HEADER_LEN + src_len;
        if src.len() < payload_at + 4 {
            src.reserve(payload_at + 4 - src.len());
            return Ok(None);
        }
        let len_bytes = &src[payload_at..payload_at + 4];
        let payload_len =
            u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        if payload_len > self.max_payload {
            return Err(RecordError::Oversized {
                len: payload_len,
                max: self.max_payload,
            });
        }

        let total = payload_at + 4 + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let source = src.split_to(src_len);
        let source = String::from_utf8(source.to_vec()).map_err(|_| RecordError::InvalidSource)?;
        src.advance(4);
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Record { source, payload }))
    }
}

impl Encoder<Record> for RecordCodec {
    type Error = RecordError;

    fn encode(&mut self, record: Record, dst: &mut BytesMut) -> Result<(), RecordError> {
        let source = record.source.as_bytes();
        if source.is_empty() || source.len() > u16::MAX as usize {
            return Err(RecordError::InvalidSource);
        }
        if record.payload.len() > self.max_payload {
            return Err(RecordError::Oversized {
                len: record.payload.len(),
                max: self.max_payload,
            });
        }

        dst.reserve(HEADER_LEN + source.len() + 4 + record.payload.len());
        dst.put_u8(RECORD_VERSION);
        dst.put_u16(source.len() as u16);
        dst.put_slice(source);
        dst.put_u32(record.payload.len() as u32);
        dst.put_slice(&record.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_input_waits_for_more() {
        let mut codec = RecordCodec::new(1024);
        let mut full = BytesMut::new();
        codec
            .encode(Record::new("10.0.0.5:5353", &b"query"[..]), &mut full)
            .unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&full[full.len() - 1..]);
        let record = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(record.source, "10.0.0.5:5353");
        assert_eq!(&record.payload[..], b"query");
        assert!(partial.is_empty());
    }

    #[test]
    fn test_back_to_back_records() {
        let mut codec = RecordCodec::new(1024);
        let mut buf = BytesMut::new();
        codec.encode(Record::new("a:1", &b"one"[..]), &mut buf).unwrap();
        codec.encode(Record::new("b:2", Bytes::new()), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().source, "a:1");
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.source, "b:2");
        assert!(second.payload.is_empty());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_payload_bytes_pass_through() {
        let payload: Vec<u8> = (0..=255).collect();
        let mut codec = RecordCodec::new(1024);
        let mut buf = BytesMut::new();
        codec
            .encode(Record::new("[::1]:53", payload.clone()), &mut buf)
            .unwrap();
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap().payload[..], &payload[..]);
    }

    #[test]
    fn test_rejects_bad_frames() {
        let mut codec = RecordCodec::new(4);

        let mut buf = BytesMut::from(&[9u8, 0, 1, b'x'][..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RecordError::UnsupportedVersion(9))
        ));

        let mut buf = BytesMut::new();
        buf.put_u8(RECORD_VERSION);
        buf.put_u16(3);
        buf.put_slice(b"a:1");
        buf.put_u32(5);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(RecordError::Oversized { len: 5, max: 4 })
        ));

        assert!(matches!(
            codec.encode(Record::new("", Bytes::new()), &mut BytesMut::new()),
            Err(RecordError::InvalidSource)
        ));
    }

    #[tokio::test]
    async fn test_stream_split_across_reads() {
        use futures::StreamExt;
        use tokio_util::codec::FramedRead;

        let mut codec = RecordCodec::new(1024);
        let mut frame = BytesMut::new();
        codec
            .encode(Record::new("192.168.1.20:40000", &b"hello"[..]), &mut frame)
            .unwrap();

        let reader = tokio_test::io::Builder::new()
            .read(&frame[..3])
            .read(&frame[3..10])
            .read(&frame[10..])
            .build();
        let mut records = FramedRead::new(reader, codec);

        let record = records.next().await.unwrap().unwrap();
        assert_eq!(record.source, "192.168.1.20:40000");
        assert_eq!(&record.payload[..], b"hello");
        assert!(records.next().await.is_none());
    }
}
