// ABOUTME: Codec for the multiplexed stdout/stderr frame format of attached exec streams
// ABOUTME: Buffers partial frames across reads and routes payloads by stream tag

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::runtime::{OutputChunk, StreamType};

/// Tag byte, three reserved bytes, then a big-endian u32 payload length.
pub const HEADER_LEN: usize = 8;

const TAG_STDIN: u8 = 0;
const TAG_STDOUT: u8 = 1;
const TAG_STDERR: u8 = 2;

#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = OutputChunk;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<OutputChunk>, io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        let frame_len = HEADER_LEN + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let stream = match src[0] {
            // stdin frames are echoed on the stdout channel
            TAG_STDIN | TAG_STDOUT => StreamType::Stdout,
            TAG_STDERR => StreamType::Stderr,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown stream tag {} in exec frame", other),
                ))
            }
        };

        src.advance(HEADER_LEN);
        let data = src.split_to(len).freeze();
        Ok(Some(OutputChunk { stream, data }))
    }
}

impl Encoder<OutputChunk> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: OutputChunk, dst: &mut BytesMut) -> Result<(), io::Error> {
        let len = u32::try_from(item.data.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame payload exceeds u32")
        })?;
        let tag = match item.stream {
            StreamType::Stdout => TAG_STDOUT,
            StreamType::Stderr => TAG_STDERR,
        };

        dst.reserve(HEADER_LEN + item.data.len());
        dst.put_u8(tag);
        dst.put_bytes(0, 3);
        dst.put_u32(len);
        dst.extend_from_slice(&item.data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![tag, 0, 0, 0];
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Feeds the given deliveries one at a time and collects (stdout, stderr).
    fn demux(deliveries: &[&[u8]]) -> (Vec<u8>, Vec<u8>) {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        for delivery in deliveries {
            buffer.extend_from_slice(delivery);
            while let Some(chunk) = codec.decode(&mut buffer).unwrap() {
                match chunk.stream {
                    StreamType::Stdout => stdout.extend_from_slice(&chunk.data),
                    StreamType::Stderr => stderr.extend_from_slice(&chunk.data),
                }
            }
        }
        assert!(buffer.is_empty(), "all bytes should be consumed");
        (stdout, stderr)
    }

    fn sample() -> Vec<u8> {
        let mut bytes = frame(TAG_STDOUT, b"hello ");
        bytes.extend(frame(TAG_STDERR, b"warning: careful\n"));
        bytes.extend(frame(TAG_STDOUT, b"world\n"));
        bytes.extend(frame(TAG_STDERR, b""));
        bytes
    }

    #[test]
    fn test_decodes_whole_delivery() {
        let bytes = sample();
        let (stdout, stderr) = demux(&[&bytes]);

        assert_eq!(stdout, b"hello world\n");
        assert_eq!(stderr, b"warning: careful\n");
    }

    #[test]
    fn test_split_delivery_matches_whole_delivery() {
        let bytes = sample();
        let expected = demux(&[&bytes]);

        // Every possible two-chunk split, including inside headers and payloads
        for split in 0..=bytes.len() {
            let (head, tail) = bytes.split_at(split);
            assert_eq!(demux(&[head, tail]), expected, "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let bytes = sample();
        let singles: Vec<&[u8]> = bytes.chunks(1).collect();

        assert_eq!(demux(&singles), demux(&[&bytes]));
    }

    #[test]
    fn test_partial_header_waits() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::from(&[TAG_STDOUT, 0, 0][..]);

        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_stdin_tag_routes_to_stdout() {
        let bytes = frame(TAG_STDIN, b"echoed");
        let (stdout, stderr) = demux(&[&bytes]);

        assert_eq!(stdout, b"echoed");
        assert!(stderr.is_empty());
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::from(&frame(7, b"x")[..]);

        let err = codec.decode(&mut buffer).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_encoder_produces_decodable_frames() {
        let mut codec = FrameCodec;
        let mut buffer = BytesMut::new();
        codec
            .encode(OutputChunk::stderr(&b"oops"[..]), &mut buffer)
            .unwrap();

        assert_eq!(&buffer[..], &frame(TAG_STDERR, b"oops")[..]);
        let chunk = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk, OutputChunk::stderr(&b"oops"[..]));
    }
}
