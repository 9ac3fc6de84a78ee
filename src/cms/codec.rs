//! CMake Server message framing
//!
//! Every message on the pipe is a JSON document wrapped in fixed markers:
//!
//! ```text
//! \n[== "CMake Server" ==[\n<json>\n]== "CMake Server" ==]\n
//! ```
//!
//! The decoder accumulates bytes and extracts the first complete block on
//! each call. `FramedRead` calls `decode` repeatedly, so several blocks
//! delivered in one read are all drained before more I/O happens.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

pub const START_MARKER: &[u8] = b"[== \"CMake Server\" ==[";
pub const END_MARKER: &[u8] = b"]== \"CMake Server\" ==]";

/// Maximum size of a single buffered frame
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024; // 64MB

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {size} bytes buffered without end marker (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Wrap a JSON payload in server markers
pub fn wrap(json: &str) -> String {
    format!(
        "\n{}\n{}\n{}\n",
        String::from_utf8_lossy(START_MARKER),
        json,
        String::from_utf8_lossy(END_MARKER)
    )
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Codec producing the raw JSON text of each framed message
#[derive(Debug, Default, Clone)]
pub struct CmsCodec {
    _private: (),
}

impl CmsCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for CmsCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(start) = find(src, START_MARKER) else {
            if src.len() > MAX_FRAME_SIZE {
                return Err(CodecError::FrameTooLarge {
                    size: src.len(),
                    max: MAX_FRAME_SIZE,
                });
            }
            return Ok(None);
        };

        let content_start = start + START_MARKER.len();
        let Some(end_offset) = find(&src[content_start..], END_MARKER) else {
            if src.len() > MAX_FRAME_SIZE {
                return Err(CodecError::FrameTooLarge {
                    size: src.len(),
                    max: MAX_FRAME_SIZE,
                });
            }
            trace!("CmsCodec: incomplete frame ({} bytes buffered)", src.len());
            return Ok(None);
        };
        let content_end = content_start + end_offset;

        let junk = &src[..start];
        if junk.iter().any(|b| !b.is_ascii_whitespace()) {
            warn!(
                "CmsCodec: discarding {} bytes before frame start: {}",
                junk.len(),
                String::from_utf8_lossy(junk)
            );
        }

        let message = String::from_utf8_lossy(&src[content_start..content_end])
            .trim()
            .to_string();
        src.advance(content_end + END_MARKER.len());

        trace!("CmsCodec: decoded frame ({} bytes)", message.len());
        Ok(Some(message))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        if src.iter().any(|b| !b.is_ascii_whitespace()) {
            warn!(
                "CmsCodec: stream ended with {} bytes of incomplete frame",
                src.len()
            );
        }
        src.clear();
        Ok(None)
    }
}

impl Encoder<String> for CmsCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let framed = wrap(&item);
        dst.reserve(framed.len());
        dst.extend_from_slice(framed.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::FramedRead;

    fn drain(codec: &mut CmsCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(msg) = codec.decode(buf).unwrap() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_encode_wraps_payload() {
        let mut codec = CmsCodec::new();
        let mut dst = BytesMut::new();
        codec.encode(r#"{"type":"compute"}"#.to_string(), &mut dst).unwrap();
        assert_eq!(
            &dst[..],
            b"\n[== \"CMake Server\" ==[\n{\"type\":\"compute\"}\n]== \"CMake Server\" ==]\n"
        );
    }

    #[test]
    fn test_two_messages_then_one_more() {
        let mut codec = CmsCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(format!("{}{}", wrap("\"A\""), wrap("\"B\"")).as_bytes());

        assert_eq!(drain(&mut codec, &mut buf), vec!["\"A\"", "\"B\""]);

        buf.extend_from_slice(wrap("\"C\"").as_bytes());
        assert_eq!(drain(&mut codec, &mut buf), vec!["\"C\""]);
        assert!(buf.iter().all(|b| b.is_ascii_whitespace()));
    }

    #[test]
    fn test_split_end_marker() {
        let mut codec = CmsCodec::new();
        let full = wrap(r#"{"type":"hello"}"#);
        let split_at = full.find("Server\" ==]").unwrap();
        let (first, second) = full.split_at(split_at);

        let mut buf = BytesMut::from(first.as_bytes());
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(second.as_bytes());
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some(r#"{"type":"hello"}"#)
        );
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut codec = CmsCodec::new();
        let stream = format!("{}{}", wrap("1"), wrap("2"));
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        for byte in stream.as_bytes() {
            buf.extend_from_slice(&[*byte]);
            out.extend(drain(&mut codec, &mut buf));
        }
        assert_eq!(out, vec!["1", "2"]);
    }

    #[test]
    fn test_leading_noise_is_discarded() {
        let mut codec = CmsCodec::new();
        let mut buf = BytesMut::from(format!("noise{}", wrap("{}")).as_bytes());
        assert_eq!(drain(&mut codec, &mut buf), vec!["{}"]);
    }

    #[tokio::test]
    async fn test_framed_read_across_writes() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let mut framed = FramedRead::new(reader, CmsCodec::new());

        let first = format!("{}{}", wrap("\"A\""), wrap("\"B\""));
        let second = wrap("\"C\"");
        tokio::spawn(async move {
            writer.write_all(first.as_bytes()).await.unwrap();
            writer.write_all(second.as_bytes()).await.unwrap();
        });

        let mut received = Vec::new();
        while let Some(frame) = framed.next().await {
            received.push(frame.unwrap());
        }
        assert_eq!(received, vec!["\"A\"", "\"B\"", "\"C\""]);
    }
}
