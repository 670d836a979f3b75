use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::FramingError;

/// Default upper bound of a single frame.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

const SNAPSHOT_LEN: usize = 100;
const HEADERS_END: &[u8] = b"\n\r\n";

/// Splits a stream of bytes into whole SIP messages.
///
/// A frame is the header section followed by exactly `Content-Length` bytes
/// of body. The buffer is left untouched until a whole frame is available, so
/// `decode` can be called again after more bytes arrive.
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
    consumed: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            consumed: 0,
        }
    }

    /// Total bytes handed out as frames or skipped as keep-alives.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    fn oversize(&self, src: &[u8]) -> FramingError {
        let end = src.len().min(SNAPSHOT_LEN);
        FramingError::Oversize {
            unread: src.len(),
            consumed: self.consumed,
            max: self.max_frame_size,
            snapshot: String::from_utf8_lossy(&src[..end]).into_owned(),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameDecoder {
    type Item = Bytes;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() > self.max_frame_size {
            return Err(self.oversize(src));
        }

        // Keep-alive pings.
        let start = match src.iter().position(|b| !b.is_ascii_whitespace()) {
            Some(start) => start,
            None => {
                self.consumed += src.len();
                src.clear();
                return Ok(None);
            }
        };

        let Some(pos) = find(&src[start..], HEADERS_END) else {
            return Ok(None);
        };
        let headers_end = start + pos + 1;
        let body_start = start + pos + HEADERS_END.len();

        let content_length = content_length(&src[start..headers_end])?
            .ok_or(FramingError::MissingContentLength)?;

        let frame_end = body_start
            .checked_add(content_length)
            .ok_or_else(|| FramingError::InvalidContentLength(content_length.to_string()))?;
        if frame_end - start > self.max_frame_size {
            return Err(self.oversize(src));
        }
        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }

        src.advance(start);
        let frame = src.split_to(frame_end - start).freeze();
        self.consumed += frame_end;

        Ok(Some(frame))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                if !buf.is_empty() {
                    log::debug!("Discarding {} bytes of incomplete frame at EOF", buf.len());
                    buf.clear();
                }
                Ok(None)
            }
        }
    }
}

/// Scans header lines for `Content-Length` or its compact form `l`.
fn content_length(headers: &[u8]) -> Result<Option<usize>, FramingError> {
    for line in headers.split(|&b| b == b'\n') {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = line[..colon].trim_ascii();
        if !name.eq_ignore_ascii_case(b"content-length") && !name.eq_ignore_ascii_case(b"l") {
            continue;
        }
        let value = line[colon + 1..].trim_ascii();
        if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
            return Err(invalid(value));
        }
        let value = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| invalid(value))?;

        return Ok(Some(value));
    }

    Ok(None)
}

fn invalid(value: &[u8]) -> FramingError {
    FramingError::InvalidContentLength(String::from_utf8_lossy(value).into_owned())
}

fn find(src: &[u8], needle: &[u8]) -> Option<usize> {
    src.windows(needle.len()).position(|w| w == needle)
}
