//! Length-prefixed framing over a plugin's standard streams.
//!
//! Each frame is a header block followed by a JSON payload:
//! ```text
//! Content-Length: <length>\r\n
//! \r\n
//! <payload>
//! ```
//!
//! The reading and writing halves are separate types because the host reads
//! on a dedicated thread while callers write from their own threads.

use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};

use crate::error::TransportError;

/// Largest payload accepted from a peer.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const CONTENT_LENGTH: &str = "content-length";

/// Reads frames from a byte stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    limit: usize,
}

impl<R: Read> FrameReader<R> {
    /// Wraps `reader` with the default frame size limit.
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_FRAME_BYTES)
    }

    /// Wraps `reader`, rejecting frames larger than `limit` bytes.
    #[must_use]
    pub fn with_limit(reader: R, limit: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            limit,
        }
    }

    /// Receives one frame, blocking until it is complete.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly between frames.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::MissingContentLength` if the header block has
    /// no length, `TransportError::InvalidHeader` if the length is not a
    /// number, `TransportError::FrameTooLarge` if it exceeds the limit, and
    /// `TransportError::Io` if the stream fails or ends inside a frame.
    pub fn receive(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let Some(content_length) = self.read_headers()? else {
            return Ok(None);
        };
        if content_length > self.limit {
            return Err(TransportError::FrameTooLarge {
                length: content_length,
                limit: self.limit,
            });
        }
        let mut content = vec![0u8; content_length];
        self.reader.read_exact(&mut content)?;
        Ok(Some(content))
    }

    fn read_headers(&mut self) -> Result<Option<usize>, TransportError> {
        let mut content_length: Option<usize> = None;
        let mut saw_header = false;

        loop {
            let mut line = String::new();
            let bytes_read = self.reader.read_line(&mut line)?;
            if bytes_read == 0 {
                if saw_header {
                    return Err(TransportError::from(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream closed while reading headers",
                    )));
                }
                return Ok(None);
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                if saw_header {
                    break;
                }
                // Blank lines between frames are tolerated.
                continue;
            }
            saw_header = true;

            if let Some(len) = parse_content_length(trimmed)? {
                content_length = Some(len);
            }
        }

        content_length
            .map(Some)
            .ok_or(TransportError::MissingContentLength)
    }
}

fn parse_content_length(header_line: &str) -> Result<Option<usize>, TransportError> {
    let Some((name, value)) = header_line.split_once(':') else {
        return Err(TransportError::InvalidHeader);
    };
    if !name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
        return Ok(None);
    }
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| TransportError::InvalidHeader)
}

/// Writes frames to a byte stream.
pub struct FrameWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> FrameWriter<W> {
    /// Wraps `writer`.
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
        }
    }

    /// Sends one frame and flushes it.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if writing to the stream fails.
    pub fn send(&mut self, message: &[u8]) -> Result<(), TransportError> {
        let header = format!("Content-Length: {}\r\n\r\n", message.len());
        self.writer.write_all(header.as_bytes())?;
        self.writer.write_all(message)?;
        self.writer.flush()?;
        Ok(())
    }
}
