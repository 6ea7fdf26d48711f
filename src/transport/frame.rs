//! Wire framing (length + crc32c) shared by host, dispatcher, and daemons.

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    LengthInvalid { reason: &'static str },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    TooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame crc mismatch: expected {expected} got {got}")]
    CrcMismatch { expected: u32, got: u32 },
}

/// Blocking frame source: accumulates stream bytes and hands out one
/// complete frame at a time via [`take_frame`] (the same parser the
/// non-blocking TLS loop drains).
pub struct FrameReader<R> {
    source: R,
    buffered: Vec<u8>,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(source: R, max_frame_bytes: usize) -> Self {
        Self {
            source,
            buffered: Vec::new(),
            max_frame_bytes,
        }
    }

    /// The next frame payload. `Ok(None)` means a clean EOF on a frame
    /// boundary; EOF inside a frame is an error.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut chunk = [0u8; 8 * 1024];
        loop {
            if let Some(payload) = take_frame(&mut self.buffered, self.max_frame_bytes)? {
                return Ok(Some(payload));
            }
            let pulled = self.source.read(&mut chunk)?;
            if pulled == 0 {
                if self.buffered.is_empty() {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection dropped mid-frame",
                )
                .into());
            }
            self.buffered.extend_from_slice(&chunk[..pulled]);
        }
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(payload, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(frame.len())
    }
}

pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_frame_bytes {
        return Err(FrameError::TooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::LengthInvalid {
        reason: "frame length exceeds u32",
    })?;
    let crc = crc32c(payload);

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Consume one complete frame from the front of `buf` if one has fully
/// arrived. Both the blocking [`FrameReader`] and the TLS poll loop
/// (which cannot hand us a blocking `Read`) drain through here.
pub fn take_frame(buf: &mut Vec<u8>, max_frame_bytes: usize) -> Result<Option<Vec<u8>>, FrameError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&buf[..FRAME_HEADER_LEN]);
    let (length, expected_crc) = parse_header(&header, max_frame_bytes)?;
    if buf.len() < FRAME_HEADER_LEN + length {
        return Ok(None);
    }
    let body: Vec<u8> = buf[FRAME_HEADER_LEN..FRAME_HEADER_LEN + length].to_vec();
    buf.drain(..FRAME_HEADER_LEN + length);
    check_crc(&body, expected_crc)?;
    Ok(Some(body))
}

fn parse_header(
    header: &[u8; FRAME_HEADER_LEN],
    max_frame_bytes: usize,
) -> Result<(usize, u32), FrameError> {
    let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if length == 0 {
        return Err(FrameError::LengthInvalid {
            reason: "frame length cannot be zero",
        });
    }
    if length > max_frame_bytes {
        return Err(FrameError::TooLarge {
            max_frame_bytes,
            got_bytes: length,
        });
    }
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    Ok((length, crc))
}

fn check_crc(body: &[u8], expected: u32) -> Result<(), FrameError> {
    let actual = crc32c(body);
    if actual != expected {
        return Err(FrameError::CrcMismatch {
            expected,
            got: actual,
        });
    }
    Ok(())
}
