//! Frame codec.
//!
//! Frame layout: [MAGIC_BYTES], payload length as exactly [LENGTH_DIGITS]
//! zero-padded ASCII decimal digits, BSON payload.

use std::{
    collections::VecDeque,
    io::{Cursor, ErrorKind, Read, Write},
};

use bson::Document;
use log::{debug, trace, warn};

use crate::message::RpcMessage;

/// Frame synchronization marker
pub const MAGIC_BYTES: &[u8; 7] = b"[ rpc ]";
/// Width of the length field
pub const LENGTH_DIGITS: usize = 8;
/// Largest payload expressible by the length field
pub const MAX_PAYLOAD_LEN: usize = 99_999_999;

/// A trait which can read one frame payload from a stream
pub trait ReadFrame {
    /// Read the next frame payload. Skips garbage until a valid frame header.
    /// Returns [crate::Error::PeerDisconnected] if the stream is closed or broken
    fn read_frame(&mut self) -> crate::Result<Vec<u8>>;
}

/// A trait which can write one frame into a stream
pub trait WriteFrame {
    /// Write the whole frame with a single `write_all`
    fn write_frame(&mut self, payload: &[u8]) -> crate::Result<()>;
}

impl<R: Read> ReadFrame for R {
    fn read_frame(&mut self) -> crate::Result<Vec<u8>> {
        FrameReader::new()
            .read_frame(self)?
            .ok_or(crate::Error::PeerDisconnected)
    }
}

/// Frame reader for streams with a read timeout.
///
/// A timeout while scanning for the marker isn't an error: the bytes which may
/// still start a marker are kept, and the scan resumes on the next call.
/// A timeout after the marker matched means a stalled frame, which is treated
/// as a broken stream.
#[derive(Debug, Default)]
pub struct FrameReader {
    /// Bytes read ahead, consumed before the stream
    pending: VecDeque<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the next frame payload. Returns `None` if the stream went idle
    /// before a complete marker
    pub fn read_frame<R: Read + ?Sized>(&mut self, reader: &mut R) -> crate::Result<Option<Vec<u8>>> {
        let mut skipped = 0usize;

        loop {
            if !self.sync_to_marker(reader, &mut skipped)? {
                if skipped > 0 {
                    debug!("Skipped {skipped} bytes, waiting for a frame marker");
                }
                return Ok(None);
            }

            let mut len_buf = [0u8; LENGTH_DIGITS];
            self.read_exact(reader, &mut len_buf)?;

            let Some(len) = parse_length(&len_buf) else {
                warn!(
                    "Invalid frame length field {:?}. Resynchronizing",
                    String::from_utf8_lossy(&len_buf)
                );

                // The length field may hold the start of the next marker
                skipped += MAGIC_BYTES.len();
                for byte in len_buf.iter().rev() {
                    self.pending.push_front(*byte);
                }
                continue;
            };

            if skipped > 0 {
                warn!("Resynchronized frame stream after {skipped} bytes");
            }

            trace!("Frame payload len: {len}");

            let mut payload = vec![0u8; len];
            self.read_exact(reader, &mut payload)?;

            return Ok(Some(payload));
        }
    }

    /// Read until the last read bytes are the marker. Returns `false` if the
    /// stream went idle first
    fn sync_to_marker<R: Read + ?Sized>(
        &mut self,
        reader: &mut R,
        skipped: &mut usize,
    ) -> crate::Result<bool> {
        let mut window: Vec<u8> = Vec::with_capacity(MAGIC_BYTES.len());

        while window.as_slice() != &MAGIC_BYTES[..] {
            match self.next_byte(reader)? {
                Some(byte) => window.push(byte),
                None => {
                    // The window is a marker prefix, keep it for the next call
                    for byte in window.into_iter().rev() {
                        self.pending.push_front(byte);
                    }
                    return Ok(false);
                }
            }

            while !MAGIC_BYTES.starts_with(&window) {
                window.remove(0);
                *skipped += 1;
            }
        }

        Ok(true)
    }

    /// Next byte, or `None` if the read timed out
    fn next_byte<R: Read + ?Sized>(&mut self, reader: &mut R) -> crate::Result<Option<u8>> {
        if let Some(byte) = self.pending.pop_front() {
            return Ok(Some(byte));
        }

        let mut byte = [0u8; 1];

        loop {
            match reader.read(&mut byte) {
                Ok(0) => return Err(crate::Error::PeerDisconnected),
                Ok(_) => return Ok(Some(byte[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(_) => return Err(crate::Error::PeerDisconnected),
            }
        }
    }

    /// Fill `buf` with pending bytes first, then from the reader
    fn read_exact<R: Read + ?Sized>(&mut self, reader: &mut R, buf: &mut [u8]) -> crate::Result<()> {
        let from_pending = self.pending.len().min(buf.len());

        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..from_pending)) {
            *slot = byte;
        }

        reader
            .read_exact(&mut buf[from_pending..])
            .map_err(|_| crate::Error::PeerDisconnected)
    }
}

impl<W: Write> WriteFrame for W {
    fn write_frame(&mut self, payload: &[u8]) -> crate::Result<()> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(crate::Error::ProtocolError(format!(
                "Payload of {} bytes doesn't fit a frame",
                payload.len()
            )));
        }

        let mut buffer = Vec::with_capacity(MAGIC_BYTES.len() + LENGTH_DIGITS + payload.len());
        buffer.extend_from_slice(MAGIC_BYTES);
        buffer.extend_from_slice(format!("{:0width$}", payload.len(), width = LENGTH_DIGITS).as_bytes());
        buffer.extend_from_slice(payload);

        self.write_all(&buffer)
            .and_then(|_| self.flush())
            .map_err(|_| crate::Error::PeerDisconnected)
    }
}

/// Serialize a message into a frame payload
pub fn encode_message(message: &RpcMessage) -> crate::Result<Vec<u8>> {
    let doc =
        bson::to_document(message).map_err(|e| crate::Error::ProtocolError(e.to_string()))?;

    let mut buffer: Vec<u8> = Vec::new();
    doc.to_writer(&mut buffer)
        .map_err(|e| crate::Error::ProtocolError(e.to_string()))?;

    Ok(buffer)
}

/// Deserialize a frame payload
pub fn decode_message(data: &[u8]) -> crate::Result<RpcMessage> {
    let mut cursor = Cursor::new(data);
    let doc = Document::from_reader(&mut cursor)
        .map_err(|e| crate::Error::ProtocolError(e.to_string()))?;

    bson::from_document(doc).map_err(|e| crate::Error::ProtocolError(e.to_string()))
}

fn parse_length(field: &[u8; LENGTH_DIGITS]) -> Option<usize> {
    let text = std::str::from_utf8(field).ok()?;
    let digits = text.trim_start_matches(' ');

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }

    digits.parse().ok()
}
