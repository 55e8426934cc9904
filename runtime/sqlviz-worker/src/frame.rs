//! Length-prefixed frames: a little-endian `u32` size, then the payload.

use std::io::{self, Read, Write};

pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

fn oversized(kind: io::ErrorKind, size: usize) -> io::Error {
    io::Error::new(
        kind,
        format!("frame of {size} bytes exceeds the {MAX_FRAME_SIZE} byte limit"),
    )
}

/// Fills `header`, returning how many bytes arrived before end of stream.
fn read_header<R: Read>(reader: &mut R, header: &mut [u8; 4]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Reads one request frame. `Ok(None)` when the stream ends between frames;
/// a stream that ends inside a header or payload is an error.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match read_header(reader, &mut header)? {
        0 => return Ok(None),
        4 => {}
        got => {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream ended after {got} of 4 frame header bytes"),
            ));
        }
    }
    let size = u32::from_le_bytes(header) as usize;
    if size > MAX_FRAME_SIZE {
        return Err(oversized(io::ErrorKind::InvalidData, size));
    }
    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Writes one reply frame and flushes it. Nothing is written for an oversized payload.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let size = u32::try_from(payload.len())
        .ok()
        .filter(|size| *size as usize <= MAX_FRAME_SIZE)
        .ok_or_else(|| oversized(io::ErrorKind::InvalidInput, payload.len()))?;
    writer.write_all(&size.to_le_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}
