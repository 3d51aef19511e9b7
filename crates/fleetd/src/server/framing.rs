//! Bounded newline-delimited framing.
//!
//! A line longer than the limit is skipped up to its terminating newline
//! so one bad message does not cost the whole connection. Lines that are
//! not valid UTF-8 are reported as such and never rewritten.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Default maximum line length accepted from a peer (64 KiB).
pub const MAX_LINE_BYTES: usize = 64 * 1024;

const DISCARD_CHUNK: u64 = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One line, terminator included if present.
    Line(String),
    /// A line over the limit was discarded; `size` is a lower bound.
    Oversized { size: usize },
    /// A complete line that is not valid UTF-8 was discarded.
    InvalidUtf8 { size: usize },
    Eof,
}

/// Reads one line of at most `max_bytes` (excluding the newline).
///
/// Not cancel-safe: a partially read line is lost if the future is dropped.
pub async fn read_line_bounded<R>(reader: &mut R, max_bytes: usize) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let limit = max_bytes as u64 + 1;
    let mut buf = Vec::new();

    let read = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(Frame::Eof);
    }

    if buf.len() as u64 >= limit && buf.last() != Some(&b'\n') {
        let skipped = discard_until_newline(reader).await?;
        return Ok(Frame::Oversized {
            size: buf.len() + skipped,
        });
    }

    match String::from_utf8(buf) {
        Ok(line) => Ok(Frame::Line(line)),
        Err(e) => Ok(Frame::InvalidUtf8 {
            size: e.as_bytes().len(),
        }),
    }
}

async fn discard_until_newline<R>(reader: &mut R) -> std::io::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut skipped = 0;
    loop {
        let mut chunk = Vec::new();
        let read = (&mut *reader)
            .take(DISCARD_CHUNK)
            .read_until(b'\n', &mut chunk)
            .await?;
        skipped += read;
        if read == 0 || chunk.last() == Some(&b'\n') {
            return Ok(skipped);
        }
    }
}
