//! Newline framing with a hard per-line limit.
//!
//! An oversized line is dropped without being buffered and reported once as
//! [`Line::TooLong`]; reading resumes at the next line. Unlike a codec that
//! errors out, the stream stays usable.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    /// Line content without the trailing `\n`.
    Data(Vec<u8>),
    TooLong,
}

pub struct BoundedLines<R> {
    reader: R,
    max_len: usize,
    buf: Vec<u8>,
    discarding: bool,
}

impl<R: AsyncBufRead + Unpin> BoundedLines<R> {
    pub fn new(reader: R, max_len: usize) -> Self {
        Self {
            reader,
            max_len,
            buf: Vec::new(),
            discarding: false,
        }
    }

    /// Next line, or `None` at end of stream. Cancel-safe: partial progress
    /// is kept in `self`.
    pub async fn next_line(&mut self) -> io::Result<Option<Line>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.discarding {
                    self.discarding = false;
                    return Ok(Some(Line::TooLong));
                }
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(Line::Data(std::mem::take(&mut self.buf))));
            }

            let newline = available.iter().position(|&b| b == b'\n');
            let chunk = &available[..newline.unwrap_or(available.len())];
            if !self.discarding {
                if self.buf.len() + chunk.len() > self.max_len {
                    self.discarding = true;
                    self.buf = Vec::new();
                } else {
                    self.buf.extend_from_slice(chunk);
                }
            }
            let used = newline.map_or(available.len(), |i| i + 1);
            self.reader.consume(used);

            if newline.is_some() {
                if self.discarding {
                    self.discarding = false;
                    return Ok(Some(Line::TooLong));
                }
                return Ok(Some(Line::Data(std::mem::take(&mut self.buf))));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn collect(input: &[u8], max: usize, cap: usize) -> Vec<Line> {
        let mut lines = BoundedLines::new(BufReader::with_capacity(cap, input), max);
        let mut out = Vec::new();
        while let Some(l) = lines.next_line().await.unwrap() {
            out.push(l);
        }
        out
    }

    #[tokio::test]
    async fn splits_and_keeps_trailing_partial() {
        let out = collect(b"a\nbc\n\nd", 8, 3).await;
        assert_eq!(
            out,
            vec![
                Line::Data(b"a".to_vec()),
                Line::Data(b"bc".to_vec()),
                Line::Data(vec![]),
                Line::Data(b"d".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn oversized_line_is_reported_once_then_resumes() {
        let mut input = vec![b'x'; 50];
        input.extend_from_slice(b"\nok\n");
        input.extend(vec![b'y'; 11]);
        let out = collect(&input, 10, 4).await;
        assert_eq!(
            out,
            vec![Line::TooLong, Line::Data(b"ok".to_vec()), Line::TooLong]
        );
    }

    #[tokio::test]
    async fn limit_is_inclusive() {
        let out = collect(b"0123456789\n", 10, 64).await;
        assert_eq!(out, vec![Line::Data(b"0123456789".to_vec())]);
    }
}
