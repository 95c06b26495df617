//! Wire formats for metric streams
//!
//! Three self-describing formats share one interface: write a header, write
//! a sample, and read the next frame (which is either a new header or the
//! raw bytes of one sample). Raw sample bytes are parsed separately so the
//! parsing work can be spread over worker threads.
//!
//! - [`text`]: one human-readable line per sample, for console output
//! - [`csv`]: `time,[tags,]field…` header line followed by value rows
//! - [`binary`]: the compact canonical form with big-endian doubles
//!
//! A stream may contain arbitrarily many header/sample groups; readers
//! accept a new header at any frame boundary and switch epochs.

use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

use crate::sample::{Header, Sample};
use crate::{PipelineError, Result};

mod binary;
mod csv;
mod text;

pub use binary::BinaryMarshaller;
pub use csv::CsvMarshaller;
pub use text::TextMarshaller;

/// First column of every header, also the frame marker on the wire.
pub(crate) const TIME_COL: &str = "time";
/// Second header column iff the stream carries tags.
pub(crate) const TAGS_COL: &str = "tags";

/// One frame read from a stream: a new header opening an epoch, or the raw
/// bytes of a single sample to be parsed against the current header.
#[derive(Debug)]
pub enum Frame {
    Header(Header),
    Sample(Vec<u8>),
}

/// Encoding and decoding of one wire format.
///
/// `read` returns `Ok(None)` on a clean EOF at a frame boundary; EOF inside
/// a frame is [`PipelineError::UnexpectedEof`].
pub trait Marshaller: Send + Sync {
    fn format(&self) -> Format;

    fn write_header(&self, header: &Header, w: &mut dyn Write) -> Result<()>;

    fn write_sample(&self, sample: &Sample, header: &Header, w: &mut dyn Write) -> Result<()>;

    /// Read the next frame. `prev` is the header of the current epoch, or
    /// `None` at the start of the stream.
    fn read(&self, input: &mut PushbackReader, prev: Option<&Header>) -> Result<Option<Frame>>;

    /// Parse raw sample bytes produced by `read` against their header.
    fn parse_sample(&self, header: &Header, data: &[u8]) -> Result<Sample>;
}

/// The three recognised wire formats.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Text,
    Csv,
    Binary,
}

impl Format {
    pub fn marshaller(&self) -> Box<dyn Marshaller> {
        match self {
            Format::Text => Box::new(TextMarshaller::default()),
            Format::Csv => Box::new(CsvMarshaller),
            Format::Binary => Box::new(BinaryMarshaller),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Format::Text => "text",
            Format::Csv => "csv",
            Format::Binary => "bin",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Format {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(Format::Text),
            "csv" => Ok(Format::Csv),
            "bin" => Ok(Format::Binary),
            other => Err(PipelineError::UnknownFormat(other.to_string())),
        }
    }
}

/// Sniff the format of a stream from its first bytes: `time=` opens a text
/// line, `time,` a CSV header, and `time\n` a binary header.
pub fn detect_format(input: &mut PushbackReader) -> Result<Format> {
    let probe = input.peek(5)?;
    if probe.starts_with(b"time=") {
        return Ok(Format::Text);
    }
    if probe.starts_with(b"time,") {
        return Ok(Format::Csv);
    }
    if probe.starts_with(b"time\n") {
        return Ok(Format::Binary);
    }
    Err(PipelineError::UnknownFormat(
        String::from_utf8_lossy(probe).into_owned(),
    ))
}

/// Verify that a header starts with the `time` column.
pub(crate) fn check_first_col(col: &str) -> Result<()> {
    if col != TIME_COL {
        return Err(PipelineError::MalformedHeader(format!(
            "first column is {:?}, expected {:?}",
            col, TIME_COL
        )));
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// PushbackReader — buffered reader with peek and put-back
// ────────────────────────────────────────────────────────────────────────────

/// A buffered reader that lets marshallers probe frame boundaries without
/// consuming bytes, and push a consumed frame back when it turns out to
/// belong to the next epoch.
///
/// When a stop signal is attached, read timeouts on the underlying stream
/// (sockets with a read deadline) are retried until the signal fires; a
/// fired signal reads as EOF so decoders wind down at the next frame
/// boundary.
pub struct PushbackReader {
    inner: Box<dyn Read + Send>,
    buf: Vec<u8>,
    pos: usize,
    chunk: usize,
    stop: Option<crate::pipeline::StopSignal>,
}

impl PushbackReader {
    pub fn new(inner: Box<dyn Read + Send>) -> Self {
        Self::with_capacity(inner, 4096)
    }

    pub fn with_capacity(inner: Box<dyn Read + Send>, chunk: usize) -> Self {
        Self {
            inner,
            buf: Vec::new(),
            pos: 0,
            chunk: chunk.max(16),
            stop: None,
        }
    }

    pub fn with_stop(mut self, stop: crate::pipeline::StopSignal) -> Self {
        self.stop = Some(stop);
        self
    }

    fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Pull more bytes from the underlying reader. Returns the number of
    /// bytes added; 0 means EOF.
    fn fill(&mut self) -> Result<usize> {
        if self.pos > 0 && self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
        }
        let old_len = self.buf.len();
        self.buf.resize(old_len + self.chunk, 0);
        loop {
            match self.inner.read(&mut self.buf[old_len..]) {
                Ok(n) => {
                    self.buf.truncate(old_len + n);
                    return Ok(n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) && self.stop.is_some() =>
                {
                    // Read deadline elapsed: either shut down cleanly or retry
                    if self.stop.as_ref().is_some_and(|s| s.is_stopped()) {
                        self.buf.truncate(old_len);
                        return Ok(0);
                    }
                }
                Err(e) => {
                    self.buf.truncate(old_len);
                    return Err(e.into());
                }
            }
        }
    }

    /// Look at up to `n` bytes without consuming them. A shorter slice is
    /// returned at EOF; an empty slice means the stream is exhausted.
    pub fn peek(&mut self, n: usize) -> Result<&[u8]> {
        while self.buffered() < n {
            if self.fill()? == 0 {
                break;
            }
        }
        let end = (self.pos + n).min(self.buf.len());
        Ok(&self.buf[self.pos..end])
    }

    /// Read exactly `buf.len()` bytes. EOF before the first byte returns
    /// `Ok(false)`; EOF in the middle is [`PipelineError::UnexpectedEof`].
    pub fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            if self.buffered() == 0 && self.fill()? == 0 {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(PipelineError::UnexpectedEof);
            }
            let take = (buf.len() - filled).min(self.buffered());
            buf[filled..filled + take].copy_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            filled += take;
        }
        Ok(true)
    }

    /// Read exactly `buf.len()` bytes, treating any EOF as unexpected.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        if self.read_exact_or_eof(buf)? {
            Ok(())
        } else {
            Err(PipelineError::UnexpectedEof)
        }
    }

    /// Read up to and including `delim`. EOF before the first byte returns
    /// `Ok(None)`; EOF before the delimiter is
    /// [`PipelineError::UnexpectedEof`].
    pub fn read_until(&mut self, delim: u8) -> Result<Option<Vec<u8>>> {
        let mut out = Vec::new();
        loop {
            if self.buffered() == 0 && self.fill()? == 0 {
                if out.is_empty() {
                    return Ok(None);
                }
                return Err(PipelineError::UnexpectedEof);
            }
            let available = &self.buf[self.pos..];
            match available.iter().position(|&b| b == delim) {
                Some(idx) => {
                    out.extend_from_slice(&available[..=idx]);
                    self.pos += idx + 1;
                    return Ok(Some(out));
                }
                None => {
                    out.extend_from_slice(available);
                    self.pos = self.buf.len();
                }
            }
        }
    }

    /// Read one `\n`-terminated line, without the terminator. EOF before
    /// the first byte returns `Ok(None)`; an unterminated final line is
    /// [`PipelineError::UnexpectedEof`].
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        match self.read_until(b'\n')? {
            Some(mut line) => {
                line.pop();
                Ok(Some(line))
            }
            None => Ok(None),
        }
    }

    /// Push bytes back so the next read returns them first.
    pub fn put_back(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.pos >= bytes.len() {
            self.pos -= bytes.len();
            self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        } else {
            let mut rebuilt = Vec::with_capacity(bytes.len() + self.buffered());
            rebuilt.extend_from_slice(bytes);
            rebuilt.extend_from_slice(&self.buf[self.pos..]);
            self.buf = rebuilt;
            self.pos = 0;
        }
    }

    /// True once the underlying stream and the buffer are both exhausted.
    pub fn at_eof(&mut self) -> Result<bool> {
        Ok(self.peek(1)?.is_empty())
    }
}
