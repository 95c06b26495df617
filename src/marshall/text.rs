//! Human-readable text format, one self-describing line per sample
//!
//! `time=<RFC3339Nano> [tags=k1=v1,k2=v2] field=value field=value …`
//!
//! There is no separate header frame on the wire; the reader derives the
//! header from each line and reports a header frame whenever the derived
//! header differs from the previous one. Tag pairs inside the `tags=` token
//! are comma-separated so the line splits unambiguously on spaces.
//!
//! Meant for console consumers; it round-trips, but is not the canonical
//! form.

use std::io::Write;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::sample::{Header, Sample};
use crate::{PipelineError, Result};

use super::{Format, Frame, Marshaller, PushbackReader, TAGS_COL, TIME_COL};

const TOKEN_SEPARATOR: char = ' ';
const TAG_PAIR_SEPARATOR: char = ',';

#[derive(Default)]
pub struct TextMarshaller;

impl Marshaller for TextMarshaller {
    fn format(&self) -> Format {
        Format::Text
    }

    fn write_header(&self, _header: &Header, _w: &mut dyn Write) -> Result<()> {
        // Every text line carries its own field names
        Ok(())
    }

    fn write_sample(&self, sample: &Sample, header: &Header, w: &mut dyn Write) -> Result<()> {
        let mut line = format!(
            "{}={}",
            TIME_COL,
            sample.time.to_rfc3339_opts(SecondsFormat::Nanos, true)
        );
        if header.has_tags {
            line.push(TOKEN_SEPARATOR);
            line.push_str(TAGS_COL);
            line.push('=');
            let tags = sample.tag_string()?;
            line.push_str(&tags.replace(TOKEN_SEPARATOR, &TAG_PAIR_SEPARATOR.to_string()));
        }
        for (name, value) in header.fields.iter().zip(&sample.values) {
            if name.contains(TOKEN_SEPARATOR) || name.contains('=') {
                return Err(PipelineError::InvalidValue(format!(
                    "field name {:?} cannot be written as text",
                    name
                )));
            }
            line.push(TOKEN_SEPARATOR);
            line.push_str(name);
            line.push('=');
            line.push_str(&format!("{}", value));
        }
        line.push('\n');
        w.write_all(line.as_bytes())?;
        Ok(())
    }

    fn read(&self, input: &mut PushbackReader, prev: Option<&Header>) -> Result<Option<Frame>> {
        let line = match input.read_line()? {
            Some(line) => line,
            None => return Ok(None),
        };
        let header = derive_header(&line)?;
        let changed = match prev {
            Some(prev) => *prev != header,
            None => true,
        };
        if changed {
            // The line belongs to the new epoch; give it back for re-reading
            input.put_back(b"\n");
            input.put_back(&line);
            return Ok(Some(Frame::Header(header)));
        }
        Ok(Some(Frame::Sample(line)))
    }

    fn parse_sample(&self, header: &Header, data: &[u8]) -> Result<Sample> {
        let line = std::str::from_utf8(data)
            .map_err(|e| PipelineError::InvalidValue(e.to_string()))?;
        let mut tokens = line.split(TOKEN_SEPARATOR);

        let time_token = tokens.next().unwrap_or_default();
        let time = parse_time_token(time_token)?;
        let mut sample = Sample::new(time, Vec::with_capacity(header.fields.len()));

        let mut tokens = tokens.peekable();
        if let Some(tags) = tokens
            .peek()
            .and_then(|t| t.strip_prefix(TAGS_COL))
            .and_then(|t| t.strip_prefix('='))
        {
            sample.parse_tag_string(&tags.replace(TAG_PAIR_SEPARATOR, " "))?;
            tokens.next();
        }

        for token in tokens {
            let (name, value) = token.split_once('=').ok_or_else(|| {
                PipelineError::InvalidValue(format!("text token {:?} has no value", token))
            })?;
            let value: f64 = value.parse().map_err(|_| {
                PipelineError::InvalidValue(format!("bad text value for {:?}: {:?}", name, value))
            })?;
            sample.values.push(value);
        }
        sample.check(header)?;
        Ok(sample)
    }
}

/// Derive the header described by one text line.
fn derive_header(line: &[u8]) -> Result<Header> {
    let line = std::str::from_utf8(line)
        .map_err(|e| PipelineError::MalformedHeader(e.to_string()))?;
    let mut tokens = line.split(TOKEN_SEPARATOR);
    let first = tokens.next().unwrap_or_default();
    if !first.starts_with("time=") {
        return Err(PipelineError::MalformedHeader(format!(
            "text line does not start with time=: {:?}",
            line
        )));
    }

    let mut header = Header::default();
    let mut first_token = true;
    for token in tokens {
        if first_token && token.starts_with("tags=") {
            header.has_tags = true;
        } else {
            let name = token.split_once('=').map(|(name, _)| name).ok_or_else(|| {
                PipelineError::MalformedHeader(format!("text token {:?} has no value", token))
            })?;
            header.fields.push(name.to_string());
        }
        first_token = false;
    }
    Ok(header)
}

fn parse_time_token(token: &str) -> Result<DateTime<Utc>> {
    let value = token.strip_prefix("time=").ok_or_else(|| {
        PipelineError::MalformedHeader(format!("expected time= token, got {:?}", token))
    })?;
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PipelineError::InvalidValue(format!("bad timestamp {:?}: {}", value, e)))
}
