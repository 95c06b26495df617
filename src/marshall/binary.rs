//! Compact binary wire format, the canonical encoding
//!
//! Header frame: `time\n`, then `tags\n` if the stream is tagged, then each
//! field name terminated by `\n`, then an empty line. Sample frame: 8 bytes
//! big-endian nanoseconds since the Unix epoch, the tag string plus `\n` if
//! the header is tagged, then one big-endian IEEE-754 double per field.
//!
//! Sample frames cannot start with the byte `t` (0x74) for any realistic
//! timestamp, so a header frame can be recognised mid-stream by probing a
//! single byte.

use std::io::Write;

use crate::sample::{Header, Sample};
use crate::{PipelineError, Result};

use super::{check_first_col, Format, Frame, Marshaller, PushbackReader, TAGS_COL, TIME_COL};

const TIME_BYTES: usize = 8;
const VAL_BYTES: usize = 8;
const SEPARATOR: u8 = b'\n';

pub struct BinaryMarshaller;

impl Marshaller for BinaryMarshaller {
    fn format(&self) -> Format {
        Format::Binary
    }

    fn write_header(&self, header: &Header, w: &mut dyn Write) -> Result<()> {
        w.write_all(TIME_COL.as_bytes())?;
        w.write_all(&[SEPARATOR])?;
        if header.has_tags {
            w.write_all(TAGS_COL.as_bytes())?;
            w.write_all(&[SEPARATOR])?;
        }
        for name in &header.fields {
            w.write_all(name.as_bytes())?;
            w.write_all(&[SEPARATOR])?;
        }
        w.write_all(&[SEPARATOR])?;
        Ok(())
    }

    fn write_sample(&self, sample: &Sample, header: &Header, w: &mut dyn Write) -> Result<()> {
        w.write_all(&(sample.time_nanos() as u64).to_be_bytes())?;
        if header.has_tags {
            w.write_all(sample.tag_string()?.as_bytes())?;
            w.write_all(&[SEPARATOR])?;
        }
        for value in &sample.values {
            w.write_all(&value.to_bits().to_be_bytes())?;
        }
        Ok(())
    }

    fn read(&self, input: &mut PushbackReader, prev: Option<&Header>) -> Result<Option<Frame>> {
        let probe = input.peek(1)?;
        if probe.is_empty() {
            return Ok(None);
        }
        if probe[0] == b't' {
            return read_header(input).map(Some);
        }
        let header = prev.ok_or_else(|| {
            PipelineError::MalformedHeader("binary sample data before any header".to_string())
        })?;
        read_sample_data(input, header)
    }

    fn parse_sample(&self, header: &Header, data: &[u8]) -> Result<Sample> {
        let min_size = TIME_BYTES + header.fields.len() * VAL_BYTES;
        if data.len() < min_size {
            return Err(PipelineError::UnexpectedEof);
        }

        let mut time_bytes = [0u8; TIME_BYTES];
        time_bytes.copy_from_slice(&data[..TIME_BYTES]);
        let mut sample = Sample::from_nanos(u64::from_be_bytes(time_bytes) as i64, Vec::new());
        let mut rest = &data[TIME_BYTES..];

        if header.has_tags {
            let index = rest
                .iter()
                .position(|&b| b == SEPARATOR)
                .ok_or_else(|| PipelineError::BadTag("missing tag terminator".to_string()))?;
            let tags = std::str::from_utf8(&rest[..index])
                .map_err(|e| PipelineError::BadTag(e.to_string()))?;
            sample.parse_tag_string(tags)?;
            rest = &rest[index + 1..];
        }

        if rest.len() != header.fields.len() * VAL_BYTES {
            return Err(PipelineError::InvalidValue(format!(
                "binary sample has {} value bytes, expected {}",
                rest.len(),
                header.fields.len() * VAL_BYTES
            )));
        }
        sample.values.reserve(header.fields.len());
        for chunk in rest.chunks_exact(VAL_BYTES) {
            let mut bits = [0u8; VAL_BYTES];
            bits.copy_from_slice(chunk);
            sample.values.push(f64::from_bits(u64::from_be_bytes(bits)));
        }
        Ok(sample)
    }
}

fn read_header(input: &mut PushbackReader) -> Result<Frame> {
    let first = input
        .read_line()?
        .ok_or(PipelineError::UnexpectedEof)?;
    check_first_col(&String::from_utf8_lossy(&first))?;

    let mut header = Header::default();
    let mut first_col = true;
    loop {
        let name = input.read_line()?.ok_or(PipelineError::UnexpectedEof)?;
        if name.is_empty() {
            return Ok(Frame::Header(header));
        }
        let name = String::from_utf8_lossy(&name).into_owned();
        if first_col && name == TAGS_COL {
            header.has_tags = true;
        } else {
            header.fields.push(name);
        }
        first_col = false;
    }
}

/// Read one complete sample frame into a contiguous buffer: the fixed-size
/// time and value parts plus the variable-length tag line in between.
fn read_sample_data(input: &mut PushbackReader, header: &Header) -> Result<Option<Frame>> {
    let mut data = vec![0u8; TIME_BYTES];
    if !input.read_exact_or_eof(&mut data)? {
        return Ok(None);
    }
    if header.has_tags {
        let tags = input
            .read_until(SEPARATOR)?
            .ok_or(PipelineError::UnexpectedEof)?;
        data.extend_from_slice(&tags);
    }
    let value_start = data.len();
    data.resize(value_start + header.fields.len() * VAL_BYTES, 0);
    input.read_exact(&mut data[value_start..])?;
    Ok(Some(Frame::Sample(data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn reader(data: &[u8]) -> PushbackReader {
        PushbackReader::new(Box::new(std::io::Cursor::new(data.to_vec())))
    }

    fn tagged_header() -> Header {
        Header::new(vec!["cpu".into(), "mem".into()], true)
    }

    fn tagged_samples() -> Vec<Sample> {
        let mut first = Sample::from_nanos(1_000_000_000, vec![0.5, 1024.0]);
        first.set_tag("host", "a");
        let mut second = Sample::from_nanos(2_000_000_000, vec![0.75, 2048.0]);
        second.set_tag("host", "b");
        vec![first, second]
    }

    fn encode(header: &Header, samples: &[Sample]) -> Vec<u8> {
        let m = BinaryMarshaller;
        let mut buf = Vec::new();
        m.write_header(header, &mut buf).unwrap();
        for sample in samples {
            m.write_sample(sample, header, &mut buf).unwrap();
        }
        buf
    }

    fn decode_all(data: &[u8]) -> Vec<(Arc<Header>, Vec<Sample>)> {
        let m = BinaryMarshaller;
        let mut input = reader(data);
        let mut groups: Vec<(Arc<Header>, Vec<Sample>)> = Vec::new();
        let mut current: Option<Arc<Header>> = None;
        while let Some(frame) = m.read(&mut input, current.as_deref()).unwrap() {
            match frame {
                Frame::Header(h) => {
                    let h = Arc::new(h);
                    current = Some(Arc::clone(&h));
                    groups.push((h, Vec::new()));
                }
                Frame::Sample(data) => {
                    let header = current.as_ref().unwrap();
                    let sample = m.parse_sample(header, &data).unwrap();
                    groups.last_mut().unwrap().1.push(sample);
                }
            }
        }
        groups
    }

    #[test]
    fn test_header_encoding() {
        let buf = encode(&tagged_header(), &[]);
        assert_eq!(&buf, b"time\ntags\ncpu\nmem\n\n");

        let untagged = Header::new(vec!["x".into()], false);
        let buf = encode(&untagged, &[]);
        assert_eq!(&buf, b"time\nx\n\n");
    }

    #[test]
    fn test_exact_sample_bytes() {
        let header = tagged_header();
        let samples = tagged_samples();
        let buf = encode(&header, &samples);

        let header_len = b"time\ntags\ncpu\nmem\n\n".len();
        let frame = &buf[header_len..];
        // 8 time bytes, "host=a\n", two 8-byte doubles
        assert_eq!(&frame[..8], &[0x00, 0x00, 0x00, 0x00, 0x3B, 0x9A, 0xCA, 0x00]);
        assert_eq!(&frame[8..15], b"host=a\n");
        assert_eq!(&frame[15..23], &0.5f64.to_bits().to_be_bytes());
        assert_eq!(&frame[23..31], &1024.0f64.to_bits().to_be_bytes());

        let second = &frame[31..];
        assert_eq!(&second[..8], &[0x00, 0x00, 0x00, 0x00, 0x77, 0x35, 0x94, 0x00]);
        assert_eq!(&second[8..15], b"host=b\n");
    }

    #[test]
    fn test_roundtrip_bit_identical() {
        let header = tagged_header();
        let samples = tagged_samples();
        let groups = decode_all(&encode(&header, &samples));

        assert_eq!(groups.len(), 1);
        assert_eq!(*groups[0].0, header);
        assert_eq!(groups[0].1.len(), 2);
        for (decoded, original) in groups[0].1.iter().zip(&samples) {
            assert_eq!(decoded.time_nanos(), original.time_nanos());
            assert_eq!(decoded.tag("host"), original.tag("host"));
            for (a, b) in decoded.values.iter().zip(&original.values) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }
    }

    #[test]
    fn test_multi_header_stream() {
        let first_header = tagged_header();
        let first_samples = tagged_samples();
        let second_header = Header::new(vec!["load".into()], false);
        let second_samples = vec![Sample::from_nanos(3_000_000_000, vec![1.5])];

        let mut buf = encode(&first_header, &first_samples);
        buf.extend_from_slice(&encode(&second_header, &second_samples));
        let groups = decode_all(&buf);

        assert_eq!(groups.len(), 2);
        assert_eq!(*groups[0].0, first_header);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(*groups[1].0, second_header);
        assert_eq!(groups[1].1, second_samples);
    }

    #[test]
    fn test_sample_without_header_rejected() {
        let m = BinaryMarshaller;
        let mut input = reader(&[0x00, 0x00, 0x00, 0x00, 0x3B, 0x9A, 0xCA, 0x00]);
        assert!(matches!(
            m.read(&mut input, None),
            Err(PipelineError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_truncated_sample_is_unexpected_eof() {
        let header = tagged_header();
        let buf = encode(&header, &tagged_samples());
        let header_len = b"time\ntags\ncpu\nmem\n\n".len();
        let truncated = &buf[..header_len + 12];

        let m = BinaryMarshaller;
        let mut input = reader(truncated);
        let frame = m.read(&mut input, None).unwrap().unwrap();
        assert!(matches!(frame, Frame::Header(_)));
        let header = match frame {
            Frame::Header(h) => h,
            _ => unreachable!(),
        };
        assert!(matches!(
            m.read(&mut input, Some(&header)),
            Err(PipelineError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_malformed_first_column() {
        let m = BinaryMarshaller;
        let mut input = reader(b"tempo\nx\n\n");
        assert!(matches!(
            m.read(&mut input, None),
            Err(PipelineError::MalformedHeader(_))
        ));
    }
}
