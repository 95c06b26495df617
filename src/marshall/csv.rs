//! CSV wire format
//!
//! The header line is `time,[tags,]field1,field2,…`; sample lines carry the
//! nanosecond timestamp, the tag string if the header is tagged, and one
//! decimal value per field. A new header anywhere in the stream is detected
//! by its first column being the literal `time`.

use std::io::Write;

use crate::sample::{Header, Sample};
use crate::{PipelineError, Result};

use super::{check_first_col, Format, Frame, Marshaller, PushbackReader, TAGS_COL, TIME_COL};

const SEPARATOR: char = ',';

pub struct CsvMarshaller;

impl Marshaller for CsvMarshaller {
    fn format(&self) -> Format {
        Format::Csv
    }

    fn write_header(&self, header: &Header, w: &mut dyn Write) -> Result<()> {
        let mut line = String::from(TIME_COL);
        if header.has_tags {
            line.push(SEPARATOR);
            line.push_str(TAGS_COL);
        }
        for name in &header.fields {
            line.push(SEPARATOR);
            line.push_str(name);
        }
        line.push('\n');
        w.write_all(line.as_bytes())?;
        Ok(())
    }

    fn write_sample(&self, sample: &Sample, header: &Header, w: &mut dyn Write) -> Result<()> {
        let mut line = sample.time_nanos().to_string();
        if header.has_tags {
            line.push(SEPARATOR);
            line.push_str(&sample.tag_string()?);
        }
        for value in &sample.values {
            line.push(SEPARATOR);
            line.push_str(&format_value(*value));
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
        if is_header_line(&line) {
            return parse_header(&line).map(Some);
        }
        if prev.is_none() {
            return Err(PipelineError::MalformedHeader(format!(
                "CSV stream starts with a sample line: {:?}",
                String::from_utf8_lossy(&line)
            )));
        }
        Ok(Some(Frame::Sample(line)))
    }

    fn parse_sample(&self, header: &Header, data: &[u8]) -> Result<Sample> {
        let line = std::str::from_utf8(data)
            .map_err(|e| PipelineError::InvalidValue(e.to_string()))?;
        let mut columns = line.split(SEPARATOR);

        let time_col = columns
            .next()
            .ok_or(PipelineError::UnexpectedEof)?;
        let nanos: i64 = time_col
            .parse()
            .map_err(|_| PipelineError::InvalidValue(format!("bad CSV timestamp {:?}", time_col)))?;
        let mut sample = Sample::from_nanos(nanos, Vec::with_capacity(header.fields.len()));

        if header.has_tags {
            let tags = columns.next().ok_or(PipelineError::UnexpectedEof)?;
            sample.parse_tag_string(tags)?;
        }

        for column in columns {
            let value: f64 = column
                .parse()
                .map_err(|_| PipelineError::InvalidValue(format!("bad CSV value {:?}", column)))?;
            sample.values.push(value);
        }
        if sample.values.len() != header.fields.len() {
            return Err(PipelineError::ValueCountMismatch {
                values: sample.values.len(),
                fields: header.fields.len(),
            });
        }
        Ok(sample)
    }
}

/// Format a value so that the decimal text parses back to the same double.
fn format_value(value: f64) -> String {
    let mut out = format!("{}", value);
    // Plain integers print without a decimal point; keep them valid floats
    if !out.contains('.') && !out.contains('e') && !out.contains("inf") && !out.contains("NaN") {
        out.push_str(".0");
    }
    out
}

fn is_header_line(line: &[u8]) -> bool {
    line == TIME_COL.as_bytes() || line.starts_with(format!("{}{}", TIME_COL, SEPARATOR).as_bytes())
}

fn parse_header(line: &[u8]) -> Result<Frame> {
    let line = std::str::from_utf8(line)
        .map_err(|e| PipelineError::MalformedHeader(e.to_string()))?;
    let mut columns = line.split(SEPARATOR);
    check_first_col(columns.next().unwrap_or_default())?;

    let mut header = Header::default();
    let mut first_col = true;
    for column in columns {
        if first_col && column == TAGS_COL {
            header.has_tags = true;
        } else if column == TIME_COL || column == TAGS_COL {
            return Err(PipelineError::MalformedHeader(format!(
                "reserved column {:?} in field position",
                column
            )));
        } else {
            header.fields.push(column.to_string());
        }
        first_col = false;
    }
    Ok(Frame::Header(header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn reader(data: &[u8]) -> PushbackReader {
        PushbackReader::new(Box::new(std::io::Cursor::new(data.to_vec())))
    }

    fn decode_all(data: &[u8]) -> Vec<(Arc<Header>, Vec<Sample>)> {
        let m = CsvMarshaller;
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
                    groups
                        .last_mut()
                        .unwrap()
                        .1
                        .push(m.parse_sample(header, &data).unwrap());
                }
            }
        }
        groups
    }

    #[test]
    fn test_write_format() {
        let m = CsvMarshaller;
        let header = Header::new(vec!["cpu".into(), "mem".into()], true);
        let mut sample = Sample::from_nanos(1_000_000_000, vec![0.5, 1024.0]);
        sample.set_tag("host", "a");

        let mut buf = Vec::new();
        m.write_header(&header, &mut buf).unwrap();
        m.write_sample(&sample, &header, &mut buf).unwrap();
        assert_eq!(
            String::from_utf8(buf).unwrap(),
            "time,tags,cpu,mem\n1000000000,host=a,0.5,1024.0\n"
        );
    }

    #[test]
    fn test_reheader_stream() {
        // A second header mid-stream opens a second epoch with more fields
        let data = b"time,tags,x\n1,host=a,1.0\ntime,tags,x,y\n2,host=b,3.0,4.0\n";
        let groups = decode_all(data);

        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0.fields, vec!["x"]);
        assert_eq!(groups[0].1.len(), 1);
        assert_eq!(groups[0].1[0].values, vec![1.0]);
        assert_eq!(groups[1].0.fields, vec!["x", "y"]);
        assert_eq!(groups[1].1.len(), 1);
        assert_eq!(groups[1].1[0].values, vec![3.0, 4.0]);
        assert_eq!(groups[1].1[0].tag("host"), "b");
    }

    #[test]
    fn test_roundtrip_preserves_order() {
        let m = CsvMarshaller;
        let header = Header::new(vec!["b_field".into(), "a_field".into()], true);
        let mut sample = Sample::from_nanos(42, vec![2.0, 1.0]);
        sample.set_tag("zone", "x");
        sample.set_tag("host", "y");

        let mut buf = Vec::new();
        m.write_header(&header, &mut buf).unwrap();
        m.write_sample(&sample, &header, &mut buf).unwrap();

        let groups = decode_all(&buf);
        assert_eq!(*groups[0].0, header);
        assert_eq!(groups[0].1[0], sample);
    }

    #[test]
    fn test_untagged_stream() {
        let groups = decode_all(b"time,x\n5,1.5\n");
        assert!(!groups[0].0.has_tags);
        assert_eq!(groups[0].1[0].values, vec![1.5]);
        assert_eq!(groups[0].1[0].num_tags(), 0);
    }

    #[test]
    fn test_sample_before_header_rejected() {
        let m = CsvMarshaller;
        let mut input = reader(b"1,host=a,1.0\n");
        assert!(matches!(
            m.read(&mut input, None),
            Err(PipelineError::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_bad_value() {
        let m = CsvMarshaller;
        let header = Header::new(vec!["x".into()], false);
        assert!(matches!(
            m.parse_sample(&header, b"1,abc"),
            Err(PipelineError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_value_count_mismatch() {
        let m = CsvMarshaller;
        let header = Header::new(vec!["x".into(), "y".into()], false);
        assert!(matches!(
            m.parse_sample(&header, b"1,2.0"),
            Err(PipelineError::ValueCountMismatch { .. })
        ));
    }

    #[test]
    fn test_unterminated_line_is_unexpected_eof() {
        let m = CsvMarshaller;
        let mut input = reader(b"time,x\n1,2.0");
        let header = match m.read(&mut input, None).unwrap().unwrap() {
            Frame::Header(h) => h,
            _ => panic!("expected header"),
        };
        assert!(matches!(
            m.read(&mut input, Some(&header)),
            Err(PipelineError::UnexpectedEof)
        ));
    }
}
