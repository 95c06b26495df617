//! Core data types for metric streams
//!
//! A [`Sample`] is a wall-clock timestamp, a vector of floating-point values
//! and a set of string tags. The meaning of each value position is defined
//! by the current [`Header`], which is shared read-only by all samples of a
//! header epoch. A new header starts a new epoch; [`HeaderChecker`] detects
//! the boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{PipelineError, Result};

/// A single metric value. All values in a sample are homogeneous doubles.
pub type Value = f64;

/// Separator between `key=value` pairs in the serialised tag string.
pub const TAG_SEPARATOR: char = ' ';
/// Separator between key and value within one tag.
pub const TAG_EQUALS: char = '=';

/// An ordered list of field names describing the value vector of an epoch.
///
/// Headers are immutable once emitted. Reshaping a stream means emitting a
/// new header, which downstream stages must treat as a flush point.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Header {
    /// Field names, in the order values appear in each sample
    pub fields: Vec<String>,
    /// Whether samples of this epoch carry tags on the wire
    pub has_tags: bool,
}

impl Header {
    pub fn new(fields: Vec<String>, has_tags: bool) -> Self {
        Self { fields, has_tags }
    }

    /// Build a header with the same `has_tags` flag but different fields.
    pub fn with_fields(&self, fields: Vec<String>) -> Self {
        Self {
            fields,
            has_tags: self.has_tags,
        }
    }

    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Header[{} fields, tags={}]", self.fields.len(), self.has_tags)
    }
}

/// One measurement: a timestamp, one value per header field, and tags.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// Wall-clock time of the measurement, nanosecond precision
    pub time: DateTime<Utc>,
    /// One value per field of the current header
    pub values: Vec<Value>,
    tags: BTreeMap<String, String>,
}

impl Sample {
    /// Create a new sample without tags
    pub fn new(time: DateTime<Utc>, values: Vec<Value>) -> Self {
        Self {
            time,
            values,
            tags: BTreeMap::new(),
        }
    }

    /// Create a sample from a nanosecond Unix timestamp
    pub fn from_nanos(nanos: i64, values: Vec<Value>) -> Self {
        Self::new(DateTime::from_timestamp_nanos(nanos), values)
    }

    /// Nanoseconds since the Unix epoch
    pub fn time_nanos(&self) -> i64 {
        self.time.timestamp_nanos_opt().unwrap_or_default()
    }

    /// Look up a tag value. Returns the empty string for unset tags,
    /// mirroring the wire representation.
    pub fn tag(&self, key: &str) -> &str {
        self.tags.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn num_tags(&self) -> usize {
        self.tags.len()
    }

    /// Iterate tags in ascending key order.
    pub fn sorted_tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Verify that this sample fits the given header.
    pub fn check(&self, header: &Header) -> Result<()> {
        if self.values.len() != header.fields.len() {
            return Err(PipelineError::ValueCountMismatch {
                values: self.values.len(),
                fields: header.fields.len(),
            });
        }
        Ok(())
    }

    /// Serialise the tags as `k1=v1 k2=v2` with keys in ascending order.
    /// An empty string represents zero tags. Keys or values containing the
    /// separator characters are rejected here, on the way to the wire.
    pub fn tag_string(&self) -> Result<String> {
        let mut out = String::new();
        for (key, value) in &self.tags {
            check_tag_part(key)?;
            check_tag_part(value)?;
            if !out.is_empty() {
                out.push(TAG_SEPARATOR);
            }
            out.push_str(key);
            out.push(TAG_EQUALS);
            out.push_str(value);
        }
        Ok(out)
    }

    /// Parse a tag string produced by [`Sample::tag_string`], replacing all
    /// current tags. Trailing whitespace is not accepted.
    pub fn parse_tag_string(&mut self, tags: &str) -> Result<()> {
        self.tags = parse_tag_string(tags)?;
        Ok(())
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Sample[t={}, {} values, {} tags]",
            self.time.to_rfc3339_opts(SecondsFormat::Nanos, true),
            self.values.len(),
            self.tags.len()
        )
    }
}

fn check_tag_part(part: &str) -> Result<()> {
    if part.contains(TAG_SEPARATOR) || part.contains(TAG_EQUALS) {
        return Err(PipelineError::BadTag(format!(
            "tag part {:?} contains a separator character",
            part
        )));
    }
    Ok(())
}

/// Parse `k1=v1 k2=v2` into a sorted tag map. The empty string is legal.
pub fn parse_tag_string(tags: &str) -> Result<BTreeMap<String, String>> {
    let mut result = BTreeMap::new();
    if tags.is_empty() {
        return Ok(result);
    }
    for pair in tags.split(TAG_SEPARATOR) {
        let (key, value) = pair
            .split_once(TAG_EQUALS)
            .ok_or_else(|| PipelineError::BadTag(format!("missing '=' in {:?}", pair)))?;
        if key.is_empty() || key.ends_with(char::is_whitespace) || value.ends_with(char::is_whitespace)
        {
            return Err(PipelineError::BadTag(format!("malformed pair {:?}", pair)));
        }
        result.insert(key.to_string(), value.to_string());
    }
    Ok(result)
}

/// Tracks the current header epoch and detects epoch boundaries.
///
/// The fast path compares `Arc` identities; content comparison only runs
/// when a stage re-allocates an identical header.
#[derive(Default)]
pub struct HeaderChecker {
    last: Option<Arc<Header>>,
}

impl HeaderChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// The header of the current epoch, if any sample has been seen.
    pub fn last_header(&self) -> Option<&Arc<Header>> {
        self.last.as_ref()
    }

    /// Returns true if the given header differs from the current epoch,
    /// including for the very first header.
    pub fn header_changed(&mut self, header: &Arc<Header>) -> bool {
        let changed = match &self.last {
            Some(last) => !Arc::ptr_eq(last, header) && **last != **header,
            None => true,
        };
        if changed {
            self.last = Some(Arc::clone(header));
        }
        changed
    }

    /// Like [`HeaderChecker::header_changed`], but the first header does not
    /// count as a change. Used by stages that flush state on epoch
    /// boundaries but have nothing to flush before the first epoch.
    pub fn initialized_header_changed(&mut self, header: &Arc<Header>) -> bool {
        let initialized = self.last.is_some();
        self.header_changed(header) && initialized
    }
}

/// A string with `${key}` placeholders resolved against a sample's tags.
///
/// Used for fork keys, filename patterns and tag values. Unresolved keys
/// are replaced by the configured `missing` string.
#[derive(Clone, Debug)]
pub struct TagTemplate {
    template: String,
    missing: String,
}

impl TagTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            missing: String::new(),
        }
    }

    /// Set the replacement for tags the sample does not carry
    pub fn with_missing(mut self, missing: impl Into<String>) -> Self {
        self.missing = missing.into();
        self
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Replace every `${key}` in the template with the sample's tag value.
    pub fn resolve(&self, sample: &Sample) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();
        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            match rest[start + 2..].find('}') {
                Some(end) => {
                    let key = &rest[start + 2..start + 2 + end];
                    if sample.has_tag(key) {
                        out.push_str(sample.tag(key));
                    } else {
                        out.push_str(&self.missing);
                    }
                    rest = &rest[start + 2 + end + 1..];
                }
                None => {
                    // Unterminated placeholder, emit verbatim
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl fmt::Display for TagTemplate {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.template)
    }
}
