//! Header-reshaping processors: select, reorder and rename fields
//!
//! All reshaping stages share [`MetricMapperHelper`]: on every header
//! epoch it computes which input value positions survive and what the new
//! header looks like, then remaps each sample's value vector accordingly.
//! Samples are rebuilt rather than mutated in place, so buffered copies
//! upstream stay untouched.

use std::any::Any;
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::pipeline::{Downstream, PipelineContext, SampleProcessor};
use crate::sample::{Header, HeaderChecker, Sample};
use crate::Result;

/// Shared logic of all field-remapping stages: tracks the current epoch and
/// the value indices that survive into the output header.
pub(crate) struct MetricMapperHelper {
    checker: HeaderChecker,
    out_header: Option<Arc<Header>>,
    out_indices: Vec<usize>,
}

impl MetricMapperHelper {
    pub(crate) fn new() -> Self {
        Self {
            checker: HeaderChecker::new(),
            out_header: None,
            out_indices: Vec::new(),
        }
    }

    /// Recompute the mapping when the epoch changes. `construct` returns
    /// the surviving input indices and the output field names, in order.
    pub(crate) fn incoming_header(
        &mut self,
        header: &Arc<Header>,
        description: &str,
        construct: impl FnOnce(&Header) -> (Vec<usize>, Vec<String>),
    ) {
        if !self.checker.header_changed(header) {
            return;
        }
        let (indices, fields) = construct(header);
        if fields.is_empty() {
            warn!("[{}] removed all metrics", description);
        } else {
            debug!(
                "[{}] changes metrics {} -> {}",
                description,
                header.fields.len(),
                fields.len()
            );
        }
        self.out_indices = indices;
        self.out_header = Some(Arc::new(header.with_fields(fields)));
    }

    /// Build the output sample for the current mapping.
    pub(crate) fn convert_sample(&self, sample: &Sample) -> Sample {
        let mut out = sample.clone();
        out.values = self
            .out_indices
            .iter()
            .map(|&index| sample.values[index])
            .collect();
        out
    }

    pub(crate) fn out_header(&self) -> Option<&Arc<Header>> {
        self.out_header.as_ref()
    }

    /// Remap a whole batch in place, returning the new header.
    pub(crate) fn convert_batch(
        &mut self,
        header: &Arc<Header>,
        samples: Vec<Sample>,
        description: &str,
        construct: impl FnOnce(&Header) -> (Vec<usize>, Vec<String>),
    ) -> (Arc<Header>, Vec<Sample>) {
        self.incoming_header(header, description, construct);
        let converted = samples.iter().map(|s| self.convert_sample(s)).collect();
        let out_header = self
            .out_header
            .clone()
            .unwrap_or_else(|| Arc::clone(header));
        (out_header, converted)
    }
}

/// Reorders and selects fields by an explicit name list. Names missing
/// from the input header are logged and dropped.
pub struct MetricMapper {
    metrics: Vec<String>,
    helper: MetricMapperHelper,
    next: Downstream,
    name: String,
}

impl MetricMapper {
    pub fn new(metrics: Vec<String>) -> Self {
        let name = format!("metric mapper ({} fields)", metrics.len());
        Self {
            metrics,
            helper: MetricMapperHelper::new(),
            next: Downstream::default(),
            name,
        }
    }

    fn construct_indices(metrics: &[String], name: &str, header: &Header) -> (Vec<usize>, Vec<String>) {
        let mut indices = Vec::with_capacity(metrics.len());
        let mut fields = Vec::with_capacity(metrics.len());
        for metric in metrics {
            match header.fields.iter().position(|field| field == metric) {
                Some(index) => {
                    indices.push(index);
                    fields.push(metric.clone());
                }
                None => warn!("[{}] metric {} not found", name, metric),
            }
        }
        (indices, fields)
    }
}

impl SampleProcessor for MetricMapper {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_downstream(&mut self, next: Box<dyn SampleProcessor>) {
        self.next.set(next);
    }

    fn start(&mut self, ctx: PipelineContext) -> Result<()> {
        self.next.start(ctx)
    }

    fn sample(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()> {
        let metrics = &self.metrics;
        let name = &self.name;
        self.helper.incoming_header(header, name, |header| {
            Self::construct_indices(metrics, name, header)
        });
        let out = self.helper.convert_sample(&sample);
        match self.helper.out_header() {
            Some(out_header) => {
                let out_header = Arc::clone(out_header);
                self.next.forward(out, &out_header)
            }
            None => self.next.forward(sample, header),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.next.close()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Applies a sequence of regex rewrites to every field name, then sorts
/// the header lexicographically.
pub struct MetricRenamer {
    rules: Vec<(Regex, String)>,
    helper: MetricMapperHelper,
    next: Downstream,
    name: String,
}

impl MetricRenamer {
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            helper: MetricMapperHelper::new(),
            next: Downstream::default(),
            name: "metric renamer".to_string(),
        }
    }

    /// Add a regex rewrite; `$1`-style capture references are supported in
    /// the replacement.
    pub fn rename(mut self, pattern: &str, replacement: impl Into<String>) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| crate::PipelineError::InvalidValue(format!("bad rename regex: {}", e)))?;
        self.rules.push((regex, replacement.into()));
        Ok(self)
    }

    fn construct_indices(rules: &[(Regex, String)], header: &Header) -> (Vec<usize>, Vec<String>) {
        let mut renamed: Vec<(usize, String)> = header
            .fields
            .iter()
            .enumerate()
            .map(|(index, field)| {
                let mut field = field.clone();
                for (regex, replacement) in rules {
                    field = regex.replace_all(&field, replacement.as_str()).into_owned();
                }
                (index, field)
            })
            .collect();
        renamed.sort_by(|a, b| a.1.cmp(&b.1));
        renamed.into_iter().unzip()
    }
}

impl Default for MetricRenamer {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleProcessor for MetricRenamer {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_downstream(&mut self, next: Box<dyn SampleProcessor>) {
        self.next.set(next);
    }

    fn start(&mut self, ctx: PipelineContext) -> Result<()> {
        self.next.start(ctx)
    }

    fn sample(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()> {
        let rules = &self.rules;
        self.helper
            .incoming_header(header, &self.name, |header| {
                Self::construct_indices(rules, header)
            });
        let out = self.helper.convert_sample(&sample);
        match self.helper.out_header() {
            Some(out_header) => {
                let out_header = Arc::clone(out_header);
                self.next.forward(out, &out_header)
            }
            None => self.next.forward(sample, header),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.next.close()
    }

    fn merge_with(&mut self, other: &mut dyn SampleProcessor) -> bool {
        match other.as_any_mut().downcast_mut::<MetricRenamer>() {
            Some(other) => {
                self.rules.append(&mut other.rules);
                true
            }
            None => false,
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
