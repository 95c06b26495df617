//! Field filtering: regex include/exclude and variance-based batch filter

use std::any::Any;
use std::sync::Arc;

use regex::Regex;

use crate::batch::BatchStep;
use crate::pipeline::{Downstream, PipelineContext, SampleProcessor};
use crate::sample::{Header, Sample};
use crate::{PipelineError, Result};

use super::mapper::MetricMapperHelper;

/// Keeps fields that match any include regex (all, when none are given)
/// and match no exclude regex. Reshapes the header accordingly.
pub struct MetricFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    helper: MetricMapperHelper,
    next: Downstream,
    name: String,
}

impl MetricFilter {
    pub fn new() -> Self {
        Self {
            include: Vec::new(),
            exclude: Vec::new(),
            helper: MetricMapperHelper::new(),
            next: Downstream::default(),
            name: "metric filter".to_string(),
        }
    }

    pub fn include(mut self, pattern: &str) -> Result<Self> {
        self.include.push(compile(pattern)?);
        Ok(self)
    }

    pub fn exclude(mut self, pattern: &str) -> Result<Self> {
        self.exclude.push(compile(pattern)?);
        Ok(self)
    }

    /// Include fields containing the literal substring.
    pub fn include_str(self, substring: &str) -> Self {
        self.include(&regex::escape(substring))
            .expect("escaped literal is a valid regex")
    }

    /// Exclude fields containing the literal substring.
    pub fn exclude_str(self, substring: &str) -> Self {
        self.exclude(&regex::escape(substring))
            .expect("escaped literal is a valid regex")
    }

    fn keeps(include: &[Regex], exclude: &[Regex], field: &str) -> bool {
        if exclude.iter().any(|regex| regex.is_match(field)) {
            return false;
        }
        include.is_empty() || include.iter().any(|regex| regex.is_match(field))
    }

    fn construct_indices(
        include: &[Regex],
        exclude: &[Regex],
        header: &Header,
    ) -> (Vec<usize>, Vec<String>) {
        let mut indices = Vec::new();
        let mut fields = Vec::new();
        for (index, field) in header.fields.iter().enumerate() {
            if Self::keeps(include, exclude, field) {
                indices.push(index);
                fields.push(field.clone());
            }
        }
        (indices, fields)
    }
}

impl Default for MetricFilter {
    fn default() -> Self {
        Self::new()
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| PipelineError::InvalidValue(format!("bad filter regex {:?}: {}", pattern, e)))
}

impl SampleProcessor for MetricFilter {
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
        let include = &self.include;
        let exclude = &self.exclude;
        self.helper.incoming_header(header, &self.name, |header| {
            Self::construct_indices(include, exclude, header)
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
        match other.as_any_mut().downcast_mut::<MetricFilter>() {
            Some(other) => {
                self.include.append(&mut other.include);
                self.exclude.append(&mut other.exclude);
                true
            }
            None => false,
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Variance filter (batch step)
// ────────────────────────────────────────────────────────────────────────────

/// Incremental mean/variance accumulator (Welford's method).
#[derive(Default, Clone, Copy)]
struct Running {
    count: u64,
    mean: f64,
    m2: f64,
}

impl Running {
    fn push(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    fn mean(&self) -> f64 {
        self.mean
    }

    fn stddev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / (self.count - 1) as f64).sqrt()
    }
}

/// Batch step dropping fields whose weighted standard deviation (σ/|μ|, or
/// σ when μ = 0) falls below a threshold.
pub struct MetricVarianceFilter {
    min_weighted_stddev: f64,
    description: String,
}

impl MetricVarianceFilter {
    pub fn new(min_weighted_stddev: f64) -> Self {
        Self {
            min_weighted_stddev,
            description: format!("variance filter ({:.2}%)", min_weighted_stddev * 100.0),
        }
    }
}

impl BatchStep for MetricVarianceFilter {
    fn name(&self) -> &str {
        &self.description
    }

    fn process_batch(
        &mut self,
        header: Arc<Header>,
        samples: Vec<Sample>,
    ) -> Result<(Arc<Header>, Vec<Sample>)> {
        let min = self.min_weighted_stddev;
        let stats: Vec<Running> = {
            let mut stats = vec![Running::default(); header.fields.len()];
            for sample in &samples {
                for (stat, value) in stats.iter_mut().zip(&sample.values) {
                    stat.push(*value);
                }
            }
            stats
        };
        // Variances differ per batch, so the mapping is rebuilt every time
        let mut helper = MetricMapperHelper::new();
        let (out_header, out_samples) =
            helper.convert_batch(&header, samples, &self.description, |header| {
                    let mut indices = Vec::new();
                    let mut fields = Vec::new();
                    for (index, field) in header.fields.iter().enumerate() {
                        let mut weighted = stats[index].stddev();
                        let mean = stats[index].mean();
                        if mean != 0.0 {
                            weighted /= mean.abs();
                        }
                        if weighted >= min {
                            indices.push(index);
                            fields.push(field.clone());
                        }
                    }
                    (indices, fields)
                });
        Ok((out_header, out_samples))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testutil::{Collector, VecSource};
    use crate::pipeline::SamplePipeline;

    fn run_filter(filter: MetricFilter, header: Arc<Header>, sample: Sample) -> (Sample, Arc<Header>) {
        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(VecSource::new(vec![(sample, header)])));
        pipeline.add(Box::new(filter));
        let (collector, received, _) = Collector::new();
        pipeline.add(Box::new(collector));
        pipeline.run().unwrap();
        let received = received.lock().unwrap();
        received[0].clone()
    }

    fn cpu_header() -> Arc<Header> {
        Arc::new(Header::new(
            vec!["cpu/user".into(), "cpu/system".into(), "mem/free".into()],
            false,
        ))
    }

    #[test]
    fn test_include_filter() {
        let filter = MetricFilter::new().include("^cpu/").unwrap();
        let (sample, header) = run_filter(
            filter,
            cpu_header(),
            Sample::from_nanos(1, vec![1.0, 2.0, 3.0]),
        );
        assert_eq!(header.fields, vec!["cpu/user", "cpu/system"]);
        assert_eq!(sample.values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_exclude_beats_include() {
        let filter = MetricFilter::new()
            .include("^cpu/")
            .unwrap()
            .exclude("system")
            .unwrap();
        let (sample, header) = run_filter(
            filter,
            cpu_header(),
            Sample::from_nanos(1, vec![1.0, 2.0, 3.0]),
        );
        assert_eq!(header.fields, vec!["cpu/user"]);
        assert_eq!(sample.values, vec![1.0]);
    }

    #[test]
    fn test_literal_substring_filter() {
        let filter = MetricFilter::new().include_str("mem/");
        let (_, header) = run_filter(
            filter,
            cpu_header(),
            Sample::from_nanos(1, vec![1.0, 2.0, 3.0]),
        );
        assert_eq!(header.fields, vec!["mem/free"]);
    }

    #[test]
    fn test_adjacent_filters_merge() {
        let first = MetricFilter::new().exclude("user").unwrap();
        let second = MetricFilter::new().exclude("system").unwrap();

        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(VecSource::new(vec![(
            Sample::from_nanos(1, vec![1.0, 2.0, 3.0]),
            cpu_header(),
        )])));
        pipeline.add(Box::new(first));
        pipeline.add(Box::new(second));
        let (collector, received, _) = Collector::new();
        pipeline.add(Box::new(collector));
        pipeline.run().unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received[0].1.fields, vec!["mem/free"]);
    }

    #[test]
    fn test_variance_filter_drops_flat_fields() {
        let header = Arc::new(Header::new(vec!["flat".into(), "noisy".into()], false));
        let samples: Vec<Sample> = (0..10)
            .map(|i| Sample::from_nanos(i, vec![5.0, (i % 4) as f64 * 100.0]))
            .collect();

        let mut step = MetricVarianceFilter::new(0.1);
        let (out_header, out_samples) = step.process_batch(header, samples).unwrap();
        assert_eq!(out_header.fields, vec!["noisy"]);
        assert_eq!(out_samples.len(), 10);
        assert_eq!(out_samples[0].values.len(), 1);
    }
}
