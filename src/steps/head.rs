//! Head processor: pass the first N samples, drop the rest

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use crate::pipeline::{Downstream, PipelineContext, SampleProcessor};
use crate::sample::{Header, Sample};
use crate::Result;

/// Forwards the first `limit` samples and silently drops everything after.
pub struct Head {
    limit: u64,
    seen: u64,
    next: Downstream,
    name: String,
}

impl Head {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            seen: 0,
            next: Downstream::default(),
            name: format!("head {}", limit),
        }
    }
}

impl SampleProcessor for Head {
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
        if self.seen >= self.limit {
            return Ok(());
        }
        self.seen += 1;
        if self.seen == self.limit {
            debug!("[{}] limit reached, dropping further samples", self.name);
        }
        self.next.forward(sample, header)
    }

    fn close(&mut self) -> Result<()> {
        self.next.close()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::testutil::{numbered_samples, single_field_header, Collector, VecSource};
    use crate::pipeline::SamplePipeline;

    #[test]
    fn test_head_limits_stream() {
        let header = single_field_header();
        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(VecSource::new(numbered_samples(10, &header))));
        pipeline.add(Box::new(Head::new(3)));
        let (collector, received, _) = Collector::new();
        pipeline.add(Box::new(collector));
        pipeline.run().unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 3);
        assert_eq!(received[2].0.values, vec![2.0]);
    }

    #[test]
    fn test_head_larger_than_stream() {
        let header = single_field_header();
        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(VecSource::new(numbered_samples(2, &header))));
        pipeline.add(Box::new(Head::new(100)));
        let (collector, received, _) = Collector::new();
        pipeline.add(Box::new(collector));
        pipeline.run().unwrap();
        assert_eq!(received.lock().unwrap().len(), 2);
    }
}
