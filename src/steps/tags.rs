//! Tagging processor: set tag templates on every sample

use std::any::Any;
use std::sync::Arc;

use crate::pipeline::{Downstream, PipelineContext, SampleProcessor};
use crate::sample::{Header, Sample, TagTemplate};
use crate::Result;

/// Sets the configured tags on every passing sample. Values are
/// [`TagTemplate`]s, so existing tags can be combined into new ones.
pub struct Tagger {
    templates: Vec<(String, TagTemplate)>,
    next: Downstream,
    name: String,
}

impl Tagger {
    pub fn new() -> Self {
        Self {
            templates: Vec::new(),
            next: Downstream::default(),
            name: "tagger".to_string(),
        }
    }

    pub fn set(mut self, key: impl Into<String>, template: impl Into<String>) -> Self {
        self.templates
            .push((key.into(), TagTemplate::new(template.into())));
        self
    }
}

impl Default for Tagger {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleProcessor for Tagger {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_downstream(&mut self, next: Box<dyn SampleProcessor>) {
        self.next.set(next);
    }

    fn start(&mut self, ctx: PipelineContext) -> Result<()> {
        self.next.start(ctx)
    }

    fn sample(&mut self, mut sample: Sample, header: &Arc<Header>) -> Result<()> {
        for (key, template) in &self.templates {
            let value = template.resolve(&sample);
            sample.set_tag(key.clone(), value);
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
