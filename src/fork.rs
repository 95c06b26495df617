//! Fork / distributor: route samples into sub-pipelines keyed by tag values
//!
//! A [`TagFork`] resolves a tag template against each sample; the resolved
//! string selects (and, on first use, builds) the sub-pipeline that
//! receives the sample. Sub-pipelines are independent processor chains;
//! ordering is preserved per key, never across keys. Closing the fork
//! closes every sub-pipeline in parallel and joins them.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, info, warn};

use crate::pipeline::{Downstream, NoopProcessor, PipelineContext, SampleProcessor};
use crate::sample::{Header, Sample, TagTemplate};
use crate::steps::Decoupler;
use crate::transport::FileSink;
use crate::{PipelineError, Result};

/// Builds the processor chain of one sub-pipeline from its resolved key.
pub type SubPipelineBuilder = Box<dyn FnMut(&str) -> Vec<Box<dyn SampleProcessor>> + Send>;

/// Fold a stage list into a single ownership chain.
fn build_chain(mut stages: Vec<Box<dyn SampleProcessor>>) -> Box<dyn SampleProcessor> {
    let mut chain: Box<dyn SampleProcessor> = Box::new(NoopProcessor::default());
    while let Some(mut stage) = stages.pop() {
        stage.set_downstream(chain);
        chain = stage;
    }
    chain
}

/// Distributes samples over sub-pipelines selected by a tag template.
pub struct TagFork {
    template: TagTemplate,
    builder: SubPipelineBuilder,
    pipelines: HashMap<String, Box<dyn SampleProcessor>>,
    ctx: Option<PipelineContext>,
    next: Downstream,
    name: String,
}

impl TagFork {
    pub fn new(template: TagTemplate, builder: SubPipelineBuilder) -> Self {
        let name = format!("fork by {}", template);
        Self {
            template,
            builder,
            pipelines: HashMap::new(),
            ctx: None,
            next: Downstream::default(),
            name,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// The sub-pipeline keys created so far.
    pub fn keys(&self) -> Vec<&str> {
        self.pipelines.keys().map(String::as_str).collect()
    }

    fn pipeline_for(&mut self, key: &str) -> Result<&mut Box<dyn SampleProcessor>> {
        if !self.pipelines.contains_key(key) {
            let ctx = self
                .ctx
                .as_ref()
                .ok_or_else(|| PipelineError::AlreadyStopped(self.name.clone()))?;
            info!("[{}] creating sub-pipeline for key {:?}", self.name, key);
            let mut chain = build_chain((self.builder)(key));
            chain.start(ctx.clone())?;
            self.pipelines.insert(key.to_string(), chain);
        }
        Ok(self
            .pipelines
            .get_mut(key)
            .expect("sub-pipeline inserted above"))
    }
}

impl SampleProcessor for TagFork {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_downstream(&mut self, next: Box<dyn SampleProcessor>) {
        self.next.set(next);
    }

    fn start(&mut self, ctx: PipelineContext) -> Result<()> {
        self.ctx = Some(ctx.clone());
        self.next.start(ctx)
    }

    fn sample(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()> {
        let key = self.template.resolve(&sample);
        let pipeline = self.pipeline_for(&key)?;
        pipeline.sample(sample, header)
    }

    fn close(&mut self) -> Result<()> {
        let pipelines = std::mem::take(&mut self.pipelines);
        debug!("[{}] closing {} sub-pipeline(s)", self.name, pipelines.len());
        let mut first_error: Option<PipelineError> = None;
        // Close all sub-pipelines in parallel and join them
        let results: Vec<(String, Result<()>)> = thread::scope(|scope| {
            let handles: Vec<_> = pipelines
                .into_iter()
                .map(|(key, mut chain)| {
                    scope.spawn(move || {
                        let result = chain.close();
                        (key, result)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(result) => result,
                    Err(_) => (
                        "unknown".to_string(),
                        Err(PipelineError::Step("sub-pipeline close panicked".to_string())),
                    ),
                })
                .collect()
        });
        for (key, result) in results {
            if let Err(err) = result {
                warn!("[{}] error closing sub-pipeline {:?}: {}", self.name, key, err);
                first_error.get_or_insert(err);
            }
        }
        let downstream = self.next.close();
        match first_error {
            Some(err) => Err(err),
            None => downstream,
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Routes samples into per-key [`FileSink`]s: the tag template doubles as
/// the filename pattern, and each resolved name gets a sink instantiated
/// from the stored configuration, optionally behind a [`Decoupler`] for
/// parallel output.
pub struct MultiFileDistributor {
    template: String,
    config: Option<Arc<Mutex<FileSink>>>,
    /// Wrap each sub-pipeline in a decoupler with this queue size
    pub parallel_output: Option<usize>,
    fork: Option<TagFork>,
    name: String,
}

impl MultiFileDistributor {
    pub fn new(template: impl Into<String>, config: FileSink) -> Self {
        let template = template.into();
        let name = format!("output files {}", template);
        Self {
            template,
            config: Some(Arc::new(Mutex::new(config))),
            parallel_output: None,
            fork: None,
            name,
        }
    }

    pub fn with_parallel_output(mut self, buffer: usize) -> Self {
        self.parallel_output = Some(buffer);
        self
    }

    fn fork(&mut self) -> Result<&mut TagFork> {
        self.fork
            .as_mut()
            .ok_or_else(|| PipelineError::AlreadyStopped(self.name.clone()))
    }
}

impl SampleProcessor for MultiFileDistributor {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_downstream(&mut self, next: Box<dyn SampleProcessor>) {
        if let Some(fork) = &mut self.fork {
            fork.set_downstream(next);
        } else {
            // Wired before start: remember it on a fresh fork shell
            let config = self.config.clone();
            let parallel = self.parallel_output;
            let mut fork = TagFork::new(
                TagTemplate::new(self.template.clone()),
                file_sink_builder(config, parallel),
            )
            .with_name(self.name.clone());
            fork.set_downstream(next);
            self.fork = Some(fork);
        }
    }

    fn start(&mut self, ctx: PipelineContext) -> Result<()> {
        if self.fork.is_none() {
            let config = self.config.clone();
            let parallel = self.parallel_output;
            self.fork = Some(
                TagFork::new(
                    TagTemplate::new(self.template.clone()),
                    file_sink_builder(config, parallel),
                )
                .with_name(self.name.clone()),
            );
        }
        self.fork()?.start(ctx)
    }

    fn sample(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()> {
        self.fork()?.sample(sample, header)
    }

    fn close(&mut self) -> Result<()> {
        self.fork()?.close()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn file_sink_builder(
    config: Option<Arc<Mutex<FileSink>>>,
    parallel_output: Option<usize>,
) -> SubPipelineBuilder {
    Box::new(move |filename: &str| {
        let mut stages: Vec<Box<dyn SampleProcessor>> = Vec::new();
        if let Some(buffer) = parallel_output {
            stages.push(Box::new(Decoupler::new(buffer)));
        }
        if let Some(config) = &config {
            stages.push(Box::new(config.lock().unwrap().config_for(filename)));
        }
        stages
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshall::CsvMarshaller;
    use crate::pipeline::testutil::{Collected, Collector, VecSource};
    use crate::pipeline::SamplePipeline;
    use crate::transport::SampleWriter;

    fn role_sample(nanos: i64, role: &str) -> Sample {
        let mut sample = Sample::from_nanos(nanos, vec![nanos as f64]);
        sample.set_tag("role", role);
        sample
    }

    #[test]
    fn test_fork_routes_by_tag() {
        let header = Arc::new(Header::new(vec!["x".into()], true));
        let collectors: Arc<std::sync::Mutex<HashMap<String, Collected>>> = Arc::default();

        let builder_collectors = Arc::clone(&collectors);
        let fork = TagFork::new(
            TagTemplate::new("${role}"),
            Box::new(move |key| {
                let (collector, received, _) = Collector::new();
                builder_collectors
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), received);
                vec![Box::new(collector) as Box<dyn SampleProcessor>]
            }),
        );

        let roles = ["web", "db", "web", "cache"];
        let samples = roles
            .iter()
            .enumerate()
            .map(|(i, role)| (role_sample(i as i64, role), Arc::clone(&header)))
            .collect();

        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(VecSource::new(samples)));
        pipeline.add(Box::new(fork));
        pipeline.run().unwrap();

        let collectors = collectors.lock().unwrap();
        assert_eq!(collectors.len(), 3, "one sub-pipeline per distinct key");

        let web = collectors.get("web").unwrap().lock().unwrap();
        assert_eq!(web.len(), 2);
        assert_eq!(web[0].0.values, vec![0.0]);
        assert_eq!(web[1].0.values, vec![2.0]);
        drop(web);

        assert_eq!(collectors.get("db").unwrap().lock().unwrap().len(), 1);
        assert_eq!(collectors.get("cache").unwrap().lock().unwrap().len(), 1);
    }

    #[test]
    fn test_fork_closes_all_subpipelines() {
        let header = Arc::new(Header::new(vec!["x".into()], true));
        let closed_flags: Arc<std::sync::Mutex<Vec<Arc<std::sync::atomic::AtomicBool>>>> =
            Arc::default();

        let builder_flags = Arc::clone(&closed_flags);
        let fork = TagFork::new(
            TagTemplate::new("${role}"),
            Box::new(move |_key| {
                let (collector, _, closed) = Collector::new();
                builder_flags.lock().unwrap().push(closed);
                vec![Box::new(collector) as Box<dyn SampleProcessor>]
            }),
        );

        let samples = vec![
            (role_sample(1, "a"), Arc::clone(&header)),
            (role_sample(2, "b"), Arc::clone(&header)),
        ];
        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(VecSource::new(samples)));
        pipeline.add(Box::new(fork));
        pipeline.run().unwrap();

        let flags = closed_flags.lock().unwrap();
        assert_eq!(flags.len(), 2);
        for flag in flags.iter() {
            assert!(flag.load(std::sync::atomic::Ordering::Relaxed));
        }
    }

    #[test]
    fn test_multi_file_distributor_writes_per_key_files() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("metrics-${role}.csv");
        let config = FileSink::new(
            "placeholder.csv",
            Arc::new(CsvMarshaller),
            SampleWriter::new().with_parallelism(2),
        );

        let header = Arc::new(Header::new(vec!["x".into()], true));
        let roles = ["web", "db", "web"];
        let samples = roles
            .iter()
            .enumerate()
            .map(|(i, role)| (role_sample(i as i64, role), Arc::clone(&header)))
            .collect();

        let distributor =
            MultiFileDistributor::new(template.display().to_string(), config)
                .with_parallel_output(16);
        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(VecSource::new(samples)));
        pipeline.add(Box::new(distributor));
        pipeline.run().unwrap();

        let web = std::fs::read_to_string(dir.path().join("metrics-web.csv")).unwrap();
        assert_eq!(web.lines().count(), 3, "header plus two web samples");
        let db = std::fs::read_to_string(dir.path().join("metrics-db.csv")).unwrap();
        assert_eq!(db.lines().count(), 2);
        assert!(!dir.path().join("metrics-cache.csv").exists());
    }
}
