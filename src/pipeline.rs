//! Pipeline runtime: processor chain, lifecycle and error surfacing
//!
//! A pipeline is a source driving an ordered chain of [`SampleProcessor`]
//! stages. Each stage owns its downstream neighbour; synchronous stages
//! forward on the caller's thread, asynchronous stages (decoupler, batch,
//! sink writers) move their downstream into a worker thread and hand
//! samples over bounded channels.
//!
//! ## Lifecycle
//!
//! - `start` is called once, front to back, before any sample flows; stages
//!   spawn their workers here and propagate the call downstream
//! - `sample` is called by the upstream stage, never concurrently on the
//!   same stage
//! - `close` is called exactly once after the source finishes; a stage
//!   flushes its state, then closes its downstream after all in-flight
//!   samples have been forwarded
//!
//! Errors surface through a shared channel carried by [`PipelineContext`];
//! the driver decides whether a reported error shuts the pipeline down.
//! This replaces upstream back-pointers, so the stage graph stays acyclic.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::sample::{Header, Sample};
use crate::{PipelineError, Result};

/// Poll interval for loops that block on I/O but must observe the stop
/// signal.
pub(crate) const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shared shutdown flag, observed by sources in their read/accept loops and
/// by workers between hand-offs.
#[derive(Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Sleep up to `duration`, waking early when stopped. Returns true if
    /// the signal fired during the sleep.
    pub fn sleep(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_stopped() {
                return true;
            }
            let slice = remaining.min(STOP_POLL_INTERVAL);
            thread::sleep(slice);
            remaining -= slice;
        }
        self.is_stopped()
    }
}

/// An error reported by a stage through the shared error channel.
#[derive(Debug)]
pub struct StageError {
    pub stage: String,
    pub error: PipelineError,
    /// Fatal errors shut the whole pipeline down; transient ones are logged
    pub fatal: bool,
}

/// Cloneable handle injected into every stage at start time: the shared
/// error channel plus the process-wide stop signal.
#[derive(Clone)]
pub struct PipelineContext {
    errors: Sender<StageError>,
    stop: StopSignal,
}

impl PipelineContext {
    fn new(errors: Sender<StageError>, stop: StopSignal) -> Self {
        Self { errors, stop }
    }

    /// A standalone context for driving stages outside a pipeline (tests,
    /// sub-pipelines with their own supervision). Errors reported to it are
    /// only logged.
    pub fn detached() -> Self {
        let (tx, rx) = unbounded();
        thread::Builder::new()
            .name("detached-errors".to_string())
            .spawn(move || {
                for err in rx {
                    let err: StageError = err;
                    warn!("[{}] unsupervised error: {}", err.stage, err.error);
                }
            })
            .ok();
        Self::new(tx, StopSignal::new())
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Report a transient error; the pipeline keeps running.
    pub fn report(&self, stage: &str, error: PipelineError) {
        warn!("[{}] {}", stage, error);
        let _ = self.errors.send(StageError {
            stage: stage.to_string(),
            error,
            fatal: false,
        });
    }

    /// Report a fatal error; the driver will stop the pipeline.
    pub fn report_fatal(&self, stage: &str, error: PipelineError) {
        error!("[{}] {}", stage, error);
        let _ = self.errors.send(StageError {
            stage: stage.to_string(),
            error,
            fatal: true,
        });
    }
}

/// One stage of a pipeline.
///
/// Implementations own their per-stage state exclusively. A stage that
/// buffers samples (batch, fork, ring) takes ownership of them; forwarding
/// hands a sample to the next stage.
pub trait SampleProcessor: Send {
    fn name(&self) -> &str;

    /// Wire the downstream neighbour. Called once, before `start`.
    fn set_downstream(&mut self, next: Box<dyn SampleProcessor>);

    /// Begin work; spawn workers if needed, and propagate to downstream.
    fn start(&mut self, ctx: PipelineContext) -> Result<()>;

    /// Process one sample of the epoch described by `header`.
    fn sample(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()>;

    /// Flush and release, then close downstream. Called exactly once.
    fn close(&mut self) -> Result<()>;

    /// Attempt to absorb a directly adjacent stage of the same kind.
    /// Returns true if `other` was merged and should be discarded.
    fn merge_with(&mut self, _other: &mut dyn SampleProcessor) -> bool {
        false
    }

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// The downstream end of a stage: either the next processor or, for the
/// last stage, nothing. Forwarding into nothing drops the sample.
#[derive(Default)]
pub struct Downstream(Option<Box<dyn SampleProcessor>>);

impl Downstream {
    pub fn set(&mut self, next: Box<dyn SampleProcessor>) {
        self.0 = Some(next);
    }

    /// Move the downstream chain out, e.g. into a worker thread.
    pub fn take(&mut self) -> Downstream {
        Downstream(self.0.take())
    }

    pub fn start(&mut self, ctx: PipelineContext) -> Result<()> {
        match &mut self.0 {
            Some(next) => next.start(ctx),
            None => Ok(()),
        }
    }

    pub fn forward(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()> {
        match &mut self.0 {
            Some(next) => next.sample(sample, header),
            None => Ok(()),
        }
    }

    pub fn close(&mut self) -> Result<()> {
        match &mut self.0 {
            Some(next) => next.close(),
            None => Ok(()),
        }
    }
}

/// A stage that does nothing but forward. Used as the terminal stage of an
/// empty chain and as a base for tests.
#[derive(Default)]
pub struct NoopProcessor {
    next: Downstream,
}

impl SampleProcessor for NoopProcessor {
    fn name(&self) -> &str {
        "noop"
    }

    fn set_downstream(&mut self, next: Box<dyn SampleProcessor>) {
        self.next.set(next);
    }

    fn start(&mut self, ctx: PipelineContext) -> Result<()> {
        self.next.start(ctx)
    }

    fn sample(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()> {
        self.next.forward(sample, header)
    }

    fn close(&mut self) -> Result<()> {
        self.next.close()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A data source that drives a processor chain until EOF or stop.
pub trait SampleSource: Send {
    fn name(&self) -> &str;

    /// Blocking read loop: decode samples and feed them to `out`. Returns
    /// when the input is exhausted, the stop signal fires, or an
    /// unrecoverable error occurs. Must not close `out`.
    fn run(&mut self, out: &mut dyn SampleProcessor, ctx: &PipelineContext) -> Result<()>;
}

// ────────────────────────────────────────────────────────────────────────────
// SamplePipeline — assembly and driver
// ────────────────────────────────────────────────────────────────────────────

/// An ordered chain of processors fed by one source.
#[derive(Default)]
pub struct SamplePipeline {
    source: Option<Box<dyn SampleSource>>,
    processors: Vec<Box<dyn SampleProcessor>>,
}

impl SamplePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_source(&mut self, source: Box<dyn SampleSource>) -> &mut Self {
        self.source = Some(source);
        self
    }

    pub fn add(&mut self, processor: Box<dyn SampleProcessor>) -> &mut Self {
        self.processors.push(processor);
        self
    }

    pub fn num_processors(&self) -> usize {
        self.processors.len()
    }

    /// Merge directly adjacent mergeable stages (e.g. two metric filters
    /// combine their regex sets into one pass).
    fn merge_adjacent(&mut self) {
        let mut index = 0;
        while index + 1 < self.processors.len() {
            let (left, right) = self.processors.split_at_mut(index + 1);
            if left[index].merge_with(right[0].as_mut()) {
                let removed = self.processors.remove(index + 1);
                debug!(
                    "[pipeline] merged stage '{}' into '{}'",
                    removed.name(),
                    self.processors[index].name()
                );
            } else {
                index += 1;
            }
        }
    }

    /// Wire the processors into a single ownership chain, back to front.
    fn build_chain(&mut self) -> Box<dyn SampleProcessor> {
        let mut chain: Box<dyn SampleProcessor> = Box::new(NoopProcessor::default());
        while let Some(mut processor) = self.processors.pop() {
            processor.set_downstream(chain);
            chain = processor;
        }
        chain
    }

    /// Start the pipeline; returns a handle for stopping and joining it.
    pub fn start(mut self) -> Result<RunningPipeline> {
        let mut source = self
            .source
            .take()
            .ok_or_else(|| PipelineError::Endpoint("pipeline has no source".to_string()))?;

        self.merge_adjacent();
        let mut chain = self.build_chain();

        let (error_tx, error_rx) = unbounded();
        let stop = StopSignal::new();
        let ctx = PipelineContext::new(error_tx, stop.clone());
        chain.start(ctx.clone())?;

        let (completion_tx, completion_rx) = unbounded();
        let source_ctx = ctx.clone();
        let source_name = source.name().to_string();
        info!("[pipeline] starting source '{}'", source_name);
        let handle = thread::Builder::new()
            .name(source_name.clone())
            .spawn(move || {
                let mut result = source.run(chain.as_mut(), &source_ctx);
                if let Err(err) = &result {
                    error!("[{}] source failed: {}", source_name, err);
                }
                debug!("[{}] source finished, closing chain", source_name);
                let close_result = chain.close();
                if result.is_ok() {
                    result = close_result;
                } else if let Err(err) = close_result {
                    error!("[{}] error closing pipeline: {}", source_name, err);
                }
                let _ = completion_tx.send(result);
            })
            .map_err(PipelineError::Io)?;

        Ok(RunningPipeline {
            stop,
            errors: error_rx,
            completion: completion_rx,
            handle: Some(handle),
        })
    }

    /// Run the pipeline to completion: start, supervise, join.
    pub fn run(self) -> Result<()> {
        self.start()?.wait()
    }
}

/// Handle to a started pipeline: stop it, or wait for completion while
/// supervising stage errors.
pub struct RunningPipeline {
    stop: StopSignal,
    errors: Receiver<StageError>,
    completion: Receiver<Result<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RunningPipeline {
    pub fn stop(&self) {
        info!("[pipeline] stop requested");
        self.stop.stop();
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Supervise until the source finishes, then join. Returns the first
    /// fatal error, if any. Non-fatal errors have already been logged by
    /// the reporting stage.
    pub fn wait(mut self) -> Result<()> {
        let mut first_fatal: Option<PipelineError> = None;
        let mut source_result: Result<()> = Ok(());
        loop {
            crossbeam_channel::select! {
                recv(self.errors) -> msg => {
                    if let Ok(stage_error) = msg {
                        if stage_error.fatal && first_fatal.is_none() {
                            first_fatal = Some(stage_error.error);
                            self.stop.stop();
                        }
                    }
                }
                recv(self.completion) -> msg => {
                    if let Ok(result) = msg {
                        source_result = result;
                    }
                    break;
                }
            }
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("[pipeline] source thread panicked");
            }
        }
        // Late errors reported during close
        while let Ok(stage_error) = self.errors.try_recv() {
            if stage_error.fatal && first_fatal.is_none() {
                first_fatal = Some(stage_error.error);
            }
        }
        info!("[pipeline] finished");
        match first_fatal {
            Some(err) => Err(err),
            None => source_result,
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Test support
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub(crate) type Collected = Arc<Mutex<Vec<(Sample, Arc<Header>)>>>;

    /// Terminal test stage that records everything it receives.
    pub(crate) struct Collector {
        pub received: Collected,
        pub closed: Arc<AtomicBool>,
        next: Downstream,
    }

    impl Collector {
        pub fn new() -> (Self, Collected, Arc<AtomicBool>) {
            let received: Collected = Arc::default();
            let closed = Arc::new(AtomicBool::new(false));
            (
                Self {
                    received: Arc::clone(&received),
                    closed: Arc::clone(&closed),
                    next: Downstream::default(),
                },
                received,
                closed,
            )
        }
    }

    impl SampleProcessor for Collector {
        fn name(&self) -> &str {
            "collector"
        }

        fn set_downstream(&mut self, next: Box<dyn SampleProcessor>) {
            self.next.set(next);
        }

        fn start(&mut self, ctx: PipelineContext) -> Result<()> {
            self.next.start(ctx)
        }

        fn sample(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()> {
            self.received
                .lock()
                .unwrap()
                .push((sample.clone(), Arc::clone(header)));
            self.next.forward(sample, header)
        }

        fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::Relaxed);
            self.next.close()
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    /// Source that emits a fixed list of (sample, header) pairs.
    pub(crate) struct VecSource {
        pub samples: VecDeque<(Sample, Arc<Header>)>,
    }

    impl VecSource {
        pub fn new(samples: Vec<(Sample, Arc<Header>)>) -> Self {
            Self {
                samples: samples.into(),
            }
        }
    }

    impl SampleSource for VecSource {
        fn name(&self) -> &str {
            "vec_source"
        }

        fn run(&mut self, out: &mut dyn SampleProcessor, ctx: &PipelineContext) -> Result<()> {
            while let Some((sample, header)) = self.samples.pop_front() {
                if ctx.is_stopped() {
                    break;
                }
                out.sample(sample, &header)?;
            }
            Ok(())
        }
    }

    pub(crate) fn numbered_samples(count: usize, header: &Arc<Header>) -> Vec<(Sample, Arc<Header>)> {
        (0..count)
            .map(|i| {
                (
                    Sample::from_nanos(i as i64, vec![i as f64]),
                    Arc::clone(header),
                )
            })
            .collect()
    }

    pub(crate) fn single_field_header() -> Arc<Header> {
        Arc::new(Header::new(vec!["value".into()], true))
    }
}
