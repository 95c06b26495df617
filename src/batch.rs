//! Epoch-buffering batch processor
//!
//! Buffers all samples of one header epoch and flushes them through a chain
//! of [`BatchStep`]s. A flush is triggered by a header change, by a change
//! of the configured flush tag, by a wall-clock timeout with no new
//! samples, or by closing the stage.
//!
//! ## Coordination
//!
//! The receiving side never touches the buffer: every sample is handed to a
//! worker thread which owns the buffer, the step chain and the downstream
//! chain. Triggered flushes travel as in-band requests carrying a reply
//! channel, so the error of a flush is returned synchronously from the
//! `sample()` or `close()` call that caused it. A timeout flush has no
//! caller to answer to; its error is parked and returned from the next
//! `sample()` call.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::pipeline::{Downstream, PipelineContext, SampleProcessor};
use crate::sample::{Header, HeaderChecker, Sample};
use crate::{PipelineError, Result};

const BATCH_CHANNEL_BUFFER: usize = 1024;

/// One step of a batch processing chain. Steps may shrink, reorder or
/// replace the sample set and reshape the header.
pub trait BatchStep: Send {
    fn name(&self) -> &str;

    fn process_batch(
        &mut self,
        header: Arc<Header>,
        samples: Vec<Sample>,
    ) -> Result<(Arc<Header>, Vec<Sample>)>;
}

/// A batch step built from a closure, for small transformations and tests.
pub struct SimpleBatchStep<F> {
    description: String,
    process: F,
}

impl<F> SimpleBatchStep<F>
where
    F: FnMut(Arc<Header>, Vec<Sample>) -> Result<(Arc<Header>, Vec<Sample>)> + Send,
{
    pub fn new(description: impl Into<String>, process: F) -> Self {
        Self {
            description: description.into(),
            process,
        }
    }
}

impl<F> BatchStep for SimpleBatchStep<F>
where
    F: FnMut(Arc<Header>, Vec<Sample>) -> Result<(Arc<Header>, Vec<Sample>)> + Send,
{
    fn name(&self) -> &str {
        &self.description
    }

    fn process_batch(
        &mut self,
        header: Arc<Header>,
        samples: Vec<Sample>,
    ) -> Result<(Arc<Header>, Vec<Sample>)> {
        (self.process)(header, samples)
    }
}

enum BatchMsg {
    Sample(Sample, Arc<Header>),
    Flush(Sender<Result<()>>),
    Close(Sender<Result<()>>),
}

/// Buffers one header epoch and flushes it through the configured steps.
pub struct BatchProcessor {
    steps: Option<Vec<Box<dyn BatchStep>>>,
    /// Flush whenever the value of this tag changes between samples
    pub flush_tag: Option<String>,
    /// Flush when no sample arrives for this long (wall-clock)
    pub flush_timeout: Option<Duration>,
    checker: HeaderChecker,
    last_flush_tag: Option<String>,
    tx: Option<Sender<BatchMsg>>,
    worker: Option<JoinHandle<()>>,
    auto_flush_error: Arc<Mutex<Option<PipelineError>>>,
    next: Downstream,
    name: String,
}

impl Default for BatchProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchProcessor {
    pub fn new() -> Self {
        Self {
            steps: Some(Vec::new()),
            flush_tag: None,
            flush_timeout: None,
            checker: HeaderChecker::new(),
            last_flush_tag: None,
            tx: None,
            worker: None,
            auto_flush_error: Arc::default(),
            next: Downstream::default(),
            name: "batch".to_string(),
        }
    }

    pub fn add(mut self, step: Box<dyn BatchStep>) -> Self {
        if let Some(steps) = &mut self.steps {
            steps.push(step);
        }
        self
    }

    pub fn with_flush_tag(mut self, tag: impl Into<String>) -> Self {
        self.flush_tag = Some(tag.into());
        self
    }

    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = Some(timeout);
        self
    }

    fn sender(&self) -> Result<&Sender<BatchMsg>> {
        self.tx
            .as_ref()
            .ok_or_else(|| PipelineError::AlreadyStopped(self.name.clone()))
    }

    /// Request a flush and wait for its outcome.
    fn trigger_flush(&self) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.sender()?
            .send(BatchMsg::Flush(reply_tx))
            .map_err(|_| PipelineError::AlreadyStopped(self.name.clone()))?;
        reply_rx
            .recv()
            .map_err(|_| PipelineError::AlreadyStopped(self.name.clone()))?
    }
}

impl SampleProcessor for BatchProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_downstream(&mut self, next: Box<dyn SampleProcessor>) {
        self.next.set(next);
    }

    fn start(&mut self, ctx: PipelineContext) -> Result<()> {
        self.next.start(ctx)?;
        let steps = self.steps.take().unwrap_or_default();
        info!(
            "[{}] starting with {} step(s), flush tag {:?}, timeout {:?}",
            self.name,
            steps.len(),
            self.flush_tag,
            self.flush_timeout
        );
        let (tx, rx) = bounded(BATCH_CHANNEL_BUFFER);
        let mut worker = BatchWorker {
            rx,
            steps,
            buffer: Vec::new(),
            epoch_header: None,
            next: self.next.take(),
            auto_flush_error: Arc::clone(&self.auto_flush_error),
            flush_timeout: self.flush_timeout,
            name: self.name.clone(),
        };
        self.tx = Some(tx);
        self.worker = Some(
            thread::Builder::new()
                .name(self.name.clone())
                .spawn(move || worker.run())
                .expect("failed to spawn batch worker"),
        );
        Ok(())
    }

    fn sample(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()> {
        let was_initialized = self.checker.last_header().is_some();
        let mut flush = self.checker.initialized_header_changed(header);
        if let Some(tag) = &self.flush_tag {
            let value = sample.tag(tag).to_string();
            if was_initialized {
                flush = flush || self.last_flush_tag.as_deref() != Some(value.as_str());
            }
            self.last_flush_tag = Some(value);
        }

        let mut result = if flush { self.trigger_flush() } else { Ok(()) };
        if self.flush_timeout.is_some() {
            let parked = self.auto_flush_error.lock().unwrap().take();
            if result.is_ok() {
                if let Some(err) = parked {
                    result = Err(err);
                }
            }
        }

        self.sender()?
            .send(BatchMsg::Sample(sample, Arc::clone(header)))
            .map_err(|_| PipelineError::AlreadyStopped(self.name.clone()))?;
        result
    }

    fn close(&mut self) -> Result<()> {
        if self.checker.last_header().is_none() {
            warn!("[{}] received no samples", self.name);
        }
        let result = match self.tx.take() {
            Some(tx) => {
                let (reply_tx, reply_rx) = bounded(1);
                match tx.send(BatchMsg::Close(reply_tx)) {
                    Ok(()) => reply_rx
                        .recv()
                        .unwrap_or_else(|_| Err(PipelineError::AlreadyStopped(self.name.clone()))),
                    Err(_) => Err(PipelineError::AlreadyStopped(self.name.clone())),
                }
            }
            None => Ok(()),
        };
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        result
    }

    fn merge_with(&mut self, other: &mut dyn SampleProcessor) -> bool {
        match other.as_any_mut().downcast_mut::<BatchProcessor>() {
            Some(other) => {
                if other.flush_tag != self.flush_tag || other.flush_timeout != self.flush_timeout {
                    return false;
                }
                if let (Some(mine), Some(theirs)) = (self.steps.as_mut(), other.steps.as_mut()) {
                    mine.append(theirs);
                    return true;
                }
                false
            }
            None => false,
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

struct BatchWorker {
    rx: Receiver<BatchMsg>,
    steps: Vec<Box<dyn BatchStep>>,
    buffer: Vec<Sample>,
    epoch_header: Option<Arc<Header>>,
    next: Downstream,
    auto_flush_error: Arc<Mutex<Option<PipelineError>>>,
    flush_timeout: Option<Duration>,
    name: String,
}

impl BatchWorker {
    fn run(&mut self) {
        loop {
            let msg = match self.flush_timeout {
                Some(timeout) => match self.rx.recv_timeout(timeout) {
                    Ok(msg) => Some(msg),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(msg) => Some(msg),
                    Err(_) => break,
                },
            };
            match msg {
                Some(BatchMsg::Sample(sample, header)) => {
                    self.epoch_header = Some(header);
                    self.buffer.push(sample);
                }
                Some(BatchMsg::Flush(reply)) => {
                    let result = self.execute_flush();
                    let _ = reply.send(result);
                }
                Some(BatchMsg::Close(reply)) => {
                    let result = self.execute_flush();
                    let closed = self.next.close();
                    let _ = reply.send(result.and(closed));
                    return;
                }
                None => {
                    // Timeout with no caller: park the error for the next
                    // sample() call
                    if !self.buffer.is_empty() {
                        debug!("[{}] auto-flush after timeout", self.name);
                        if let Err(err) = self.execute_flush() {
                            error!(
                                "[{}] error during automatic flush (returned with the next sample): {}",
                                self.name, err
                            );
                            *self.auto_flush_error.lock().unwrap() = Some(PipelineError::Step(
                                format!("error during previous auto-flush: {}", err),
                            ));
                        }
                    }
                }
            }
        }
        // Sender vanished without a close request; drain what we have
        if let Err(err) = self.execute_flush() {
            error!("[{}] error flushing remaining samples: {}", self.name, err);
        }
        if let Err(err) = self.next.close() {
            error!("[{}] error closing downstream: {}", self.name, err);
        }
    }

    /// Run the step chain over the buffered epoch and emit the result.
    fn execute_flush(&mut self) -> Result<()> {
        let header = match &self.epoch_header {
            Some(header) => Arc::clone(header),
            None => return Ok(()),
        };
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut samples = std::mem::take(&mut self.buffer);
        let mut header = header;

        if !self.steps.is_empty() {
            debug!("[{}] executing {} batch step(s)", self.name, self.steps.len());
            for (index, step) in self.steps.iter_mut().enumerate() {
                if samples.is_empty() {
                    warn!(
                        "[{}] skipping remaining {} step(s): batch is empty",
                        self.name,
                        self.steps.len() - index
                    );
                    break;
                }
                debug!(
                    "[{}] executing {} on {} samples with {} fields",
                    self.name,
                    step.name(),
                    samples.len(),
                    header.fields.len()
                );
                let (new_header, new_samples) = step.process_batch(header, samples)?;
                header = new_header;
                samples = new_samples;
            }
        }

        info!(
            "[{}] flushing {} batched samples with {} fields",
            self.name,
            samples.len(),
            header.fields.len()
        );
        for sample in samples {
            self.next
                .forward(sample, &header)
                .map_err(|err| PipelineError::Step(format!("error flushing batch: {}", err)))?;
        }
        Ok(())
    }
}
