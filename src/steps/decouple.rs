//! Decoupling processor: an asynchronous hand-off between pipeline stages
//!
//! Inserts a parallelism boundary: samples are queued into a bounded
//! channel and a dedicated forwarder thread drives the rest of the chain.
//! The upstream thread blocks only when the queue is full.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error};

use crate::pipeline::{Downstream, PipelineContext, SampleProcessor};
use crate::sample::{Header, Sample};
use crate::{PipelineError, Result};

/// Hands samples to a dedicated forwarding thread over a bounded channel.
pub struct Decoupler {
    buffer: usize,
    tx: Option<Sender<(Sample, Arc<Header>)>>,
    worker: Option<JoinHandle<()>>,
    error: Arc<Mutex<Option<PipelineError>>>,
    next: Downstream,
    name: String,
}

impl Decoupler {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            tx: None,
            worker: None,
            error: Arc::default(),
            next: Downstream::default(),
            name: format!("decouple ({} buffered)", buffer),
        }
    }
}

impl SampleProcessor for Decoupler {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_downstream(&mut self, next: Box<dyn SampleProcessor>) {
        self.next.set(next);
    }

    fn start(&mut self, ctx: PipelineContext) -> Result<()> {
        self.next.start(ctx.clone())?;
        let (tx, rx) = bounded(self.buffer);
        let mut next = self.next.take();
        let error = Arc::clone(&self.error);
        let name = self.name.clone();
        self.tx = Some(tx);
        self.worker = Some(
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || forward_loop(&name, rx, &mut next, error, ctx))
                .expect("failed to spawn decoupling forwarder"),
        );
        Ok(())
    }

    fn sample(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()> {
        if let Some(err) = self.error.lock().unwrap().take() {
            return Err(err);
        }
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PipelineError::AlreadyStopped(self.name.clone()))?;
        tx.send((sample, Arc::clone(header)))
            .map_err(|_| PipelineError::AlreadyStopped(self.name.clone()))
    }

    fn close(&mut self) -> Result<()> {
        // Closing the channel drains the queue, then closes downstream
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        match self.error.lock().unwrap().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn forward_loop(
    name: &str,
    rx: Receiver<(Sample, Arc<Header>)>,
    next: &mut Downstream,
    error: Arc<Mutex<Option<PipelineError>>>,
    ctx: PipelineContext,
) {
    let mut forwarded = 0u64;
    for (sample, header) in rx {
        if let Err(err) = next.forward(sample, &header) {
            error!("[{}] downstream failed: {}", name, err);
            ctx.report_fatal(name, PipelineError::Step(format!("{}", err)));
            *error.lock().unwrap() = Some(err);
            break;
        }
        forwarded += 1;
    }
    debug!("[{}] forwarder done after {} samples", name, forwarded);
    if let Err(err) = next.close() {
        error!("[{}] error closing downstream: {}", name, err);
        *error.lock().unwrap() = Some(err);
    }
}
