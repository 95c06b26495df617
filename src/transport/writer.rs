//! Parallel marshalling of sample streams
//!
//! The mirror of the reader: samples are numbered, fanned out to marshaller
//! workers, and a single writer thread emits the serialised frames in
//! sequence order. Header frames are serialised inline by the enqueuing
//! thread and injected into the ordered stream, so a header always reaches
//! the wire before the samples of its epoch.
//!
//! The bounded job queue is the sink-side backpressure: `sample()` blocks
//! when marshalling and writing fall behind.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::marshall::Marshaller;
use crate::sample::{Header, HeaderChecker, Sample};
use crate::{PipelineError, Result};

use super::{default_parallelism, DEFAULT_SAMPLE_BUFFER};

/// Configuration for parallel marshalling, shared by all sinks.
#[derive(Clone, Copy)]
pub struct SampleWriter {
    /// Number of marshaller worker threads
    pub parallelism: usize,
    /// Capacity of the job and frame queues
    pub buffered_samples: usize,
}

impl Default for SampleWriter {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            buffered_samples: DEFAULT_SAMPLE_BUFFER,
        }
    }
}

impl SampleWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_buffer(mut self, buffered_samples: usize) -> Self {
        self.buffered_samples = buffered_samples.max(1);
        self
    }

    /// Open an ordered, parallel marshalling stream over `output`.
    pub fn open(
        &self,
        name: impl Into<String>,
        output: Box<dyn Write + Send>,
        marshaller: Arc<dyn Marshaller>,
    ) -> SampleOutputStream {
        let name = name.into();
        let parallelism = self.parallelism.max(1);
        let (job_tx, job_rx) = bounded::<MarshalJob>(self.buffered_samples);
        let (frame_tx, frame_rx) = bounded::<(u64, Vec<u8>)>(self.buffered_samples);
        let error: SharedError = Arc::default();

        let mut workers = Vec::with_capacity(parallelism);
        for i in 0..parallelism {
            let job_rx = job_rx.clone();
            let frame_tx = frame_tx.clone();
            let marshaller = Arc::clone(&marshaller);
            let error = Arc::clone(&error);
            let handle = thread::Builder::new()
                .name(format!("{}-marshal{}", name, i))
                .spawn(move || marshal_loop(marshaller.as_ref(), job_rx, frame_tx, error))
                .expect("failed to spawn marshal worker");
            workers.push(handle);
        }

        let writer = {
            let error = Arc::clone(&error);
            let name = name.clone();
            thread::Builder::new()
                .name(format!("{}-write", name))
                .spawn(move || write_loop(&name, output, frame_rx, error))
                .expect("failed to spawn stream writer")
        };

        SampleOutputStream {
            name,
            marshaller,
            checker: HeaderChecker::new(),
            seq: 0,
            job_tx: Some(job_tx),
            frame_tx: Some(frame_tx),
            error,
            workers,
            writer: Some(writer),
        }
    }
}

type SharedError = Arc<Mutex<Option<PipelineError>>>;

struct MarshalJob {
    seq: u64,
    sample: Sample,
    header: Arc<Header>,
}

/// One open output stream: samples go in, ordered frames come out on a
/// dedicated writer thread.
pub struct SampleOutputStream {
    name: String,
    marshaller: Arc<dyn Marshaller>,
    checker: HeaderChecker,
    seq: u64,
    job_tx: Option<Sender<MarshalJob>>,
    frame_tx: Option<Sender<(u64, Vec<u8>)>>,
    error: SharedError,
    workers: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl SampleOutputStream {
    /// Enqueue one sample, writing a header frame first when the epoch
    /// changes. Blocks when the stream's queues are full. Returns any error
    /// the marshal or write side hit since the last call.
    pub fn sample(&mut self, sample: &Sample, header: &Arc<Header>) -> Result<()> {
        self.check_error()?;
        sample.check(header)?;

        if self.checker.header_changed(header) {
            let mut frame = Vec::new();
            self.marshaller.write_header(header, &mut frame)?;
            self.push_frame(frame)?;
        }

        let job = MarshalJob {
            seq: self.seq,
            sample: sample.clone(),
            header: Arc::clone(header),
        };
        let job_tx = self
            .job_tx
            .as_ref()
            .ok_or_else(|| PipelineError::AlreadyStopped(self.name.clone()))?;
        if job_tx.send(job).is_err() {
            return Err(self.take_error());
        }
        self.seq += 1;
        Ok(())
    }

    /// The number of frames enqueued so far.
    pub fn frames_written(&self) -> u64 {
        self.seq
    }

    fn push_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        let frame_tx = self
            .frame_tx
            .as_ref()
            .ok_or_else(|| PipelineError::AlreadyStopped(self.name.clone()))?;
        if frame_tx.send((self.seq, frame)).is_err() {
            return Err(self.take_error());
        }
        self.seq += 1;
        Ok(())
    }

    fn check_error(&mut self) -> Result<()> {
        let pending = self.error.lock().unwrap().take();
        match pending {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn take_error(&mut self) -> PipelineError {
        self.error
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| PipelineError::AlreadyStopped(self.name.clone()))
    }

    /// Drain the queues, join the workers and flush the output. Returns the
    /// last error of the marshal or write side, if any.
    pub fn close(mut self) -> Result<()> {
        self.shutdown();
        self.check_error()
    }

    fn shutdown(&mut self) {
        self.job_tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.frame_tx.take();
        if let Some(writer) = self.writer.take() {
            let _ = writer.join();
        }
        debug!("[{}] output stream closed after {} frames", self.name, self.seq);
    }
}

impl Drop for SampleOutputStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn marshal_loop(
    marshaller: &dyn Marshaller,
    job_rx: Receiver<MarshalJob>,
    frame_tx: Sender<(u64, Vec<u8>)>,
    error: SharedError,
) {
    for job in job_rx {
        let mut frame = Vec::new();
        if let Err(e) = marshaller.write_sample(&job.sample, &job.header, &mut frame) {
            error.lock().unwrap().get_or_insert(e);
            frame.clear();
        }
        // An empty frame keeps the sequence moving past a failed sample
        if frame_tx.send((job.seq, frame)).is_err() {
            return;
        }
    }
}

fn write_loop(
    name: &str,
    mut output: Box<dyn Write + Send>,
    frame_rx: Receiver<(u64, Vec<u8>)>,
    error: SharedError,
) {
    let mut pending: HashMap<u64, Vec<u8>> = HashMap::new();
    let mut next_seq = 0u64;
    let mut failed = false;
    for (seq, frame) in frame_rx {
        pending.insert(seq, frame);
        while let Some(frame) = pending.remove(&next_seq) {
            next_seq += 1;
            if failed {
                continue;
            }
            if let Err(e) = output.write_all(&frame) {
                warn!("[{}] write failed: {}", name, e);
                error.lock().unwrap().get_or_insert(e.into());
                failed = true;
            }
        }
    }
    if !failed {
        if let Err(e) = output.flush() {
            error.lock().unwrap().get_or_insert(e.into());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshall::{CsvMarshaller, Format};
    use crate::pipeline::PipelineContext;
    use crate::transport::SampleReader;
    use std::sync::Mutex as StdMutex;

    /// Write target backed by shared memory so tests can inspect output.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<StdMutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_ordered_parallel_output() {
        let header = Arc::new(Header::new(vec!["value".into()], false));
        let buf = SharedBuf::default();
        let writer = SampleWriter::new().with_parallelism(4).with_buffer(8);
        let mut stream = writer.open("test", Box::new(buf.clone()), Arc::new(CsvMarshaller));

        for i in 0..200 {
            let sample = Sample::from_nanos(i, vec![i as f64]);
            stream.sample(&sample, &header).unwrap();
        }
        stream.close().unwrap();

        let bytes = buf.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "time,value");
        assert_eq!(lines.len(), 201);
        for (i, line) in lines[1..].iter().enumerate() {
            assert!(
                line.starts_with(&format!("{},", i)),
                "line {} out of order: {}",
                i,
                line
            );
        }
    }

    #[test]
    fn test_header_change_renegotiates() {
        let first = Arc::new(Header::new(vec!["x".into()], false));
        let second = Arc::new(Header::new(vec!["x".into(), "y".into()], false));
        let buf = SharedBuf::default();
        let writer = SampleWriter::new().with_parallelism(2);
        let mut stream = writer.open("test", Box::new(buf.clone()), Arc::new(CsvMarshaller));

        stream.sample(&Sample::from_nanos(1, vec![1.0]), &first).unwrap();
        stream
            .sample(&Sample::from_nanos(2, vec![2.0, 3.0]), &second)
            .unwrap();
        stream.close().unwrap();

        let bytes = buf.0.lock().unwrap().clone();

        // Decode what was written and expect the two epochs back
        let reader = SampleReader::new().with_format(Format::Csv);
        let (mut collector, received, _) = crate::pipeline::testutil::Collector::new();
        let ctx = PipelineContext::detached();
        reader
            .read_samples("test", Box::new(std::io::Cursor::new(bytes)), &mut collector, &ctx)
            .unwrap();
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].1.fields, vec!["x"]);
        assert_eq!(received[1].1.fields, vec!["x", "y"]);
    }

    #[test]
    fn test_value_count_checked() {
        let header = Arc::new(Header::new(vec!["x".into(), "y".into()], false));
        let buf = SharedBuf::default();
        let writer = SampleWriter::new();
        let mut stream = writer.open("test", Box::new(buf), Arc::new(CsvMarshaller));
        let short = Sample::from_nanos(1, vec![1.0]);
        assert!(matches!(
            stream.sample(&short, &header),
            Err(PipelineError::ValueCountMismatch { .. })
        ));
        stream.close().unwrap();
    }

    struct FailingWriter;
    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::other("disk full"))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_error_surfaces() {
        let header = Arc::new(Header::new(vec!["x".into()], false));
        let writer = SampleWriter::new().with_parallelism(1).with_buffer(1);
        let mut stream = writer.open("test", Box::new(FailingWriter), Arc::new(CsvMarshaller));

        // The first write fails asynchronously; keep feeding until the
        // error comes back or the stream drains everything
        let mut saw_error = false;
        for i in 0..100 {
            let sample = Sample::from_nanos(i, vec![1.0]);
            if stream.sample(&sample, &header).is_err() {
                saw_error = true;
                break;
            }
        }
        if !saw_error {
            saw_error = stream.close().is_err();
        } else {
            let _ = stream.close();
        }
        assert!(saw_error);
    }
}
