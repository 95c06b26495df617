//! Standard I/O endpoints
//!
//! `ConsoleSource` decodes samples from stdin; `WriterSink` marshals to any
//! `Write` target, with stdout as the common case.

use std::any::Any;
use std::io::Write;
use std::sync::Arc;

use tracing::info;

use crate::marshall::{Format, Marshaller};
use crate::pipeline::{Downstream, PipelineContext, SampleProcessor, SampleSource};
use crate::sample::{Header, Sample};
use crate::Result;

use super::{SampleOutputStream, SampleReader, SampleWriter};

/// Reads samples from standard input, auto-detecting the format unless one
/// is configured on the reader.
pub struct ConsoleSource {
    pub reader: SampleReader,
}

impl ConsoleSource {
    pub fn new(reader: SampleReader) -> Self {
        Self { reader }
    }
}

impl SampleSource for ConsoleSource {
    fn name(&self) -> &str {
        "stdin"
    }

    fn run(&mut self, out: &mut dyn SampleProcessor, ctx: &PipelineContext) -> Result<()> {
        info!("[stdin] reading samples from standard input");
        self.reader
            .read_samples("stdin", Box::new(std::io::stdin()), out, ctx)?;
        Ok(())
    }
}

/// Marshals every sample to a `Write` target and forwards it downstream.
///
/// Sinks are ordinary processors, so several outputs can be chained.
pub struct WriterSink {
    name: String,
    output: Option<Box<dyn Write + Send>>,
    marshaller: Arc<dyn Marshaller>,
    writer: SampleWriter,
    stream: Option<SampleOutputStream>,
    next: Downstream,
}

impl WriterSink {
    pub fn new(
        name: impl Into<String>,
        output: Box<dyn Write + Send>,
        marshaller: Arc<dyn Marshaller>,
        writer: SampleWriter,
    ) -> Self {
        Self {
            name: name.into(),
            output: Some(output),
            marshaller,
            writer,
            stream: None,
            next: Downstream::default(),
        }
    }

    /// A sink printing text samples to standard output.
    pub fn stdout(writer: SampleWriter) -> Self {
        Self::new(
            "stdout",
            Box::new(std::io::stdout()),
            Arc::from(Format::Text.marshaller()),
            writer,
        )
    }

    /// Replace the default text marshalling.
    pub fn with_marshaller(mut self, marshaller: Arc<dyn Marshaller>) -> Self {
        self.marshaller = marshaller;
        self
    }
}

impl SampleProcessor for WriterSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_downstream(&mut self, next: Box<dyn SampleProcessor>) {
        self.next.set(next);
    }

    fn start(&mut self, ctx: PipelineContext) -> Result<()> {
        if let Some(output) = self.output.take() {
            info!("[{}] writing {} samples", self.name, self.marshaller.format());
            self.stream =
                Some(self.writer.open(self.name.clone(), output, Arc::clone(&self.marshaller)));
        }
        self.next.start(ctx)
    }

    fn sample(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()> {
        if let Some(stream) = &mut self.stream {
            stream.sample(&sample, header)?;
        }
        self.next.forward(sample, header)
    }

    fn close(&mut self) -> Result<()> {
        let result = match self.stream.take() {
            Some(stream) => stream.close(),
            None => Ok(()),
        };
        let downstream = self.next.close();
        result.and(downstream)
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshall::CsvMarshaller;
    use crate::pipeline::testutil::{numbered_samples, single_field_header, VecSource};
    use crate::pipeline::SamplePipeline;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

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
    fn test_writer_sink_in_pipeline() {
        let header = single_field_header();
        let buf = SharedBuf::default();
        let sink = WriterSink::new(
            "mem",
            Box::new(buf.clone()),
            Arc::new(CsvMarshaller),
            SampleWriter::new().with_parallelism(2),
        );

        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(VecSource::new(numbered_samples(5, &header))));
        pipeline.add(Box::new(sink));
        pipeline.run().unwrap();

        let text = String::from_utf8(buf.0.lock().unwrap().clone()).unwrap();
        assert_eq!(text.lines().count(), 6);
        assert!(text.starts_with("time,tags,value\n"));
    }

    #[test]
    fn test_sink_forwards_downstream() {
        let header = single_field_header();
        let buf = SharedBuf::default();
        let sink = WriterSink::new(
            "mem",
            Box::new(buf),
            Arc::new(CsvMarshaller),
            SampleWriter::new(),
        );
        let (collector, received, _) = crate::pipeline::testutil::Collector::new();

        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(VecSource::new(numbered_samples(3, &header))));
        pipeline.add(Box::new(sink));
        pipeline.add(Box::new(collector));
        pipeline.run().unwrap();

        assert_eq!(received.lock().unwrap().len(), 3);
    }
}
