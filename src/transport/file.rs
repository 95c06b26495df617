//! File endpoints
//!
//! `FileSource` reads one or more files in sequence; `FileSink` writes to a
//! filename template and rotates to a numbered file on every header change,
//! so each output file holds exactly one epoch.

use std::any::Any;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::marshall::Marshaller;
use crate::pipeline::{Downstream, PipelineContext, SampleProcessor, SampleSource, STOP_POLL_INTERVAL};
use crate::sample::{Header, HeaderChecker, Sample};
use crate::Result;

use super::{SampleOutputStream, SampleReader, SampleWriter};

pub(crate) const DEFAULT_IO_BUFFER: usize = 4096;

/// Reads samples from a list of files, one after the other.
pub struct FileSource {
    pub file_names: Vec<PathBuf>,
    pub reader: SampleReader,
    /// Log and skip unreadable files instead of aborting
    pub robust: bool,
    /// Stay alive after the last file, feeding a downstream listener
    pub keep_alive: bool,
    pub io_buffer: usize,
}

impl FileSource {
    pub fn new(file_names: Vec<PathBuf>, reader: SampleReader) -> Self {
        Self {
            file_names,
            reader,
            robust: false,
            keep_alive: false,
            io_buffer: DEFAULT_IO_BUFFER,
        }
    }

    pub fn with_robust(mut self, robust: bool) -> Self {
        self.robust = robust;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    fn read_file(
        &self,
        path: &Path,
        out: &mut dyn SampleProcessor,
        ctx: &PipelineContext,
    ) -> Result<u64> {
        let file = File::open(path)?;
        let input = BufReader::with_capacity(self.io_buffer, file);
        self.reader
            .read_samples(&path.display().to_string(), Box::new(input), out, ctx)
    }
}

impl SampleSource for FileSource {
    fn name(&self) -> &str {
        "files"
    }

    fn run(&mut self, out: &mut dyn SampleProcessor, ctx: &PipelineContext) -> Result<()> {
        let file_names = self.file_names.clone();
        for path in &file_names {
            if ctx.is_stopped() {
                break;
            }
            info!("[files] reading {}", path.display());
            match self.read_file(path, out, ctx) {
                Ok(count) => debug!("[files] {} delivered {} samples", path.display(), count),
                Err(err) if self.robust => {
                    warn!("[files] skipping {}: {}", path.display(), err);
                }
                Err(err) => return Err(err),
            }
        }
        if self.keep_alive {
            info!("[files] all files read, keeping source alive");
            while !ctx.stop_signal().sleep(STOP_POLL_INTERVAL) {}
        }
        Ok(())
    }
}

/// Writes samples to files derived from a filename template.
///
/// The first epoch goes to the template itself; every header change closes
/// the current file and opens the next one with an incrementing `-N` suffix
/// before the extension. In append mode a single file is appended across
/// epochs instead.
pub struct FileSink {
    filename: PathBuf,
    marshaller: Arc<dyn Marshaller>,
    writer: SampleWriter,
    pub clean: bool,
    pub append: bool,
    pub io_buffer: usize,
    checker: HeaderChecker,
    file_num: usize,
    stream: Option<SampleOutputStream>,
    next: Downstream,
    name: String,
}

impl FileSink {
    pub fn new(
        filename: impl Into<PathBuf>,
        marshaller: Arc<dyn Marshaller>,
        writer: SampleWriter,
    ) -> Self {
        let filename = filename.into();
        let name = format!("file {}", filename.display());
        Self {
            filename,
            marshaller,
            writer,
            clean: false,
            append: false,
            io_buffer: DEFAULT_IO_BUFFER,
            checker: HeaderChecker::new(),
            file_num: 0,
            stream: None,
            next: Downstream::default(),
            name,
        }
    }

    pub fn with_clean(mut self, clean: bool) -> Self {
        self.clean = clean;
        self
    }

    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }

    /// A copy of this sink's configuration pointed at another filename.
    /// Used by the multi-file distributor to instantiate per-key sinks.
    pub fn config_for(&self, filename: impl Into<PathBuf>) -> FileSink {
        let mut copy = FileSink::new(filename, Arc::clone(&self.marshaller), self.writer);
        copy.clean = self.clean;
        copy.append = self.append;
        copy.io_buffer = self.io_buffer;
        copy
    }

    /// The file name for the given rotation number: `out.csv`, `out-1.csv`,
    /// `out-2.csv`, …
    fn build_filename(&self, num: usize) -> PathBuf {
        if num == 0 {
            return self.filename.clone();
        }
        let stem = self
            .filename
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut name = format!("{}-{}", stem, num);
        if let Some(ext) = self.filename.extension() {
            name.push('.');
            name.push_str(&ext.to_string_lossy());
        }
        self.filename.with_file_name(name)
    }

    /// Delete output files a previous run may have left behind.
    fn clean_files(&self) -> Result<()> {
        let mut num = 0;
        loop {
            let path = self.build_filename(num);
            if !path.exists() {
                return Ok(());
            }
            debug!("[{}] deleting {}", self.name, path.display());
            std::fs::remove_file(&path)?;
            num += 1;
        }
    }

    fn open_next_file(&mut self) -> Result<()> {
        let path = self.build_filename(self.file_num);
        self.file_num += 1;
        let file = if self.append {
            OpenOptions::new().create(true).append(true).open(&path)?
        } else {
            File::create(&path)?
        };
        info!("[{}] writing to {}", self.name, path.display());
        let output = BufWriter::with_capacity(self.io_buffer, file);
        self.stream = Some(self.writer.open(
            path.display().to_string(),
            Box::new(output),
            Arc::clone(&self.marshaller),
        ));
        Ok(())
    }

    /// Close the current file and continue with the next rotation.
    pub fn rotate(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream.close()?;
        }
        Ok(())
    }
}

impl SampleProcessor for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_downstream(&mut self, next: Box<dyn SampleProcessor>) {
        self.next.set(next);
    }

    fn start(&mut self, ctx: PipelineContext) -> Result<()> {
        if self.clean {
            self.clean_files()?;
        }
        self.next.start(ctx)
    }

    fn sample(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()> {
        if self.checker.initialized_header_changed(header) && !self.append {
            self.rotate()?;
        }
        if self.stream.is_none() {
            self.open_next_file()?;
        }
        if let Some(stream) = &mut self.stream {
            stream.sample(&sample, header)?;
        }
        self.next.forward(sample, header)
    }

    fn close(&mut self) -> Result<()> {
        let result = self.rotate();
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
    use crate::marshall::{CsvMarshaller, Format};
    use crate::pipeline::testutil::Collector;
    use crate::pipeline::{PipelineContext, SamplePipeline};
    use crate::pipeline::testutil::VecSource;

    fn csv_sink(path: &Path) -> FileSink {
        FileSink::new(
            path,
            Arc::new(CsvMarshaller),
            SampleWriter::new().with_parallelism(2),
        )
    }

    fn write_epochs(path: &Path, epochs: &[(Vec<&str>, usize)]) {
        let mut samples = Vec::new();
        for (i, (fields, count)) in epochs.iter().enumerate() {
            let header = Arc::new(Header::new(
                fields.iter().map(|s| s.to_string()).collect(),
                false,
            ));
            for j in 0..*count {
                let values = vec![(i * 100 + j) as f64; fields.len()];
                samples.push((Sample::from_nanos(j as i64, values), Arc::clone(&header)));
            }
        }
        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(VecSource::new(samples)));
        pipeline.add(Box::new(csv_sink(path)));
        pipeline.run().unwrap();
    }

    #[test]
    fn test_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        write_epochs(&path, &[(vec!["cpu"], 3)]);

        let source = FileSource::new(
            vec![path],
            SampleReader::new().with_format(Format::Csv),
        );
        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(source));
        let (collector, received, _) = Collector::new();
        pipeline.add(Box::new(collector));
        pipeline.run().unwrap();

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 3);
        assert_eq!(received[0].1.fields, vec!["cpu"]);
    }

    #[test]
    fn test_rotation_on_header_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        write_epochs(&path, &[(vec!["a"], 2), (vec!["a", "b"], 1)]);

        assert!(path.exists());
        let rotated = dir.path().join("out-1.csv");
        assert!(rotated.exists(), "second epoch should open out-1.csv");

        let first = std::fs::read_to_string(&path).unwrap();
        assert_eq!(first.lines().count(), 3);
        let second = std::fs::read_to_string(&rotated).unwrap();
        assert!(second.starts_with("time,a,b\n"));
    }

    #[test]
    fn test_append_mode_keeps_one_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        let header = Arc::new(Header::new(vec!["a".into()], false));
        let second_header = Arc::new(Header::new(vec!["b".into()], false));
        let samples = vec![
            (Sample::from_nanos(1, vec![1.0]), Arc::clone(&header)),
            (Sample::from_nanos(2, vec![2.0]), Arc::clone(&second_header)),
        ];
        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(VecSource::new(samples)));
        pipeline.add(Box::new(csv_sink(&path).with_append(true)));
        pipeline.run().unwrap();

        assert!(!dir.path().join("out-1.csv").exists());
        let content = std::fs::read_to_string(&path).unwrap();
        // Both epochs in one file, the second header in-stream
        assert_eq!(content.matches("time,").count(), 2);
    }

    #[test]
    fn test_clean_removes_stale_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        std::fs::write(&path, "stale").unwrap();
        std::fs::write(dir.path().join("out-1.csv"), "stale").unwrap();

        let mut sink = csv_sink(&path).with_clean(true);
        let ctx = PipelineContext::detached();
        sink.start(ctx).unwrap();
        assert!(!path.exists());
        assert!(!dir.path().join("out-1.csv").exists());
        sink.close().unwrap();
    }

    #[test]
    fn test_robust_source_skips_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.csv");
        write_epochs(&good, &[(vec!["x"], 2)]);
        let missing = dir.path().join("missing.csv");

        let source = FileSource::new(
            vec![missing.clone(), good],
            SampleReader::new().with_format(Format::Csv),
        )
        .with_robust(true);
        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(source));
        let (collector, received, _) = Collector::new();
        pipeline.add(Box::new(collector));
        pipeline.run().unwrap();
        assert_eq!(received.lock().unwrap().len(), 2);

        // Without robust mode the same input aborts
        let source = FileSource::new(vec![missing], SampleReader::new());
        let mut pipeline = SamplePipeline::new();
        pipeline.set_source(Box::new(source));
        assert!(pipeline.run().is_err());
    }
}
