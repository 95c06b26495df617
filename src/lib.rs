//! Streaming metrics pipeline with self-describing wire formats
//!
//! This library moves timestamped numeric samples from heterogeneous
//! endpoints (TCP client, TCP listener, files, standard I/O) through a
//! composable chain of processors and out to one or more sinks.
//!
//! # Architecture
//!
//! - **Sample / Header**: a value vector plus tags, grouped into header
//!   epochs that define the meaning of each value position
//! - **Marshallers**: text, CSV and binary codecs with header negotiation
//!   and multi-header streams
//! - **Pipeline**: sources drive a linear processor chain with explicit
//!   Start / Sample / Close lifecycle and a shared error channel
//! - **Batch & Fork**: epoch-buffering batch steps and tag-keyed
//!   sub-pipeline routing
//!
//! # Example
//!
//! ```no_run
//! use metflow::{EndpointFactory, SamplePipeline};
//!
//! let factory = EndpointFactory::new();
//! let mut pipeline = SamplePipeline::new();
//! pipeline.set_source(factory.create_input(&[":7777"])?);
//! pipeline.add(factory.create_output("csv+file://metrics.csv")?);
//! pipeline.run()?;
//! # Ok::<(), metflow::PipelineError>(())
//! ```

use thiserror::Error;

pub mod batch;
pub mod endpoints;
pub mod fork;
pub mod marshall;
pub mod pipeline;
pub mod sample;
pub mod steps;
pub mod transport;

pub use batch::{BatchProcessor, BatchStep, SimpleBatchStep};
pub use endpoints::{Endpoint, EndpointFactory, Transport};
pub use fork::{MultiFileDistributor, SubPipelineBuilder, TagFork};
pub use marshall::{detect_format, Format, Frame, Marshaller, PushbackReader};
pub use pipeline::{
    Downstream, NoopProcessor, PipelineContext, SamplePipeline, SampleProcessor, SampleSource,
    StageError, StopSignal,
};
pub use sample::{Header, HeaderChecker, Sample, TagTemplate, Value};
pub use steps::{
    Decoupler, Head, MetricFilter, MetricMapper, MetricRenamer, MetricVarianceFilter,
    SampleSorter, Tagger,
};
pub use transport::{
    ConsoleSource, FileSink, FileSource, SampleOutputStream, SampleReader, SampleWriter, TcpSink,
    TcpListenerSink, TcpListenerSource, TcpSource, WriterSink,
};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unexpected EOF while reading sample data")]
    UnexpectedEof,

    #[error("bad tag string: {0}")]
    BadTag(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("unable to detect stream format from: {0:?}")]
    UnknownFormat(String),

    #[error("sample has {values} values, but header has {fields} fields")]
    ValueCountMismatch { values: usize, fields: usize },

    #[error("invalid endpoint: {0}")]
    Endpoint(String),

    #[error("{0} already stopped")]
    AlreadyStopped(String),

    #[error("{0}")]
    Step(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
