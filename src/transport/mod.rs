//! Transport endpoints and parallel (un)marshalling
//!
//! Sources decode byte streams into samples through [`SampleReader`], which
//! spreads parsing over worker threads while preserving arrival order.
//! Sinks encode through [`SampleWriter`] the same way. The concrete
//! endpoints cover active TCP, listening TCP, files and standard I/O.

mod console;
mod file;
mod listen;
mod reader;
mod tcp;
mod writer;

pub use console::{ConsoleSource, WriterSink};
pub use file::{FileSink, FileSource};
pub use listen::{TcpListenerSink, TcpListenerSource};
pub use reader::SampleReader;
pub use tcp::{TcpSink, TcpSource};
pub use writer::{SampleOutputStream, SampleWriter};

/// Default number of samples buffered while (un)marshalling.
pub(crate) const DEFAULT_SAMPLE_BUFFER: usize = 10_000;
/// Default queue length of one TCP write connection.
pub(crate) const TCP_SAMPLE_BUFFER: usize = 50;

/// Default parallelism for (un)marshalling workers: one per core.
pub(crate) fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
