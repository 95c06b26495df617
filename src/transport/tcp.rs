//! Active TCP endpoints: dialing source and dialing sink
//!
//! The source loops over its remotes, dialing each in turn and streaming
//! until EOF or error, with a retry pause between rounds. The sink dials
//! lazily on the first sample and renegotiates the header by reconnecting.

use std::any::Any;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::marshall::Marshaller;
use crate::pipeline::{Downstream, PipelineContext, SampleProcessor, SampleSource, STOP_POLL_INTERVAL};
use crate::sample::{Header, HeaderChecker, Sample};
use crate::{PipelineError, Result};

use super::{SampleOutputStream, SampleReader, SampleWriter, TCP_SAMPLE_BUFFER};

pub(crate) const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_millis(2000);
pub(crate) const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(1000);

fn resolve(endpoint: &str) -> Result<SocketAddr> {
    endpoint
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| PipelineError::Endpoint(format!("cannot resolve {:?}", endpoint)))
}

/// Dials one or more remote endpoints and streams their samples.
pub struct TcpSource {
    pub remotes: Vec<String>,
    pub reader: SampleReader,
    pub dial_timeout: Duration,
    pub retry_interval: Duration,
    /// Stop after this many successful connections
    pub connection_limit: Option<usize>,
    /// Suppress dial-failure logging when false
    pub print_errors: bool,
}

impl TcpSource {
    pub fn new(remotes: Vec<String>, reader: SampleReader) -> Self {
        Self {
            remotes,
            reader,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            connection_limit: None,
            print_errors: true,
        }
    }

    pub fn with_connection_limit(mut self, limit: Option<usize>) -> Self {
        self.connection_limit = limit;
        self
    }

    pub fn with_print_errors(mut self, print_errors: bool) -> Self {
        self.print_errors = print_errors;
        self
    }

    fn dial(&self, remote: &str) -> Result<TcpStream> {
        let addr = resolve(remote)?;
        let stream = TcpStream::connect_timeout(&addr, self.dial_timeout)?;
        stream.set_read_timeout(Some(STOP_POLL_INTERVAL))?;
        Ok(stream)
    }
}

impl SampleSource for TcpSource {
    fn name(&self) -> &str {
        "tcp source"
    }

    fn run(&mut self, out: &mut dyn SampleProcessor, ctx: &PipelineContext) -> Result<()> {
        let mut connections = 0usize;
        info!("[tcp source] downloading samples from {:?}", self.remotes);
        loop {
            for remote in &self.remotes {
                if ctx.is_stopped() {
                    return Ok(());
                }
                match self.dial(remote) {
                    Ok(stream) => {
                        info!("[tcp source] connected to {}", remote);
                        match self.reader.read_samples(remote, Box::new(stream), out, ctx) {
                            Ok(count) => {
                                info!("[tcp source] {} closed after {} samples", remote, count)
                            }
                            Err(PipelineError::Io(err)) => {
                                // Read errors on one remote don't kill the source
                                warn!("[tcp source] error reading from {}: {}", remote, err);
                            }
                            Err(PipelineError::Step(err)) => {
                                // A downstream processing error is fatal
                                return Err(PipelineError::Step(err));
                            }
                            Err(err) => {
                                // Protocol errors close this connection only
                                warn!("[tcp source] protocol error from {}: {}", remote, err);
                            }
                        }
                        connections += 1;
                        if let Some(limit) = self.connection_limit {
                            if connections >= limit {
                                info!("[tcp source] connection limit {} reached", limit);
                                return Ok(());
                            }
                        }
                    }
                    Err(err) => {
                        if self.print_errors {
                            warn!("[tcp source] error connecting to {}: {}", remote, err);
                        } else {
                            debug!("[tcp source] error connecting to {}: {}", remote, err);
                        }
                    }
                }
            }
            if ctx.stop_signal().sleep(self.retry_interval) {
                return Ok(());
            }
        }
    }
}

/// Dials a remote endpoint on the first sample and streams marshalled
/// samples to it. A header change closes the connection and redials so the
/// peer observes a clean renegotiation; write failures poison the
/// connection and the next sample re-establishes it.
pub struct TcpSink {
    pub endpoint: String,
    pub dial_timeout: Duration,
    /// Report connection errors at warn level
    pub print_errors: bool,
    marshaller: Arc<dyn Marshaller>,
    writer: SampleWriter,
    checker: HeaderChecker,
    conn: Option<TcpConnection>,
    ctx: Option<PipelineContext>,
    next: Downstream,
    name: String,
}

struct TcpConnection {
    stream: SampleOutputStream,
    socket: TcpStream,
}

impl TcpSink {
    pub fn new(
        endpoint: impl Into<String>,
        marshaller: Arc<dyn Marshaller>,
        writer: SampleWriter,
    ) -> Self {
        let endpoint = endpoint.into();
        let name = format!("tcp sink {}", endpoint);
        Self {
            endpoint,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            print_errors: true,
            marshaller,
            writer: writer.with_buffer(TCP_SAMPLE_BUFFER),
            checker: HeaderChecker::new(),
            conn: None,
            ctx: None,
            next: Downstream::default(),
            name,
        }
    }

    pub fn with_print_errors(mut self, print_errors: bool) -> Self {
        self.print_errors = print_errors;
        self
    }

    fn assert_connection(&mut self) -> Result<()> {
        if self.conn.is_none() {
            let addr = resolve(&self.endpoint)?;
            let socket = TcpStream::connect_timeout(&addr, self.dial_timeout)?;
            info!(
                "[{}] sending {} samples to {}",
                self.name,
                self.marshaller.format(),
                self.endpoint
            );
            let stream = self.writer.open(
                self.name.clone(),
                Box::new(socket.try_clone()?),
                Arc::clone(&self.marshaller),
            );
            self.conn = Some(TcpConnection { stream, socket });
        }
        Ok(())
    }

    fn close_connection(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!("[{}] closing connection", self.name);
            if let Err(err) = conn.stream.close() {
                debug!("[{}] error draining connection: {}", self.name, err);
            }
            let _ = conn.socket.shutdown(std::net::Shutdown::Both);
        }
    }

    /// Deliver one sample, reporting transport failures as transient
    /// errors so the pipeline keeps running.
    fn write_sample(&mut self, sample: &Sample, header: &Arc<Header>) -> Result<()> {
        sample.check(header)?;
        if self.checker.initialized_header_changed(header) {
            // Reconnect so the peer sees the new header negotiation
            self.close_connection();
        }
        self.assert_connection()?;
        let result = match &mut self.conn {
            Some(conn) => conn.stream.sample(sample, header),
            None => Ok(()),
        };
        if let Err(err) = result {
            self.close_connection();
            return Err(err);
        }
        Ok(())
    }
}

impl SampleProcessor for TcpSink {
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
        if let Err(err) = self.write_sample(&sample, header) {
            // The sample is dropped; transport trouble is not fatal
            match (&self.ctx, self.print_errors) {
                (Some(ctx), true) => ctx.report(&self.name, err),
                _ => debug!("[{}] dropping sample: {}", self.name, err),
            }
        }
        self.next.forward(sample, header)
    }

    fn close(&mut self) -> Result<()> {
        self.close_connection();
        self.next.close()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
