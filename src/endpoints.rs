//! Endpoint descriptions and the factory turning them into sources/sinks
//!
//! Endpoints are given either as URLs of the form `format+transport://target`
//! (either component may be omitted, in either order) or as bare targets
//! whose transport is inferred: `-` is standard I/O, `host:port` dials TCP,
//! `:port` listens, anything else is a file name.
//!
//! The factory carries the shared configuration of all endpoints it creates
//! plus registries for custom transports, injected explicitly instead of
//! living in process-wide state.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::marshall::{Format, Marshaller};
use crate::pipeline::{SampleProcessor, SampleSource};
use crate::transport::{
    ConsoleSource, FileSink, FileSource, SampleReader, SampleWriter, TcpListenerSink,
    TcpListenerSource, TcpSink, TcpSource, WriterSink,
};
use crate::{PipelineError, Result};

const STD_TARGET: &str = "-";
const BINARY_FILE_SUFFIX: &str = ".bin";

/// How the bytes of an endpoint move.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transport {
    /// Active TCP connection to a remote endpoint
    Tcp,
    /// Listening TCP socket on a local port
    TcpListen,
    /// File input/output
    File,
    /// Standard input/output
    Std,
    /// A transport registered by client code
    Custom(String),
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::TcpListen => write!(f, "listen"),
            Transport::File => write!(f, "file"),
            Transport::Std => write!(f, "std"),
            Transport::Custom(name) => write!(f, "{}", name),
        }
    }
}

/// A parsed endpoint description, independent of data direction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub format: Option<Format>,
    pub transport: Transport,
    pub target: String,
}

impl Endpoint {
    /// Parse a URL-style or bare endpoint description.
    pub fn parse(spec: &str) -> Result<Endpoint> {
        if spec.contains("://") {
            Self::parse_url(spec)
        } else {
            Ok(Endpoint {
                format: None,
                transport: guess_transport(spec)?,
                target: spec.to_string(),
            })
        }
    }

    fn parse_url(spec: &str) -> Result<Endpoint> {
        let (parts, target) = spec
            .split_once("://")
            .ok_or_else(|| PipelineError::Endpoint(format!("invalid URL endpoint: {}", spec)))?;
        if parts.is_empty() || target.is_empty() {
            return Err(PipelineError::Endpoint(format!(
                "invalid URL endpoint: {}",
                spec
            )));
        }

        let mut format = None;
        let mut transport = None;
        for part in parts.split('+') {
            if let Ok(parsed) = part.parse::<Format>() {
                if format.replace(parsed).is_some() {
                    return Err(PipelineError::Endpoint(format!(
                        "multiple formats defined in: {}",
                        spec
                    )));
                }
                continue;
            }
            let parsed = match part {
                "tcp" => Transport::Tcp,
                "listen" => Transport::TcpListen,
                "file" => Transport::File,
                "std" => {
                    if target != STD_TARGET {
                        return Err(PipelineError::Endpoint(format!(
                            "transport 'std' requires target '{}', got '{}'",
                            STD_TARGET, target
                        )));
                    }
                    Transport::Std
                }
                custom => Transport::Custom(custom.to_string()),
            };
            if transport.replace(parsed).is_some() {
                return Err(PipelineError::Endpoint(format!(
                    "multiple transports defined in: {}",
                    spec
                )));
            }
        }

        let transport = match transport {
            Some(transport) => transport,
            None => guess_transport(target)?,
        };
        if matches!(transport, Transport::Custom(_)) && format.is_some() {
            return Err(PipelineError::Endpoint(format!(
                "cannot define a data format for custom transport '{}'",
                transport
            )));
        }
        Ok(Endpoint {
            format,
            transport,
            target: target.to_string(),
        })
    }

    /// The format used when writing to this endpoint and none was given:
    /// binary on TCP, binary or CSV on files depending on the suffix, text
    /// on the console.
    pub fn output_format(&self) -> Option<Format> {
        if self.format.is_some() {
            return self.format;
        }
        match &self.transport {
            Transport::Tcp | Transport::TcpListen => Some(Format::Binary),
            Transport::File => {
                if self.target.ends_with(BINARY_FILE_SUFFIX) {
                    Some(Format::Binary)
                } else {
                    Some(Format::Csv)
                }
            }
            Transport::Std => Some(Format::Text),
            Transport::Custom(_) => None,
        }
    }
}

/// Infer the transport of a bare target.
fn guess_transport(target: &str) -> Result<Transport> {
    if target.is_empty() {
        return Err(PipelineError::Endpoint(
            "empty endpoint/file is not valid".to_string(),
        ));
    }
    if target == STD_TARGET {
        return Ok(Transport::Std);
    }
    if let Some((host, port)) = target.rsplit_once(':') {
        if !port.is_empty() && port.parse::<u16>().is_ok() {
            let transport = if host.is_empty() {
                Transport::TcpListen
            } else {
                Transport::Tcp
            };
            debug!("guessed transport of {}: {}", target, transport);
            return Ok(transport);
        }
        return Err(PipelineError::Endpoint(format!(
            "not a filename and not a valid TCP endpoint: {}",
            target
        )));
    }
    debug!("guessed transport of {}: file", target);
    Ok(Transport::File)
}

type SourceFactoryFn = Box<dyn Fn(&str, &EndpointFactory) -> Result<Box<dyn SampleSource>> + Send + Sync>;
type SinkFactoryFn = Box<dyn Fn(&str, &EndpointFactory) -> Result<Box<dyn SampleProcessor>> + Send + Sync>;

/// Creates sources and sinks from endpoint descriptions, carrying the
/// configuration shared by everything it creates.
pub struct EndpointFactory {
    // File endpoints
    pub input_files_robust: bool,
    pub output_files_clean: bool,
    pub files_keep_alive: bool,
    pub files_append: bool,
    pub io_buffer: usize,

    // TCP endpoints
    /// Ring buffer replayed to new subscribers of a listening output
    pub output_tcp_listen_buffer: usize,
    /// Total TCP connections to establish/accept before exiting
    pub tcp_connection_limit: Option<usize>,
    /// Simultaneous connections accepted by a listening input
    pub input_tcp_accept_limit: Option<usize>,
    /// Suppress logging of failed active TCP connection attempts
    pub tcp_drop_errors: bool,

    // Parallel (un)marshalling
    pub parallelism: usize,
    pub buffered_samples: usize,

    custom_sources: HashMap<String, SourceFactoryFn>,
    custom_sinks: HashMap<String, SinkFactoryFn>,
}

impl Default for EndpointFactory {
    fn default() -> Self {
        let reader = SampleReader::default();
        Self {
            input_files_robust: false,
            output_files_clean: false,
            files_keep_alive: false,
            files_append: false,
            io_buffer: 4096,
            output_tcp_listen_buffer: 0,
            tcp_connection_limit: None,
            input_tcp_accept_limit: None,
            tcp_drop_errors: false,
            parallelism: reader.parallelism,
            buffered_samples: reader.buffered_samples,
            custom_sources: HashMap::new(),
            custom_sinks: HashMap::new(),
        }
    }
}

impl EndpointFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a custom input transport usable as `name://target`.
    pub fn register_source(
        &mut self,
        name: impl Into<String>,
        factory: SourceFactoryFn,
    ) -> &mut Self {
        self.custom_sources.insert(name.into(), factory);
        self
    }

    /// Register a custom output transport usable as `name://target`.
    pub fn register_sink(&mut self, name: impl Into<String>, factory: SinkFactoryFn) -> &mut Self {
        self.custom_sinks.insert(name.into(), factory);
        self
    }

    /// The reader configuration shared by all created sources.
    pub fn reader(&self, format: Option<Format>) -> SampleReader {
        let mut reader = SampleReader::new()
            .with_parallelism(self.parallelism)
            .with_buffer(self.buffered_samples);
        reader.format = format;
        reader
    }

    /// The writer configuration shared by all created sinks.
    pub fn writer(&self) -> SampleWriter {
        SampleWriter::new()
            .with_parallelism(self.parallelism)
            .with_buffer(self.buffered_samples)
    }

    /// Create one source from the given endpoint descriptions. Multiple
    /// descriptions must share one transport; active TCP remotes and
    /// files merge into a single multi-target source.
    pub fn create_input(&self, inputs: &[&str]) -> Result<Box<dyn SampleSource>> {
        let mut endpoints = Vec::with_capacity(inputs.len());
        for input in inputs {
            endpoints.push(Endpoint::parse(input)?);
        }
        let first = endpoints
            .first()
            .ok_or_else(|| PipelineError::Endpoint("no input endpoint given".to_string()))?;

        let format = first.format;
        for endpoint in &endpoints {
            if endpoint.transport != first.transport {
                return Err(PipelineError::Endpoint(format!(
                    "please provide only one type of data source (got {} and {})",
                    first.transport, endpoint.transport
                )));
            }
            if endpoint.format != format {
                return Err(PipelineError::Endpoint(
                    "multiple input formats defined".to_string(),
                ));
            }
        }
        let targets: Vec<&str> = endpoints.iter().map(|e| e.target.as_str()).collect();
        let singleton_error = |what: &str| {
            Err(PipelineError::Endpoint(format!(
                "cannot read from {} multiple times",
                what
            )))
        };

        match &first.transport {
            Transport::Std => {
                if targets.len() > 1 {
                    return singleton_error("stdin");
                }
                Ok(Box::new(ConsoleSource::new(self.reader(format))))
            }
            Transport::Tcp => {
                let source = TcpSource::new(
                    targets.iter().map(|t| t.to_string()).collect(),
                    self.reader(format),
                )
                .with_connection_limit(self.tcp_connection_limit)
                .with_print_errors(!self.tcp_drop_errors);
                Ok(Box::new(source))
            }
            Transport::TcpListen => {
                if targets.len() > 1 {
                    return singleton_error("multiple TCP ports");
                }
                let source = TcpListenerSource::new(first.target.clone(), self.reader(format))
                    .with_simultaneous_connections(self.input_tcp_accept_limit)
                    .with_accept_limit(self.tcp_connection_limit);
                Ok(Box::new(source))
            }
            Transport::File => {
                let mut source = FileSource::new(
                    targets.iter().map(PathBuf::from).collect(),
                    self.reader(format),
                )
                .with_robust(self.input_files_robust)
                .with_keep_alive(self.files_keep_alive);
                source.io_buffer = self.io_buffer;
                Ok(Box::new(source))
            }
            Transport::Custom(name) => {
                if targets.len() > 1 {
                    return singleton_error(&format!("custom input '{}' with multiple targets", name));
                }
                match self.custom_sources.get(name) {
                    Some(factory) => factory(&first.target, self),
                    None => Err(PipelineError::Endpoint(format!(
                        "unknown input endpoint type: {}",
                        name
                    ))),
                }
            }
        }
    }

    /// Create one sink processor from the given endpoint description.
    pub fn create_output(&self, output: &str) -> Result<Box<dyn SampleProcessor>> {
        let endpoint = Endpoint::parse(output)?;
        let marshaller: Option<Arc<dyn Marshaller>> = endpoint
            .output_format()
            .map(|format| Arc::from(format.marshaller()));

        match &endpoint.transport {
            Transport::Std => {
                let marshaller = marshaller.expect("std endpoints always have a format");
                Ok(Box::new(
                    WriterSink::stdout(self.writer()).with_marshaller(marshaller),
                ))
            }
            Transport::File => {
                let marshaller = marshaller.expect("file endpoints always have a format");
                let mut sink = FileSink::new(endpoint.target.clone(), marshaller, self.writer())
                    .with_clean(self.output_files_clean)
                    .with_append(self.files_append);
                sink.io_buffer = self.io_buffer;
                Ok(Box::new(sink))
            }
            Transport::Tcp => {
                let marshaller = marshaller.expect("tcp endpoints always have a format");
                let sink = TcpSink::new(endpoint.target.clone(), marshaller, self.writer())
                    .with_print_errors(!self.tcp_drop_errors);
                Ok(Box::new(sink))
            }
            Transport::TcpListen => {
                let marshaller = marshaller.expect("tcp endpoints always have a format");
                Ok(Box::new(TcpListenerSink::new(
                    endpoint.target.clone(),
                    marshaller,
                    self.output_tcp_listen_buffer,
                )))
            }
            Transport::Custom(name) => match self.custom_sinks.get(name) {
                Some(factory) => factory(&endpoint.target, self),
                None => Err(PipelineError::Endpoint(format!(
                    "unknown output endpoint type: {}",
                    name
                ))),
            },
        }
    }
}
