//! Listening TCP endpoints
//!
//! `TcpListenerSource` accepts incoming connections and decodes each on its
//! own thread, funnelling the results through one channel so downstream
//! stages see a serialised stream. `TcpListenerSink` fans samples out to
//! any number of subscribers, replaying the current epoch's tail from a
//! ring buffer to every new connection.

use std::any::Any;
use std::collections::VecDeque;
use std::io::{BufWriter, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::marshall::Marshaller;
use crate::pipeline::{
    Downstream, PipelineContext, SampleProcessor, SampleSource, STOP_POLL_INTERVAL,
};
use crate::sample::{Header, HeaderChecker, Sample};
use crate::{PipelineError, Result};

use super::{SampleReader, TCP_SAMPLE_BUFFER};

// ────────────────────────────────────────────────────────────────────────────
// Listener source
// ────────────────────────────────────────────────────────────────────────────

/// Accepts connections on a local port and decodes samples from each.
///
/// Every connection runs an independent decoder thread; decoded samples are
/// forwarded through one bounded channel, so delivery downstream stays
/// single-threaded. Each connection's header opens its own epoch.
pub struct TcpListenerSource {
    pub bind_addr: String,
    pub reader: SampleReader,
    /// Maximum concurrently served connections
    pub simultaneous_connections: Option<usize>,
    /// Stop after accepting this many connections in total
    pub accept_limit: Option<usize>,
}

/// Forwards decoded samples from a connection thread into the shared
/// channel of the listener source.
struct ChannelForwarder {
    tx: Sender<(Sample, Arc<Header>)>,
}

impl SampleProcessor for ChannelForwarder {
    fn name(&self) -> &str {
        "channel forwarder"
    }

    fn set_downstream(&mut self, _next: Box<dyn SampleProcessor>) {}

    fn start(&mut self, _ctx: PipelineContext) -> Result<()> {
        Ok(())
    }

    fn sample(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()> {
        self.tx
            .send((sample, Arc::clone(header)))
            .map_err(|_| PipelineError::AlreadyStopped("listener source".to_string()))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl TcpListenerSource {
    pub fn new(bind_addr: impl Into<String>, reader: SampleReader) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            reader,
            simultaneous_connections: None,
            accept_limit: None,
        }
    }

    pub fn with_simultaneous_connections(mut self, limit: Option<usize>) -> Self {
        self.simultaneous_connections = limit;
        self
    }

    pub fn with_accept_limit(mut self, limit: Option<usize>) -> Self {
        self.accept_limit = limit;
        self
    }
}

impl SampleSource for TcpListenerSource {
    fn name(&self) -> &str {
        "tcp listener source"
    }

    fn run(&mut self, out: &mut dyn SampleProcessor, ctx: &PipelineContext) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        info!("[listen {}] waiting for incoming data", self.bind_addr);

        let (tx, rx) = bounded::<(Sample, Arc<Header>)>(self.reader.buffered_samples);
        let active = Arc::new(AtomicUsize::new(0));
        let mut accepted = 0usize;
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        loop {
            if ctx.is_stopped() {
                break;
            }
            let accepting = self
                .accept_limit
                .map(|limit| accepted < limit)
                .unwrap_or(true);
            if !accepting && active.load(Ordering::Relaxed) == 0 && rx.is_empty() {
                break;
            }

            if accepting {
                match listener.accept() {
                    Ok((conn, remote)) => {
                        let at_capacity = self
                            .simultaneous_connections
                            .map(|limit| active.load(Ordering::Relaxed) >= limit)
                            .unwrap_or(false);
                        if at_capacity {
                            warn!("[listen {}] rejecting {}: connection limit", self.bind_addr, remote);
                            drop(conn);
                        } else {
                            accepted += 1;
                            active.fetch_add(1, Ordering::Relaxed);
                            info!("[listen {}] accepted connection from {}", self.bind_addr, remote);
                            handles.push(self.spawn_decoder(conn, remote.to_string(), tx.clone(), Arc::clone(&active), ctx));
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!("[listen {}] accept failed: {}", self.bind_addr, err);
                    }
                }
            }

            // Drain decoded samples; park briefly when idle
            let mut drained = false;
            while let Ok((sample, header)) = rx.try_recv() {
                drained = true;
                out.sample(sample, &header)?;
            }
            if !drained {
                thread::sleep(STOP_POLL_INTERVAL.min(std::time::Duration::from_millis(10)));
            }
        }

        drop(rx);
        for handle in handles {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl TcpListenerSource {
    fn spawn_decoder(
        &self,
        conn: TcpStream,
        remote: String,
        tx: Sender<(Sample, Arc<Header>)>,
        active: Arc<AtomicUsize>,
        ctx: &PipelineContext,
    ) -> JoinHandle<()> {
        let reader = self.reader.clone();
        let ctx = ctx.clone();
        thread::Builder::new()
            .name(format!("decode-{}", remote))
            .spawn(move || {
                if let Err(err) = conn.set_read_timeout(Some(STOP_POLL_INTERVAL)) {
                    warn!("[{}] cannot configure connection: {}", remote, err);
                    active.fetch_sub(1, Ordering::Relaxed);
                    return;
                }
                let mut forwarder = ChannelForwarder { tx };
                match reader.read_samples(&remote, Box::new(conn), &mut forwarder, &ctx) {
                    Ok(count) => debug!("[{}] connection done after {} samples", remote, count),
                    Err(err) => warn!("[{}] closing connection: {}", remote, err),
                }
                active.fetch_sub(1, Ordering::Relaxed);
            })
            .expect("failed to spawn connection decoder")
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Listener sink
// ────────────────────────────────────────────────────────────────────────────

enum SubscriberMsg {
    Header(Arc<Header>),
    Sample(Sample),
}

struct Subscriber {
    remote: String,
    tx: Sender<SubscriberMsg>,
}

struct ListenerState {
    header: Option<Arc<Header>>,
    ring: VecDeque<Sample>,
    subscribers: Vec<Subscriber>,
}

/// Serves the sample stream to any number of TCP subscribers.
///
/// Keeps a ring of the last `buffered_samples` samples of the current
/// epoch; a new subscriber first receives the current header and the ring
/// content, then joins the live fan-out. Slow subscribers are dropped
/// rather than blocking the producer.
pub struct TcpListenerSink {
    pub bind_addr: String,
    /// Ring buffer size replayed to new subscribers
    pub buffered_samples: usize,
    marshaller: Arc<dyn Marshaller>,
    state: Arc<Mutex<ListenerState>>,
    closed: Arc<AtomicBool>,
    accept_handle: Option<JoinHandle<()>>,
    subscriber_handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    checker: HeaderChecker,
    next: Downstream,
    name: String,
}

impl TcpListenerSink {
    pub fn new(
        bind_addr: impl Into<String>,
        marshaller: Arc<dyn Marshaller>,
        buffered_samples: usize,
    ) -> Self {
        let bind_addr = bind_addr.into();
        let name = format!("listen sink {}", bind_addr);
        Self {
            bind_addr,
            buffered_samples,
            marshaller,
            state: Arc::new(Mutex::new(ListenerState {
                header: None,
                ring: VecDeque::new(),
                subscribers: Vec::new(),
            })),
            closed: Arc::new(AtomicBool::new(false)),
            accept_handle: None,
            subscriber_handles: Arc::new(Mutex::new(Vec::new())),
            checker: HeaderChecker::new(),
            next: Downstream::default(),
            name,
        }
    }

    fn accept_loop(
        name: String,
        listener: TcpListener,
        state: Arc<Mutex<ListenerState>>,
        handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
        marshaller: Arc<dyn Marshaller>,
        closed: Arc<AtomicBool>,
    ) {
        while !closed.load(Ordering::Relaxed) {
            match listener.accept() {
                Ok((conn, remote)) => {
                    let remote = remote.to_string();
                    info!("[{}] subscriber connected: {}", name, remote);
                    // Snapshot and registration happen under one lock, so
                    // the subscriber sees every sample exactly once: first
                    // from the replay, then live.
                    let (tx, rx) = bounded(TCP_SAMPLE_BUFFER);
                    let (header, replay) = {
                        let mut state = state.lock().unwrap();
                        let header = state.header.clone();
                        let replay: Vec<Sample> = state.ring.iter().cloned().collect();
                        state.subscribers.push(Subscriber {
                            remote: remote.clone(),
                            tx,
                        });
                        (header, replay)
                    };
                    let marshaller = Arc::clone(&marshaller);
                    let handle = thread::Builder::new()
                        .name(format!("subscriber-{}", remote))
                        .spawn(move || {
                            serve_subscriber(conn, remote, header, replay, rx, marshaller)
                        })
                        .expect("failed to spawn subscriber writer");
                    handles.lock().unwrap().push(handle);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(STOP_POLL_INTERVAL.min(std::time::Duration::from_millis(20)));
                }
                Err(err) => {
                    warn!("[{}] accept failed: {}", name, err);
                }
            }
        }
        debug!("[{}] accept loop finished", name);
    }

    /// Deliver messages to the snapshotted subscribers, dropping the ones
    /// whose queue is full or gone. Writing happens outside the state lock.
    fn fan_out(&self, senders: Vec<(String, Sender<SubscriberMsg>)>, messages: Vec<SubscriberMsg>) {
        if senders.is_empty() {
            return;
        }
        let mut dead = Vec::new();
        for (remote, tx) in senders {
            for message in &messages {
                let message = match message {
                    SubscriberMsg::Header(h) => SubscriberMsg::Header(Arc::clone(h)),
                    SubscriberMsg::Sample(s) => SubscriberMsg::Sample(s.clone()),
                };
                match tx.try_send(message) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("[{}] dropping slow subscriber {}", self.name, remote);
                        dead.push(remote);
                        break;
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        debug!("[{}] subscriber {} disconnected", self.name, remote);
                        dead.push(remote);
                        break;
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut state = self.state.lock().unwrap();
            state.subscribers.retain(|s| !dead.contains(&s.remote));
        }
    }
}

/// Write the replay snapshot, then live messages, until the subscriber
/// falls away.
fn serve_subscriber(
    conn: TcpStream,
    remote: String,
    header: Option<Arc<Header>>,
    replay: Vec<Sample>,
    rx: Receiver<SubscriberMsg>,
    marshaller: Arc<dyn Marshaller>,
) {
    let mut out = BufWriter::new(conn);
    let mut current = None;

    let mut startup: Vec<SubscriberMsg> = Vec::new();
    if let Some(header) = header {
        startup.push(SubscriberMsg::Header(header));
    }
    startup.extend(replay.into_iter().map(SubscriberMsg::Sample));

    for msg in &startup {
        if let Err(err) = write_subscriber_msg(marshaller.as_ref(), msg, &mut current, &mut out) {
            debug!("[{}] subscriber write failed during replay: {}", remote, err);
            return;
        }
    }
    for msg in rx {
        if let Err(err) = write_subscriber_msg(marshaller.as_ref(), &msg, &mut current, &mut out) {
            debug!("[{}] subscriber write failed: {}", remote, err);
            return;
        }
    }
    debug!("[{}] subscriber stream closed", remote);
}

fn write_subscriber_msg(
    marshaller: &dyn Marshaller,
    msg: &SubscriberMsg,
    current: &mut Option<Arc<Header>>,
    out: &mut BufWriter<TcpStream>,
) -> Result<()> {
    match msg {
        SubscriberMsg::Header(header) => {
            marshaller.write_header(header, out)?;
            *current = Some(Arc::clone(header));
        }
        SubscriberMsg::Sample(sample) => {
            if let Some(header) = current {
                marshaller.write_sample(sample, header, out)?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

impl SampleProcessor for TcpListenerSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_downstream(&mut self, next: Box<dyn SampleProcessor>) {
        self.next.set(next);
    }

    fn start(&mut self, ctx: PipelineContext) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_addr)?;
        listener.set_nonblocking(true)?;
        info!(
            "[{}] serving {} samples, replaying up to {}",
            self.name,
            self.marshaller.format(),
            self.buffered_samples
        );
        let name = self.name.clone();
        let state = Arc::clone(&self.state);
        let handles = Arc::clone(&self.subscriber_handles);
        let marshaller = Arc::clone(&self.marshaller);
        let closed = Arc::clone(&self.closed);
        self.accept_handle = Some(
            thread::Builder::new()
                .name(format!("accept-{}", self.bind_addr))
                .spawn(move || {
                    Self::accept_loop(name, listener, state, handles, marshaller, closed)
                })
                .expect("failed to spawn accept loop"),
        );
        self.next.start(ctx)
    }

    fn sample(&mut self, sample: Sample, header: &Arc<Header>) -> Result<()> {
        sample.check(header)?;
        let mut messages = Vec::with_capacity(2);
        // Ring update and subscriber snapshot share one lock acquisition;
        // a concurrently registering subscriber therefore sees this sample
        // either in its replay or live, never both.
        let senders: Vec<(String, Sender<SubscriberMsg>)> = {
            let mut state = self.state.lock().unwrap();
            if self.checker.header_changed(header) {
                state.header = Some(Arc::clone(header));
                state.ring.clear();
                messages.push(SubscriberMsg::Header(Arc::clone(header)));
            }
            if self.buffered_samples > 0 {
                if state.ring.len() >= self.buffered_samples {
                    state.ring.pop_front();
                }
                state.ring.push_back(sample.clone());
            }
            messages.push(SubscriberMsg::Sample(sample.clone()));
            state
                .subscribers
                .iter()
                .map(|s| (s.remote.clone(), s.tx.clone()))
                .collect()
        };
        self.fan_out(senders, messages);
        self.next.forward(sample, header)
    }

    fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }
        // Dropping the senders lets the subscriber threads drain and exit
        self.state.lock().unwrap().subscribers.clear();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.subscriber_handles.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        self.next.close()
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
