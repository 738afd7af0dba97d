//! The device server: connection multiplexing, request dispatch and the
//! built-in request set.
//!
//! A [`DeviceServer`] listens on a stream socket and speaks katcp to any
//! number of concurrent clients. All request handlers run on the accept
//! thread; sampling emissions arrive from the reactor thread and from
//! whatever threads mutate sensors, funneled through per-client write locks.
//!
//! Embedders implement [`Device`] to describe the instrument: its version
//! strings, its sensor catalog and (optionally) extra request handlers and
//! connection hooks.
//!
//! ```no_run
//! use katcp_device::prelude::*;
//! use katcp_device::sensor::{Sensor, TypeSpec};
//! use katcp_device::server::{Device, DeviceServer, SensorSet};
//!
//! struct MyDevice;
//!
//! impl Device for MyDevice {
//!     fn version_info(&self) -> (&str, u32, u32) {
//!         ("my-device", 1, 0)
//!     }
//!
//!     fn setup_sensors(&mut self, sensors: &mut SensorSet) {
//!         sensors.add(Sensor::new(
//!             TypeSpec::Float { min: 0.0, max: 5.0 },
//!             "psu.voltage",
//!             "PSU voltage.",
//!             "V",
//!         ));
//!     }
//! }
//!
//! let server = DeviceServer::new("0.0.0.0:5000", MyDevice).unwrap();
//! server.start(Some(std::time::Duration::from_secs(1))).unwrap();
//! server.join();
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    os::fd::AsFd,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc, Arc, Condvar, Mutex, Weak,
    },
    thread,
    thread::JoinHandle,
    time::Duration,
};

use chrono::Utc;
use nix::{
    errno::Errno,
    poll::{poll, PollFd, PollFlags, PollTimeout},
};
use socket2::{Domain, Socket, Type};

use crate::{
    logger::{log_msg, DeviceLogger},
    messages::common::FromKatcpArgument,
    messages::log::Level,
    protocol::{KatcpError, Message, MessageKind},
    sampling::{EmitFn, SampleReactor, SampleStrategy, StrategyKind},
    sensor::Sensor,
    utils::lock,
};

/// How long the readiness loop waits before re-checking the running flag
const POLL_INTERVAL_MS: u16 = 500;
/// Inbound read chunk size
const READ_CHUNK: usize = 4096;
const LISTEN_BACKLOG: i32 = 5;

/// What a request handler produced
pub enum HandlerResult {
    /// A reply to send; its name must equal the request name
    Reply(Message),
    /// Refuse with a caller-visible reason, producing `!<name> fail <reason>`
    Fail(String),
    /// The handler has arranged for the reply to be sent later by other
    /// means; dispatch sends nothing
    Async,
}

pub type RequestHandler = Box<
    dyn Fn(&DeviceServer, &Arc<ClientConn>, &Message) -> Result<HandlerResult, KatcpError>
        + Send
        + Sync,
>;
pub type InformHandler =
    Box<dyn Fn(&DeviceServer, &Arc<ClientConn>, &Message) -> Result<(), KatcpError> + Send + Sync>;
pub type ReplyHandler = InformHandler;

struct RequestEntry {
    help: String,
    handler: RequestHandler,
}

/// The three name-to-handler tables. Registration converts underscores in
/// names to the dashes used on the wire.
pub struct HandlerTable {
    requests: BTreeMap<String, RequestEntry>,
    informs: BTreeMap<String, InformHandler>,
    replies: BTreeMap<String, ReplyHandler>,
}

fn dashed(name: &str) -> String {
    name.replace('_', "-")
}

impl HandlerTable {
    fn new() -> Self {
        Self {
            requests: BTreeMap::new(),
            informs: BTreeMap::new(),
            replies: BTreeMap::new(),
        }
    }

    /// Registers a request handler along with the help string reported by
    /// `?help`
    pub fn request(&mut self, name: &str, help: &str, handler: RequestHandler) {
        self.requests.insert(dashed(name), RequestEntry {
            help: help.to_owned(),
            handler,
        });
    }

    pub fn inform(&mut self, name: &str, handler: InformHandler) {
        self.informs.insert(dashed(name), handler);
    }

    pub fn reply(&mut self, name: &str, handler: ReplyHandler) {
        self.replies.insert(dashed(name), handler);
    }
}

/// The sensor catalog built by [`Device::setup_sensors`]
#[derive(Default)]
pub struct SensorSet {
    sensors: BTreeMap<String, Arc<Sensor>>,
}

impl SensorSet {
    /// Adds a sensor, returning the shared handle the device can keep for
    /// later mutation
    pub fn add(&mut self, sensor: Sensor) -> Arc<Sensor> {
        let sensor = Arc::new(sensor);
        self.sensors
            .insert(sensor.name().to_owned(), Arc::clone(&sensor));
        sensor
    }
}

/// The embedder's half of a device server: identity, sensors and hooks
pub trait Device: Send + Sync + 'static {
    /// Interface `(name, major, minor)`; serialized as `name-major.minor`
    /// into the `#version` connect inform
    fn version_info(&self) -> (&str, u32, u32) {
        ("device_stub", 0, 1)
    }

    /// Build `(name, major, minor, extra)`; serialized as
    /// `name-major.minor<extra>` into the `#build-state` connect inform
    fn build_info(&self) -> (&str, u32, u32, &str) {
        ("name", 0, 1, "")
    }

    /// Populates the sensor catalog; called once during server construction
    fn setup_sensors(&mut self, sensors: &mut SensorSet);

    /// Registers additional request/inform/reply handlers beyond the
    /// built-in set
    fn register_handlers(&self, _handlers: &mut HandlerTable) {}

    /// Called after a client connection is established
    fn on_client_connect(&self, _server: &DeviceServer, _client: &Arc<ClientConn>) {}

    /// Called before a client connection is closed. `sock_valid` is false
    /// when the socket can no longer be written to.
    fn on_client_disconnect(
        &self,
        _server: &DeviceServer,
        _client: &Arc<ClientConn>,
        _reason: &str,
        _sock_valid: bool,
    ) {
    }
}

/// One connected client: its socket, partial-line buffer and write lock
pub struct ClientConn {
    id: u64,
    stream: TcpStream,
    buffer: Mutex<Vec<u8>>,
    write_lock: Mutex<()>,
}

impl ClientConn {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The peer address, if the socket still knows it
    pub fn address(&self) -> Option<SocketAddr> {
        self.stream.peer_addr().ok()
    }

    /// `host:port` when the peer address is known, otherwise an opaque
    /// identifier unique to this connection
    pub fn description(&self) -> String {
        match self.address() {
            Some(addr) => addr.to_string(),
            None => format!("client-{}", self.id),
        }
    }

    /// Writes one serialized message plus the line terminator, retrying while
    /// the socket would block. Holds this client's write lock for the
    /// duration so concurrent messages never interleave.
    fn write_message(&self, msg: &Message) -> Result<(), String> {
        let mut data = msg.to_string().into_bytes();
        data.push(b'\n');
        let _writer = lock(&self.write_lock);
        let mut written = 0;
        while written < data.len() {
            match (&self.stream).write(&data[written..]) {
                Ok(0) => return Err("wrote zero bytes".to_owned()),
                Ok(n) => written += n,
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    continue
                }
                Err(e) => return Err(e.to_string()),
            }
        }
        Ok(())
    }
}

pub(crate) struct ServerState {
    /// The requested bind address, replaced by the actual one once listening
    bind_addr: Mutex<SocketAddr>,
    running: AtomicBool,
    started: Mutex<bool>,
    started_signal: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
    clients: Mutex<HashMap<u64, Arc<ClientConn>>>,
    next_client_id: AtomicU64,
    sensors: BTreeMap<String, Arc<Sensor>>,
    /// Per-client sensor-name to strategy maps
    strategies: Mutex<HashMap<u64, HashMap<String, Arc<SampleStrategy>>>>,
    reactor: SampleReactor,
    logger: DeviceLogger,
    handlers: HandlerTable,
    restart_sink: Mutex<Option<mpsc::Sender<DeviceServer>>>,
    device: Box<dyn Device>,
    version: String,
    build_state: String,
}

/// A multi-client katcp device server. Cloning is cheap and yields another
/// handle to the same server.
#[derive(Clone)]
pub struct DeviceServer {
    state: Arc<ServerState>,
}

impl DeviceServer {
    /// Creates a server for `device`, resolving (but not yet binding) the
    /// given address. The device's `setup_sensors` and `register_handlers`
    /// run here.
    pub fn new(addr: impl ToSocketAddrs, mut device: impl Device) -> io::Result<Self> {
        let bind_addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no bind address given")
        })?;
        let mut sensors = SensorSet::default();
        device.setup_sensors(&mut sensors);
        let mut handlers = builtin_handlers();
        device.register_handlers(&mut handlers);
        let (iface, major, minor) = device.version_info();
        let version = format!("{iface}-{major}.{minor}");
        let (build, build_major, build_minor, extra) = device.build_info();
        let build_state = format!("{build}-{build_major}.{build_minor}{extra}");
        let state = Arc::new_cyclic(|weak: &Weak<ServerState>| ServerState {
            bind_addr: Mutex::new(bind_addr),
            running: AtomicBool::new(false),
            started: Mutex::new(false),
            started_signal: Condvar::new(),
            thread: Mutex::new(None),
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            sensors: sensors.sensors,
            strategies: Mutex::new(HashMap::new()),
            reactor: SampleReactor::new(),
            logger: DeviceLogger::new(weak.clone()),
            handlers,
            restart_sink: Mutex::new(None),
            device: Box::new(device),
            version,
            build_state,
        });
        Ok(Self { state })
    }

    /// The address the server is bound to; once running, the actual
    /// listening address (useful when binding port 0)
    pub fn address(&self) -> SocketAddr {
        *lock(&self.state.bind_addr)
    }

    /// The device logger broadcasting `#log` informs
    pub fn log(&self) -> &DeviceLogger {
        &self.state.logger
    }

    /// Fetches the sensor with the given name
    pub fn get_sensor(&self, name: &str) -> Option<Arc<Sensor>> {
        self.state.sensors.get(name).cloned()
    }

    /// All sensors, in name order
    pub fn sensors(&self) -> Vec<Arc<Sensor>> {
        self.state.sensors.values().cloned().collect()
    }

    /// Registers the restart sink. `?restart` pushes a handle to this server
    /// onto it; without a sink the request fails.
    pub fn set_restart_sink(&self, sink: mpsc::Sender<DeviceServer>) {
        *lock(&self.state.restart_sink) = Some(sink);
    }

    /// Whether the run loop is active
    pub fn running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    /// Starts the server in a new thread. With a timeout, waits that long
    /// for the run loop to come up and errors if it does not.
    pub fn start(&self, timeout: Option<Duration>) -> Result<(), KatcpError> {
        {
            let mut thread = lock(&self.state.thread);
            if thread.is_some() {
                return Err(KatcpError::Message("Device server already started.".to_owned()));
            }
            let server = self.clone();
            let handle = thread::Builder::new()
                .name("katcp-device".to_owned())
                .spawn(move || server.run())
                .map_err(|e| {
                    KatcpError::Message(format!("Failed to spawn device server thread: {e}"))
                })?;
            *thread = Some(handle);
        }
        if let Some(timeout) = timeout {
            if !self.wait_started(timeout) {
                return Err(KatcpError::Message(
                    "Device server failed to start.".to_owned(),
                ));
            }
        }
        Ok(())
    }

    /// Runs the accept/dispatch loop on the current thread until stopped
    pub fn run(&self) {
        self.state.run_loop();
    }

    /// Waits for the server thread to exit
    pub fn join(&self) {
        if let Some(handle) = lock(&self.state.thread).take() {
            let _ = handle.join();
        }
    }

    /// Stops a running server: waits (bounded) for it to have started, then
    /// clears the running flag. The loop notices within its poll interval,
    /// drains the clients and closes the listen socket.
    pub fn stop(&self, timeout: Duration) -> Result<(), KatcpError> {
        if !self.wait_started(timeout) {
            return Err(KatcpError::Message(
                "Attempt to stop server that wasn't running.".to_owned(),
            ));
        }
        self.state.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn wait_started(&self, timeout: Duration) -> bool {
        let started = lock(&self.state.started);
        let (started, _) = self
            .state
            .started_signal
            .wait_timeout_while(started, timeout, |started| !*started)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *started
    }

    /// Sends an inform to one client
    pub fn inform(&self, client: &Arc<ClientConn>, msg: &Message) {
        debug_assert_eq!(MessageKind::Inform, msg.kind());
        self.state.send_message(client, msg);
    }

    /// Sends an inform to every connected client
    pub fn mass_inform(&self, msg: &Message) {
        debug_assert_eq!(MessageKind::Inform, msg.kind());
        self.state.mass_inform(msg);
    }
}

impl ServerState {
    fn server(self: &Arc<Self>) -> DeviceServer {
        DeviceServer {
            state: Arc::clone(self),
        }
    }

    /// Creates the listening socket: reusable address, non-blocking
    fn bind(addr: &SocketAddr) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.bind(&(*addr).into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;
        Ok(socket.into())
    }

    fn run_loop(self: &Arc<Self>) {
        let mut listener = match Self::bind(&lock(&self.bind_addr)) {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("Failed to bind device server socket: {e}");
                return;
            }
        };
        // Keep the real address around so the same port can be rebound
        if let Ok(actual) = listener.local_addr() {
            *lock(&self.bind_addr) = actual;
        }
        if let Err(e) = self.reactor.start() {
            log::error!("Failed to start the sample reactor: {e}");
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        {
            let mut started = lock(&self.started);
            *started = true;
            self.started_signal.notify_all();
        }

        while self.running.load(Ordering::SeqCst) {
            let clients: Vec<Arc<ClientConn>> = lock(&self.clients).values().cloned().collect();
            let mut fds = Vec::with_capacity(clients.len() + 1);
            fds.push(PollFd::new(listener.as_fd(), PollFlags::POLLIN));
            for client in &clients {
                fds.push(PollFd::new(client.stream.as_fd(), PollFlags::POLLIN));
            }
            let poll_result = poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS));
            let events: Vec<PollFlags> = fds
                .iter()
                .map(|fd| fd.revents().unwrap_or_else(PollFlags::empty))
                .collect();
            drop(fds);

            match poll_result {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    // Search for the broken socket(s) with individual
                    // zero-timeout probes
                    log::warn!("poll failed ({e}), probing sockets");
                    for client in &clients {
                        let mut probe = [PollFd::new(client.stream.as_fd(), PollFlags::POLLIN)];
                        if poll(&mut probe, PollTimeout::ZERO).is_err() {
                            self.drop_client(client, "Client socket died", false);
                        }
                    }
                    let listen_dead = {
                        let mut probe = [PollFd::new(listener.as_fd(), PollFlags::POLLIN)];
                        poll(&mut probe, PollTimeout::ZERO).is_err()
                    };
                    if listen_dead {
                        listener = match self.rebind() {
                            Some(listener) => listener,
                            None => break,
                        };
                    }
                    continue;
                }
            }

            for (client, revents) in clients.iter().zip(events.iter().skip(1)) {
                if revents.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                    self.drop_client(client, "Client socket died", false);
                    continue;
                }
                if revents.intersects(PollFlags::POLLIN | PollFlags::POLLHUP) {
                    let mut chunk = [0u8; READ_CHUNK];
                    match (&client.stream).read(&mut chunk) {
                        Ok(0) => self.drop_client(client, "Socket EOF", false),
                        Ok(n) => self.handle_chunk(client, &chunk[..n]),
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => self.drop_client(
                            client,
                            &format!("Client socket died with error {e}"),
                            false,
                        ),
                    }
                }
            }

            let listen_events = events[0];
            if listen_events.intersects(PollFlags::POLLERR | PollFlags::POLLNVAL) {
                listener = match self.rebind() {
                    Some(listener) => listener,
                    None => break,
                };
            } else if listen_events.contains(PollFlags::POLLIN) {
                self.accept(&listener);
            }
        }

        let clients: Vec<Arc<ClientConn>> = lock(&self.clients).values().cloned().collect();
        for client in clients {
            self.drop_client(&client, "Device server shutting down.", true);
        }
        drop(listener);
        self.reactor.stop();
        self.running.store(false, Ordering::SeqCst);
    }

    fn rebind(self: &Arc<Self>) -> Option<TcpListener> {
        log::warn!("Server socket died, attempting to restart it.");
        match Self::bind(&lock(&self.bind_addr)) {
            Ok(listener) => Some(listener),
            Err(e) => {
                log::error!("Failed to rebind device server socket: {e}");
                None
            }
        }
    }

    fn accept(self: &Arc<Self>, listener: &TcpListener) {
        let (stream, addr) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                log::warn!("Failed to accept client: {e}");
                return;
            }
        };
        if let Err(e) = stream.set_nonblocking(true) {
            log::warn!("Failed to make client socket non-blocking: {e}");
            return;
        }
        // Informs all *other* clients; the new one is not registered yet
        self.mass_inform(&Message::new_unvalidated(
            MessageKind::Inform,
            "client-connected",
            [format!("New client connected from {addr}")],
        ));
        let client = Arc::new(ClientConn {
            id: self.next_client_id.fetch_add(1, Ordering::SeqCst),
            stream,
            buffer: Mutex::new(Vec::new()),
            write_lock: Mutex::new(()),
        });
        lock(&self.clients).insert(client.id, Arc::clone(&client));
        lock(&self.strategies).insert(client.id, HashMap::new());
        self.send_message(
            &client,
            &Message::new_unvalidated(MessageKind::Inform, "version", [self.version.clone()]),
        );
        self.send_message(
            &client,
            &Message::new_unvalidated(MessageKind::Inform, "build-state", [
                self.build_state.clone()
            ]),
        );
        self.device.on_client_connect(&self.server(), &client);
    }

    /// Removes a client: detaches its strategies from the reactor, closes the
    /// socket and fires the disconnect hook. Safe to call more than once.
    fn drop_client(self: &Arc<Self>, client: &Arc<ClientConn>, reason: &str, sock_valid: bool) {
        if lock(&self.clients).remove(&client.id).is_none() {
            return;
        }
        let strategies = lock(&self.strategies).remove(&client.id).unwrap_or_default();
        for strategy in strategies.into_values() {
            self.reactor.remove_strategy(&strategy);
        }
        if sock_valid {
            let _ = client.write_message(&Message::new_unvalidated(
                MessageKind::Inform,
                "disconnect",
                [reason.to_owned()],
            ));
        }
        let _ = client.stream.shutdown(std::net::Shutdown::Both);
        self.device
            .on_client_disconnect(&self.server(), client, reason, sock_valid);
    }

    /// Sends a message to one client. Failed sends drop the client and never
    /// surface to the caller.
    pub(crate) fn send_message(self: &Arc<Self>, client: &Arc<ClientConn>, msg: &Message) {
        // Log all sent messages here so no one else has to
        log::debug!("sending to {}: {msg}", client.description());
        if !lock(&self.clients).contains_key(&client.id) {
            log::warn!(
                "Attempt to send to {} which is no longer a client.",
                client.description()
            );
            return;
        }
        if let Err(error) = client.write_message(msg) {
            let reason = format!(
                "Failed to send message to client {} ({error})",
                client.description()
            );
            log::error!("{reason}");
            self.drop_client(client, &reason, false);
        }
    }

    fn inform(self: &Arc<Self>, client: &Arc<ClientConn>, msg: &Message) {
        debug_assert_eq!(MessageKind::Inform, msg.kind());
        self.send_message(client, msg);
    }

    /// Sends an inform to every connected client
    pub(crate) fn mass_inform(self: &Arc<Self>, msg: &Message) {
        let clients: Vec<Arc<ClientConn>> = lock(&self.clients).values().cloned().collect();
        for client in clients {
            self.send_message(&client, msg);
        }
    }

    /// Splits newly arrived bytes into lines, keeping the unfinished tail in
    /// the client's partial buffer. Bare CR is treated as LF.
    fn handle_chunk(self: &Arc<Self>, client: &Arc<ClientConn>, chunk: &[u8]) {
        let complete = {
            let mut buffer = lock(&client.buffer);
            buffer.extend(chunk.iter().map(|&b| if b == b'\r' { b'\n' } else { b }));
            buffer
                .iter()
                .rposition(|&b| b == b'\n')
                .map(|last| buffer.drain(..=last).collect::<Vec<u8>>())
        };
        let Some(complete) = complete else { return };
        for line in complete.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue;
            }
            self.handle_line(client, line);
        }
    }

    fn handle_line(self: &Arc<Self>, client: &Arc<ClientConn>, line: &[u8]) {
        let parsed = std::str::from_utf8(line)
            .map_err(|_| KatcpError::Syntax("message is not valid utf-8".to_owned()))
            .and_then(Message::from_str);
        match parsed {
            Ok(msg) => self.handle_message(client, &msg),
            Err(e) => {
                // The offending line is discarded; the client hears about it
                // through a log inform
                let description = e.to_string();
                log::error!("BAD COMMAND: {description}");
                self.inform(client, &log_msg(Level::Error, &description, "root", Utc::now()));
            }
        }
    }

    fn handle_message(self: &Arc<Self>, client: &Arc<ClientConn>, msg: &Message) {
        log::debug!("received from {}: {msg}", client.description());
        match msg.kind() {
            MessageKind::Request => self.handle_request(client, msg),
            MessageKind::Inform => self.handle_inform(client, msg),
            MessageKind::Reply => self.handle_reply(client, msg),
        }
    }

    fn handle_request(self: &Arc<Self>, client: &Arc<ClientConn>, msg: &Message) {
        let reply = match self.handlers.requests.get(msg.name()) {
            Some(entry) => match (entry.handler)(&self.server(), client, msg) {
                Ok(HandlerResult::Reply(reply))
                    if reply.kind() == MessageKind::Reply && reply.name() == msg.name() =>
                {
                    log::info!("{} OK", msg.name());
                    Some(reply)
                }
                Ok(HandlerResult::Reply(_)) => {
                    let reason = format!("Handler for {} returned an unrelated reply.", msg.name());
                    log::error!("Request {} FAIL: {reason}", msg.name());
                    Some(msg.reply_to(["fail", reason.as_str()]))
                }
                Ok(HandlerResult::Async) => {
                    log::info!("{} ASYNC OK", msg.name());
                    None
                }
                Ok(HandlerResult::Fail(reason)) => {
                    log::error!("Request {} FAIL: {reason}", msg.name());
                    Some(msg.reply_to(["fail", reason.as_str()]))
                }
                Err(error) => {
                    let reason = error.to_string();
                    log::error!("Request {} FAIL: {reason}", msg.name());
                    Some(msg.reply_to(["fail", reason.as_str()]))
                }
            },
            None => {
                log::error!("{} INVALID: Unknown request.", msg.name());
                Some(msg.reply_to(["invalid", "Unknown request."]))
            }
        };
        if let Some(reply) = reply {
            self.send_message(client, &reply);
        }
    }

    fn handle_inform(self: &Arc<Self>, client: &Arc<ClientConn>, msg: &Message) {
        match self.handlers.informs.get(msg.name()) {
            Some(handler) => {
                if let Err(e) = handler(&self.server(), client, msg) {
                    log::error!("Inform {} FAIL: {e}", msg.name());
                }
            }
            None => log::warn!("{} INVALID: Unknown inform.", msg.name()),
        }
    }

    fn handle_reply(self: &Arc<Self>, client: &Arc<ClientConn>, msg: &Message) {
        match self.handlers.replies.get(msg.name()) {
            Some(handler) => {
                if let Err(e) = handler(&self.server(), client, msg) {
                    log::error!("Reply {} FAIL: {e}", msg.name());
                }
            }
            None => log::warn!("{} INVALID: Unknown reply.", msg.name()),
        }
    }

    /// The emission callback handed to a strategy: writes through this
    /// client's lock, holding only a weak server reference so strategies
    /// never keep the server alive
    fn strategy_emit(self: &Arc<Self>, client: &Arc<ClientConn>) -> EmitFn {
        let weak = Arc::downgrade(self);
        let client = Arc::clone(client);
        Box::new(move |msg| {
            if let Some(state) = weak.upgrade() {
                state.send_message(&client, &msg);
            }
        })
    }
}

// ---- Built-in requests

fn builtin_handlers() -> HandlerTable {
    let mut handlers = HandlerTable::new();
    handlers.request("halt", "Halt the device server.", Box::new(request_halt));
    handlers.request(
        "help",
        "Return help on the available requests.",
        Box::new(request_help),
    );
    handlers.request(
        "log_level",
        "Query or set the current logging level.",
        Box::new(request_log_level),
    );
    handlers.request(
        "restart",
        "Restart the device server.",
        Box::new(request_restart),
    );
    handlers.request(
        "client_list",
        "Request the list of connected clients.",
        Box::new(request_client_list),
    );
    handlers.request(
        "sensor_list",
        "Request the list of sensors.",
        Box::new(request_sensor_list),
    );
    handlers.request(
        "sensor_value",
        "Request the value of a sensor or sensors.",
        Box::new(request_sensor_value),
    );
    handlers.request(
        "sensor_sampling",
        "Configure or query the way a sensor is sampled.",
        Box::new(request_sensor_sampling),
    );
    handlers.request(
        "watchdog",
        "Check that the server is still alive.",
        Box::new(request_watchdog),
    );
    handlers
}

fn request_halt(
    server: &DeviceServer,
    _client: &Arc<ClientConn>,
    msg: &Message,
) -> Result<HandlerResult, KatcpError> {
    server.stop(Duration::from_secs(1))?;
    // The reply still departs: the run loop only notices the cleared flag
    // after dispatch has sent it
    Ok(HandlerResult::Reply(msg.reply_to(["ok"])))
}

fn request_watchdog(
    _server: &DeviceServer,
    _client: &Arc<ClientConn>,
    msg: &Message,
) -> Result<HandlerResult, KatcpError> {
    Ok(HandlerResult::Reply(msg.reply_to(["ok"])))
}

fn request_restart(
    server: &DeviceServer,
    _client: &Arc<ClientConn>,
    msg: &Message,
) -> Result<HandlerResult, KatcpError> {
    let sink = lock(&server.state.restart_sink);
    match &*sink {
        None => Ok(HandlerResult::Fail(
            "No restart queue registered -- cannot restart.".to_owned(),
        )),
        // The sink is unbounded, so the push never blocks
        Some(sink) => match sink.send(server.clone()) {
            Ok(()) => Ok(HandlerResult::Reply(msg.reply_to(["ok"]))),
            Err(_) => Ok(HandlerResult::Fail(
                "Restart queue is gone -- cannot restart.".to_owned(),
            )),
        },
    }
}

fn request_help(
    server: &DeviceServer,
    client: &Arc<ClientConn>,
    msg: &Message,
) -> Result<HandlerResult, KatcpError> {
    let requests = &server.state.handlers.requests;
    match msg.arguments() {
        [] => {
            for (name, entry) in requests {
                server.state.inform(
                    client,
                    &Message::new_unvalidated(MessageKind::Inform, "help", [
                        name.clone(),
                        entry.help.clone(),
                    ]),
                );
            }
            Ok(HandlerResult::Reply(msg.reply_to(vec![
                "ok".to_owned(),
                requests.len().to_string(),
            ])))
        }
        [name, ..] => match requests.get(name.as_str()) {
            Some(entry) => {
                server.state.inform(
                    client,
                    &Message::new_unvalidated(MessageKind::Inform, "help", [
                        name.clone(),
                        entry.help.clone(),
                    ]),
                );
                Ok(HandlerResult::Reply(msg.reply_to(["ok", "1"])))
            }
            None => Ok(HandlerResult::Fail("Unknown request method.".to_owned())),
        },
    }
}

fn request_log_level(
    server: &DeviceServer,
    _client: &Arc<ClientConn>,
    msg: &Message,
) -> Result<HandlerResult, KatcpError> {
    if let [name, ..] = msg.arguments() {
        if let Err(e) = server.state.logger.set_level_by_name(name) {
            return Ok(HandlerResult::Fail(e.to_string()));
        }
    }
    Ok(HandlerResult::Reply(msg.reply_to(vec![
        "ok".to_owned(),
        server.state.logger.level_name(),
    ])))
}

fn request_client_list(
    server: &DeviceServer,
    client: &Arc<ClientConn>,
    msg: &Message,
) -> Result<HandlerResult, KatcpError> {
    let clients: Vec<Arc<ClientConn>> = lock(&server.state.clients).values().cloned().collect();
    let count = clients.len();
    for listed in clients {
        server.state.inform(
            client,
            &Message::new_unvalidated(MessageKind::Inform, "client-list", [listed.description()]),
        );
    }
    Ok(HandlerResult::Reply(msg.reply_to(vec![
        "ok".to_owned(),
        count.to_string(),
    ])))
}

fn sensor_list_inform(sensor: &Sensor) -> Message {
    let mut args = vec![
        sensor.name().to_owned(),
        sensor.description().to_owned(),
        sensor.units().to_owned(),
        sensor.type_spec().name().to_owned(),
    ];
    args.extend(sensor.type_spec().formatted_params());
    Message::new_unvalidated(MessageKind::Inform, "sensor-list", args)
}

fn request_sensor_list(
    server: &DeviceServer,
    client: &Arc<ClientConn>,
    msg: &Message,
) -> Result<HandlerResult, KatcpError> {
    let sensors = &server.state.sensors;
    match msg.arguments() {
        [] => {
            for sensor in sensors.values() {
                server.state.inform(client, &sensor_list_inform(sensor));
            }
            Ok(HandlerResult::Reply(msg.reply_to(vec![
                "ok".to_owned(),
                sensors.len().to_string(),
            ])))
        }
        [name, ..] => match sensors.get(name.as_str()) {
            Some(sensor) => {
                server.state.inform(client, &sensor_list_inform(sensor));
                Ok(HandlerResult::Reply(msg.reply_to(["ok", "1"])))
            }
            None => Ok(HandlerResult::Fail("Unknown sensor name.".to_owned())),
        },
    }
}

fn sensor_value_inform(sensor: &Sensor) -> Message {
    let (timestamp, status, value) = sensor.read_formatted();
    Message::new_unvalidated(MessageKind::Inform, "sensor-value", [
        timestamp,
        "1".to_owned(),
        sensor.name().to_owned(),
        status,
        value,
    ])
}

fn request_sensor_value(
    server: &DeviceServer,
    client: &Arc<ClientConn>,
    msg: &Message,
) -> Result<HandlerResult, KatcpError> {
    let sensors = &server.state.sensors;
    match msg.arguments() {
        [] => {
            for sensor in sensors.values() {
                server.state.inform(client, &sensor_value_inform(sensor));
            }
            Ok(HandlerResult::Reply(msg.reply_to(vec![
                "ok".to_owned(),
                sensors.len().to_string(),
            ])))
        }
        [name, ..] => match sensors.get(name.as_str()) {
            Some(sensor) => {
                server.state.inform(client, &sensor_value_inform(sensor));
                Ok(HandlerResult::Reply(msg.reply_to(["ok", "1"])))
            }
            None => Ok(HandlerResult::Fail("Unknown sensor name.".to_owned())),
        },
    }
}

fn request_sensor_sampling(
    server: &DeviceServer,
    client: &Arc<ClientConn>,
    msg: &Message,
) -> Result<HandlerResult, KatcpError> {
    let state = &server.state;
    let [name, rest @ ..] = msg.arguments() else {
        return Ok(HandlerResult::Fail("No sensor name given.".to_owned()));
    };
    let Some(sensor) = state.sensors.get(name.as_str()) else {
        return Ok(HandlerResult::Fail("Unknown sensor name.".to_owned()));
    };

    if let [kind, params @ ..] = rest {
        if StrategyKind::from_argument(kind).is_err() {
            return Ok(HandlerResult::Fail("Unknown strategy name.".to_owned()));
        }
        let emit = state.strategy_emit(client);
        let new = match SampleStrategy::construct(kind, emit, Arc::clone(sensor), params) {
            Ok(strategy) => strategy,
            Err(e) => return Ok(HandlerResult::Fail(e.to_string())),
        };
        let old = lock(&state.strategies)
            .get_mut(&client.id)
            .and_then(|per_client| per_client.remove(name.as_str()));
        if let Some(old) = old {
            state.reactor.remove_strategy(&old);
        }
        // A none strategy is not armed; querying it below reports "none"
        if new.kind() != StrategyKind::None {
            if let Some(per_client) = lock(&state.strategies).get_mut(&client.id) {
                per_client.insert(name.clone(), Arc::clone(&new));
            }
            state.reactor.add_strategy(new);
        }
    }

    let current = lock(&state.strategies)
        .get(&client.id)
        .and_then(|per_client| per_client.get(name.as_str()))
        .cloned();
    let (kind, params) = match current {
        Some(strategy) => strategy.get_sampling_formatted(),
        None => ("none".to_owned(), vec![]),
    };
    let mut args = vec!["ok".to_owned(), name.clone(), kind];
    args.extend(params);
    Ok(HandlerResult::Reply(msg.reply_to(args)))
}
