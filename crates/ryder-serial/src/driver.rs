//! Driver handle and connection supervision
//!
//! [`RyderSerial`] is the public face of the driver. A dedicated worker
//! thread owns the channel, the protocol engine and both timers; public
//! methods post operations to its mailbox and get one-shot completions back.
//! All state transitions therefore happen on a single execution context,
//! which also keeps observer events in generation order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::channel::{Channel, SerialChannel, TcpChannel};
use crate::commands::Command;
use crate::engine::{ChannelLoss, Engine};
use crate::error::DriverError;
use crate::events::{DeviceEvent, EventSink};
use crate::lock::LockLayer;
use crate::queue::{self, completion, CommandEntry, Completion, Resolver};
use crate::response::Response;
use crate::{serial, DEFAULT_BAUD_RATE, DEFAULT_RECONNECT_INTERVAL};

/// How long the worker parks on its mailbox between channel polls.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Driver configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Serial baud rate
    pub baud_rate: u32,
    /// Take an OS-level exclusive lock on the port (unix)
    pub exclusive_lock: bool,
    /// Delay between reconnection attempts while unexpectedly closed
    pub reconnect_interval: Duration,
    /// Fail every queued command when the device reports LOCKED
    pub reject_on_locked: bool,
    /// Log raw wire traffic at debug level
    pub debug: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            exclusive_lock: true,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            reject_on_locked: false,
            debug: false,
        }
    }
}

/// Bytes accepted by [`RyderSerial::send`]: a byte sequence, a single byte,
/// or a [`Command`] opcode.
pub trait IntoCommandBytes {
    fn into_bytes(self) -> Vec<u8>;
}

impl IntoCommandBytes for Vec<u8> {
    fn into_bytes(self) -> Vec<u8> {
        self
    }
}

impl IntoCommandBytes for &[u8] {
    fn into_bytes(self) -> Vec<u8> {
        self.to_vec()
    }
}

impl<const N: usize> IntoCommandBytes for [u8; N] {
    fn into_bytes(self) -> Vec<u8> {
        self.to_vec()
    }
}

impl IntoCommandBytes for u8 {
    fn into_bytes(self) -> Vec<u8> {
        vec![self]
    }
}

impl IntoCommandBytes for Command {
    fn into_bytes(self) -> Vec<u8> {
        vec![self.opcode()]
    }
}

/// Operations posted to the worker's mailbox.
enum Op {
    Send {
        bytes: Vec<u8>,
        prepend: bool,
        resolver: Resolver<Response>,
    },
    Open,
    Close { done: Resolver<()> },
    Clear { done: Resolver<()> },
    Shutdown,
}

/// Handle to a Ryder device (or simulator) on one serial port.
pub struct RyderSerial {
    ops: Sender<Op>,
    port_open: Arc<AtomicBool>,
    locks: Arc<LockLayer>,
    events: EventSink,
    worker: Option<JoinHandle<()>>,
}

impl RyderSerial {
    /// Create a driver for the given port. Port names starting with
    /// `tcp://host:port` connect to a simulator instead of a serial device.
    ///
    /// The worker thread starts immediately; call [`open`](Self::open) to
    /// connect.
    pub fn new(port: impl Into<String>, config: DriverConfig) -> Self {
        let (ops_tx, ops_rx) = mpsc::channel();
        let port_open = Arc::new(AtomicBool::new(false));
        let locks = Arc::new(LockLayer::new());
        let events = EventSink::new();

        let worker = Worker {
            mailbox: ops_rx,
            engine: Engine::new(config.reject_on_locked, config.debug, events.clone()),
            port_name: port.into(),
            config,
            closing: false,
            reconnect_at: None,
            port_open: port_open.clone(),
            locks: locks.clone(),
            events: events.clone(),
        };
        let handle = thread::Builder::new()
            .name("ryder-serial".into())
            .spawn(move || worker.run())
            .expect("failed to spawn driver worker thread");

        Self {
            ops: ops_tx,
            port_open,
            locks,
            events,
            worker: Some(handle),
        }
    }

    /// Open the port. A no-op while already open (even if a different port
    /// was configured since; the port name is fixed at construction). While
    /// the open fails, reconnection is retried at the configured interval.
    pub fn open(&self) {
        let _ = self.ops.send(Op::Open);
    }

    /// Close the port: pending commands fail with `Cleared`, outstanding
    /// locks are released, and the reconnect timer is cancelled. Idempotent.
    /// Blocks until the worker has torn the connection down.
    pub fn close(&self) {
        let (done, comp) = completion();
        if self.ops.send(Op::Close { done }).is_ok() {
            let _ = comp.wait();
        }
    }

    /// Fail every pending command with `Cleared`, return the engine to idle
    /// and release every outstanding lock. The port stays open.
    pub fn clear(&self) {
        let (done, comp) = completion();
        if self.ops.send(Op::Clear { done }).is_ok() {
            let _ = comp.wait();
        }
    }

    /// Whether the port is currently open.
    pub fn is_open(&self) -> bool {
        self.port_open.load(Ordering::SeqCst)
    }

    /// Queue a command for the device. The completion resolves with the
    /// device's response, or fails with a [`DriverError`]. Fails immediately
    /// with `Disconnected` while the port is closed.
    pub fn send(&self, bytes: impl IntoCommandBytes) -> Completion<Response> {
        self.submit(bytes.into_bytes(), false)
    }

    /// Like [`send`](Self::send), but inserts ahead of all queued commands.
    /// The command currently in flight is never displaced.
    pub fn send_prepend(&self, bytes: impl IntoCommandBytes) -> Completion<Response> {
        self.submit(bytes.into_bytes(), true)
    }

    /// Ask the device to abandon its operation in progress, jumping ahead of
    /// any queued work.
    pub fn cancel(&self) -> Completion<Response> {
        self.send_prepend(Command::Cancel)
    }

    fn submit(&self, bytes: Vec<u8>, prepend: bool) -> Completion<Response> {
        if !self.is_open() {
            return queue::failed(DriverError::Disconnected);
        }
        let (resolver, comp) = completion();
        if self
            .ops
            .send(Op::Send {
                bytes,
                prepend,
                resolver,
            })
            .is_err()
        {
            return queue::failed(DriverError::Disconnected);
        }
        comp
    }

    /// Acquire the advisory lock. The first lock resolves immediately; each
    /// later one waits for a matching [`unlock`](Self::unlock). Locks are
    /// cooperative: they do not stop other callers from sending.
    pub fn lock(&self) -> Completion<()> {
        self.locks.lock()
    }

    /// Release one hold on the advisory lock.
    pub fn unlock(&self) {
        self.locks.unlock()
    }

    /// Whether any advisory lock is outstanding.
    pub fn locked(&self) -> bool {
        self.locks.locked()
    }

    /// Run a multi-command interaction under the advisory lock. The lock is
    /// held for the whole call and released whatever the outcome.
    pub fn sequence<T>(
        &self,
        f: impl FnOnce(&Self) -> Result<T, DriverError>,
    ) -> Result<T, DriverError> {
        self.lock().wait()?;
        let result = f(self);
        self.unlock();
        result
    }

    /// Subscribe to observer events. Events are delivered in the order they
    /// are generated; events emitted before this call are not replayed.
    pub fn subscribe(&self) -> Receiver<DeviceEvent> {
        self.events.subscribe()
    }
}

impl Drop for RyderSerial {
    fn drop(&mut self) {
        let _ = self.ops.send(Op::Shutdown);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

/// The worker thread: owns the engine and both timers, drains the mailbox,
/// polls the channel, and supervises reconnection.
struct Worker {
    mailbox: Receiver<Op>,
    engine: Engine,
    port_name: String,
    config: DriverConfig,
    closing: bool,
    reconnect_at: Option<Instant>,
    port_open: Arc<AtomicBool>,
    locks: Arc<LockLayer>,
    events: EventSink,
}

impl Worker {
    fn run(mut self) {
        loop {
            match self.mailbox.recv_timeout(POLL_INTERVAL) {
                Ok(op) => {
                    if self.handle(op) {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.teardown();
                    return;
                }
            }
            // Drain any further queued operations before touching the wire.
            loop {
                match self.mailbox.try_recv() {
                    Ok(op) => {
                        if self.handle(op) {
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }

            let now = Instant::now();
            self.engine.poll_io(now);
            self.engine.check_watchdog(now);
            self.after_engine(now);
        }
    }

    /// Returns true when the worker should exit.
    fn handle(&mut self, op: Op) -> bool {
        let now = Instant::now();
        match op {
            Op::Send {
                bytes,
                prepend,
                resolver,
            } => {
                self.engine
                    .submit(CommandEntry::new(bytes, resolver), prepend, now);
                self.after_engine(now);
            }
            Op::Open => {
                self.closing = false;
                if self.engine.is_open() {
                    debug!("open requested while already open; ignoring");
                } else {
                    self.attempt_open(now);
                }
            }
            Op::Close { done } => {
                self.teardown();
                done.resolve(());
            }
            Op::Clear { done } => {
                self.engine.clear();
                self.locks.release_all();
                done.resolve(());
            }
            Op::Shutdown => {
                self.teardown();
                return true;
            }
        }
        false
    }

    fn attempt_open(&mut self, now: Instant) {
        match open_channel(&self.port_name, &self.config) {
            Ok(channel) => {
                info!("port {} open", self.port_name);
                self.port_open.store(true, Ordering::SeqCst);
                self.reconnect_at = None;
                self.engine.attach(channel, now);
                self.events.emit(DeviceEvent::Open);
            }
            Err(e) => {
                warn!("failed to open {}: {}", self.port_name, e);
                self.events.emit(DeviceEvent::Failed(e.to_string()));
                if !self.closing {
                    self.reconnect_at = Some(now + self.config.reconnect_interval);
                }
            }
        }
    }

    /// React to channel loss and fire the reconnect timer.
    fn after_engine(&mut self, now: Instant) {
        if let Some(loss) = self.engine.take_loss() {
            self.port_open.store(false, Ordering::SeqCst);
            match loss {
                ChannelLoss::Eof => info!("port {} closed by peer", self.port_name),
                ChannelLoss::Error(message) => {
                    warn!("transport error on {}: {}", self.port_name, message);
                    self.events.emit(DeviceEvent::Error(message));
                }
            }
            self.events.emit(DeviceEvent::Close);
            if !self.closing {
                self.reconnect_at = Some(now + self.config.reconnect_interval);
            }
        }

        if let Some(deadline) = self.reconnect_at {
            if now >= deadline {
                self.reconnect_at = None;
                debug!("reconnecting to {}", self.port_name);
                self.attempt_open(now);
            }
        }
    }

    /// Close the port and fail everything pending. Idempotent.
    fn teardown(&mut self) {
        self.closing = true;
        self.reconnect_at = None;
        self.engine.clear();
        self.locks.release_all();
        self.port_open.store(false, Ordering::SeqCst);
        if self.engine.detach().is_some() {
            self.events.emit(DeviceEvent::Close);
        }
    }
}

/// Open the configured transport: TCP for `tcp://` names, serial otherwise.
fn open_channel(port_name: &str, config: &DriverConfig) -> Result<Box<dyn Channel>, DriverError> {
    if let Some(addr) = port_name.strip_prefix("tcp://") {
        let channel = TcpChannel::connect(addr)?;
        Ok(Box::new(channel))
    } else {
        let port = serial::open_port(port_name, config.baud_rate, config.exclusive_lock)?;
        Ok(Box::new(SerialChannel::new(port)))
    }
}
