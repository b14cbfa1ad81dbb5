//! Full-duplex serial transport.
//!
//! Owns the port handle and a dedicated reader thread that drains the OS
//! queue, reframes bytes through the decoder and delivers records to the
//! data callback. The public API (open / write / clear / close) may be
//! called from any thread; the handle is snapshotted under the state mutex
//! and then used lock-free, so a revoked handle is observed at the next
//! slice boundary.

use std::io::{self, ErrorKind};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serial2::SerialPort;
use tracing::{debug, error, warn};

use crate::decoder::Decoder;
use crate::record::{DecodedRecord, RawChunk};
use crate::{Error, LinkResult};

/// Default baud rate of the general transport.
pub const DEFAULT_BAUD: u32 = 57_600 * 16;

const READ_BUFFER_SIZE: usize = 4096;
/// Reader wait slice; stop requests are observed within one slice.
const READ_SLICE: Duration = Duration::from_millis(100);
/// Per-attempt write wait slice.
const WRITE_SLICE: Duration = Duration::from_millis(16);
/// Fixed total write timeout.
const WRITE_TIMEOUT: Duration = Duration::from_millis(1500);
const OPEN_ATTEMPTS: u32 = 10;
const OPEN_RETRY_SPACING: Duration = Duration::from_millis(333);
/// Pause after a transient failure or an empty read, against busy-spin.
const RETRY_PAUSE: Duration = Duration::from_millis(1);

/// The byte-level port operations the transport needs. Implemented by
/// [`serial2::SerialPort`]; tests substitute an in-memory peer.
pub trait PortIo: Send + Sync + std::fmt::Debug {
    /// Reads available bytes, blocking at most one read slice. An empty
    /// slice reports `TimedOut` or `WouldBlock`.
    fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Writes some bytes, blocking at most one write slice. May accept
    /// fewer than `buf.len()` bytes.
    fn write_chunk(&self, buf: &[u8]) -> io::Result<usize>;
    /// Purges the OS receive and transmit queues.
    fn discard_buffers(&self) -> io::Result<()>;
}

impl PortIo for SerialPort {
    fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn write_chunk(&self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }

    fn discard_buffers(&self) -> io::Result<()> {
        SerialPort::discard_buffers(self)
    }
}

pub type DataHandler = Arc<dyn Fn(&DecodedRecord) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;
pub type ConnectionHandler = Arc<dyn Fn(bool) + Send + Sync>;

/// Consumer callbacks. All are invoked without any transport lock held;
/// panics inside them are caught, logged and swallowed.
#[derive(Clone)]
pub struct TransportHandlers {
    pub data: DataHandler,
    pub error: ErrorHandler,
    pub connection: ConnectionHandler,
}

impl Default for TransportHandlers {
    fn default() -> Self {
        Self {
            data: Arc::new(|_| {}),
            error: Arc::new(|_| {}),
            connection: Arc::new(|_| {}),
        }
    }
}

impl TransportHandlers {
    pub fn on_data(mut self, f: impl Fn(&DecodedRecord) + Send + Sync + 'static) -> Self {
        self.data = Arc::new(f);
        self
    }

    pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.error = Arc::new(f);
        self
    }

    pub fn on_connection(mut self, f: impl Fn(bool) + Send + Sync + 'static) -> Self {
        self.connection = Arc::new(f);
        self
    }
}

#[derive(Debug)]
struct PortState {
    port: Option<Arc<dyn PortIo>>,
    is_open: bool,
    baud: u32,
}

#[derive(Debug, Default)]
struct GateState {
    reader_running: bool,
    clear_pending: bool,
}

/// State shared with the reader thread. The gate condvar has its own
/// mutex, never composed with the port-state mutex.
#[derive(Debug)]
struct Shared {
    state: Mutex<PortState>,
    stop: AtomicBool,
    gate: Mutex<GateState>,
    gate_cv: Condvar,
}

impl Shared {
    fn clear_pending(&self) -> bool {
        self.gate.lock().unwrap().clear_pending
    }

    fn finish_clear(&self, decoder: &mut Decoder) {
        let mut gate = self.gate.lock().unwrap();
        if gate.clear_pending {
            decoder.reset();
            gate.clear_pending = false;
            self.gate_cv.notify_all();
        }
    }

    fn publish_running(&self, running: bool) {
        let mut gate = self.gate.lock().unwrap();
        gate.reader_running = running;
        if !running {
            gate.clear_pending = false;
        }
        self.gate_cv.notify_all();
    }
}

pub struct SerialTransport {
    shared: Arc<Shared>,
    handlers: TransportHandlers,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SerialTransport {
    pub fn new(handlers: TransportHandlers) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PortState { port: None, is_open: false, baud: DEFAULT_BAUD }),
                stop: AtomicBool::new(false),
                gate: Mutex::new(GateState::default()),
                gate_cv: Condvar::new(),
            }),
            handlers,
            reader: Mutex::new(None),
        }
    }

    /// Opens and configures the named port, starts the reader and fires
    /// `connection(true)` once the reader is pumping. Failures are
    /// returned and also delivered through the error callback.
    pub fn open(&self, port_name: &str, baud: u32) -> LinkResult<()> {
        let port = match open_port(port_name, baud) {
            Ok(port) => port,
            Err(err) => {
                self.report(&err);
                return Err(err);
            }
        };
        self.open_with(Arc::new(port), baud)
    }

    /// Starts the transport over an already-configured port.
    pub fn open_with(&self, port: Arc<dyn PortIo>, baud: u32) -> LinkResult<()> {
        if self.is_open() {
            self.close();
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            state.port = Some(port);
            state.is_open = true;
            state.baud = baud;
        }
        self.shared.stop.store(false, Ordering::Release);
        {
            let mut gate = self.shared.gate.lock().unwrap();
            gate.reader_running = false;
            gate.clear_pending = false;
        }

        let shared = Arc::clone(&self.shared);
        let handlers = self.handlers.clone();
        let handle = thread::Builder::new()
            .name("acqlink-reader".into())
            .spawn(move || reader_loop(shared, handlers))
            .map_err(|e| {
                let err = Error::Io(e);
                self.report(&err);
                err
            })?;
        *self.reader.lock().unwrap() = Some(handle);

        // Do not announce the connection before the reader is pumping.
        let mut gate = self.shared.gate.lock().unwrap();
        while !gate.reader_running {
            let (guard, timeout) =
                self.shared.gate_cv.wait_timeout(gate, Duration::from_secs(1)).unwrap();
            gate = guard;
            if timeout.timed_out() {
                break;
            }
        }
        drop(gate);

        self.invoke_connection(true);
        Ok(())
    }

    /// Writes all of `data`, looping over partial writes. Zero-byte writes
    /// succeed without touching the handle.
    pub fn write(&self, data: &[u8]) -> LinkResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        let Some(port) = self.snapshot_port() else {
            let err = Error::PortClosed;
            self.report(&err);
            return Err(err);
        };

        let deadline = Instant::now() + WRITE_TIMEOUT;
        let mut written = 0usize;
        while written < data.len() {
            match port.write_chunk(&data[written..]) {
                Ok(0) => {
                    let err =
                        Error::Io(io::Error::new(ErrorKind::WriteZero, "port accepted no bytes"));
                    self.report(&err);
                    return Err(err);
                }
                Ok(n) => written += n,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    if Instant::now() >= deadline {
                        let err = Error::WriteTimeout { written, total: data.len() };
                        self.report(&err);
                        return Err(err);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    let err = Error::Io(e);
                    self.report(&err);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Asks the reader to drain and discard buffered input, blocks until
    /// it confirms (or exits), then purges the OS queues. A no-op when the
    /// reader is not running; safe to call repeatedly.
    pub fn clear(&self) {
        {
            let mut gate = self.shared.gate.lock().unwrap();
            if !gate.reader_running {
                return;
            }
            gate.clear_pending = true;
            self.shared.gate_cv.notify_all();
            while gate.clear_pending && gate.reader_running {
                gate = self.shared.gate_cv.wait(gate).unwrap();
            }
        }
        if let Some(port) = self.snapshot_port() {
            let _ = port.discard_buffers();
        }
    }

    /// Stops the reader, revokes the handle and joins outside the lock.
    /// Fires `connection(false)` only if the port was open. Idempotent.
    pub fn close(&self) -> bool {
        self.shared.stop.store(true, Ordering::Release);

        let was_open = {
            let mut state = self.shared.state.lock().unwrap();
            let was_open = state.is_open;
            state.is_open = false;
            // The reader's snapshot keeps the handle alive for at most one
            // more slice; dropping ours here revokes it for everyone else.
            state.port = None;
            was_open
        };

        let handle = self.reader.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("reader thread panicked");
            }
        }
        self.shared.publish_running(false);

        if was_open {
            self.invoke_connection(false);
        }
        true
    }

    pub fn is_open(&self) -> bool {
        self.shared.state.lock().unwrap().is_open
    }

    pub fn baud_rate(&self) -> u32 {
        self.shared.state.lock().unwrap().baud
    }

    fn snapshot_port(&self) -> Option<Arc<dyn PortIo>> {
        let state = self.shared.state.lock().unwrap();
        if state.is_open { state.port.clone() } else { None }
    }

    fn report(&self, err: &Error) {
        report_error(&self.handlers, err);
    }

    fn invoke_connection(&self, up: bool) {
        let connection = &self.handlers.connection;
        if catch_unwind(AssertUnwindSafe(|| connection(up))).is_err() {
            error!(up, "connection callback panicked");
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_port(port_name: &str, baud: u32) -> LinkResult<SerialPort> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match configure_port(port_name, baud) {
            Ok(port) => return Ok(port),
            Err(e) if e.kind() == ErrorKind::NotFound && attempt < OPEN_ATTEMPTS => {
                debug!(port = port_name, attempt, "port not present yet; retrying");
                thread::sleep(OPEN_RETRY_SPACING);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::PortNotFound(port_name.to_string()));
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
}

/// 8-N-1, binary, no flow control, DTR and RTS asserted, queues purged.
fn configure_port(port_name: &str, baud: u32) -> io::Result<SerialPort> {
    let mut port = SerialPort::open(port_name, |mut settings: serial2::Settings| {
        settings.set_raw();
        settings.set_baud_rate(baud)?;
        settings.set_char_size(serial2::CharSize::Bits8);
        settings.set_stop_bits(serial2::StopBits::One);
        settings.set_parity(serial2::Parity::None);
        settings.set_flow_control(serial2::FlowControl::None);
        Ok(settings)
    })?;
    port.set_read_timeout(READ_SLICE)?;
    port.set_write_timeout(WRITE_SLICE)?;
    port.set_dtr(true)?;
    port.set_rts(true)?;
    port.discard_buffers()?;
    Ok(port)
}

fn reader_loop(shared: Arc<Shared>, handlers: TransportHandlers) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let started = Instant::now();

    shared.publish_running(true);

    loop {
        if shared.stop.load(Ordering::Acquire) {
            break;
        }

        // Snapshot under the lock, then read lock-free.
        let port = {
            let state = shared.state.lock().unwrap();
            if !state.is_open {
                break;
            }
            state.port.clone()
        };
        let Some(port) = port else { break };

        match port.read_chunk(&mut buf) {
            Ok(0) => thread::sleep(RETRY_PAUSE),
            Ok(n) => {
                if shared.clear_pending() {
                    debug!(bytes = n, "discarding input while clearing");
                    continue;
                }
                let chunk = RawChunk::new(
                    started.elapsed().as_millis() as u64,
                    Bytes::copy_from_slice(&buf[..n]),
                );
                deliver(&mut decoder, chunk, &handlers);
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                // The OS queue is empty; a pending clear is now a drain.
                shared.finish_clear(&mut decoder);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                if shared.stop.load(Ordering::Acquire) {
                    // Cancelled by close; exit silently.
                    break;
                }
                warn!(%e, "transient read failure");
                report_error(&handlers, &Error::Io(e));
                thread::sleep(RETRY_PAUSE);
            }
        }
    }

    shared.publish_running(false);
}

/// Runs the decoder over a chunk and hands every extracted record to the
/// data callback, with no lock held.
fn deliver(decoder: &mut Decoder, chunk: RawChunk, handlers: &TransportHandlers) {
    let mut next = chunk;
    loop {
        let Some(record) = decoder.process(&next) else { break };
        let data = &handlers.data;
        if catch_unwind(AssertUnwindSafe(|| data(&record))).is_err() {
            error!(kind = %record.kind(), "data callback panicked; record dropped");
        }
        next = RawChunk::empty(next.timestamp_ms);
    }
}

fn report_error(handlers: &TransportHandlers, err: &Error) {
    let error_cb = &handlers.error;
    if catch_unwind(AssertUnwindSafe(|| error_cb(err))).is_err() {
        error!("error callback panicked");
    }
}
