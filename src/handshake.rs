//! Probe/ack/version handshake layered over the transport.
//!
//! [`DeviceLink`] owns a [`SerialTransport`] and intercepts text records
//! while the handshake is in progress; everything else flows through the
//! dispatch bridge to the consumer. The handshake worker is a one-shot
//! thread whose every wait and sleep observes a cancellation token.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::LinkResult;
use crate::config::{HOST_VERSION, LinkConfig};
use crate::dispatch::{ConsumerHandler, DispatchBridge, DispatchPolicy};
use crate::record::DecodedRecord;
use crate::transport::{ErrorHandler, PortIo, SerialTransport, TransportHandlers};

/// Probe sent by the host; deliberately unterminated.
pub const HOST_ACK: &str = ">HOST_ACK";
/// Acknowledge expected from the device.
pub const DEVICE_ACK: &str = "<DEVICE_ACK";
/// Baud rate used by the handshake wrapper.
pub const HANDSHAKE_BAUD: u32 = 115_200 * 8;

const CLOSED_PORT_PAUSE: Duration = Duration::from_millis(200);
const ACK_WAIT: Duration = Duration::from_millis(500);
const ACK_RETRIES: u32 = 5;
const RESPONSE_WAIT: Duration = Duration::from_millis(500);
const CYCLE_PAUSE: Duration = Duration::from_millis(5_000);

/// Strictly monotonic: `Idle -> InProgress -> {Succeeded, Disconnected}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum HandshakeState {
    Idle,
    InProgress,
    Succeeded,
    Disconnected,
}

pub type StateHandler = Arc<dyn Fn(HandshakeState) + Send + Sync>;

/// Consumer-facing callbacks for a [`DeviceLink`].
#[derive(Clone)]
pub struct LinkHandlers {
    pub consumer: ConsumerHandler,
    pub state: StateHandler,
    pub error: ErrorHandler,
}

impl Default for LinkHandlers {
    fn default() -> Self {
        Self {
            consumer: Arc::new(|_| {}),
            state: Arc::new(|_| {}),
            error: Arc::new(|_| {}),
        }
    }
}

impl LinkHandlers {
    pub fn on_consumer(
        mut self,
        f: impl Fn(crate::dispatch::ConsumerEvent) + Send + Sync + 'static,
    ) -> Self {
        self.consumer = Arc::new(f);
        self
    }

    pub fn on_state(mut self, f: impl Fn(HandshakeState) + Send + Sync + 'static) -> Self {
        self.state = Arc::new(f);
        self
    }

    pub fn on_error(mut self, f: impl Fn(&crate::Error) + Send + Sync + 'static) -> Self {
        self.error = Arc::new(f);
        self
    }
}

/// Cooperative cancellation. A cancellation observed mid-sleep returns
/// immediately and is never an error.
#[derive(Debug, Default)]
struct CancelToken {
    cancelled: Mutex<bool>,
    cv: Condvar,
}

impl CancelToken {
    fn cancel(&self) {
        *self.cancelled.lock().unwrap() = true;
        self.cv.notify_all();
    }

    fn reset(&self) {
        *self.cancelled.lock().unwrap() = false;
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.lock().unwrap()
    }

    /// Sleeps for `duration` unless cancelled first. True when cancelled.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut cancelled = self.cancelled.lock().unwrap();
        loop {
            if *cancelled {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self.cv.wait_timeout(cancelled, deadline - now).unwrap();
            cancelled = guard;
        }
    }
}

/// Single-slot mailbox for intercepted handshake lines.
#[derive(Debug, Default)]
struct HandshakeSignal {
    inbox: Mutex<Option<Vec<u8>>>,
    cv: Condvar,
}

impl HandshakeSignal {
    fn post(&self, bytes: Vec<u8>) {
        *self.inbox.lock().unwrap() = Some(bytes);
        self.cv.notify_all();
    }

    fn drain(&self) {
        *self.inbox.lock().unwrap() = None;
    }

    fn wait(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut inbox = self.inbox.lock().unwrap();
        loop {
            if let Some(bytes) = inbox.take() {
                return Some(bytes);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self.cv.wait_timeout(inbox, deadline - now).unwrap();
            inbox = guard;
        }
    }
}

struct LinkShared {
    state: Mutex<HandshakeState>,
    config: Mutex<LinkConfig>,
    signal: HandshakeSignal,
    cancel: CancelToken,
    bridge: DispatchBridge,
    state_cb: StateHandler,
}

impl LinkShared {
    /// Routes a decoded record: handshake-shaped text is intercepted
    /// while the handshake is running, everything else goes to the
    /// consumer.
    fn route(&self, record: &DecodedRecord) {
        if let DecodedRecord::Text(text) = record {
            let in_progress = *self.state.lock().unwrap() == HandshakeState::InProgress;
            if in_progress && text.is_handshake() {
                self.signal.post(text.text.clone().into_bytes());
                return;
            }
        }
        self.bridge.submit(record);
    }

    fn set_state(&self, next: HandshakeState) {
        *self.state.lock().unwrap() = next;
        (self.state_cb)(next);
    }
}

/// Transport wrapper that sequences the handshake and then streams
/// records to the consumer.
pub struct DeviceLink {
    transport: Arc<SerialTransport>,
    shared: Arc<LinkShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceLink {
    pub fn new(policy: DispatchPolicy, handlers: LinkHandlers) -> Self {
        let shared = Arc::new(LinkShared {
            state: Mutex::new(HandshakeState::Idle),
            config: Mutex::new(LinkConfig::default()),
            signal: HandshakeSignal::default(),
            cancel: CancelToken::default(),
            bridge: DispatchBridge::new(policy, handlers.consumer),
            state_cb: handlers.state,
        });

        let route_shared = Arc::clone(&shared);
        let conn_shared = Arc::clone(&shared);
        let transport = Arc::new(SerialTransport::new(
            TransportHandlers::default()
                .on_data(move |record| route_shared.route(record))
                .on_error({
                    let error = handlers.error;
                    move |err| error(err)
                })
                .on_connection(move |up| {
                    if !up {
                        // Port revoked mid-handshake: wake the worker so
                        // it can settle into Disconnected.
                        conn_shared.cancel.cancel();
                        conn_shared.signal.post(Vec::new());
                    }
                }),
        ));

        Self { transport, shared, worker: Mutex::new(None) }
    }

    /// Opens the port at the handshake baud rate and starts the probe
    /// cycle.
    pub fn open(&self, port_name: &str) -> LinkResult<()> {
        self.cancel_worker();
        self.transport.open(port_name, HANDSHAKE_BAUD)?;
        self.start_handshake();
        Ok(())
    }

    /// Starts the link over an already-configured port.
    pub fn open_with(&self, port: Arc<dyn PortIo>) -> LinkResult<()> {
        self.cancel_worker();
        self.transport.open_with(port, HANDSHAKE_BAUD)?;
        self.start_handshake();
        Ok(())
    }

    pub fn close(&self) {
        self.cancel_worker();
        self.transport.close();
    }

    pub fn state(&self) -> HandshakeState {
        *self.shared.state.lock().unwrap()
    }

    /// Snapshot of the negotiated configuration.
    pub fn config(&self) -> LinkConfig {
        self.shared.config.lock().unwrap().clone()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    pub fn write(&self, data: &[u8]) -> LinkResult<()> {
        self.transport.write(data)
    }

    pub fn clear(&self) {
        self.transport.clear();
    }

    pub fn transport(&self) -> &SerialTransport {
        &self.transport
    }

    fn start_handshake(&self) {
        self.shared.cancel.reset();
        self.shared.signal.drain();
        let transport = Arc::clone(&self.transport);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("acqlink-handshake".into())
            .spawn(move || run_handshake(transport, shared));
        match handle {
            Ok(handle) => *self.worker.lock().unwrap() = Some(handle),
            Err(e) => warn!(%e, "could not start handshake worker"),
        }
    }

    fn cancel_worker(&self) {
        self.shared.cancel.cancel();
        self.shared.signal.post(Vec::new());
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for DeviceLink {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_handshake(transport: Arc<SerialTransport>, shared: Arc<LinkShared>) {
    *shared.state.lock().unwrap() = HandshakeState::InProgress;

    let outcome = loop {
        if shared.cancel.is_cancelled() {
            break HandshakeState::Disconnected;
        }
        if !transport.is_open() {
            if shared.cancel.sleep(CLOSED_PORT_PAUSE) {
                break HandshakeState::Disconnected;
            }
            continue;
        }

        let _ = transport.write(HOST_ACK.as_bytes());

        let mut acked = false;
        for _ in 0..ACK_RETRIES {
            if shared.cancel.is_cancelled() {
                break;
            }
            // The signal also fires on close, with an empty line.
            let Some(reply) = shared.signal.wait(ACK_WAIT) else { break };
            if shared.cancel.is_cancelled() {
                break;
            }
            if ack_matches(&reply, DEVICE_ACK.as_bytes()) {
                acked = true;
                break;
            }
        }
        if shared.cancel.is_cancelled() {
            break HandshakeState::Disconnected;
        }

        if acked {
            let version_line = format!(">{HOST_VERSION}\n");
            let _ = transport.write(version_line.as_bytes());

            if let Some(reply) = shared.signal.wait(RESPONSE_WAIT) {
                if shared.cancel.is_cancelled() {
                    break HandshakeState::Disconnected;
                }
                let line = String::from_utf8_lossy(&reply);
                shared.config.lock().unwrap().apply_response(&line);
                break HandshakeState::Succeeded;
            }
        } else {
            debug!("no device acknowledge; repeating probe cycle");
        }

        if shared.cancel.sleep(CYCLE_PAUSE) {
            break HandshakeState::Disconnected;
        }
    };

    let outcome =
        if transport.is_open() { outcome } else { HandshakeState::Disconnected };
    shared.set_state(outcome);
}

/// Prefix comparison over `min(received, expected)` bytes, as the device
/// protocol defines it.
fn ack_matches(received: &[u8], expected: &[u8]) -> bool {
    let n = received.len().min(expected.len());
    received[..n] == expected[..n]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::TextRecord;

    #[test]
    fn ack_match_is_prefix_wise() {
        assert!(ack_matches(b"<DEVICE_ACK", b"<DEVICE_ACK"));
        assert!(ack_matches(b"<DEVICE_ACK extra", b"<DEVICE_ACK"));
        assert!(ack_matches(b"<DEV", b"<DEVICE_ACK"));
        assert!(!ack_matches(b"<device_ack", b"<DEVICE_ACK"));
        assert!(!ack_matches(b"ready", b"<DEVICE_ACK"));
    }

    #[test]
    fn handshake_text_predicate() {
        let line = |text: &str| TextRecord { timestamp_ms: 0, text: text.to_string() };
        assert!(line("<DEVICE_ACK").is_handshake());
        assert!(line("<x").is_handshake());
        assert!(!line("<").is_handshake());
        assert!(!line("DEVICE_ACK").is_handshake());
    }

    #[test]
    fn cancel_token_interrupts_sleep() {
        let token = Arc::new(CancelToken::default());
        let t = Arc::clone(&token);
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            t.cancel();
        });
        let started = Instant::now();
        assert!(token.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
        waker.join().unwrap();
    }

    #[test]
    fn cancelled_token_returns_immediately() {
        let token = CancelToken::default();
        token.cancel();
        let started = Instant::now();
        assert!(token.sleep(Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn signal_hands_over_one_message() {
        let signal = HandshakeSignal::default();
        signal.post(b"<DEVICE_ACK".to_vec());
        assert_eq!(signal.wait(Duration::from_millis(10)), Some(b"<DEVICE_ACK".to_vec()));
        assert_eq!(signal.wait(Duration::from_millis(10)), None);
    }

    #[test]
    fn signal_wait_times_out() {
        let signal = HandshakeSignal::default();
        let started = Instant::now();
        assert_eq!(signal.wait(Duration::from_millis(30)), None);
        assert!(started.elapsed() >= Duration::from_millis(25));
    }
}
