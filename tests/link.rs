//! End-to-end scenarios over the public API, driven through an in-memory
//! scripted peer standing in for the device.

use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use acqlink::record::{DATA_FRAME_END, DATA_FRAME_START};
use acqlink::{ConsumerEvent, DeviceLink, DispatchPolicy, HandshakeState, LinkHandlers, PortIo};

/// In-memory device: answers the host probe with an acknowledge and the
/// version line with a configuration response.
#[derive(Debug)]
struct ScriptedPeer {
    rx: Mutex<VecDeque<u8>>,
    rx_cv: Condvar,
    written: Mutex<Vec<u8>>,
    ack_sent: Mutex<bool>,
    config_sent: Mutex<bool>,
    silent: bool,
}

impl ScriptedPeer {
    fn new(silent: bool) -> Arc<Self> {
        Arc::new(Self {
            rx: Mutex::new(VecDeque::new()),
            rx_cv: Condvar::new(),
            written: Mutex::new(Vec::new()),
            ack_sent: Mutex::new(false),
            config_sent: Mutex::new(false),
            silent,
        })
    }

    fn inject(&self, bytes: &[u8]) {
        let mut rx = self.rx.lock().unwrap();
        rx.extend(bytes);
        self.rx_cv.notify_all();
    }

    fn react(&self) {
        if self.silent {
            return;
        }
        let transcript = String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned();
        {
            let mut ack_sent = self.ack_sent.lock().unwrap();
            if !*ack_sent && transcript.contains(">HOST_ACK") {
                *ack_sent = true;
                self.inject(b"<DEVICE_ACK\n");
            }
        }
        {
            let mut config_sent = self.config_sent.lock().unwrap();
            if !*config_sent && transcript.contains(">v") && transcript.ends_with('\n') {
                *config_sent = true;
                self.inject(b"<LOOP_MS=20:VERSION=1.2\n");
            }
        }
    }
}

impl PortIo for ScriptedPeer {
    fn read_chunk(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut rx = self.rx.lock().unwrap();
        if rx.is_empty() {
            let (guard, _) = self.rx_cv.wait_timeout(rx, Duration::from_millis(20)).unwrap();
            rx = guard;
        }
        if rx.is_empty() {
            return Err(io::Error::from(ErrorKind::TimedOut));
        }
        let n = rx.len().min(buf.len());
        for slot in buf.iter_mut().take(n) {
            *slot = rx.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write_chunk(&self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(buf);
        self.react();
        Ok(buf.len())
    }

    fn discard_buffers(&self) -> io::Result<()> {
        self.rx.lock().unwrap().clear();
        Ok(())
    }
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    done()
}

fn framed_data_record() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&DATA_FRAME_START.to_le_bytes());
    out.extend_from_slice(&[0u8; 64]);
    out.extend_from_slice(&DATA_FRAME_END.to_le_bytes());
    out
}

#[test]
fn handshake_succeeds_against_scripted_peer() {
    let states: Arc<Mutex<Vec<HandshakeState>>> = Arc::new(Mutex::new(Vec::new()));
    let observed = Arc::clone(&states);
    let samples = Arc::new(AtomicUsize::new(0));
    let texts = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&samples);
    let t = Arc::clone(&texts);

    let link = DeviceLink::new(
        DispatchPolicy::Direct,
        LinkHandlers::default()
            .on_state(move |state| observed.lock().unwrap().push(state))
            .on_consumer(move |event| match event {
                ConsumerEvent::Sample(_) => {
                    s.fetch_add(1, Ordering::SeqCst);
                }
                ConsumerEvent::Text(text) => {
                    assert!(!text.text.starts_with('<'), "handshake line leaked: {}", text.text);
                    t.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }),
    );

    let peer = ScriptedPeer::new(false);
    link.open_with(peer.clone()).unwrap();

    // One probe cycle is well under two seconds.
    assert!(
        wait_for(Duration::from_secs(2), || {
            states.lock().unwrap().contains(&HandshakeState::Succeeded)
        }),
        "handshake did not settle: {:?}",
        link.state()
    );
    assert_eq!(link.state(), HandshakeState::Succeeded);
    assert_eq!(*states.lock().unwrap(), vec![HandshakeState::Succeeded]);

    let config = link.config();
    assert_eq!(config.loop_ms, 20);
    assert_eq!(config.version, "1.2");

    // With the handshake settled, traffic flows to the consumer.
    peer.inject(b"ready\n");
    peer.inject(&framed_data_record());
    assert!(wait_for(Duration::from_secs(1), || {
        samples.load(Ordering::SeqCst) == 1 && texts.load(Ordering::SeqCst) == 1
    }));

    link.close();
}

#[test]
fn close_during_silent_peer_settles_quickly() {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let d = Arc::clone(&disconnects);
    let link = DeviceLink::new(
        DispatchPolicy::Direct,
        LinkHandlers::default().on_state(move |state| {
            if state == HandshakeState::Disconnected {
                d.fetch_add(1, Ordering::SeqCst);
            }
        }),
    );

    let peer = ScriptedPeer::new(true);
    link.open_with(peer).unwrap();
    assert!(wait_for(Duration::from_secs(1), || link.state() == HandshakeState::InProgress));

    let started = Instant::now();
    link.close();
    assert!(started.elapsed() < Duration::from_millis(200), "close took {:?}", started.elapsed());
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(link.state(), HandshakeState::Disconnected);
}

#[test]
fn reopening_restarts_the_handshake() {
    let link = DeviceLink::new(DispatchPolicy::Direct, LinkHandlers::default());

    let silent = ScriptedPeer::new(true);
    link.open_with(silent).unwrap();
    link.close();
    assert_eq!(link.state(), HandshakeState::Disconnected);

    let peer = ScriptedPeer::new(false);
    link.open_with(peer).unwrap();
    assert!(wait_for(Duration::from_secs(2), || link.state() == HandshakeState::Succeeded));
    link.close();
}
