//! Host-side ingest pipeline for a tethered data-acquisition device
//! streaming mixed binary telemetry and ASCII diagnostics over a USB-CDC
//! serial link.
//!
//! The crate opens the port, performs the probe/ack/version handshake,
//! reframes the byte stream into typed records (samples, sample blocks with
//! event timelines, point telemetry, text lines) and hands them to a
//! consumer through a pooled dispatch bridge. A post-processing filter
//! detects baseline step discontinuities in a scalar channel and rewrites
//! them out while emitting a fixed-latency corrected output.
//!
//! # Example
//! Open a link on the first known USB-serial port and print everything the
//! device sends:
//!
//! ```no_run
//! use acqlink::{DeviceLink, DispatchPolicy, LinkHandlers, ports};
//!
//! let port = ports::usb_serial_ports().into_iter().next().expect("no device");
//! let handlers = LinkHandlers::default()
//!     .on_consumer(|event| println!("{event:?}"))
//!     .on_state(|state| println!("handshake: {state}"));
//! let link = DeviceLink::new(DispatchPolicy::Queued, handlers);
//! link.open(&port).expect("open failed");
//! ```
use std::io;

use thiserror::Error;

pub mod config;
pub mod decoder;
pub mod dispatch;
pub mod handshake;
pub mod math;
pub mod ports;
pub mod record;
pub mod transport;

pub use config::LinkConfig;
pub use decoder::Decoder;
pub use dispatch::{ConsumerEvent, DispatchBridge, DispatchPolicy};
pub use handshake::{DeviceLink, HandshakeState, LinkHandlers};
pub use math::fixer::DiscontinuityFixer;
pub use record::{DecodedRecord, RawChunk, RecordKind};
pub use transport::{PortIo, SerialTransport, TransportHandlers};

/// Errors surfaced through return values and the error callback.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("port {0} not found")]
    PortNotFound(String),
    #[error("write attempted on closed or invalid port")]
    PortClosed,
    #[error("write timed out after {written} of {total} bytes")]
    WriteTimeout { written: usize, total: usize },
}

pub type LinkResult<T> = std::result::Result<T, Error>;
