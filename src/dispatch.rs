//! Converts decoded records into pooled consumer events and hands them to
//! the consumer under the chosen execution policy.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, warn};

use crate::record::{
    BlockRecord, DataRecord, DecodedRecord, EventItem, NUM_CHANNELS, STATE_UNSET, TelemetryRecord,
    TextRecord,
};

/// Bound of the `Queued` policy's dispatch queue.
const QUEUE_DEPTH: usize = 1024;
/// Returned storage kept per pool; beyond this, records are dropped.
const POOL_CAP: usize = 64;

/// How consumer callbacks are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum DispatchPolicy {
    /// On the transport reader thread.
    Direct,
    /// On a shared worker pool.
    Pool,
    /// On a single long-running worker fed by a bounded queue.
    Queued,
}

/// Storage that can be rented from a [`Pool`] and recycled on return.
pub trait Recycle: Default + Send {
    fn recycle(&mut self);
}

/// Per-variant slab of reusable record storage.
#[derive(Debug)]
pub struct Pool<T: Recycle> {
    slots: Mutex<Vec<Box<T>>>,
}

impl<T: Recycle> Pool<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { slots: Mutex::new(Vec::new()) })
    }

    pub fn rent(self: &Arc<Self>) -> Pooled<T> {
        let value = self.slots.lock().unwrap().pop().unwrap_or_default();
        Pooled { value: Some(value), pool: Arc::clone(self) }
    }

    fn give_back(&self, mut value: Box<T>) {
        value.recycle();
        let mut slots = self.slots.lock().unwrap();
        if slots.len() < POOL_CAP {
            slots.push(value);
        }
    }

    #[cfg(test)]
    fn idle(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

/// Owning guard over rented storage; returns it to the pool on drop,
/// after the consumer is done with it.
pub struct Pooled<T: Recycle> {
    value: Option<Box<T>>,
    pool: Arc<Pool<T>>,
}

impl<T: Recycle> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value.as_ref().expect("pooled value present until drop")
    }
}

impl<T: Recycle> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("pooled value present until drop")
    }
}

impl<T: Recycle> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.pool.give_back(value);
        }
    }
}

impl<T: Recycle + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.deref().fmt(f)
    }
}

/// Device status lanes unpacked from the compacted hardware and sensor
/// words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleFields {
    pub sequence_number: u16,
    pub offset1: u16,
    pub offset2: u16,
    pub gain: u16,
    pub pre_gain_sensor: u16,
    pub post_gain_sensor: u16,
}

impl SampleFields {
    pub fn unpack(hw_state: u64, sensor_state: u32) -> Self {
        Self {
            sequence_number: hw_state as u16,
            offset1: (hw_state >> 16) as u16,
            offset2: (hw_state >> 32) as u16,
            gain: (hw_state >> 48) as u16,
            pre_gain_sensor: sensor_state as u16,
            post_gain_sensor: (sensor_state >> 16) as u16,
        }
    }
}

#[derive(Debug, Default)]
pub struct SampleEvent {
    pub state: u32,
    pub timestamp: f64,
    pub state_time: f64,
    pub fields: SampleFields,
    pub channels: [u32; NUM_CHANNELS],
}

impl SampleEvent {
    fn populate(&mut self, record: &DataRecord) {
        self.state = record.state;
        self.timestamp = record.timestamp;
        self.state_time = record.state_time;
        self.fields = SampleFields::unpack(record.hw_state, record.sensor_state);
        self.channels = record.channels;
    }
}

impl Recycle for SampleEvent {
    fn recycle(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Default)]
pub struct BlockEvent {
    pub state: u32,
    pub timestamp: f64,
    pub samples: Vec<SampleEvent>,
    pub events: Vec<EventItem>,
}

impl BlockEvent {
    fn populate(&mut self, record: &BlockRecord) {
        self.state = record.state;
        self.timestamp = record.timestamp;
        for item in &record.items {
            let mut sample = SampleEvent::default();
            sample.populate(item);
            self.samples.push(sample);
        }
        self.events.extend_from_slice(&record.events);
    }
}

impl Recycle for BlockEvent {
    fn recycle(&mut self) {
        self.state = 0;
        self.timestamp = 0.0;
        // Keep the allocations, drop the contents.
        self.samples.clear();
        self.events.clear();
    }
}

#[derive(Debug, Default)]
pub struct TelemetryEvent {
    pub timestamp: f64,
    pub group: u8,
    pub subgroup: u8,
    pub id: u16,
    pub value: f32,
    pub key: u32,
}

impl TelemetryEvent {
    fn populate(&mut self, record: &TelemetryRecord) {
        self.timestamp = record.timestamp;
        self.group = record.group;
        self.subgroup = record.subgroup;
        self.id = record.id;
        self.value = record.value;
        self.key = record.key;
    }
}

impl Recycle for TelemetryEvent {
    fn recycle(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Default)]
pub struct TextEvent {
    pub timestamp_ms: u64,
    pub text: String,
}

impl TextEvent {
    fn populate(&mut self, record: &TextRecord) {
        self.timestamp_ms = record.timestamp_ms;
        self.text.push_str(&record.text);
    }
}

impl Recycle for TextEvent {
    fn recycle(&mut self) {
        self.timestamp_ms = 0;
        self.text.clear();
    }
}

/// What the consumer receives. Dropping an event returns its storage to
/// the owning pool.
#[derive(Debug)]
pub enum ConsumerEvent {
    Sample(Pooled<SampleEvent>),
    Block(Pooled<BlockEvent>),
    Telemetry(Pooled<TelemetryEvent>),
    Text(Pooled<TextEvent>),
}

pub type ConsumerHandler = Arc<dyn Fn(ConsumerEvent) + Send + Sync>;

#[derive(Debug)]
struct EventPools {
    sample: Arc<Pool<SampleEvent>>,
    block: Arc<Pool<BlockEvent>>,
    telemetry: Arc<Pool<TelemetryEvent>>,
    text: Arc<Pool<TextEvent>>,
}

impl EventPools {
    fn new() -> Self {
        Self {
            sample: Pool::new(),
            block: Pool::new(),
            telemetry: Pool::new(),
            text: Pool::new(),
        }
    }
}

/// Bridge between decoded records and the consumer. The policy is fixed
/// at construction.
pub struct DispatchBridge {
    policy: DispatchPolicy,
    handler: ConsumerHandler,
    pools: EventPools,
    queue: Option<QueuedWorker>,
}

impl DispatchBridge {
    pub fn new(policy: DispatchPolicy, handler: ConsumerHandler) -> Self {
        let queue = match policy {
            DispatchPolicy::Queued => Some(QueuedWorker::start(Arc::clone(&handler))),
            _ => None,
        };
        Self { policy, handler, pools: EventPools::new(), queue }
    }

    pub fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Events accepted but not yet executed (always 0 outside `Queued`).
    pub fn pending(&self) -> usize {
        self.queue.as_ref().map_or(0, |q| q.depth.load(Ordering::Acquire))
    }

    /// Converts and submits one record. Suppressed records are dropped
    /// here and never reach the consumer.
    pub fn submit(&self, record: &DecodedRecord) {
        let Some(event) = self.convert(record) else { return };
        match self.policy {
            DispatchPolicy::Direct => run_consumer(&self.handler, event),
            DispatchPolicy::Pool => {
                let handler = Arc::clone(&self.handler);
                shared_pool().execute(move || run_consumer(&handler, event));
            }
            DispatchPolicy::Queued => {
                if let Some(queue) = &self.queue {
                    queue.depth.fetch_add(1, Ordering::AcqRel);
                    if queue.tx.send(event).is_err() {
                        queue.depth.fetch_sub(1, Ordering::AcqRel);
                        warn!("dispatch queue closed; record dropped");
                    }
                }
            }
        }
    }

    fn convert(&self, record: &DecodedRecord) -> Option<ConsumerEvent> {
        match record {
            DecodedRecord::Data(data) => {
                let mut event = self.pools.sample.rent();
                event.populate(data);
                Some(ConsumerEvent::Sample(event))
            }
            DecodedRecord::Block(block) if block.state == STATE_UNSET => {
                debug!("suppressing block with unset state");
                None
            }
            DecodedRecord::Block(block) => {
                let mut event = self.pools.block.rent();
                event.populate(block);
                Some(ConsumerEvent::Block(event))
            }
            DecodedRecord::Telemetry(telemetry) => {
                let mut event = self.pools.telemetry.rent();
                event.populate(telemetry);
                Some(ConsumerEvent::Telemetry(event))
            }
            DecodedRecord::Text(text) if text.text == "\r" => None,
            DecodedRecord::Text(text) => {
                let mut event = self.pools.text.rent();
                event.populate(text);
                Some(ConsumerEvent::Text(event))
            }
        }
    }
}

fn run_consumer(handler: &ConsumerHandler, event: ConsumerEvent) {
    if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
        error!("consumer callback panicked; event dropped");
    }
}

/// Single long-running consumer of the bounded dispatch queue.
struct QueuedWorker {
    tx: SyncSender<ConsumerEvent>,
    depth: Arc<AtomicUsize>,
    handle: Option<JoinHandle<()>>,
}

impl QueuedWorker {
    fn start(handler: ConsumerHandler) -> Self {
        let (tx, rx) = mpsc::sync_channel::<ConsumerEvent>(QUEUE_DEPTH);
        let depth = Arc::new(AtomicUsize::new(0));
        let worker_depth = Arc::clone(&depth);
        let handle = thread::Builder::new()
            .name("acqlink-dispatch".into())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    run_consumer(&handler, event);
                    worker_depth.fetch_sub(1, Ordering::AcqRel);
                }
            })
            .expect("spawn dispatch worker");
        Self { tx, depth, handle: Some(handle) }
    }
}

impl Drop for DispatchBridge {
    fn drop(&mut self) {
        if let Some(mut worker) = self.queue.take() {
            // Close the channel so the worker drains and exits.
            let handle = worker.handle.take();
            drop(worker);
            if let Some(handle) = handle {
                let _ = handle.join();
            }
        }
    }
}

/// Lazily started process-wide worker pool backing the `Pool` policy.
struct WorkerPool {
    tx: Mutex<mpsc::Sender<Job>>,
}

type Job = Box<dyn FnOnce() + Send>;

impl WorkerPool {
    fn with_threads(threads: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        for index in 0..threads {
            let rx = Arc::clone(&rx);
            let _ = thread::Builder::new()
                .name(format!("acqlink-pool-{index}"))
                .spawn(move || {
                    loop {
                        let job = rx.lock().unwrap().recv();
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    }
                });
        }
        Self { tx: Mutex::new(tx) }
    }

    fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.lock().unwrap().send(Box::new(job));
    }
}

fn shared_pool() -> &'static WorkerPool {
    static POOL: OnceLock<WorkerPool> = OnceLock::new();
    POOL.get_or_init(|| {
        let threads = thread::available_parallelism().map_or(2, |n| n.get().min(4));
        WorkerPool::with_threads(threads)
    })
}
