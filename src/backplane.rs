//! Backplane engine
//!
//! Disseminates invalidation messages among managers attached to the same
//! broker channel. The emitting side batches: notifications land in a
//! deduplicating outbound set and are flushed as one frame after a short
//! coalescing delay, with a periodic timer as a safety net. A `Clear`
//! subsumes everything buffered before it. The receive side decodes
//! frames, drops self-echoes by sender id and hands foreign messages to
//! the owning manager in delivery order.
//!
//! Publish and subscribe failures are logged and swallowed; they never
//! fail a cache operation.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::CacheError;
use crate::config::{BackplaneConfig, ConnectionConfig};
use crate::connection::{self, ConnectionFactory};
use crate::protocol::{BackplaneMessage, ChangeAction, decode_frame, encode_frame};

/// Handler invoked with each raw frame received on the channel.
pub type FrameHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Pub/sub contract the engine runs over: publish one frame, deliver
/// inbound frames to a handler. Implementations own their delivery task
/// and return its handle.
#[async_trait]
pub trait BackplaneTransport: Send + Sync {
    async fn publish(&self, channel: &str, frame: Vec<u8>) -> Result<(), CacheError>;

    async fn subscribe(
        &self,
        channel: &str,
        handler: FrameHandler,
    ) -> Result<JoinHandle<()>, CacheError>;
}

/// Production transport: frames travel over a Redis pub/sub channel using
/// the process-wide shared connection for publishing and a dedicated
/// pub/sub connection for receiving.
pub struct RedisTransport {
    config: ConnectionConfig,
    factory: Option<ConnectionFactory>,
}

impl RedisTransport {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            factory: None,
        }
    }

    /// Use a caller-supplied dialer instead of the default connection
    /// setup.
    pub fn with_factory(config: ConnectionConfig, factory: ConnectionFactory) -> Self {
        Self {
            config,
            factory: Some(factory),
        }
    }
}

#[async_trait]
impl BackplaneTransport for RedisTransport {
    async fn publish(&self, channel: &str, frame: Vec<u8>) -> Result<(), CacheError> {
        let connection = connection::connect_with(&self.config, self.factory.as_ref()).await?;
        let channel = channel.to_owned();
        connection::retry(
            || {
                let mut conn = connection.clone();
                let channel = channel.clone();
                let frame = frame.clone();
                async move {
                    conn.publish::<_, _, ()>(channel, frame)
                        .await
                        .map_err(CacheError::from)
                }
            },
            self.config.retry,
        )
        .await
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: FrameHandler,
    ) -> Result<JoinHandle<()>, CacheError> {
        let client = redis::Client::open(self.config.connection_string.as_str())?;
        let channel = channel.to_owned();
        let backoff = self.config.retry.backoff;

        Ok(tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        error!("backplane: cannot open pub/sub connection: {}", e);
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                };
                if let Err(e) = pubsub.subscribe(&channel).await {
                    warn!("backplane: subscribe to {} failed: {}", channel, e);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                debug!("backplane: subscribed to channel {}", channel);

                while let Some(message) = pubsub.on_message().next().await {
                    match message.get_payload::<Vec<u8>>() {
                        Ok(frame) => handler(frame),
                        Err(e) => warn!("backplane: undecodable pub/sub payload: {}", e),
                    }
                }
                warn!("backplane: pub/sub connection to {} lost, reconnecting", channel);
                tokio::time::sleep(backoff).await;
            }
        }))
    }
}

/// In-process transport over a broadcast channel. Lets several managers in
/// one process (or one test) share a backplane without a broker.
#[derive(Clone)]
pub struct LoopbackTransport {
    frames: broadcast::Sender<(String, Vec<u8>)>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        let (frames, _) = broadcast::channel(256);
        Self { frames }
    }
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackplaneTransport for LoopbackTransport {
    async fn publish(&self, channel: &str, frame: Vec<u8>) -> Result<(), CacheError> {
        // No subscribers is fine; the frame just has nowhere to go.
        let _ = self.frames.send((channel.to_owned(), frame));
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: FrameHandler,
    ) -> Result<JoinHandle<()>, CacheError> {
        let mut receiver = self.frames.subscribe();
        let channel = channel.to_owned();
        Ok(tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok((frame_channel, frame)) => {
                        if frame_channel == channel {
                            handler(frame);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("backplane: loopback subscriber lagged, lost {} frames", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }))
    }
}

#[derive(Default)]
struct Outbound {
    pending: HashSet<BackplaneMessage>,
    skipped: u64,
}

struct BackplaneInner {
    transport: Arc<dyn BackplaneTransport>,
    config: BackplaneConfig,
    sender_id: Uuid,
    outbound: Mutex<Outbound>,
    /// At most one flush in progress; Idle <-> Sending.
    sending: AtomicBool,
    shutdown: AtomicBool,
    hard_limit_logged: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Batched invalidation publisher plus subscriber for one channel.
pub struct CacheBackplane {
    inner: Arc<BackplaneInner>,
}

impl CacheBackplane {
    pub fn new(transport: Arc<dyn BackplaneTransport>, config: BackplaneConfig) -> Self {
        Self {
            inner: Arc::new(BackplaneInner {
                transport,
                config,
                sender_id: Uuid::new_v4(),
                outbound: Mutex::new(Outbound::default()),
                sending: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                hard_limit_logged: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// This process's identity on the wire.
    pub fn sender_id(&self) -> Uuid {
        self.inner.sender_id
    }

    /// Subscribe to the channel and start the periodic flush timer.
    ///
    /// Foreign messages arrive on the returned receiver in delivery order;
    /// self-echoes are already filtered out.
    pub async fn start(&self) -> Result<mpsc::UnboundedReceiver<BackplaneMessage>, CacheError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let own_id = self.inner.sender_id;
        let handler: FrameHandler = Arc::new(move |frame: Vec<u8>| {
            match decode_frame(&frame) {
                Ok(messages) => {
                    for message in messages {
                        if message.sender() == own_id {
                            continue;
                        }
                        let _ = tx.send(message);
                    }
                }
                // The frame is dropped but the subscription survives.
                Err(e) => warn!("backplane: dropping undecodable frame: {}", e),
            }
        });
        let subscriber = self
            .inner
            .transport
            .subscribe(&self.inner.config.channel, handler)
            .await?;

        let timer = tokio::spawn({
            let inner = Arc::clone(&self.inner);
            async move {
                let mut ticker = tokio::time::interval(inner.config.flush_interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if inner.shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    BackplaneInner::try_flush(&inner);
                }
            }
        });

        let mut tasks = self.inner.tasks.lock();
        tasks.push(subscriber);
        tasks.push(timer);
        Ok(rx)
    }

    pub fn notify_change(&self, key: &str, region: Option<&str>, action: ChangeAction) {
        self.enqueue(BackplaneMessage::changed(
            self.inner.sender_id,
            action,
            key,
            region,
        ));
    }

    pub fn notify_remove(&self, key: &str, region: Option<&str>) {
        self.enqueue(BackplaneMessage::removed(self.inner.sender_id, key, region));
    }

    pub fn notify_clear(&self) {
        self.enqueue(BackplaneMessage::clear(self.inner.sender_id));
    }

    pub fn notify_clear_region(&self, region: &str) {
        self.enqueue(BackplaneMessage::clear_region(self.inner.sender_id, region));
    }

    fn enqueue(&self, message: BackplaneMessage) {
        if self.inner.shutdown.load(Ordering::Relaxed) {
            return;
        }
        {
            let mut outbound = self.inner.outbound.lock();
            if message.is_clear() {
                // A clear subsumes everything buffered before it.
                outbound.skipped += outbound.pending.len() as u64;
                outbound.pending.clear();
                outbound.pending.insert(message);
            } else if outbound.pending.len() >= self.inner.config.hard_limit {
                outbound.skipped += 1;
                if !self.inner.hard_limit_logged.swap(true, Ordering::Relaxed) {
                    warn!(
                        "backplane: outbound buffer full ({} messages), dropping notifications",
                        self.inner.config.hard_limit
                    );
                }
            } else if !outbound.pending.insert(message) {
                outbound.skipped += 1;
            }
        }
        BackplaneInner::try_flush(&self.inner);
    }

    /// Number of dropped-or-collapsed messages since the last flush.
    pub fn skipped_count(&self) -> u64 {
        self.inner.outbound.lock().skipped
    }

    /// Number of messages waiting for the next flush.
    pub fn pending_count(&self) -> usize {
        self.inner.outbound.lock().pending.len()
    }

    /// Stop the timer and subscriber after one final bounded flush.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let deadline = self.inner.config.shutdown_deadline;
        let flush = BackplaneInner::flush_once(&self.inner);
        if tokio::time::timeout(deadline, flush).await.is_err() {
            warn!("backplane: final flush did not finish within {:?}", deadline);
        }
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            task.abort();
        }
    }
}

impl BackplaneInner {
    /// Try to move Idle -> Sending; losers return immediately.
    fn try_flush(inner: &Arc<Self>) {
        if inner
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            // Let further enqueues join this batch.
            tokio::time::sleep(inner.config.coalesce_delay).await;
            let published = Self::flush_once(&inner).await;
            inner.sending.store(false, Ordering::Release);

            // Messages enqueued while we were sending missed this frame.
            // After a failed publish the timer retries instead, so a dead
            // broker is not hammered at coalesce cadence.
            let left_over = !inner.outbound.lock().pending.is_empty();
            if published && left_over && !inner.shutdown.load(Ordering::Relaxed) {
                Self::try_flush(&inner);
            }
        });
    }

    /// One flush round: drain the outbound set, publish one frame, restore
    /// the batch on failure. The outbound lock is never held across the
    /// publish.
    async fn flush_once(inner: &Arc<Self>) -> bool {
        let batch: Vec<BackplaneMessage> = {
            let mut outbound = inner.outbound.lock();
            outbound.skipped = 0;
            outbound.pending.drain().collect()
        };
        if batch.is_empty() {
            return true;
        }

        let frame = encode_frame(&batch);
        debug!("backplane: publishing frame with {} message(s)", batch.len());
        match inner.transport.publish(&inner.config.channel, frame).await {
            Ok(()) => {
                inner.hard_limit_logged.store(false, Ordering::Relaxed);
                true
            }
            Err(e) => {
                warn!(
                    "backplane: publish failed, keeping {} message(s) buffered: {}",
                    batch.len(),
                    e
                );
                let mut outbound = inner.outbound.lock();
                if outbound.pending.iter().any(BackplaneMessage::is_clear) {
                    // A clear arrived meanwhile and subsumes the batch.
                    outbound.skipped += batch.len() as u64;
                } else {
                    outbound.pending.extend(batch);
                }
                false
            }
        }
    }
}
