//! In-memory broker.
//!
//! [`MemoryBroker`] keeps topic-partitioned, append-only logs in process memory and hands out producers that behave
//! like a networked broker client: requests are queued to a per-producer I/O thread, batched according to `linger.ms`,
//! and their outcomes are reported from that thread. It can be shut down and restarted to exercise failure handling.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering},
        mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError,
    },
    thread,
    time::Duration,
};

use bytes::Bytes;
use sluice_error::{ErrorContext as _, GenericError};
use tokio::{sync::mpsc, time::sleep};
use tracing::{debug, error, info, warn};
use twox_hash::XxHash64;

use super::{BrokerAddress, Producer, ProducerError, ProducerFactory, ProducerSettings, PublishRequest, RequiredAcks};
use crate::delivery::{self, DeliveryError, DeliveryHandle, DeliveryOutcome, DeliveryPromise};

static NEXT_PORT: AtomicU16 = AtomicU16::new(19092);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A message stored by the broker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredMessage {
    /// Partition the message was appended to.
    pub partition: i32,

    /// Offset of the message within its partition.
    pub offset: i64,

    /// Message key, if any.
    pub key: Option<Bytes>,

    /// Message value.
    pub value: Bytes,
}

struct BrokerState {
    address: BrokerAddress,
    partitions: u16,
    running: AtomicBool,
    next_partition: AtomicU32,
    topics: Mutex<HashMap<String, Vec<Vec<StoredMessage>>>>,
}

/// An in-memory broker.
///
/// Each broker gets a unique loopback address. Producers only reach the broker if that address is among their
/// bootstrap servers. Cloning a broker yields another handle to the same logs.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    /// Creates a new broker whose topics have a single partition.
    pub fn new() -> Self {
        Self::with_partitions(1)
    }

    /// Creates a new broker whose topics have the given number of partitions.
    ///
    /// A partition count of zero is treated as one.
    pub fn with_partitions(partitions: u16) -> Self {
        let port = NEXT_PORT.fetch_add(1, Ordering::Relaxed);

        Self {
            state: Arc::new(BrokerState {
                address: BrokerAddress::new("127.0.0.1", port),
                partitions: partitions.max(1),
                running: AtomicBool::new(true),
                next_partition: AtomicU32::new(0),
                topics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the broker's address.
    pub fn address(&self) -> &BrokerAddress {
        &self.state.address
    }

    /// Returns the broker's address in the form expected by the `bootstrap.servers` property.
    pub fn connection_string(&self) -> String {
        self.state.address.to_string()
    }

    /// Marks the broker as down.
    ///
    /// Requests submitted while the broker is down fail immediately, and requests still queued in a producer fail
    /// once their batch is sent.
    pub fn shutdown(&self) {
        if self.state.running.swap(false, Ordering::AcqRel) {
            info!(broker = %self.state.address, "Broker shut down.");
        }
    }

    /// Marks the broker as up again. Stored messages are kept.
    pub fn restart(&self) {
        if !self.state.running.swap(true, Ordering::AcqRel) {
            info!(broker = %self.state.address, "Broker restarted.");
        }
    }

    /// Returns `true` if the broker is up.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Returns the offset the next message appended to the given partition will get.
    ///
    /// Unknown topics and partitions report `0`.
    pub fn latest_offset(&self, topic: &str, partition: i32) -> i64 {
        let topics = lock(&self.state.topics);
        partition_log(&topics, topic, partition).map_or(0, |log| log.len() as i64)
    }

    /// Returns the message at the given offset, if there is one.
    pub fn fetch(&self, topic: &str, partition: i32, offset: i64) -> Option<StoredMessage> {
        let offset = usize::try_from(offset).ok()?;
        let topics = lock(&self.state.topics);
        partition_log(&topics, topic, partition)?.get(offset).cloned()
    }

    /// Returns every message stored for the given topic, ordered by partition and then offset.
    pub fn messages(&self, topic: &str) -> Vec<StoredMessage> {
        let topics = lock(&self.state.topics);
        topics
            .get(topic)
            .map(|partitions| partitions.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    fn partition_for(&self, key: Option<&Bytes>) -> u16 {
        let partitions = u32::from(self.state.partitions);
        let slot = match key {
            Some(key) => (XxHash64::oneshot(0, key) % u64::from(partitions)) as u32,
            None => self.state.next_partition.fetch_add(1, Ordering::Relaxed) % partitions,
        };
        slot as u16
    }

    fn append(&self, request: PublishRequest) -> Result<(i32, i64), DeliveryError> {
        if !self.is_running() {
            return Err(DeliveryError::BrokerUnavailable);
        }

        let partition = self.partition_for(request.key.as_ref());
        let mut topics = lock(&self.state.topics);
        let log = topics
            .entry(request.topic)
            .or_insert_with(|| vec![Vec::new(); usize::from(self.state.partitions)]);

        let messages = &mut log[usize::from(partition)];
        let offset = messages.len() as i64;
        messages.push(StoredMessage {
            partition: i32::from(partition),
            offset,
            key: request.key,
            value: request.value,
        });

        Ok((i32::from(partition), offset))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn partition_log<'a>(
    topics: &'a HashMap<String, Vec<Vec<StoredMessage>>>, topic: &str, partition: i32,
) -> Option<&'a Vec<StoredMessage>> {
    let partition = usize::try_from(partition).ok()?;
    topics.get(topic)?.get(partition)
}

impl ProducerFactory for MemoryBroker {
    fn connect(&self, settings: &ProducerSettings) -> Result<Arc<dyn Producer>, GenericError> {
        let reachable = settings.bootstrap_servers().contains(self.address());
        if !reachable {
            warn!(
                broker = %self.address(),
                "None of the configured bootstrap servers match the broker. Requests will fail."
            );
        }

        let producer = MemoryProducer::spawn(self.clone(), settings, reachable)?;
        Ok(Arc::new(producer))
    }
}

enum Command {
    Publish {
        request: PublishRequest,
        promise: DeliveryPromise,
    },
    Flush(std_mpsc::Sender<()>),
}

/// A producer connected to a [`MemoryBroker`].
pub struct MemoryProducer {
    broker: MemoryBroker,
    reachable: bool,
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    stopped: Mutex<Option<std_mpsc::Receiver<()>>>,
    io_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MemoryProducer {
    fn spawn(broker: MemoryBroker, settings: &ProducerSettings, reachable: bool) -> Result<Self, GenericError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .error_context("Failed to build runtime for producer I/O thread.")?;

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (stopped_tx, stopped_rx) = std_mpsc::channel();

        let io_broker = broker.clone();
        let acks = settings.acks();
        let linger = settings.linger();
        let io_thread = thread::Builder::new()
            .name("memory-producer-io".to_string())
            .spawn(move || {
                runtime.block_on(run_io_loop(io_broker, commands_rx, acks, linger));
                let _ = stopped_tx.send(());
            })
            .error_context("Failed to spawn producer I/O thread.")?;

        debug!(broker = %broker.address(), ?acks, ?linger, "Memory producer connected.");

        Ok(Self {
            broker,
            reachable,
            commands: Mutex::new(Some(commands_tx)),
            stopped: Mutex::new(Some(stopped_rx)),
            io_thread: Mutex::new(Some(io_thread)),
        })
    }

    fn submit(&self, command: Command) -> Result<(), ProducerError> {
        let commands = lock(&self.commands);
        let sender = commands.as_ref().ok_or(ProducerError::Closed)?;
        sender.send(command).map_err(|_| ProducerError::Closed)
    }
}

impl Producer for MemoryProducer {
    fn send(&self, request: PublishRequest) -> Result<DeliveryHandle, ProducerError> {
        if !self.reachable {
            return Err(ProducerError::Unavailable {
                reason: format!("no bootstrap server matches broker at {}", self.broker.address()),
            });
        }

        if !self.broker.is_running() {
            return Err(ProducerError::Unavailable {
                reason: format!("broker at {} is down", self.broker.address()),
            });
        }

        let (promise, handle) = delivery::channel();
        self.submit(Command::Publish { request, promise })?;
        Ok(handle)
    }

    fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        let (flushed_tx, flushed_rx) = std_mpsc::channel();
        self.submit(Command::Flush(flushed_tx))?;

        flushed_rx.recv_timeout(timeout).map_err(|e| match e {
            std_mpsc::RecvTimeoutError::Timeout => ProducerError::Timeout { timeout },
            std_mpsc::RecvTimeoutError::Disconnected => ProducerError::Closed,
        })
    }

    fn close(&self, timeout: Duration) -> Result<(), ProducerError> {
        // Dropping the sender lets the I/O loop drain whatever is queued and then exit.
        let Some(sender) = lock(&self.commands).take() else {
            return Ok(());
        };
        drop(sender);

        if let Some(stopped) = lock(&self.stopped).take() {
            if let Err(std_mpsc::RecvTimeoutError::Timeout) = stopped.recv_timeout(timeout) {
                return Err(ProducerError::Timeout { timeout });
            }
        }

        if let Some(io_thread) = lock(&self.io_thread).take() {
            if io_thread.join().is_err() {
                error!(broker = %self.broker.address(), "Producer I/O thread panicked.");
            }
        }

        debug!(broker = %self.broker.address(), "Memory producer closed.");
        Ok(())
    }
}

async fn run_io_loop(
    broker: MemoryBroker, mut commands: mpsc::UnboundedReceiver<Command>, acks: RequiredAcks, linger: Duration,
) {
    let mut batch = Vec::new();
    let mut flush_waiters = Vec::new();

    while let Some(command) = commands.recv().await {
        accept(command, &mut batch, &mut flush_waiters);

        // Keep collecting until the linger period is up, unless somebody is waiting on a flush.
        if !linger.is_zero() && flush_waiters.is_empty() {
            let deadline = sleep(linger);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    maybe_command = commands.recv() => match maybe_command {
                        Some(command) => {
                            accept(command, &mut batch, &mut flush_waiters);
                            if !flush_waiters.is_empty() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        }

        while let Ok(command) = commands.try_recv() {
            accept(command, &mut batch, &mut flush_waiters);
        }

        debug!(batch_size = batch.len(), "Sending batch.");
        for (request, promise) in batch.drain(..) {
            let outcome = match broker.append(request) {
                Ok((partition, offset)) => DeliveryOutcome::Success {
                    partition,
                    offset: if acks == RequiredAcks::None { -1 } else { offset },
                },
                Err(e) => DeliveryOutcome::Failure(e),
            };
            promise.complete(outcome);
        }

        for waiter in flush_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    debug!("Producer I/O loop stopped.");
}

fn accept(
    command: Command, batch: &mut Vec<(PublishRequest, DeliveryPromise)>, flush_waiters: &mut Vec<std_mpsc::Sender<()>>,
) {
    match command {
        Command::Publish { request, promise } => batch.push((request, promise)),
        Command::Flush(waiter) => flush_waiters.push(waiter),
    }
}
