//! Feeder protocol engine
//!
//! Single accept loop; every device socket gets a reader task (this
//! module's `handle_connection`), a writer task draining its outbound
//! queue, and a persistence task that applies database writes in arrival
//! order without holding up frame handling.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::hex;
use common::logging::FRAME_TARGET;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::database::{AlertKind, FeederDatabase, MealOrigin};
use crate::error::{FeedSrvError, Result};
use crate::protocol::constants::DEFAULT_PORT;
use crate::protocol::{
    codec, Command, DeviceIdentifier, Event, FeederFrameCodec, MealPlan, QuantityValue,
    TimeOffset, TimeValue,
};
use crate::registry::{ConnectionRegistry, IdentifyOutcome};
use crate::session::{Connection, FeederStatus};

/// Frames queued per socket before senders wait
const OUTBOUND_QUEUE_SIZE: usize = 32;

/// Idle time before the kernel starts keep-alive probes
const KEEPALIVE_IDLE: Duration = Duration::from_secs(60);

/// Pause after a failed accept (e.g. descriptor exhaustion)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Runtime parameters of the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub listen_addr: SocketAddr,
    /// Accepted identifiers; empty accepts any feeder
    pub allow_list: HashSet<DeviceIdentifier>,
    /// How long `send_and_wait` waits for an acknowledgement
    pub command_timeout: Duration,
    /// A feeder is available if it responded within this window
    pub availability_window: Duration,
    /// Sessions silent for this long are evicted
    pub idle_timeout: Duration,
    pub eviction_interval: Duration,
    pub time_offset: TimeOffset,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT),
            allow_list: HashSet::new(),
            command_timeout: Duration::from_secs(30),
            availability_window: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            eviction_interval: Duration::from_secs(60),
            time_offset: TimeOffset::DEFAULT,
        }
    }
}

/// Database write produced by frame dispatch
#[derive(Debug)]
enum PersistJob {
    Register {
        identifier: DeviceIdentifier,
        ip: IpAddr,
    },
    ManualMeal {
        identifier: DeviceIdentifier,
        quantity: QuantityValue,
    },
    EmptyAlert {
        identifier: DeviceIdentifier,
        time: TimeValue,
        quantity: QuantityValue,
    },
    UnknownData {
        kind: &'static str,
        raw: Bytes,
        ip: IpAddr,
    },
}

impl PersistJob {
    async fn apply(self, database: &dyn FeederDatabase) -> Result<()> {
        match self {
            PersistJob::Register { identifier, ip } => {
                database.register_feeder(&identifier, ip).await
            },
            PersistJob::ManualMeal {
                identifier,
                quantity,
            } => {
                database
                    .record_meal(&identifier, quantity, MealOrigin::Manual)
                    .await?;
                database
                    .remember_default_amount(&identifier, quantity)
                    .await
                    .map(|_| ())
            },
            PersistJob::EmptyAlert {
                identifier,
                time,
                quantity,
            } => {
                let data = serde_json::json!({
                    "time": time.to_string(),
                    "quantity": quantity.grams(),
                });
                database
                    .log_alert(&identifier, AlertKind::Empty, data)
                    .await
                    .map(|_| ())
            },
            PersistJob::UnknownData { kind, raw, ip } => database
                .log_unknown_data(kind, &raw, Some(ip))
                .await
                .map(|_| ()),
        }
    }
}

/// Hand a job to the connection's persistence task
fn queue_job(jobs: &mpsc::UnboundedSender<PersistJob>, job: PersistJob) {
    if let Err(e) = jobs.send(job) {
        debug!("Persistence task gone, dropping {:?}", e.0);
    }
}

/// Drain persistence jobs of one connection in order
async fn persist_loop(
    database: Arc<dyn FeederDatabase>,
    mut jobs: mpsc::UnboundedReceiver<PersistJob>,
) {
    while let Some(job) = jobs.recv().await {
        debug!("Persisting {:?}", job);
        if let Err(e) = job.apply(database.as_ref()).await {
            warn!("Database write failed: {}", e);
        }
    }
}

/// Forward queued frames to the socket until the connection closes
async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, FeederFrameCodec>,
    mut outbound: mpsc::Receiver<Bytes>,
    token: CancellationToken,
    peer: SocketAddr,
) {
    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        debug!(target: FRAME_TARGET, "Data sent to {}: {}", peer, hex::encode_upper(&frame));
        if let Err(e) = sink.send(frame).await {
            warn!("Write to {} failed: {}", peer, e);
            token.cancel();
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!("Shutdown of {} failed: {}", peer, e);
    }
}

fn enable_keepalive(stream: &TcpStream, peer: SocketAddr) {
    let socket = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
    if let Err(e) = socket.set_tcp_keepalive(&keepalive) {
        warn!("Failed to enable keep-alive for {}: {}", peer, e);
    }
}

/// TCP server for feeders plus the command operations used by the API layer
///
/// Cheap to clone; clones share the registry and the database.
#[derive(Clone)]
pub struct ProtocolEngine {
    config: Arc<EngineConfig>,
    registry: Arc<ConnectionRegistry>,
    database: Arc<dyn FeederDatabase>,
    next_connection_id: Arc<AtomicU64>,
}

impl ProtocolEngine {
    pub fn new(config: EngineConfig, database: Arc<dyn FeederDatabase>) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(ConnectionRegistry::new()),
            database,
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Bind the listening socket
    pub async fn bind(&self) -> Result<BoundEngine> {
        let listener = TcpListener::bind(self.config.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(BoundEngine {
            engine: self.clone(),
            listener,
            local_addr,
        })
    }

    fn is_allowed(&self, identifier: &DeviceIdentifier) -> bool {
        self.config.allow_list.is_empty() || self.config.allow_list.contains(identifier)
    }

    // ========================================================================
    // Operations for the external API layer
    // ========================================================================

    /// Dispense `quantity` now and record the meal once acknowledged
    pub async fn feed_now(
        &self,
        identifier: &DeviceIdentifier,
        quantity: QuantityValue,
    ) -> Result<()> {
        self.command(identifier, &Command::FeedNow(quantity)).await?;
        info!("Feeder {} fed {}", identifier, quantity);

        let database = self.database.clone();
        let identifier = identifier.clone();
        tokio::spawn(async move {
            if let Err(e) = database
                .record_meal(&identifier, quantity, MealOrigin::Remote)
                .await
            {
                warn!("Failed to record meal for {}: {}", identifier, e);
            }
        });
        Ok(())
    }

    pub async fn set_default_quantity(
        &self,
        identifier: &DeviceIdentifier,
        quantity: QuantityValue,
    ) -> Result<()> {
        self.command(identifier, &Command::SetDefaultQuantity(quantity))
            .await?;
        info!("Feeder {} default quantity set to {}", identifier, quantity);

        let database = self.database.clone();
        let identifier = identifier.clone();
        tokio::spawn(async move {
            if let Err(e) = database.remember_default_amount(&identifier, quantity).await {
                warn!("Failed to store default amount for {}: {}", identifier, e);
            }
        });
        Ok(())
    }

    /// Program the meal plan; succeeds once the plan is acknowledged and stored
    pub async fn set_planning(&self, identifier: &DeviceIdentifier, plan: MealPlan) -> Result<()> {
        self.command(identifier, &Command::SetPlanning(plan.clone()))
            .await?;
        info!(
            "Feeder {} planning set: {} meal(s), {}g per day",
            identifier,
            plan.enabled_count(),
            plan.total_quantity()
        );
        self.database.record_planning(identifier, &plan).await
    }

    /// Live status, else the last response known to the database
    pub async fn get_feeder(&self, identifier: &DeviceIdentifier) -> Result<Option<FeederStatus>> {
        if let Some(status) = self
            .registry
            .status(identifier, self.config.availability_window)
        {
            return Ok(Some(status));
        }
        let last_responded = self.database.fetch_last_responded(identifier).await?;
        Ok(last_responded.map(|at| FeederStatus {
            identifier: identifier.clone(),
            last_responded: Some(at),
            is_available: false,
        }))
    }

    /// Write raw bytes to a feeder
    pub async fn send(&self, identifier: &DeviceIdentifier, frame: Bytes) -> Result<()> {
        self.registry.send(identifier, frame).await
    }

    /// Write raw bytes and wait for `expected` within the command timeout
    pub async fn send_and_wait(
        &self,
        identifier: &DeviceIdentifier,
        frame: Bytes,
        expected: Bytes,
    ) -> Result<()> {
        self.registry
            .send_and_wait(identifier, frame, expected, self.config.command_timeout)
            .await
    }

    async fn command(&self, identifier: &DeviceIdentifier, command: &Command) -> Result<()> {
        let frame = codec::encode(command, self.config.time_offset)?;
        match command.expected_ack(identifier) {
            Some(expected) => self.send_and_wait(identifier, frame, expected).await,
            None => self.send(identifier, frame).await,
        }
    }

    // ========================================================================
    // Connection handling
    // ========================================================================

    async fn handle_connection(self, stream: TcpStream, peer: SocketAddr, token: CancellationToken) {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        debug!("Connection #{} accepted from {}", connection_id, peer);

        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }
        let (read_half, write_half) = stream.into_split();

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let connection = Arc::new(Connection::new(
            connection_id,
            peer,
            outbound_tx,
            token.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            FramedWrite::new(write_half, FeederFrameCodec::new()),
            outbound_rx,
            token.clone(),
            peer,
        ));

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        tokio::spawn(persist_loop(self.database.clone(), jobs_rx));

        let mut frames = FramedRead::new(read_half, FeederFrameCodec::new());
        let mut identified: Option<DeviceIdentifier> = None;

        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                next = frames.next() => match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        debug!("Read from {} failed: {}", peer, e);
                        break;
                    },
                    None => {
                        debug!("Connection #{} closed by {}", connection_id, peer);
                        break;
                    },
                },
            };

            debug!(target: FRAME_TARGET, "Data received from {}: {}", peer, hex::encode_upper(&frame));
            connection.offer(&frame);

            match self
                .dispatch(&connection, &frame, &mut identified, &jobs_tx)
                .await
            {
                Ok(Some(IdentifyOutcome::Refreshed)) | Ok(None) => {},
                Ok(Some(_)) => enable_keepalive(frames.get_ref().as_ref(), peer),
                Err(e) if e.is_connection_fatal() => {
                    warn!("Closing connection #{} from {}: {}", connection_id, peer, e);
                    break;
                },
                Err(e) => {
                    debug!("Connection #{} from {} ended: {}", connection_id, peer, e);
                    break;
                },
            }
        }

        if let Some(identifier) = &identified {
            if self.registry.disconnect(identifier, connection_id) {
                info!("Feeder {} disconnected", identifier);
            }
        }
        connection.close();
        drop(jobs_tx);
        if let Err(e) = writer.await {
            error!("Writer task for {} panicked: {}", peer, e);
        }
    }

    /// Act on one inbound frame
    ///
    /// Returns the identification outcome for identification frames. An
    /// error means the connection must be closed.
    async fn dispatch(
        &self,
        connection: &Arc<Connection>,
        frame: &Bytes,
        identified: &mut Option<DeviceIdentifier>,
        jobs: &mpsc::UnboundedSender<PersistJob>,
    ) -> Result<Option<IdentifyOutcome>> {
        let ip = connection.peer().ip();

        let event = match codec::recognize(frame, self.config.time_offset) {
            Ok(event) => event,
            Err(e) => {
                let kind = match &e {
                    FeedSrvError::Validation(_) => "invalid",
                    _ => "unknown",
                };
                queue_job(jobs, PersistJob::UnknownData {
                    kind,
                    raw: frame.clone(),
                    ip,
                });
                return Err(e);
            },
        };

        let identifier = event.identifier().clone();
        if !self.is_allowed(&identifier) {
            queue_job(jobs, PersistJob::UnknownData {
                kind: "unauthorized",
                raw: frame.clone(),
                ip,
            });
            return Err(FeedSrvError::Unauthorized(identifier.to_string()));
        }

        if identified.as_ref() == Some(&identifier) {
            self.registry.touch(&identifier, connection.id());
        }

        match event {
            Event::Identification { identifier } => {
                let outcome = self.registry.identify(identifier.clone(), connection.clone());
                match outcome {
                    IdentifyOutcome::Registered => {
                        info!("Feeder {} identified from {}", identifier, ip)
                    },
                    IdentifyOutcome::Reconnected => {
                        info!("Feeder {} reconnected from {}", identifier, ip)
                    },
                    IdentifyOutcome::Refreshed => debug!("Feeder {} identified again", identifier),
                }

                let reply = codec::encode(
                    &Command::TimeBroadcast(TimeValue::now()),
                    self.config.time_offset,
                )?;
                connection.send(reply).await?;

                queue_job(jobs, PersistJob::Register {
                    identifier: identifier.clone(),
                    ip,
                });
                *identified = Some(identifier);
                Ok(Some(outcome))
            },
            Event::ManualMeal {
                identifier,
                quantity,
            } => {
                info!("Feeder {} manual meal of {}", identifier, quantity);
                queue_job(jobs, PersistJob::ManualMeal {
                    identifier,
                    quantity,
                });
                Ok(None)
            },
            Event::EmptyFeeder {
                identifier,
                time,
                quantity,
            } => {
                warn!(
                    "Feeder {} is empty (meal at {}, {} missing)",
                    identifier, time, quantity
                );
                queue_job(jobs, PersistJob::EmptyAlert {
                    identifier,
                    time,
                    quantity,
                });
                Ok(None)
            },
            Event::Expectation { identifier, action } => {
                debug!("Feeder {} acknowledged {:?}", identifier, action);
                Ok(None)
            },
        }
    }

    async fn evict_idle_loop(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.eviction_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for identifier in self.registry.evict_idle(self.config.idle_timeout) {
                        debug!("Evicted idle feeder {}", identifier);
                    }
                },
            }
        }
    }
}

/// Engine with its listening socket bound
pub struct BoundEngine {
    engine: ProtocolEngine,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundEngine {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn engine(&self) -> &ProtocolEngine {
        &self.engine
    }

    /// Accept feeders until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let BoundEngine {
            engine,
            listener,
            local_addr,
        } = self;
        info!("Feeder engine listening on {}", local_addr);

        let eviction = tokio::spawn(engine.clone().evict_idle_loop(shutdown.clone()));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let engine = engine.clone();
                        let token = shutdown.child_token();
                        tokio::spawn(engine.handle_connection(stream, peer, token));
                    },
                    Err(e) => {
                        error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    },
                },
            }
        }

        if let Err(e) = eviction.await {
            error!("Eviction task panicked: {}", e);
        }
        info!("Feeder engine stopped");
        Ok(())
    }
}
