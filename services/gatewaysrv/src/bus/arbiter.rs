//! Serial bus arbiter
//!
//! A single worker task owns the RTU transport. Callers submit jobs over a
//! bounded channel and receive exactly one outcome on a oneshot. Jobs are
//! served strictly in arrival order, one write+read cycle at a time.
//!
//! Per transaction the worker enforces:
//! - admission: a job not started by its admission deadline gets `Busy`
//! - turnaround: a minimum quiet gap since the previous frame on the line
//! - response timeout for the first byte, then a silence interval that ends the frame
//! - CRC and slave/function matching before anything is returned
//! - a flush of stray bytes before the next job after a bad or missing response

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bridge_codec::constants::MAX_RTU_FRAME_SIZE;
use bridge_codec::rtu::{self, RtuRequest, RtuResponse};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{hex, BusConnector};
use crate::config::BusConfig;
use crate::error::BusError;

/// Timing and queue settings for the worker
#[derive(Debug, Clone)]
pub struct BusSettings {
    pub response_timeout: Duration,
    pub silence: Duration,
    pub turnaround: Duration,
    pub admission_timeout: Duration,
    pub queue_depth: usize,
    pub reconnect_delay: Duration,
}

impl From<&BusConfig> for BusSettings {
    fn from(config: &BusConfig) -> Self {
        Self {
            response_timeout: config.response_timeout(),
            silence: config.silence(),
            turnaround: config.turnaround(),
            admission_timeout: config.admission_timeout(),
            queue_depth: config.queue_depth,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

impl Default for BusSettings {
    fn default() -> Self {
        Self::from(&BusConfig::default())
    }
}

/// Who asked for a transaction; carried for correlation in logs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Origin {
    pub session_id: u64,
    pub transaction_id: u16,
}

/// Successful dispatch outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusReply {
    Response(RtuResponse),
    /// Broadcast frame written; slaves do not answer
    Broadcast,
}

/// The single in-flight RTU transaction
#[derive(Debug)]
struct PendingTransaction {
    origin: Origin,
    slave_id: u8,
    function_code: u8,
    started: Instant,
}

struct BusJob {
    origin: Origin,
    request: RtuRequest,
    timeout: Duration,
    admission_deadline: Instant,
    /// Fired when the worker takes the line for this job
    started: oneshot::Sender<()>,
    reply: oneshot::Sender<Result<BusReply, BusError>>,
}

#[derive(Debug, Default)]
struct BusStats {
    dispatched: AtomicU64,
    responses: AtomicU64,
    timeouts: AtomicU64,
    checksum_errors: AtomicU64,
    frame_errors: AtomicU64,
    busy: AtomicU64,
    unavailable: AtomicU64,
    abandoned: AtomicU64,
}

/// Counters since the arbiter was spawned
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStatsSnapshot {
    /// Frames written to the line
    pub dispatched: u64,
    pub responses: u64,
    pub timeouts: u64,
    pub checksum_errors: u64,
    pub frame_errors: u64,
    pub busy: u64,
    pub unavailable: u64,
    /// Queued jobs skipped because the requester went away
    pub abandoned: u64,
}

impl BusStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            frame_errors: self.frame_errors.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable handle to the bus worker
#[derive(Clone)]
pub struct BusArbiter {
    tx: mpsc::Sender<BusJob>,
    admission_timeout: Duration,
    response_timeout: Duration,
    stats: Arc<BusStats>,
}

impl BusArbiter {
    /// Spawn the worker. It stops on `shutdown` or when every handle is dropped.
    pub fn spawn<C: BusConnector>(
        connector: C,
        settings: BusSettings,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.queue_depth.max(1));
        let stats = Arc::new(BusStats::default());

        let handle = Self {
            tx,
            admission_timeout: settings.admission_timeout,
            response_timeout: settings.response_timeout,
            stats: Arc::clone(&stats),
        };

        let worker = BusWorker {
            connector,
            transport: None,
            settings,
            pending: None,
            last_frame_end: None,
            needs_flush: false,
            retry_at: None,
            stats,
        };
        let task = tokio::spawn(worker.run(rx, shutdown));

        (handle, task)
    }

    /// Default per-dispatch response timeout
    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        self.stats.snapshot()
    }

    /// Submit one request and wait for its single outcome
    pub async fn dispatch(
        &self,
        request: RtuRequest,
        timeout: Duration,
    ) -> Result<BusReply, BusError> {
        self.dispatch_from(Origin::default(), request, timeout).await
    }

    /// Same as [`dispatch`](Self::dispatch), tagged with the originating session
    pub async fn dispatch_from(
        &self,
        origin: Origin,
        request: RtuRequest,
        timeout: Duration,
    ) -> Result<BusReply, BusError> {
        self.submit(origin, request, timeout).await?.outcome().await
    }

    /// Queue a request without waiting for the line.
    ///
    /// Fails with `Busy` if the queue stays full for the admission window.
    pub async fn submit(
        &self,
        origin: Origin,
        request: RtuRequest,
        timeout: Duration,
    ) -> Result<BusTicket, BusError> {
        let admission_deadline = Instant::now() + self.admission_timeout;
        let (reply, outcome) = oneshot::channel();
        let (started_tx, started) = oneshot::channel();
        let job = BusJob {
            origin,
            request,
            timeout,
            admission_deadline,
            started: started_tx,
            reply,
        };

        // Queue full for the whole admission window counts as busy
        match tokio::time::timeout_at(admission_deadline, self.tx.send(job)).await {
            Ok(Ok(())) => {},
            Ok(Err(_)) => return Err(BusError::Closed),
            Err(_) => {
                BusStats::bump(&self.stats.busy);
                return Err(BusError::Busy);
            },
        }

        Ok(BusTicket {
            outcome,
            started,
            admission_deadline,
            stats: Arc::clone(&self.stats),
        })
    }
}

/// A queued job; resolves to the job's single outcome
pub struct BusTicket {
    outcome: oneshot::Receiver<Result<BusReply, BusError>>,
    started: oneshot::Receiver<()>,
    admission_deadline: Instant,
    stats: Arc<BusStats>,
}

impl BusTicket {
    /// Wait for the outcome.
    ///
    /// Until the worker starts the job the wait is bounded by the admission
    /// deadline; past it the ticket gives up with `Busy` and the worker skips
    /// the job. Once started, the job runs to its own response timeout.
    pub async fn outcome(self) -> Result<BusReply, BusError> {
        let BusTicket {
            mut outcome,
            started,
            admission_deadline,
            stats,
        } = self;

        tokio::select! {
            biased;
            result = &mut outcome => return result.unwrap_or(Err(BusError::Closed)),
            // Err: worker answered without starting (expired, closed); the outcome follows
            _ = started => {},
            _ = sleep_until(admission_deadline) => {
                BusStats::bump(&stats.busy);
                return Err(BusError::Busy);
            },
        }

        outcome.await.unwrap_or(Err(BusError::Closed))
    }
}

struct BusWorker<C: BusConnector> {
    connector: C,
    transport: Option<C::Transport>,
    settings: BusSettings,
    pending: Option<PendingTransaction>,
    last_frame_end: Option<Instant>,
    needs_flush: bool,
    retry_at: Option<Instant>,
    stats: Arc<BusStats>,
}

impl<C: BusConnector> BusWorker<C> {
    async fn run(mut self, mut rx: mpsc::Receiver<BusJob>, shutdown: CancellationToken) {
        info!("Bus arbiter started: {}", self.connector.describe());
        if let Err(e) = self.open().await {
            warn!("Bus not ready at startup: {}", e);
        }

        loop {
            let job = tokio::select! {
                _ = shutdown.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.handle(job).await;
        }

        let stats = self.stats.snapshot();
        info!(
            "Bus arbiter stopped: {} frames, {} timeouts, {} CRC errors",
            stats.dispatched, stats.timeouts, stats.checksum_errors
        );
    }

    async fn handle(&mut self, job: BusJob) {
        if job.reply.is_closed() {
            debug!(
                "Skip queued job: session {} gone (txn {})",
                job.origin.session_id, job.origin.transaction_id
            );
            BusStats::bump(&self.stats.abandoned);
            return;
        }

        if Instant::now() > job.admission_deadline {
            debug!("Admission expired: txn {}", job.origin.transaction_id);
            BusStats::bump(&self.stats.busy);
            let _ = job.reply.send(Err(BusError::Busy));
            return;
        }

        if job.started.send(()).is_err() {
            debug!(
                "Skip queued job: session {} gave up waiting (txn {})",
                job.origin.session_id, job.origin.transaction_id
            );
            BusStats::bump(&self.stats.abandoned);
            return;
        }

        debug_assert!(self.pending.is_none(), "second RTU transaction started");
        self.pending = Some(PendingTransaction {
            origin: job.origin,
            slave_id: job.request.slave_id,
            function_code: job.request.function_code(),
            started: Instant::now(),
        });

        let outcome = self.transact(&job.request, job.timeout).await;
        self.record(&outcome);

        if let Some(pending) = self.pending.take() {
            debug!(
                "RTU done: session={} txn={} slave={} FC={:02X} in {:?}",
                pending.origin.session_id,
                pending.origin.transaction_id,
                pending.slave_id,
                pending.function_code,
                pending.started.elapsed()
            );
        }

        if job.reply.send(outcome).is_err() {
            debug!("Requester gone, reply discarded");
        }
    }

    fn record(&self, outcome: &Result<BusReply, BusError>) {
        let counter = match outcome {
            Ok(_) => &self.stats.responses,
            Err(BusError::Timeout(_)) => &self.stats.timeouts,
            Err(BusError::Checksum { .. }) => &self.stats.checksum_errors,
            Err(BusError::Frame(_)) => &self.stats.frame_errors,
            Err(BusError::Unavailable(_)) => &self.stats.unavailable,
            Err(BusError::Busy) => &self.stats.busy,
            Err(BusError::Closed) => return,
        };
        BusStats::bump(counter);
    }

    /// Make sure a transport is open, honoring the reconnect delay
    async fn open(&mut self) -> Result<(), BusError> {
        if self.transport.is_some() {
            return Ok(());
        }
        if let Some(at) = self.retry_at {
            if Instant::now() < at {
                return Err(BusError::Unavailable(format!(
                    "{} down, reopen pending",
                    self.connector.describe()
                )));
            }
        }

        match self.connector.connect().await {
            Ok(port) => {
                info!("Bus open: {}", self.connector.describe());
                self.transport = Some(port);
                self.retry_at = None;
                self.last_frame_end = None;
                self.needs_flush = false;
                Ok(())
            },
            Err(e) => {
                error!("Bus open failed: {} - {}", self.connector.describe(), e);
                self.retry_at = Some(Instant::now() + self.settings.reconnect_delay);
                Err(BusError::Unavailable(e.to_string()))
            },
        }
    }

    fn port_failed(&mut self, reason: &str) {
        error!("Bus I/O failed, closing port: {}", reason);
        self.transport = None;
        self.retry_at = Some(Instant::now() + self.settings.reconnect_delay);
    }

    async fn transact(
        &mut self,
        request: &RtuRequest,
        response_timeout: Duration,
    ) -> Result<BusReply, BusError> {
        self.open().await?;
        let Some(mut port) = self.transport.take() else {
            return Err(BusError::Unavailable("port not open".to_string()));
        };

        if self.needs_flush {
            let limit = self.settings.response_timeout;
            match drain(&mut port, self.settings.silence, limit).await {
                Ok(0) => {},
                Ok(n) => debug!("RTU flush: discarded {}B", n),
                Err(e) => {
                    self.port_failed(&e.to_string());
                    return Err(BusError::Unavailable(e.to_string()));
                },
            }
            self.needs_flush = false;
        }

        if let Some(end) = self.last_frame_end {
            sleep_until(end + self.settings.turnaround).await;
        }

        let frame = request.to_frame();
        debug!("RTU TX: {}B [{}]", frame.len(), hex(&frame));
        let written = async {
            port.write_all(&frame).await?;
            port.flush().await
        }
        .await;
        if let Err(e) = written {
            self.port_failed(&e.to_string());
            return Err(BusError::Unavailable(format!("serial write: {e}")));
        }
        BusStats::bump(&self.stats.dispatched);

        if request.is_broadcast() {
            sleep(self.settings.turnaround).await;
            self.last_frame_end = Some(Instant::now());
            self.transport = Some(port);
            return Ok(BusReply::Broadcast);
        }

        let received = read_response(
            &mut port,
            request.function_code(),
            response_timeout,
            self.settings.silence,
        )
        .await;
        self.last_frame_end = Some(Instant::now());

        let raw = match received {
            Ok(raw) => raw,
            Err(BusError::Unavailable(reason)) => {
                self.port_failed(&reason);
                return Err(BusError::Unavailable(reason));
            },
            Err(e) => {
                self.needs_flush = true;
                self.transport = Some(port);
                return Err(e);
            },
        };
        self.transport = Some(port);
        debug!("RTU RX: {}B [{}]", raw.len(), hex(&raw));

        if let Some(expected) = rtu::expected_response_len(request.function_code(), &raw) {
            if raw.len() != expected {
                warn!("RTU discard: {}B received, layout says {}B", raw.len(), expected);
                self.needs_flush = true;
                return Err(BusError::Frame(format!(
                    "response length {} does not match expected {}",
                    raw.len(),
                    expected
                )));
            }
        }

        let response = match rtu::decode_rtu_response(&raw) {
            Ok(response) => response,
            Err(e) => {
                warn!("RTU discard: {}", e);
                self.needs_flush = true;
                return Err(BusError::from(e));
            },
        };

        if response.slave_id != request.slave_id
            || response.function_code != request.function_code()
        {
            self.needs_flush = true;
            return Err(BusError::Frame(format!(
                "expected slave {} FC {:02X}, got slave {} FC {:02X}",
                request.slave_id,
                request.function_code(),
                response.slave_id,
                response.function_code
            )));
        }

        Ok(BusReply::Response(response))
    }
}

/// Read one response frame.
///
/// The first read is bounded by `response_timeout`. After that the frame ends
/// when the line stays quiet for `silence`, or as soon as a frame of the
/// expected length for `request_fc` is complete.
async fn read_response<T: AsyncRead + Unpin>(
    port: &mut T,
    request_fc: u8,
    response_timeout: Duration,
    silence: Duration,
) -> Result<Vec<u8>, BusError> {
    let mut frame = Vec::with_capacity(MAX_RTU_FRAME_SIZE);
    let mut chunk = [0u8; MAX_RTU_FRAME_SIZE];

    match timeout(response_timeout, port.read(&mut chunk)).await {
        Err(_) => return Err(BusError::Timeout(response_timeout)),
        Ok(Ok(0)) => return Err(BusError::Unavailable("serial port closed".to_string())),
        Ok(Ok(n)) => frame.extend_from_slice(&chunk[..n]),
        Ok(Err(e)) => return Err(BusError::Unavailable(format!("serial read: {e}"))),
    }

    loop {
        if let Some(expected) = rtu::expected_response_len(request_fc, &frame) {
            if frame.len() >= expected {
                break;
            }
        }
        if frame.len() >= MAX_RTU_FRAME_SIZE {
            return Err(BusError::Frame(format!(
                "response exceeds {} bytes",
                MAX_RTU_FRAME_SIZE
            )));
        }

        let room = MAX_RTU_FRAME_SIZE - frame.len();
        match timeout(silence, port.read(&mut chunk[..room])).await {
            Err(_) => break,
            Ok(Ok(0)) => return Err(BusError::Unavailable("serial port closed".to_string())),
            Ok(Ok(n)) => frame.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(BusError::Unavailable(format!("serial read: {e}"))),
        }
    }

    Ok(frame)
}

/// Discard whatever arrives until the line is quiet for `silence` (bounded by `limit`)
async fn drain<T: AsyncRead + Unpin>(
    port: &mut T,
    silence: Duration,
    limit: Duration,
) -> std::io::Result<usize> {
    let until = Instant::now() + limit;
    let mut scratch = [0u8; 64];
    let mut discarded = 0;

    while Instant::now() < until {
        match timeout(silence, port.read(&mut scratch)).await {
            Err(_) => break,
            Ok(Ok(0)) => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            Ok(Ok(n)) => discarded += n,
            Ok(Err(e)) => return Err(e),
        }
    }
    Ok(discarded)
}
