//! Per-connection request handling
//!
//! A session reads one MBAP request at a time, resolves its target through the
//! mapping store, forwards it over the serial bus and writes exactly one
//! response before reading the next request. Every per-request failure becomes
//! a Modbus exception response; only a TCP framing error ends the connection.

use std::sync::Arc;
use std::time::Duration;

use bridge_codec::constants::{
    FC_READ_WRITE_MULTIPLE_REGISTERS, FC_WRITE_MULTIPLE_COILS, FC_WRITE_MULTIPLE_REGISTERS,
    FC_WRITE_SINGLE_COIL, FC_WRITE_SINGLE_REGISTER,
};
use bridge_codec::pdu::{self, PduBuilder};
use bridge_codec::{ExceptionCode, MbapCodec, ResponsePayload, RtuRequest, TcpRequest, TcpResponse};
use bridge_store::{AuditSink, Mapping, MappingStore};
use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bus::{BusArbiter, BusReply, Origin};
use crate::config::{GatewayConfig, MappingKey};
use crate::error::{BusError, Result};
use crate::SERVICE_NAME;

/// Session lifecycle
///
/// ```text
/// AwaitingRequest -> Resolving -> Dispatching -> AwaitingBusResponse -> Responding -> AwaitingRequest
///                        |                              |  (retry)          ^
///                        |                              +--> Dispatching    |
///                        +--------------------------------------------------+  (no dispatch)
/// any state -> Closing (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    AwaitingRequest,
    Resolving,
    Dispatching,
    AwaitingBusResponse,
    Responding,
    Closing,
}

impl SessionState {
    pub const ALL: [SessionState; 6] = [
        SessionState::AwaitingRequest,
        SessionState::Resolving,
        SessionState::Dispatching,
        SessionState::AwaitingBusResponse,
        SessionState::Responding,
        SessionState::Closing,
    ];

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closing, _) => false,
            (_, Closing) => true,
            (AwaitingRequest, Resolving)
            | (Resolving, Dispatching)
            | (Resolving, Responding)
            | (Dispatching, AwaitingBusResponse)
            | (Dispatching, Responding)
            | (AwaitingBusResponse, Responding)
            | (AwaitingBusResponse, Dispatching)
            | (Responding, AwaitingRequest) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Closing
    }
}

/// Per-connection state
#[derive(Debug)]
pub struct Session {
    id: u64,
    state: SessionState,
    live_transaction: Option<u16>,
}

impl Session {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: SessionState::AwaitingRequest,
            live_transaction: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn live_transaction(&self) -> Option<u16> {
        self.live_transaction
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {:?} -> {:?}",
            self.state,
            next
        );
        trace!("session {}: {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
    }
}

/// Request-path settings shared by all sessions
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Extra attempts after a retryable bus failure
    pub retries: u32,
    pub resolve_timeout: Duration,
    pub response_timeout: Duration,
    pub mapping_key: MappingKey,
    pub idle_timeout: Option<Duration>,
    /// How long a request waits for a serving slot
    pub slot_wait: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            retries: config.session.retries,
            resolve_timeout: config.session.resolve_timeout(),
            response_timeout: config.bus.response_timeout(),
            mapping_key: config.session.mapping_key,
            idle_timeout: config.listen.idle_timeout(),
            slot_wait: config.bus.admission_timeout(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

/// Bound on concurrently served sessions.
///
/// A session claims a slot with its first request and keeps it until it closes.
/// Sessions without a slot are still read; each request waits at most
/// `slot_wait` and is refused with *server device busy* after that.
#[derive(Debug, Clone)]
pub struct SessionSlots {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl SessionSlots {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    async fn claim(&self, wait: Duration) -> Option<OwnedSemaphorePermit> {
        match timeout(wait, Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => Some(permit),
            _ => None,
        }
    }
}

/// Collaborators every session needs
#[derive(Clone)]
pub struct SessionContext {
    pub store: Arc<dyn MappingStore>,
    pub audit: Arc<dyn AuditSink>,
    pub bus: BusArbiter,
    pub settings: SessionSettings,
    /// `None` serves every session
    pub slots: Option<SessionSlots>,
}

enum Inbound {
    Request(TcpRequest),
    Framing(bridge_codec::FrameError),
    Eof,
    Idle,
}

pub struct SessionHandler {
    session: Session,
    ctx: SessionContext,
    slot: Option<OwnedSemaphorePermit>,
}

impl SessionHandler {
    pub fn new(id: u64, ctx: SessionContext) -> Self {
        Self {
            session: Session::new(id),
            ctx,
            slot: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Serve the connection until EOF, idle timeout, shutdown or a framing error
    pub async fn run<S>(mut self, stream: S, shutdown: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut framed = Framed::new(stream, MbapCodec);
        let id = self.session.id;

        let result = loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("session {}: shutdown", id);
                    break Ok(());
                },
                inbound = next_inbound(&mut framed, self.ctx.settings.idle_timeout) => inbound,
            };

            let request = match inbound {
                Inbound::Request(request) => request,
                Inbound::Eof => {
                    debug!("session {}: peer closed", id);
                    break Ok(());
                },
                Inbound::Idle => {
                    info!("session {}: idle timeout", id);
                    break Ok(());
                },
                Inbound::Framing(e) => {
                    warn!("session {}: framing error, closing: {}", id, e);
                    break Err(e.into());
                },
            };

            let response = self.handle_request(&request).await;
            if let Err(e) = framed.send(response).await {
                warn!("session {}: write failed: {}", id, e);
                break Err(e.into());
            }
            self.session.live_transaction = None;
            self.session.advance(SessionState::AwaitingRequest);
        };

        self.session.advance(SessionState::Closing);
        result
    }

    /// Produce the single response for one request. Ends in `Responding`.
    pub async fn handle_request(&mut self, request: &TcpRequest) -> TcpResponse {
        self.session.live_transaction = Some(request.transaction_id());
        self.session.advance(SessionState::Resolving);

        let payload = if self.claim_slot().await {
            match self.resolve_and_forward(request).await {
                Ok(payload) => payload,
                Err(code) => ResponsePayload::Exception(code),
            }
        } else {
            ResponsePayload::Exception(ExceptionCode::ServerDeviceBusy)
        };

        self.session.advance(SessionState::Responding);
        TcpResponse {
            transaction_id: request.transaction_id(),
            unit_id: request.unit_id(),
            function_code: request.function_code,
            payload,
        }
    }

    async fn claim_slot(&mut self) -> bool {
        let Some(slots) = &self.ctx.slots else {
            return true;
        };
        if self.slot.is_some() {
            return true;
        }

        let wait = self.ctx.settings.slot_wait;
        match slots.claim(wait).await {
            Some(permit) => {
                debug!("session {}: serving slot claimed", self.session.id);
                self.slot = Some(permit);
                true
            },
            None => {
                warn!(
                    "session {}: no serving slot within {:?} ({} in use)",
                    self.session.id,
                    wait,
                    slots.in_use()
                );
                false
            },
        }
    }

    async fn resolve_and_forward(
        &mut self,
        request: &TcpRequest,
    ) -> std::result::Result<ResponsePayload, ExceptionCode> {
        let id = self.session.id;
        let fc = request.function_code;

        let Some(start) = request.start_address() else {
            debug!("session {}: unsupported FC {:02X}", id, fc);
            return Err(ExceptionCode::IllegalFunction);
        };

        let key = match self.ctx.settings.mapping_key {
            MappingKey::Unit => u16::from(request.unit_id()),
            MappingKey::Register => start,
        };

        let mapping = self.resolve(key).await?;

        if mapping.is_broadcast() && pdu::is_read_function(fc) {
            warn!(
                "session {}: read FC {:02X} mapped to broadcast (key {})",
                id, fc, key
            );
            return Err(ExceptionCode::GatewayPathUnavailable);
        }

        let rtu_request = translate(request, &mapping).map_err(|e| {
            warn!("session {}: cannot build RTU request: {}", id, e);
            ExceptionCode::IllegalDataValue
        })?;

        match self.forward(request, rtu_request).await {
            Ok(BusReply::Response(response)) => Ok(client_echo(request, response.payload)),
            // Write echo: address + value/quantity as sent by the client
            Ok(BusReply::Broadcast) => Ok(ResponsePayload::Data(request.body.slice(..4))),
            Err(e) => Err(self.bus_failure(request, e)),
        }
    }

    async fn resolve(&self, key: u16) -> std::result::Result<Mapping, ExceptionCode> {
        let id = self.session.id;
        match timeout(self.ctx.settings.resolve_timeout, self.ctx.store.resolve(key)).await {
            Ok(Ok(Some(mapping))) => {
                debug!(
                    "session {}: key {} -> slave {} addr {}",
                    id, key, mapping.rtu_id, mapping.rtu_address
                );
                Ok(mapping)
            },
            Ok(Ok(None)) => {
                debug!("session {}: no mapping for key {}", id, key);
                Err(ExceptionCode::IllegalDataAddress)
            },
            Ok(Err(e)) => {
                warn!("Mapping store unavailable: {}", e);
                self.ctx
                    .audit
                    .record(SERVICE_NAME, &format!("mapping store unavailable: {}", e));
                Err(ExceptionCode::ServerDeviceFailure)
            },
            Err(_) => {
                warn!(
                    "Mapping store unavailable: resolve exceeded {:?}",
                    self.ctx.settings.resolve_timeout
                );
                self.ctx
                    .audit
                    .record(SERVICE_NAME, "mapping store unavailable: resolve timed out");
                Err(ExceptionCode::ServerDeviceFailure)
            },
        }
    }

    /// Submit to the arbiter, retrying retryable failures
    async fn forward(
        &mut self,
        request: &TcpRequest,
        rtu_request: RtuRequest,
    ) -> std::result::Result<BusReply, BusError> {
        let origin = Origin {
            session_id: self.session.id,
            transaction_id: request.transaction_id(),
        };
        let attempts = 1 + self.ctx.settings.retries;
        let mut attempt = 1;

        loop {
            self.session.advance(SessionState::Dispatching);
            let ticket = self
                .ctx
                .bus
                .submit(origin, rtu_request.clone(), self.ctx.settings.response_timeout)
                .await?;

            self.session.advance(SessionState::AwaitingBusResponse);
            match ticket.outcome().await {
                Err(e) if e.is_retryable() && attempt < attempts => {
                    debug!(
                        "session {}: txn {} attempt {}/{} failed: {}",
                        origin.session_id, origin.transaction_id, attempt, attempts, e
                    );
                    attempt += 1;
                },
                outcome => return outcome,
            }
        }
    }

    fn bus_failure(&self, request: &TcpRequest, err: BusError) -> ExceptionCode {
        let id = self.session.id;
        let txn = request.transaction_id();
        match err {
            BusError::Timeout(_) | BusError::Checksum { .. } | BusError::Frame(_) => {
                warn!("session {}: txn {} no valid response: {}", id, txn, err);
                ExceptionCode::GatewayTargetDeviceFailedToRespond
            },
            BusError::Busy => {
                warn!("session {}: txn {} bus busy", id, txn);
                ExceptionCode::ServerDeviceBusy
            },
            BusError::Unavailable(_) | BusError::Closed => {
                warn!("session {}: txn {} bus unavailable: {}", id, txn, err);
                self.ctx
                    .audit
                    .record(SERVICE_NAME, &format!("serial bus unavailable: {}", err));
                ExceptionCode::GatewayPathUnavailable
            },
        }
    }
}

async fn next_inbound<S>(framed: &mut Framed<S, MbapCodec>, idle: Option<Duration>) -> Inbound
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let next = match idle {
        Some(limit) => match timeout(limit, framed.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::Idle,
        },
        None => framed.next().await,
    };

    match next {
        Some(Ok(request)) => Inbound::Request(request),
        Some(Err(e)) => Inbound::Framing(e),
        None => Inbound::Eof,
    }
}

/// Write echoes carry the serial-side address; give the client back its own.
fn client_echo(request: &TcpRequest, payload: ResponsePayload) -> ResponsePayload {
    let is_write = matches!(
        request.function_code,
        FC_WRITE_SINGLE_COIL
            | FC_WRITE_SINGLE_REGISTER
            | FC_WRITE_MULTIPLE_COILS
            | FC_WRITE_MULTIPLE_REGISTERS
    );
    match payload {
        ResponsePayload::Data(echo) if is_write && echo.len() >= 2 && request.body.len() >= 2 => {
            let mut body = BytesMut::with_capacity(echo.len());
            body.extend_from_slice(&request.body[..2]);
            body.extend_from_slice(&echo[2..]);
            ResponsePayload::Data(body.freeze())
        },
        other => other,
    }
}

/// Build the serial request: mapped slave id, mapped starting address.
///
/// For read/write-multiple the write address keeps its offset from the read address.
pub fn translate(request: &TcpRequest, mapping: &Mapping) -> bridge_codec::Result<RtuRequest> {
    let fc = request.function_code;
    let body = &request.body[..];
    let needed = pdu::min_request_body(fc, body).max(2);
    if body.len() < needed {
        return Err(bridge_codec::FrameError::PduTooShort {
            function: fc,
            needed,
            actual: body.len(),
        });
    }

    let builder = PduBuilder::new()
        .function_code(fc)?
        .address(mapping.rtu_address)?;

    let builder = if fc == FC_READ_WRITE_MULTIPLE_REGISTERS {
        let read_start = u16::from_be_bytes([body[0], body[1]]);
        let write_start = u16::from_be_bytes([body[4], body[5]]);
        let shifted = write_start
            .wrapping_sub(read_start)
            .wrapping_add(mapping.rtu_address);
        builder
            .data(&body[2..4])?
            .address(shifted)?
            .data(&body[6..])?
    } else {
        builder.data(&body[2..])?
    };

    Ok(RtuRequest::new(mapping.rtu_id, builder.build()))
}
