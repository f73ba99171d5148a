//! Service wiring: store, audit writer, bus arbiter and listener

use std::net::SocketAddr;
use std::sync::Arc;

use bridge_store::{AuditLogger, AuditSink, SqliteStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bus::{BusArbiter, BusConnector, BusSettings, SerialConnector};
use crate::config::GatewayConfig;
use crate::error::Result;
use crate::listener::GatewayListener;
use crate::session::{SessionContext, SessionSettings};
use crate::SERVICE_NAME;

/// A started gateway. Stops when the shutdown token passed to
/// [`Gateway::start`] is cancelled.
pub struct Gateway {
    local_addr: SocketAddr,
    store: SqliteStore,
    audit: AuditLogger,
    audit_task: JoinHandle<()>,
    bus: BusArbiter,
    bus_shutdown: CancellationToken,
    bus_task: JoinHandle<()>,
    listener_task: JoinHandle<Result<()>>,
}

impl Gateway {
    /// Open the store, spawn the bus worker over `connector` and start accepting
    pub async fn start<C: BusConnector>(
        config: &GatewayConfig,
        connector: C,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let store = SqliteStore::connect(&config.database.path).await?;
        store.init_schema().await?;
        info!("Mapping store: {}", config.database.path.display());

        let (audit, audit_task) =
            AuditLogger::spawn(store.pool().clone(), config.logging.audit_capacity);

        // Stopped only after sessions have drained, so in-flight requests finish
        let bus_shutdown = CancellationToken::new();
        let (bus, bus_task) = BusArbiter::spawn(
            connector,
            BusSettings::from(&config.bus),
            bus_shutdown.clone(),
        );

        let ctx = SessionContext {
            store: Arc::new(store.clone()),
            audit: Arc::new(audit.clone()),
            bus: bus.clone(),
            settings: SessionSettings::from_config(config),
            // Installed by the listener
            slots: None,
        };

        let listener = GatewayListener::bind(
            &config.listen.bind_address(),
            ctx,
            config.listen.max_sessions,
            shutdown,
        )
        .await?;
        let local_addr = listener.local_addr()?;
        let listener_task = tokio::spawn(listener.run());

        audit.record(SERVICE_NAME, &format!("gateway started on {}", local_addr));

        Ok(Self {
            local_addr,
            store,
            audit,
            audit_task,
            bus,
            bus_shutdown,
            bus_task,
            listener_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn bus(&self) -> &BusArbiter {
        &self.bus
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    /// Wait for the listener to stop, then tear down bus, audit writer and store
    pub async fn wait(self) -> Result<()> {
        let listener_result = match self.listener_task.await {
            Ok(result) => result,
            Err(e) => {
                error!("Listener task failed: {}", e);
                Ok(())
            },
        };

        self.bus_shutdown.cancel();
        if let Err(e) = self.bus_task.await {
            error!("Bus task failed: {}", e);
        }

        let stats = self.bus.stats();
        self.audit.record(
            SERVICE_NAME,
            &format!(
                "gateway stopped: {} frames, {} timeouts, {} CRC errors",
                stats.dispatched, stats.timeouts, stats.checksum_errors
            ),
        );
        drop(self.bus);
        drop(self.audit);
        if let Err(e) = self.audit_task.await {
            error!("Audit task failed: {}", e);
        }

        self.store.close().await;
        info!("Gateway stopped");
        listener_result
    }
}

/// Run the gateway on the configured serial port until `shutdown`
pub async fn run_gateway(config: GatewayConfig, shutdown: CancellationToken) -> Result<()> {
    let connector = SerialConnector::new(config.serial.clone());
    let gateway = Gateway::start(&config, connector, shutdown).await?;
    info!(
        "Gateway ready: {} -> {} {}baud",
        gateway.local_addr(),
        config.serial.device,
        config.serial.baud_rate
    );
    gateway.wait().await
}
