//! Full gateway over loopback TCP, SQLite mappings and a scripted serial slave
#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::time::Duration;

use bridge_codec::{decode_tcp_response, ExceptionCode, ResponsePayload, TcpResponse};
use bridge_store::{repository, Mapping, MappingStore};
use common::{rtu_frame, MockSlave, PipeConnector, Reply};
use gatewaysrv::{Gateway, GatewayConfig};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

struct Harness {
    gateway: Gateway,
    shutdown: CancellationToken,
    _dir: TempDir,
}

impl Harness {
    async fn start(pipe_connector: PipeConnector, tweak: impl FnOnce(&mut GatewayConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = GatewayConfig::default();
        config.listen.host = "127.0.0.1".to_string();
        config.listen.port = 0;
        config.database.path = dir.path().join("modbus_mapping.db");
        tweak(&mut config);

        let shutdown = CancellationToken::new();
        let gateway = Gateway::start(&config, pipe_connector, shutdown.clone())
            .await
            .unwrap();
        Self {
            gateway,
            shutdown,
            _dir: dir,
        }
    }

    async fn map(&self, mappings: &[Mapping]) {
        for mapping in mappings {
            self.gateway.store().upsert(*mapping).await.unwrap();
        }
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.gateway.local_addr()).await.unwrap()
    }
}

fn read_request(txn: u16, unit: u8, address: u16, quantity: u16) -> Vec<u8> {
    let [t0, t1] = txn.to_be_bytes();
    let [a0, a1] = address.to_be_bytes();
    let [q0, q1] = quantity.to_be_bytes();
    vec![t0, t1, 0x00, 0x00, 0x00, 0x06, unit, 0x03, a0, a1, q0, q1]
}

async fn read_response(stream: &mut TcpStream) -> TcpResponse {
    let mut header = [0u8; 6];
    stream.read_exact(&mut header).await.unwrap();
    let len = usize::from(u16::from_be_bytes([header[4], header[5]]));
    let mut rest = vec![0u8; len];
    stream.read_exact(&mut rest).await.unwrap();
    decode_tcp_response(&[header.to_vec(), rest].concat()).unwrap()
}

async fn exchange(stream: &mut TcpStream, frame: &[u8]) -> TcpResponse {
    stream.write_all(frame).await.unwrap();
    read_response(stream).await
}

#[tokio::test]
async fn test_silent_device_yields_target_failed_to_respond() {
    let (connector, pipe) = PipeConnector::new();
    let slave = MockSlave::spawn(pipe.plug(), |_| Reply::Silent);
    let harness = Harness::start(connector, |_| {}).await;
    harness.map(&[Mapping::new(10, 10, 41060)]).await;

    let mut client = harness.connect().await;
    let started = Instant::now();
    let response = exchange(&mut client, &read_request(1, 10, 41060, 2)).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(response.transaction_id, 1);
    assert_eq!(response.unit_id, 10);
    assert_eq!(response.function_code, 0x03);
    assert_eq!(
        response.payload,
        ResponsePayload::Exception(ExceptionCode::GatewayTargetDeviceFailedToRespond)
    );

    // One retry by default, same frame both times
    let expected = rtu_frame(&[0x0A, 0x03, 0xA0, 0x64, 0x00, 0x02]);
    assert_eq!(slave.frames(), vec![expected.clone(), expected]);
}

#[tokio::test]
async fn test_unmapped_unit_never_touches_the_bus() {
    let (connector, pipe) = PipeConnector::new();
    let slave = MockSlave::spawn(pipe.plug(), |_| Reply::Silent);
    let harness = Harness::start(connector, |_| {}).await;

    let mut client = harness.connect().await;
    let response = exchange(&mut client, &read_request(7, 99, 0, 1)).await;

    assert_eq!(response.transaction_id, 7);
    assert_eq!(response.unit_id, 99);
    assert_eq!(
        response.payload,
        ResponsePayload::Exception(ExceptionCode::IllegalDataAddress)
    );
    assert_eq!(harness.gateway.bus().stats().dispatched, 0);
    assert!(slave.frames().is_empty());
}

#[tokio::test]
async fn test_device_data_is_relayed_with_client_header() {
    let (connector, pipe) = PipeConnector::new();
    let slave = MockSlave::spawn(pipe.plug(), |req| {
        assert_eq!(req[0], 5);
        Reply::Now(rtu_frame(&[0x05, 0x03, 0x04, 0x00, 0x2A, 0x01, 0x00]))
    });
    let harness = Harness::start(connector, |_| {}).await;
    harness.map(&[Mapping::new(1, 5, 0x0010)]).await;

    let mut client = harness.connect().await;
    let response = exchange(&mut client, &read_request(0x1234, 1, 0x0000, 2)).await;

    assert_eq!(response.transaction_id, 0x1234);
    assert_eq!(response.unit_id, 1);
    assert_eq!(response.function_code, 0x03);
    assert_eq!(
        response.payload,
        ResponsePayload::Data(vec![0x04, 0x00, 0x2A, 0x01, 0x00].into())
    );
    assert_eq!(
        slave.frames(),
        vec![rtu_frame(&[0x05, 0x03, 0x00, 0x10, 0x00, 0x02])]
    );
}

#[tokio::test]
async fn test_device_exception_is_forwarded() {
    let (connector, pipe) = PipeConnector::new();
    let _slave = MockSlave::spawn(pipe.plug(), |req| {
        Reply::Now(rtu_frame(&[req[0], 0x83, 0x02]))
    });
    let harness = Harness::start(connector, |_| {}).await;
    harness.map(&[Mapping::new(2, 6, 0x0100)]).await;

    let mut client = harness.connect().await;
    let response = exchange(&mut client, &read_request(3, 2, 0, 1)).await;

    assert_eq!(response.function_code, 0x03);
    assert_eq!(
        response.payload,
        ResponsePayload::Exception(ExceptionCode::IllegalDataAddress)
    );
    // Device-reported exceptions are final, no retry
    assert_eq!(harness.gateway.bus().stats().dispatched, 1);
}

#[tokio::test]
async fn test_missing_serial_port_is_path_unavailable() {
    let (connector, _pipe) = PipeConnector::new();
    let harness = Harness::start(connector, |_| {}).await;
    harness.map(&[Mapping::new(10, 10, 41060)]).await;

    let mut client = harness.connect().await;
    let response = exchange(&mut client, &read_request(1, 10, 41060, 2)).await;
    assert_eq!(
        response.payload,
        ResponsePayload::Exception(ExceptionCode::GatewayPathUnavailable)
    );

    sleep(Duration::from_millis(100)).await;
    let logs = repository::recent_logs(harness.gateway.store().pool(), 10)
        .await
        .unwrap();
    assert!(logs.iter().any(|r| r.message.contains("serial bus unavailable")));
}

#[tokio::test]
async fn test_pipelined_requests_are_answered_in_order() {
    let (connector, pipe) = PipeConnector::new();
    let _slave = MockSlave::spawn(pipe.plug(), |req| {
        Reply::Now(rtu_frame(&[req[0], 0x03, 0x02, 0x00, req[3]]))
    });
    let harness = Harness::start(connector, |_| {}).await;
    harness.map(&[Mapping::new(1, 1, 0)]).await;

    let mut client = harness.connect().await;
    let burst = [
        read_request(1, 1, 0, 1),
        read_request(2, 99, 0, 1),
        read_request(3, 1, 0, 1),
    ]
    .concat();
    client.write_all(&burst).await.unwrap();

    let ids: Vec<u16> = [
        read_response(&mut client).await,
        read_response(&mut client).await,
        read_response(&mut client).await,
    ]
    .iter()
    .map(|r| r.transaction_id)
    .collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_framing_error_closes_only_that_connection() {
    let (connector, _pipe) = PipeConnector::new();
    let harness = Harness::start(connector, |_| {}).await;

    let mut good = harness.connect().await;
    let mut bad = harness.connect().await;

    // Protocol id 1
    bad.write_all(&[0x00, 0x01, 0x00, 0x01, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01])
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(1), bad.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0, "connection should be closed without a response");

    let response = exchange(&mut good, &read_request(9, 42, 0, 1)).await;
    assert_eq!(response.transaction_id, 9);
}

#[tokio::test]
async fn test_extra_connection_is_busy_after_admission_wait() {
    let (connector, _pipe) = PipeConnector::new();
    let harness = Harness::start(connector, |config| {
        config.listen.max_sessions = 1;
        config.bus.admission_timeout_ms = 300;
    })
    .await;

    let mut first = harness.connect().await;
    let response = exchange(&mut first, &read_request(1, 99, 0, 1)).await;
    assert_eq!(
        response.payload,
        ResponsePayload::Exception(ExceptionCode::IllegalDataAddress)
    );

    // The only slot is held: answered busy once the admission wait runs out
    let mut second = harness.connect().await;
    let started = Instant::now();
    let response = timeout(
        Duration::from_secs(2),
        exchange(&mut second, &read_request(2, 99, 0, 1)),
    )
    .await
    .unwrap();
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(response.transaction_id, 2);
    assert_eq!(
        response.payload,
        ResponsePayload::Exception(ExceptionCode::ServerDeviceBusy)
    );

    // Same connection is served once the first client leaves
    drop(first);
    sleep(Duration::from_millis(50)).await;
    let response = exchange(&mut second, &read_request(3, 99, 0, 1)).await;
    assert_eq!(response.transaction_id, 3);
    assert_eq!(
        response.payload,
        ResponsePayload::Exception(ExceptionCode::IllegalDataAddress)
    );
}

#[tokio::test]
async fn test_write_echo_carries_client_address() {
    let (connector, pipe) = PipeConnector::new();
    // Device echoes the request as written
    let slave = MockSlave::spawn(pipe.plug(), |req| Reply::Now(req.to_vec()));
    let harness = Harness::start(connector, |_| {}).await;
    harness.map(&[Mapping::new(1, 5, 0x0010)]).await;

    let mut client = harness.connect().await;
    let write = [0x00, 0x08, 0x00, 0x00, 0x00, 0x06, 0x01, 0x06, 0x00, 0x00, 0x12, 0x34];
    let response = exchange(&mut client, &write).await;

    assert_eq!(response.transaction_id, 8);
    assert_eq!(response.function_code, 0x06);
    assert_eq!(
        response.payload,
        ResponsePayload::Data(vec![0x00, 0x00, 0x12, 0x34].into())
    );
    assert_eq!(
        slave.frames(),
        vec![rtu_frame(&[0x05, 0x06, 0x00, 0x10, 0x12, 0x34])]
    );
}

#[tokio::test]
async fn test_reply_with_stray_trailing_byte_is_not_relayed() {
    let (connector, pipe) = PipeConnector::new();
    let _slave = MockSlave::spawn(pipe.plug(), |_| {
        let mut reply = rtu_frame(&[0x0A, 0x03, 0x04, 0x00, 0x2A, 0x00, 0x07]);
        reply.push(0x00);
        Reply::Now(reply)
    });
    let harness = Harness::start(connector, |_| {}).await;
    harness.map(&[Mapping::new(10, 10, 41060)]).await;

    let mut client = harness.connect().await;
    let response = exchange(&mut client, &read_request(1, 10, 41060, 2)).await;
    assert_eq!(
        response.payload,
        ResponsePayload::Exception(ExceptionCode::GatewayTargetDeviceFailedToRespond)
    );
    assert_eq!(harness.gateway.bus().stats().responses, 0);
}

#[tokio::test]
async fn test_shutdown_drains_sessions_and_records_audit() {
    let (connector, _pipe) = PipeConnector::new();
    let harness = Harness::start(connector, |_| {}).await;
    let pool = harness.gateway.store().pool().clone();

    let mut client = harness.connect().await;
    let _ = exchange(&mut client, &read_request(1, 99, 0, 1)).await;

    sleep(Duration::from_millis(50)).await;
    let logs = repository::recent_logs(&pool, 10).await.unwrap();
    assert!(logs.iter().any(|r| r.message.contains("gateway started")));

    harness.shutdown.cancel();
    timeout(Duration::from_secs(5), harness.gateway.wait())
        .await
        .unwrap()
        .unwrap();

    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
}
