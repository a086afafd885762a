// End-to-end tunnels between a ProxiedConnection and an in-process Responder

use async_trait::async_trait;
use dnsconduit::{
    AcceptedTunnel, DropPercentage, FaultInjector, Flags, LoopbackResolver, NoFaults,
    ProxiedConnection, ResolveError, Resolver, Responder, SegmentCodec, TcState, TunnelConfig,
    TunnelError,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_test::assert_ok;

fn config() -> TunnelConfig {
    let mut config = TunnelConfig::default();
    config.transport.linger = Duration::from_millis(100);
    config
}

fn responder(config: &TunnelConfig) -> (Arc<Responder>, mpsc::Receiver<AcceptedTunnel>) {
    let (tx, rx) = mpsc::channel(16);
    let responder = Responder::new(config.responder_config().unwrap(), tx);
    (Arc::new(responder), rx)
}

fn pattern(len: usize, salt: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ salt).collect()
}

/// Records the flags of every query the driver issues
struct Recording {
    inner: LoopbackResolver,
    codec: SegmentCodec,
    queries: Mutex<Vec<Flags>>,
}

#[async_trait]
impl Resolver for Recording {
    async fn lookup_cname(&self, name: &str) -> Result<String, ResolveError> {
        self.queries.lock().unwrap().push(self.codec.decode(name).flags);
        self.inner.lookup_cname(name).await
    }
}

/// Fails every query
struct Blackhole;

#[async_trait]
impl Resolver for Blackhole {
    async fn lookup_cname(&self, _name: &str) -> Result<String, ResolveError> {
        Err(ResolveError::ServerFailure(2))
    }
}

async fn exchange(
    config: &TunnelConfig,
    injector: Arc<dyn FaultInjector>,
    request_len: usize,
    reply_len: usize,
) {
    let (responder, mut accepted) = responder(config);
    let resolver = Arc::new(LoopbackResolver::new(responder.clone()));

    let (local, mut app) = tokio::io::duplex(64 * 1024);
    let conn = assert_ok!(ProxiedConnection::new(config, 0x0101, resolver, injector, local));
    let handle = assert_ok!(conn.start().await);
    assert_eq!(handle.state(), TcState::Established);

    let mut tunnel = accepted.recv().await.unwrap();
    assert_eq!(tunnel.conn_id, 0x0101);

    let request = pattern(request_len, 0x5a);
    let reply = pattern(reply_len, 0xa5);

    let server = tokio::spawn({
        let request = request.clone();
        let reply = reply.clone();
        async move {
            let mut received = vec![0u8; request.len()];
            tunnel.stream.read_exact(&mut received).await.unwrap();
            assert_eq!(received, request);

            tunnel.stream.write_all(&reply).await.unwrap();

            let mut rest = Vec::new();
            tunnel.stream.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        }
    });

    app.write_all(&request).await.unwrap();
    let mut received = vec![0u8; reply.len()];
    app.read_exact(&mut received).await.unwrap();
    assert_eq!(received, reply);

    app.shutdown().await.unwrap();
    assert_ok!(server.await);

    let stats = assert_ok!(handle.wait().await);
    assert_eq!(stats.bytes_sent, request_len as u64);
    assert_eq!(stats.bytes_received, reply_len as u64);
}

#[tokio::test(start_paused = true)]
async fn test_round_trip() {
    exchange(&config(), Arc::new(NoFaults), 20_000, 5_000).await;
}

#[tokio::test(start_paused = true)]
async fn test_round_trip_with_thirty_percent_drop() {
    exchange(
        &config(),
        Arc::new(DropPercentage::with_seed(30, 0xd15c)),
        8_000,
        3_000,
    )
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_long_suffix_domain_still_delivers() {
    let mut config = config();
    config.suffix_domain = format!("{}.{}.net", "a".repeat(60), "b".repeat(60));
    exchange(&config, Arc::new(NoFaults), 4_000, 4_000).await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_sends_final_segment_after_close() {
    let config = config();
    let (responder, mut accepted) = responder(&config);
    let resolver = Arc::new(Recording {
        inner: LoopbackResolver::new(responder.clone()),
        codec: config.codec().unwrap(),
        queries: Mutex::new(Vec::new()),
    });

    let (local, _app) = tokio::io::duplex(4096);
    let conn = assert_ok!(ProxiedConnection::new(
        &config,
        7,
        resolver.clone(),
        Arc::new(NoFaults),
        local
    ));
    let handle = assert_ok!(conn.start().await);
    let mut tunnel = accepted.recv().await.unwrap();

    handle.stop();
    let mut rest = Vec::new();
    assert_ok!(tunnel.stream.read_to_end(&mut rest).await);

    let stats = assert_ok!(handle.wait().await);
    assert!(stats.segments_sent >= 2);

    let queries = resolver.queries.lock().unwrap();
    assert!(queries.iter().any(|flags| flags.contains(Flags::FIN)));
    let last = queries.last().copied().unwrap();
    assert!(!last.is_empty());
    assert!(last.contains(Flags::ACK));
}

#[tokio::test(start_paused = true)]
async fn test_teardown_under_loss() {
    let config = config();
    let (responder, mut accepted) = responder(&config);
    let resolver = Arc::new(LoopbackResolver::new(responder.clone()));

    let (local, mut app) = tokio::io::duplex(4096);
    let conn = assert_ok!(ProxiedConnection::new(
        &config,
        8,
        resolver,
        Arc::new(DropPercentage::with_seed(20, 99)),
        local
    ));
    let handle = assert_ok!(conn.start().await);
    let mut tunnel = accepted.recv().await.unwrap();

    app.write_all(b"last words").await.unwrap();
    app.shutdown().await.unwrap();

    let mut received = Vec::new();
    assert_ok!(tunnel.stream.read_to_end(&mut received).await);
    assert_eq!(received, b"last words");

    assert_ok!(handle.wait().await);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_connections_are_isolated() {
    let config = config();
    let (responder, mut accepted) = responder(&config);
    let resolver: Arc<dyn Resolver> = Arc::new(LoopbackResolver::new(responder.clone()));

    let mut apps = Vec::new();
    let mut handles = Vec::new();
    for (id, salt) in [(0x0a0a_u16, 1u8), (0x0b0b, 2)] {
        let (local, app) = tokio::io::duplex(64 * 1024);
        let conn = assert_ok!(ProxiedConnection::new(
            &config,
            id,
            resolver.clone(),
            Arc::new(NoFaults),
            local
        ));
        handles.push(assert_ok!(conn.start().await));
        apps.push((app, pattern(6_000 + salt as usize * 500, salt)));
    }

    for (app, data) in apps.iter_mut() {
        app.write_all(data.as_slice()).await.unwrap();
        app.shutdown().await.unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..2 {
        let mut tunnel = accepted.recv().await.unwrap();
        let expected = match tunnel.conn_id {
            0x0a0a => &apps[0].1,
            0x0b0b => &apps[1].1,
            other => panic!("unexpected connection {:04x}", other),
        };
        let mut received = Vec::new();
        assert_ok!(tunnel.stream.read_to_end(&mut received).await);
        assert_eq!(&received, expected);
        seen.push(tunnel.conn_id);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0x0a0a, 0x0b0b]);

    for (handle, (_, data)) in handles.into_iter().zip(apps.iter()) {
        let stats = assert_ok!(handle.wait().await);
        assert_eq!(stats.bytes_sent, data.len() as u64);
    }
}

#[tokio::test(start_paused = true)]
async fn test_handshake_fails_without_answers() {
    let mut config = config();
    config.transport.max_retransmissions = 3;
    config.transport.handshake_timeout = Duration::from_secs(60);

    let (local, _app) = tokio::io::duplex(1024);
    let conn = assert_ok!(ProxiedConnection::new(
        &config,
        9,
        Arc::new(Blackhole),
        Arc::new(NoFaults),
        local
    ));

    let started = tokio::time::Instant::now();
    let result = conn.start().await;
    assert!(matches!(
        result,
        Err(TunnelError::HandshakeFailed(9)) | Err(TunnelError::HandshakeTimeout(_))
    ));
    assert!(started.elapsed() <= Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_kill_aborts_established_connection() {
    let config = config();
    let (responder, mut accepted) = responder(&config);
    let resolver = Arc::new(LoopbackResolver::new(responder.clone()));

    let (local, _app) = tokio::io::duplex(1024);
    let conn = assert_ok!(ProxiedConnection::new(
        &config,
        0x0c0c,
        resolver,
        Arc::new(NoFaults),
        local
    ));
    let handle = assert_ok!(conn.start().await);
    let _tunnel = accepted.recv().await.unwrap();

    handle.kill();
    let stats = assert_ok!(handle.wait().await);
    assert!(stats.segments_received >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_close_before_start_still_delivers() {
    let config = config();
    let (responder, mut accepted) = responder(&config);
    let resolver = Arc::new(LoopbackResolver::new(responder.clone()));

    let (local, mut app) = tokio::io::duplex(4096);
    app.write_all(b"hello").await.unwrap();
    app.shutdown().await.unwrap();

    let conn = assert_ok!(ProxiedConnection::new(
        &config,
        0x0d0d,
        resolver,
        Arc::new(NoFaults),
        local
    ));
    let handle = assert_ok!(conn.start().await);
    let mut tunnel = accepted.recv().await.unwrap();

    let mut received = Vec::new();
    assert_ok!(tunnel.stream.read_to_end(&mut received).await);
    assert_eq!(received, b"hello");

    let stats = assert_ok!(handle.wait().await);
    assert_eq!(stats.bytes_sent, 5);
}

#[tokio::test(start_paused = true)]
async fn test_kill_while_local_endpoint_stalls() {
    let config = config();
    let (responder, mut accepted) = responder(&config);
    let resolver = Arc::new(LoopbackResolver::new(responder.clone()));

    // Tiny buffer that the application never drains
    let (local, _app) = tokio::io::duplex(64);
    let conn = assert_ok!(ProxiedConnection::new(
        &config,
        0x0e0e,
        resolver,
        Arc::new(NoFaults),
        local
    ));
    let handle = assert_ok!(conn.start().await);
    let mut tunnel = accepted.recv().await.unwrap();

    tunnel.stream.write_all(&pattern(10_000, 0x33)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    handle.kill();
    let stats = assert_ok!(tokio::time::timeout(Duration::from_secs(60), handle.wait()).await);
    assert_ok!(stats);
}
