//! Start/stop behaviour of channels, workers, the registry and client sessions.

mod common;

use std::time::Duration;

use common::*;
use securecho_session::{
    ClientSession, ClientSessionConfig, ClientState, CloseReason, ConnectionHandle, Direction,
    EndReason, HandleState, ReadError, RecordingSink, RetryPolicy, SecureChannel, ServerSettings,
    WriteError,
};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_shutdown_twice_is_harmless() {
    let pki = self_signed();
    let mut listener = start_listener(server_context(&pki, RecordingSink::new())).await;
    let client_ctx = client_context(&pki, RecordingSink::new());
    let (mut channel, _id) = connect_pair(&mut listener, &client_ctx).await;

    channel.shutdown().await;
    channel.shutdown().await;

    assert!(!channel.is_open());
    assert!(matches!(channel.read(), Err(ReadError::Closed)));
    assert!(matches!(channel.write(b"late").await, Err(WriteError::Closed)));

    listener.shutdown().await;
}

#[tokio::test]
async fn test_stop_all_stops_every_worker() {
    const CLIENTS: usize = 4;

    let pki = self_signed();
    let mut listener = start_listener(server_context(&pki, RecordingSink::new())).await;
    let client_ctx = client_context(&pki, RecordingSink::new());

    let mut channels = Vec::new();
    let mut watches = Vec::new();
    for _ in 0..CLIENTS {
        let (channel, id) = connect_pair(&mut listener, &client_ctx).await;
        wait_for_state(&listener, id, HandleState::Active).await;
        watches.push(listener.registry().get(id).unwrap().watch_state());
        channels.push(channel);
    }
    assert_eq!(listener.registry().len(), CLIENTS);

    let stats = listener.registry_mut().stop_all().await;

    assert_eq!(stats.len(), CLIENTS);
    assert!(stats.iter().all(|s| s.end == EndReason::Stopped));
    assert!(watches.iter().all(|w| *w.borrow() == HandleState::Stopped));
    assert!(listener.registry().is_empty());

    // Each client sees the close_notify
    for channel in &mut channels {
        let closed = tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                match channel.read() {
                    Ok(_) => channel.readable().await.unwrap(),
                    Err(e) => break e,
                }
            }
        })
        .await
        .unwrap();
        assert!(matches!(closed, ReadError::PeerClosed));
        assert!(channel.is_peer_closed());
    }
}

#[tokio::test]
async fn test_stop_during_handshake() {
    let pki = self_signed();
    let settings = ServerSettings {
        handshake_timeout: None,
        ..Default::default()
    };
    let mut listener = bind_listener_with(&pki, settings).await;

    // Plain TCP; the TLS handshake never starts
    let _raw = TcpStream::connect(listener.local_addr()).await.unwrap();
    let id = listener.accept_next().await.unwrap().unwrap();
    assert_eq!(listener.registry().get(id).unwrap().state(), HandleState::Accepting);

    let stats = tokio::time::timeout(TEST_TIMEOUT, listener.registry_mut().stop_all())
        .await
        .expect("stop_all hung on a pending handshake");
    assert_eq!(stats[0].end, EndReason::Stopped);
}

#[tokio::test]
async fn test_handshake_timeout_releases_socket() {
    let pki = self_signed();
    let settings = ServerSettings {
        handshake_timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };
    let mut listener = bind_listener_with(&pki, settings).await;

    let mut raw = TcpStream::connect(listener.local_addr()).await.unwrap();
    let id = listener.accept_next().await.unwrap().unwrap();
    wait_for_state(&listener, id, HandleState::Stopped).await;

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(TEST_TIMEOUT, raw.read(&mut buf))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);

    let stats = listener.shutdown().await;
    assert_eq!(stats[0].end, EndReason::HandshakeFailed);
}

#[tokio::test]
async fn test_client_sends_exactly_three_probes() {
    let pki = self_signed();
    let server_sink = RecordingSink::new();
    let client_sink = RecordingSink::new();
    let listener = start_listener(server_context(&pki, server_sink.clone())).await;
    let port = listener.local_addr().port();

    let server_cancel = CancellationToken::new();
    let server = tokio::spawn(listener.run(server_cancel.clone()));

    let client_ctx = client_context(&pki, client_sink.clone());
    let mut session = ClientSession::new(ClientSessionConfig {
        host: "localhost".to_string(),
        port,
        ..Default::default()
    });
    session.start(&client_ctx).await.unwrap();
    assert_eq!(session.state(), ClientState::Connected);

    let client_cancel = CancellationToken::new();
    let client = tokio::spawn({
        let cancel = client_cancel.clone();
        async move {
            let stats = session.run(cancel).await;
            (stats, session.state())
        }
    });

    wait_until(|| client_sink.bytes(Direction::Received).len() == 9).await;
    // Give the loop room to misbehave before stopping it
    tokio::time::sleep(Duration::from_millis(50)).await;
    client_cancel.cancel();

    let (stats, state) = tokio::time::timeout(TEST_TIMEOUT, client).await.unwrap().unwrap();
    assert_eq!(state, ClientState::Closed);
    assert_eq!(stats.end, Some(CloseReason::Cancelled));
    assert_eq!(stats.probes_sent, 3);
    assert_eq!(stats.bytes_out, 9);
    assert_eq!(stats.bytes_in, 9);
    assert!(stats.iterations >= 3);
    assert_eq!(client_sink.count(Direction::Sent), 3);
    assert_eq!(client_sink.bytes(Direction::Received), b"hi\0hi\0hi\0");

    server_cancel.cancel();
    let server_stats = tokio::time::timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    assert_eq!(server_stats.len(), 1);
    assert_eq!(server_stats[0].bytes_in, 9);
    assert_eq!(server_stats[0].bytes_out, 9);
    assert_eq!(server_sink.bytes(Direction::Received), b"hi\0hi\0hi\0");
}

#[tokio::test]
async fn test_server_close_ends_client_session() {
    let pki = self_signed();
    let server_ctx = server_context(&pki, RecordingSink::new());
    let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = raw.local_addr().unwrap().port();

    // Echo the first probe, then close
    let server = tokio::spawn(async move {
        let (stream, _) = raw.accept().await.unwrap();
        let mut channel = server_ctx.wrap(stream).unwrap();
        channel.accept_handshake().await.unwrap();
        let first = read_at_least(&mut channel, 3).await;
        channel.write(&first[..3]).await.unwrap();
        channel.shutdown().await;
    });

    let client_sink = RecordingSink::new();
    let client_ctx = client_context(&pki, client_sink.clone());
    let mut session = ClientSession::new(ClientSessionConfig {
        host: "localhost".to_string(),
        port,
        ..Default::default()
    });
    assert_eq!(session.config().probe_limit, 3);
    session.start(&client_ctx).await.unwrap();
    assert!(session.is_running());

    let stats = tokio::time::timeout(TEST_TIMEOUT, session.run(CancellationToken::new()))
        .await
        .unwrap();
    tokio::time::timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();

    assert!(!session.is_running());
    assert_eq!(session.state(), ClientState::Closed);
    assert_eq!(stats.end, Some(CloseReason::PeerClosed));
    assert!(stats.probes_sent >= 1 && stats.probes_sent < 3);
    assert!(stats.bytes_in >= 3);

    // Nothing is written once the close has been seen
    let sent = client_sink.count(Direction::Sent);
    assert_eq!(sent, stats.probes_sent as usize);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client_sink.count(Direction::Sent), sent);
}

#[tokio::test]
async fn test_stop_aborts_worker_stuck_on_a_client_that_never_reads() {
    let pki = self_signed();
    let server_ctx = server_context(&pki, RecordingSink::new()).with_retry_policy(RetryPolicy {
        shutdown_grace: Duration::from_millis(100),
        ..Default::default()
    });
    let mut listener = start_listener(server_ctx).await;
    assert_eq!(listener.registry().join_grace(), Duration::from_millis(200));
    let client_ctx = client_context(&pki, RecordingSink::new());
    let (mut channel, id) = connect_pair(&mut listener, &client_ctx).await;
    wait_for_state(&listener, id, HandleState::Active).await;

    // Keep sending without ever reading the echo until both directions stall
    let flood = tokio::spawn(async move {
        let chunk = vec![0x5au8; 64 * 1024];
        loop {
            if channel.write(&chunk).await.is_err() {
                break;
            }
        }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(listener.registry().states(), vec![(id, HandleState::Active)]);

    let stats = tokio::time::timeout(TEST_TIMEOUT, listener.registry_mut().stop_all())
        .await
        .expect("stop_all waited on a blocked worker");
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].end, EndReason::Aborted);

    flood.abort();
}

#[tokio::test]
async fn test_handle_stop_and_join() {
    let pki = self_signed();
    let server_ctx = server_context(&pki, RecordingSink::new());
    let client_ctx = client_context(&pki, RecordingSink::new());
    let raw = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = raw.local_addr().unwrap().port();

    let connect = tokio::spawn(async move { SecureChannel::connect("127.0.0.1", port, &client_ctx).await });
    let (stream, _) = raw.accept().await.unwrap();
    let handle = ConnectionHandle::spawn(server_ctx.wrap(stream).unwrap(), Some(TEST_TIMEOUT));
    let mut channel = tokio::time::timeout(TEST_TIMEOUT, connect).await.unwrap().unwrap().unwrap();

    let mut state = handle.watch_state();
    tokio::time::timeout(TEST_TIMEOUT, state.wait_for(|s| *s == HandleState::Active))
        .await
        .unwrap()
        .unwrap();
    assert!(handle.is_connected());

    handle.stop();
    assert!(!handle.is_connected());
    let stats = tokio::time::timeout(TEST_TIMEOUT, handle.join()).await.unwrap();
    assert_eq!(stats.end, EndReason::Stopped);

    channel.shutdown().await;
}

#[tokio::test]
async fn test_run_loop_stops_on_cancel() {
    let pki = self_signed();
    let listener = start_listener(server_context(&pki, RecordingSink::new())).await;
    let cancel = CancellationToken::new();
    let server = tokio::spawn(listener.run(cancel.clone()));

    cancel.cancel();
    let stats = tokio::time::timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
    assert!(stats.is_empty());
}

async fn bind_listener_with(
    pki: &TestPki,
    settings: ServerSettings,
) -> securecho_session::ListenerLoop {
    securecho_session::bind_ephemeral(server_context(pki, RecordingSink::new()), settings)
        .await
        .unwrap()
}
