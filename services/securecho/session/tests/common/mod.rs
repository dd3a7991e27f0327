//! Shared helpers for the session integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use securecho_session::{
    bind_ephemeral, ClientMaterial, ConnectionId, HandleState, HandshakeContext, ListenerLoop,
    RecordingSink, SecureChannel, ServerMaterial, ServerSettings,
};

/// Upper bound for any single wait in these tests
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Self-signed certificate and key for `localhost`
pub struct TestPki {
    pub cert_pem: String,
    pub key_pem: String,
}

pub fn self_signed() -> TestPki {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    TestPki {
        cert_pem: certified.cert.pem(),
        key_pem: certified.key_pair.serialize_pem(),
    }
}

pub fn server_context(pki: &TestPki, sink: Arc<RecordingSink>) -> HandshakeContext {
    HandshakeContext::server(ServerMaterial::from_pem(
        pki.cert_pem.clone(),
        pki.key_pem.clone(),
    ))
    .unwrap()
    .with_sink(sink)
}

pub fn client_context(pki: &TestPki, sink: Arc<RecordingSink>) -> HandshakeContext {
    HandshakeContext::client(ClientMaterial {
        roots_pem: Some(pki.cert_pem.clone()),
        server_name: Some("localhost".to_string()),
        insecure_skip_verify: false,
    })
    .unwrap()
    .with_sink(sink)
}

/// Listener on an ephemeral localhost port with default settings
pub async fn start_listener(ctx: HandshakeContext) -> ListenerLoop {
    bind_ephemeral(ctx, ServerSettings::default()).await.unwrap()
}

/// Connect a client channel to `listener` and let the listener accept it.
///
/// Both sides must make progress for the handshake to finish, so the connect
/// runs on its own task while the listener accepts here.
pub async fn connect_pair(
    listener: &mut ListenerLoop,
    ctx: &HandshakeContext,
) -> (SecureChannel, ConnectionId) {
    let port = listener.local_addr().port();
    let ctx = ctx.clone();
    let connect = tokio::spawn(async move { SecureChannel::connect("127.0.0.1", port, &ctx).await });

    let accepted = tokio::time::timeout(TEST_TIMEOUT, listener.accept_next())
        .await
        .expect("accept timed out")
        .unwrap()
        .expect("connection was refused");

    let channel = tokio::time::timeout(TEST_TIMEOUT, connect)
        .await
        .expect("connect timed out")
        .unwrap()
        .unwrap();
    (channel, accepted)
}

/// Wait until the worker behind `id` publishes `state`
pub async fn wait_for_state(listener: &ListenerLoop, id: ConnectionId, state: HandleState) {
    let mut watch = listener
        .registry()
        .get(id)
        .expect("unknown connection")
        .watch_state();
    tokio::time::timeout(TEST_TIMEOUT, watch.wait_for(|s| *s == state))
        .await
        .expect("state not reached in time")
        .unwrap();
}

/// Read from `channel` until at least `n` bytes arrived
pub async fn read_at_least(channel: &mut SecureChannel, n: usize) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, async {
        while out.len() < n {
            out.extend(channel.read().unwrap());
            if out.len() < n {
                channel.readable().await.unwrap();
            }
        }
    })
    .await
    .expect("read timed out");
    out
}

/// Poll `condition` every few milliseconds until it holds
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
