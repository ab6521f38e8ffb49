//! End-to-end tests driving a real server through `tandem-client`.

use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tandem_client::{ClientConfig, ClientError, ClientEvent, ClientState, SignalingClient};
use tandem_core::{
    MemoryCallLog, MemoryDirectory, RelationshipStatus, StaticTokens,
};
use tandem_protocol::{ClientIdentity, ContactSummary, Frame, Role, SignalType};
use tandem_server::{serve, AppState, Config};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(200);

struct TestServer {
    addr: SocketAddr,
    state: Arc<AppState>,
    call_log: Arc<MemoryCallLog>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start(config: Config, tokens: StaticTokens, directory: MemoryDirectory) -> Self {
        let call_log = Arc::new(MemoryCallLog::new());
        let state = Arc::new(AppState::with_collaborators(
            config,
            Arc::new(tokens),
            Arc::new(directory),
            call_log.clone(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, signal) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, Arc::clone(&state), async move {
            let _ = signal.await;
        }));

        Self {
            addr,
            state,
            call_log,
            shutdown: Some(shutdown),
            task,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    async fn connect(&self, path: &str, token: &str) -> SignalingClient {
        SignalingClient::connect(&self.url(path), token, quiet_client())
            .await
            .unwrap()
    }

    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = tokio::time::timeout(WAIT, &mut self.task).await;
    }
}

fn quiet_client() -> ClientConfig {
    ClientConfig {
        heartbeat_interval: None,
    }
}

async fn next_frame(client: &mut SignalingClient) -> Frame {
    let received = client.next_timeout(WAIT).await.expect("no message from relay");
    received.frame().cloned().expect("not a known frame")
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

struct Pair {
    tokens: StaticTokens,
    directory: MemoryDirectory,
    ada: ClientIdentity,
    bob: ClientIdentity,
}

fn contacts() -> Pair {
    let ada = ClientIdentity::generate();
    let bob = ClientIdentity::generate();

    let tokens = StaticTokens::new();
    tokens.insert("ada-token", ada);
    tokens.insert("bob-token", bob);

    let directory = MemoryDirectory::new();
    directory.add_user(ada, "Ada", None);
    directory.add_user(bob, "Bob", None);
    directory.add_relationship(ada, bob, RelationshipStatus::Accepted);

    Pair {
        tokens,
        directory,
        ada,
        bob,
    }
}

#[tokio::test]
async fn test_bad_token_is_rejected_before_upgrade() {
    let Pair { tokens, directory, .. } = contacts();
    let server = TestServer::start(Config::default(), tokens, directory).await;

    for token in ["wrong", ""] {
        let result =
            SignalingClient::connect(&server.url("/ws/direct"), token, quiet_client()).await;
        assert!(matches!(result, Err(ClientError::Rejected(401))));
    }
    assert_eq!(server.state.switchboard.stats().online, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_connection_limit() {
    let Pair { tokens, directory, .. } = contacts();
    let mut config = Config::default();
    config.limits.max_connections = 1;
    let server = TestServer::start(config, tokens, directory).await;

    let mut ada = server.connect("/ws/direct", "ada-token").await;
    assert!(matches!(next_frame(&mut ada).await, Frame::OnlineContacts { .. }));

    let result =
        SignalingClient::connect(&server.url("/ws/direct"), "bob-token", quiet_client()).await;
    assert!(matches!(result, Err(ClientError::Rejected(503))));

    ada.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_presence_between_contacts() {
    let Pair {
        tokens,
        directory,
        ada: ada_id,
        bob: bob_id,
    } = contacts();
    let server = TestServer::start(Config::default(), tokens, directory).await;

    let mut ada = server.connect("/ws/direct", "ada-token").await;
    assert_eq!(
        next_frame(&mut ada).await,
        Frame::online_contacts(Vec::new())
    );

    let mut bob = server.connect("/ws/direct", "bob-token").await;
    assert_eq!(
        next_frame(&mut bob).await,
        Frame::online_contacts(vec![ContactSummary::new(ada_id, Some("Ada".into()))])
    );

    let mut ada_state = ClientState::new();
    let event = ada_state.apply(&next_frame(&mut ada).await);
    assert_eq!(event, ClientEvent::RosterChanged);
    assert!(ada_state.roster.contains(&bob_id));

    bob.close().await;
    let event = ada_state.apply(&next_frame(&mut ada).await);
    assert_eq!(event, ClientEvent::RosterChanged);
    assert!(ada_state.roster.is_empty());

    ada.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_signal_is_relayed_verbatim() {
    let Pair {
        tokens,
        directory,
        ada: ada_id,
        bob: bob_id,
    } = contacts();
    let server = TestServer::start(Config::default(), tokens, directory).await;

    let mut ada = server.connect("/ws/direct", "ada-token").await;
    let mut bob = server.connect("/ws/direct", "bob-token").await;
    next_frame(&mut ada).await; // online-contacts
    next_frame(&mut ada).await; // contact-online
    next_frame(&mut bob).await; // online-contacts

    let offer = json!({
        "type": "signal",
        "to": bob_id.to_string(),
        "from": ada_id.to_string(),
        "signalType": "offer",
        "signalData": {"type": "offer", "sdp": "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\n"}
    });
    ada.send_json(&offer).unwrap();

    let received = bob.next_timeout(WAIT).await.unwrap();
    assert_eq!(received.text, serde_json::to_string(&offer).unwrap());

    let mut bob_state = ClientState::new();
    let event = bob_state.apply(received.frame().unwrap());
    assert_eq!(event, ClientEvent::IncomingCall { from: ada_id });

    // Candidates follow in order.
    for n in 0..5 {
        ada.send_signal(bob_id, ada_id, SignalType::IceCandidate, json!({"n": n}))
            .unwrap();
    }
    for n in 0..5 {
        match next_frame(&mut bob).await {
            Frame::Signal(envelope) => assert_eq!(envelope.signal_data, json!({"n": n})),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    // A forged sender is dropped.
    ada.send_signal(bob_id, bob_id, SignalType::HangUp, json!(null))
        .unwrap();
    assert!(bob.next_timeout(QUIET).await.is_none());

    ada.close().await;
    bob.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_reconnect_replaces_old_connection() {
    let Pair {
        tokens,
        directory,
        ada: ada_id,
        ..
    } = contacts();
    let server = TestServer::start(Config::default(), tokens, directory).await;

    let mut bob = server.connect("/ws/direct", "bob-token").await;
    next_frame(&mut bob).await;

    let first = server.connect("/ws/direct", "ada-token").await;
    assert!(matches!(next_frame(&mut bob).await, Frame::ContactOnline { .. }));
    let mut second = server.connect("/ws/direct", "ada-token").await;
    next_frame(&mut second).await;
    assert!(matches!(next_frame(&mut bob).await, Frame::ContactOnline { .. }));

    // Closing the stale connection does not take the identity offline.
    first.close().await;
    assert!(bob.next_timeout(QUIET).await.is_none());
    assert!(server.state.switchboard.registry().lookup(&ada_id).is_some());

    second.close().await;
    assert!(matches!(next_frame(&mut bob).await, Frame::ContactOffline { .. }));

    bob.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_random_pairing_flow() {
    let tokens = StaticTokens::new();
    for name in ["one", "two", "three"] {
        tokens.insert(name, ClientIdentity::generate());
    }
    let server = TestServer::start(Config::default(), tokens, MemoryDirectory::new()).await;

    let mut one = server.connect("/ws/random", "one").await;
    wait_for(|| server.state.switchboard.stats().waiting == 1).await;
    let mut two = server.connect("/ws/random", "two").await;

    let (pair_one, role_one) = match next_frame(&mut one).await {
        Frame::MatchFound { pair_id, role } => (pair_id, role),
        other => panic!("unexpected frame {other:?}"),
    };
    let (pair_two, role_two) = match next_frame(&mut two).await {
        Frame::MatchFound { pair_id, role } => (pair_id, role),
        other => panic!("unexpected frame {other:?}"),
    };
    assert_eq!(pair_one, pair_two);
    assert_eq!(role_one, Role::Initiator);
    assert_eq!(role_two, Role::Responder);

    let offer = json!({"type": "offer", "sdp": "v=0"});
    one.send_json(&offer).unwrap();
    let received = two.next_timeout(WAIT).await.unwrap();
    assert_eq!(received.text, serde_json::to_string(&offer).unwrap());

    // A third participant waits alone.
    let mut three = server.connect("/ws/random", "three").await;
    assert!(three.next_timeout(QUIET).await.is_none());

    one.close().await;
    assert_eq!(next_frame(&mut two).await, Frame::PeerDisconnected);
    wait_for(|| server.state.switchboard.stats().sessions == 0).await;
    wait_for(|| {
        server
            .call_log
            .records()
            .first()
            .is_some_and(|record| record.ended_at.is_some())
    })
    .await;

    two.close().await;
    three.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_silent_connection_is_reaped() {
    let tokens = StaticTokens::new();
    tokens.insert("quiet", ClientIdentity::generate());
    tokens.insert("chatty", ClientIdentity::generate());

    let mut config = Config::default();
    config.heartbeat.timeout_ms = 300;
    config.heartbeat.reap_interval_ms = 50;
    let server = TestServer::start(config, tokens, MemoryDirectory::new()).await;

    let mut quiet = server.connect("/ws/random", "quiet").await;
    let mut chatty = SignalingClient::connect(
        &server.url("/ws/random"),
        "chatty",
        ClientConfig {
            heartbeat_interval: Some(Duration::from_millis(50)),
        },
    )
    .await
    .unwrap();

    // Both get paired, then the quiet side goes silent.
    assert!(matches!(next_frame(&mut quiet).await, Frame::MatchFound { .. }));
    assert!(matches!(next_frame(&mut chatty).await, Frame::MatchFound { .. }));

    let closed = tokio::time::timeout(WAIT, async {
        while quiet.next().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "quiet connection was not closed");
    assert_eq!(next_frame(&mut chatty).await, Frame::PeerDisconnected);

    chatty.close().await;
    server.stop().await;
}

#[tokio::test]
async fn test_health_endpoint() {
    let Pair { tokens, directory, .. } = contacts();
    let server = TestServer::start(Config::default(), tokens, directory).await;

    let mut ada = server.connect("/ws/direct", "ada-token").await;
    next_frame(&mut ada).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let health: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["online"], 1);
    assert_eq!(health["waiting"], 0);

    ada.close().await;
    server.stop().await;
}
