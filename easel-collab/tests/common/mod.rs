//! Shared harness: a real server on an ephemeral port and a raw WebSocket
//! client that keeps its own replica.

#![allow(dead_code)]

use easel_collab::storage::DocumentStore;
use easel_collab::{PeerInfo, ServerConfig, StaticVerifier, SyncMessage, SyncService};
use easel_core::{Replica, ShapeOp};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub service: Arc<SyncService>,
    pub addr: SocketAddr,
}

fn verifier() -> StaticVerifier {
    StaticVerifier::new()
        .with_token("alice-token", "alice", "Alice")
        .with_token("bob-token", "bob", "Bob")
        .with_token("carol-token", "carol", "Carol")
}

pub async fn start_with(store: Arc<dyn DocumentStore>, config: ServerConfig) -> TestServer {
    let _ = env_logger::builder().is_test(true).try_init();
    let service = Arc::new(SyncService::new(config, store, Arc::new(verifier())));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::clone(&service);
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    TestServer { service, addr }
}

pub async fn start(store: Arc<dyn DocumentStore>) -> TestServer {
    start_with(store, ServerConfig::for_testing()).await
}

pub async fn connect_raw(addr: SocketAddr, target: &str) -> Socket {
    let url = format!("ws://{addr}{target}");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

/// Read until the server closes the socket; returns the close code.
pub async fn close_code(ws: &mut Socket) -> Option<u16> {
    loop {
        match timeout(WAIT, ws.next()).await.expect("no close frame") {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

/// Poll `check` until it holds, for up to five seconds.
pub async fn eventually<F, Fut>(what: &str, check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

pub struct Client {
    pub ws: Socket,
    pub peer: PeerInfo,
    pub replica: Replica,
    pending: VecDeque<SyncMessage>,
}

impl Client {
    /// Connect on the sync channel, read the handshake and pull the
    /// server's state.
    pub async fn join(addr: SocketAddr, doc: &str, token: &str) -> Self {
        Self::join_with(addr, doc, token, Replica::new()).await
    }

    /// Like [`join`](Self::join), but starting from an existing local
    /// replica, which is pushed to the server before pulling.
    pub async fn join_with(addr: SocketAddr, doc: &str, token: &str, replica: Replica) -> Self {
        let ws = connect_raw(addr, &format!("/{doc}?token={token}")).await;
        let mut client = Self::handshake(ws, replica).await;

        if !client.replica.is_empty() {
            let state = client.replica.encode_state();
            client.send(&SyncMessage::SyncStep2 { update: state }).await;
        }
        let sv = client.replica.state_vector();
        client.send(&SyncMessage::SyncStep1 { state_vector: sv }).await;
        let SyncMessage::SyncStep2 { update } = client.expect("sync_step2").await else { unreachable!() };
        client.replica.apply_update(&update).unwrap();
        client
    }

    /// Connect on the presence channel.
    pub async fn join_presence(addr: SocketAddr, doc: &str, token: &str) -> Self {
        let ws = connect_raw(addr, &format!("/{doc}?token={token}&channel=presence")).await;
        Self::handshake(ws, Replica::new()).await
    }

    async fn handshake(ws: Socket, replica: Replica) -> Self {
        let mut client = Self { ws, peer: PeerInfo::new(uuid::Uuid::nil(), "", ""), replica, pending: VecDeque::new() };
        let SyncMessage::Welcome { peer } = client.expect("welcome").await else { unreachable!() };
        client.peer = peer;
        client.expect("lock_snapshot").await;
        client
    }

    pub async fn send(&mut self, msg: &SyncMessage) {
        self.ws.send(Message::Binary(msg.encode().unwrap().into())).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    /// Apply an edit locally and push the resulting update.
    pub async fn edit(&mut self, op: ShapeOp) {
        let update = self.replica.apply_op(&op).unwrap();
        self.send(&SyncMessage::Update { update }).await;
    }

    async fn recv(&mut self) -> SyncMessage {
        loop {
            let frame = timeout(WAIT, self.ws.next()).await.expect("no frame from server");
            match frame {
                Some(Ok(Message::Binary(data))) => return SyncMessage::decode(&data).unwrap(),
                Some(Ok(Message::Close(frame))) => panic!("server closed the socket: {frame:?}"),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    }

    /// Next message of `kind`. Other messages are kept for later calls.
    pub async fn expect(&mut self, kind: &str) -> SyncMessage {
        if let Some(pos) = self.pending.iter().position(|m| m.kind() == kind) {
            return self.pending.remove(pos).unwrap();
        }
        loop {
            let msg = self.recv().await;
            if msg.kind() == kind {
                return msg;
            }
            self.pending.push_back(msg);
        }
    }

    /// Whether a message of `kind` was received and not consumed yet.
    pub fn has_pending(&self, kind: &str) -> bool {
        self.pending.iter().any(|m| m.kind() == kind)
    }

    /// Wait for the next relayed update and merge it.
    pub async fn absorb_update(&mut self) {
        let SyncMessage::Update { update } = self.expect("update").await else { unreachable!() };
        self.replica.apply_update(&update).unwrap();
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        // Drain until the server acknowledges
        while let Ok(Some(Ok(_))) = timeout(WAIT, self.ws.next()).await {}
    }
}
