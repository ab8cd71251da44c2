//! The task behind one authenticated socket.
//!
//! Frames from the socket are handled one at a time, so a member's updates
//! are merged and relayed in the order it sent them. Broadcasts from the room
//! arrive on a per-member receiver and are filtered by origin and channel.
//! A protocol error closes this socket only; the room and every other member
//! carry on.

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::Identity;
use crate::gateway::{ConnectRequest, CLOSE_GOING_AWAY, CLOSE_PROTOCOL_ERROR};
use crate::locks::LockOwner;
use crate::protocol::{ChannelKind, PeerInfo, ProtocolError, SyncMessage};
use crate::room::{Member, Room};
use crate::service::{ServiceContext, SyncError};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

async fn send(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), SyncError> {
    sink.send(Message::Binary(msg.encode()?.into())).await?;
    Ok(())
}

async fn send_close(sink: &mut WsSink, code: u16, reason: &'static str) {
    let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        log::debug!("Close ({code}) not delivered: {e}");
    }
}

/// Handle one decoded client frame. Returns a reply for this socket only.
async fn handle_message(
    room: &Room,
    peer: &PeerInfo,
    channel: ChannelKind,
    msg: SyncMessage,
) -> Result<Option<SyncMessage>, ProtocolError> {
    if msg.is_replica_traffic() && !channel.carries_replica() {
        return Err(ProtocolError::UnexpectedMessage(msg.kind()));
    }
    match msg {
        SyncMessage::SyncStep1 { state_vector } => {
            let update = room.diff_since(&state_vector).await?;
            Ok(Some(SyncMessage::SyncStep2 { update }))
        }
        SyncMessage::SyncStep2 { update } | SyncMessage::Update { update } => {
            room.apply_update(peer.conn_id, update).await?;
            Ok(None)
        }
        SyncMessage::Awareness { clock, state } => {
            room.set_awareness(peer, clock, state).await;
            Ok(None)
        }
        SyncMessage::LockAcquire { shape_id } => {
            match room.acquire_lock(shape_id, LockOwner::session(peer.user_id.clone(), peer.conn_id)).await {
                Ok(_) => Ok(None),
                Err(w) => Ok(Some(SyncMessage::LockDenied { shape_id: w.shape_id, owner: w.owner })),
            }
        }
        SyncMessage::LockRelease { shape_id } => match room.release_lock(&shape_id, Some(&peer.user_id)).await {
            Ok(_) => Ok(None),
            Err(w) => Ok(Some(SyncMessage::LockDenied { shape_id: w.shape_id, owner: w.owner })),
        },
        other => Err(ProtocolError::UnexpectedMessage(other.kind())),
    }
}

/// Run an authenticated socket until it closes, times out, misbehaves or the
/// service shuts down. The member is always removed from its room on exit.
pub(crate) async fn run(ws: WebSocketStream<TcpStream>, identity: Identity, request: ConnectRequest, ctx: ServiceContext) {
    let ServiceContext { config, registry, counters, mut shutdown, .. } = ctx;
    let ConnectRequest { doc_id, channel, .. } = request;
    let peer = PeerInfo::new(Uuid::new_v4(), identity.user_id, identity.display_name);
    let conn_id = peer.conn_id;

    counters.active.fetch_add(1, Ordering::AcqRel);
    let room: Arc<Room> = registry.join(&doc_id, Member::new(peer.clone(), channel)).await;
    let (mut rx, handshake) = room.open_session(&peer, channel).await;
    let (mut sink, mut stream) = ws.split();

    let mut open = true;
    for msg in &handshake {
        if let Err(e) = send(&mut sink, msg).await {
            log::debug!("Handshake to {conn_id} failed: {e}");
            open = false;
            break;
        }
    }

    let mut heartbeat = interval_at(Instant::now() + config.heartbeat_interval, config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    while open {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        if *shutdown.borrow() {
                            // Rooms may already be flushed, nothing more is merged
                            send_close(&mut sink, CLOSE_GOING_AWAY, "server shutting down").await;
                            break;
                        }
                        counters.messages.fetch_add(1, Ordering::Relaxed);
                        counters.bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                        let handled = match SyncMessage::decode(&data) {
                            Ok(msg) => {
                                log::trace!("{conn_id} → {}: {}", doc_id, msg.kind());
                                handle_message(&room, &peer, channel, msg).await
                            }
                            Err(e) => Err(e),
                        };
                        match handled {
                            Ok(Some(reply)) => {
                                if let Err(e) = send(&mut sink, &reply).await {
                                    log::debug!("Send to {conn_id} failed: {e}");
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                log::warn!("Protocol error from {conn_id} in {doc_id}, closing: {e}");
                                send_close(&mut sink, CLOSE_PROTOCOL_ERROR, "protocol error").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        last_seen = Instant::now();
                        log::debug!("Ignoring text frame from {conn_id}");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::debug!("{conn_id} closed its socket");
                        break;
                    }
                    Some(Err(e)) => {
                        log::debug!("Socket error on {conn_id}: {e}");
                        break;
                    }
                }
            }
            outbound = rx.recv() => {
                match outbound {
                    Ok(out) => {
                        if !out.is_for(conn_id, channel.carries_replica()) {
                            continue;
                        }
                        if let Err(e) = sink.send(Message::Binary(out.frame.to_vec().into())).await {
                            log::debug!("Send to {conn_id} failed: {e}");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("{conn_id} lagged {missed} frames behind in {doc_id}, resynchronizing");
                        room.record_dropped(missed);
                        let mut failed = false;
                        for msg in room.resync_frames(channel).await {
                            if send(&mut sink, &msg).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > config.heartbeat_timeout {
                    log::warn!("{conn_id} silent for {:?}, dropping", last_seen.elapsed());
                    send_close(&mut sink, CLOSE_GOING_AWAY, "heartbeat timeout").await;
                    break;
                }
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => {
                send_close(&mut sink, CLOSE_GOING_AWAY, "server shutting down").await;
                break;
            }
        }
    }

    registry.leave(&doc_id, &peer).await;
    counters.connection_closed();
    log::info!("{} ({conn_id}) disconnected from {doc_id}", peer.user_id);
}
