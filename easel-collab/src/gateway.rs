//! Connection gateway: WebSocket handshake, request parsing and
//! authentication.
//!
//! A socket connects to `ws://host/<documentId>?token=<bearer>` (add
//! `&channel=presence` for the presence sub-channel). Nothing about the room
//! is touched until the token is verified: a refused socket is closed with
//! [`CLOSE_UNAUTHORIZED`] after a single warning, and no room is created,
//! loaded or logged about.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use url::form_urlencoded;

use crate::auth::authenticate;
use crate::connection;
use crate::protocol::ChannelKind;
use crate::service::ServiceContext;
use crate::storage::DocId;

/// Credential missing, invalid, expired or unverifiable.
pub const CLOSE_UNAUTHORIZED: u16 = 4001;
/// No usable document id in the path, or an unknown channel.
pub const CLOSE_BAD_REQUEST: u16 = 4004;
/// Malformed or out-of-place frame.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_GOING_AWAY: u16 = 1001;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("No document id in path")]
    MissingDocument,
    #[error("Invalid document id '{0}'")]
    InvalidDocument(String),
    #[error("Unknown channel '{0}'")]
    UnknownChannel(String),
    #[error("Malformed percent-encoding")]
    Encoding,
}

/// What a socket asked for in its connect URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub doc_id: DocId,
    pub token: Option<String>,
    pub channel: ChannelKind,
}

impl ConnectRequest {
    /// Parse the path-and-query part of a connect URL.
    pub fn parse(target: &str) -> Result<Self, RequestError> {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        let path = path.strip_prefix('/').unwrap_or(path);
        check_escapes(path)?;
        let raw = urlencoding::decode(path).map_err(|_| RequestError::Encoding)?.into_owned();
        if raw.is_empty() {
            return Err(RequestError::MissingDocument);
        }
        let doc_id = DocId::parse(&raw).ok_or(RequestError::InvalidDocument(raw))?;

        check_escapes(query)?;
        let mut token = None;
        let mut channel = ChannelKind::Sync;
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "token" => token = Some(value.into_owned()),
                "channel" => {
                    channel = match value.as_ref() {
                        "sync" => ChannelKind::Sync,
                        "presence" => ChannelKind::Presence,
                        other => return Err(RequestError::UnknownChannel(other.to_string())),
                    }
                }
                _ => {}
            }
        }
        Ok(Self { doc_id, token, channel })
    }
}

/// Every `%` must open a two-hex-digit escape. The decoders pass malformed
/// escapes through as literal text instead of failing.
fn check_escapes(raw: &str) -> Result<(), RequestError> {
    let bytes = raw.as_bytes();
    for (i, _) in raw.match_indices('%') {
        match bytes.get(i + 1..i + 3) {
            Some([hi, lo]) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {}
            _ => return Err(RequestError::Encoding),
        }
    }
    Ok(())
}

/// Send a close frame and drop the socket.
pub(crate) async fn close<S>(ws: &mut WebSocketStream<S>, code: u16, reason: &'static str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame { code: CloseCode::from(code), reason: reason.into() };
    if let Err(e) = ws.close(Some(frame)).await {
        log::debug!("Close ({code}) not delivered: {e}");
    }
}

/// Handshake, parse, authenticate, then hand over to the connection loop.
pub(crate) async fn handle_socket(stream: TcpStream, addr: SocketAddr, ctx: ServiceContext) {
    let mut target: Option<String> = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        target = req.uri().path_and_query().map(|pq| pq.as_str().to_string());
        Ok(resp)
    };
    let mut ws = match accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            log::debug!("WebSocket handshake with {addr} failed: {e}");
            return;
        }
    };

    let request = match ConnectRequest::parse(target.as_deref().unwrap_or("/")) {
        Ok(request) => request,
        Err(e) => {
            ctx.counters.rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!("Rejected socket from {addr}: {e}");
            close(&mut ws, CLOSE_BAD_REQUEST, "bad request").await;
            return;
        }
    };

    let verified = authenticate(ctx.verifier.as_ref(), request.token.as_deref(), ctx.config.auth_timeout).await;
    let identity = match verified {
        Ok(identity) => identity,
        Err(e) => {
            ctx.counters.rejected.fetch_add(1, Ordering::Relaxed);
            log::warn!("Unauthorized socket from {addr}: {e}");
            close(&mut ws, CLOSE_UNAUTHORIZED, "unauthorized").await;
            return;
        }
    };

    if *ctx.shutdown.borrow() {
        close(&mut ws, CLOSE_GOING_AWAY, "server shutting down").await;
        return;
    }

    log::info!(
        "{} ({}) connected to {} from {addr} on {:?} channel",
        identity.display_name,
        identity.user_id,
        request.doc_id,
        request.channel
    );
    connection::run(ws, identity, request, ctx).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sync_request() {
        let request = ConnectRequest::parse("/doc-1?token=abc.def").unwrap();
        assert_eq!(request.doc_id, DocId::from("doc-1"));
        assert_eq!(request.token.as_deref(), Some("abc.def"));
        assert_eq!(request.channel, ChannelKind::Sync);
    }

    #[test]
    fn test_parse_presence_and_encoding() {
        let request = ConnectRequest::parse("/my%20board?channel=presence&token=a%2Bb&x=1").unwrap();
        assert_eq!(request.doc_id.as_str(), "my board");
        assert_eq!(request.token.as_deref(), Some("a+b"));
        assert_eq!(request.channel, ChannelKind::Presence);
    }

    #[test]
    fn test_parse_without_token() {
        assert_eq!(ConnectRequest::parse("/doc").unwrap().token, None);
    }

    #[test]
    fn test_parse_rejections() {
        assert_eq!(ConnectRequest::parse("/?token=t"), Err(RequestError::MissingDocument));
        assert_eq!(ConnectRequest::parse("/"), Err(RequestError::MissingDocument));
        assert!(matches!(ConnectRequest::parse("/a/b"), Err(RequestError::InvalidDocument(_))));
        assert!(matches!(ConnectRequest::parse("/d?channel=video"), Err(RequestError::UnknownChannel(_))));
        assert_eq!(ConnectRequest::parse("/d%zz"), Err(RequestError::Encoding));
        assert_eq!(ConnectRequest::parse("/d%2"), Err(RequestError::Encoding));
        assert_eq!(ConnectRequest::parse("/d%FF"), Err(RequestError::Encoding));
    }

    #[test]
    fn test_socket_task_is_spawnable() {
        fn spawnable<F>(_: impl Fn(TcpStream, SocketAddr, ServiceContext) -> F)
        where
            F: std::future::Future<Output = ()> + Send + 'static,
        {
        }
        spawnable(handle_socket);
    }

    #[test]
    fn test_signed_escape_is_not_hex() {
        assert_eq!(ConnectRequest::parse("/d?token=%+41"), Err(RequestError::Encoding));
        assert_eq!(ConnectRequest::parse("/%+41"), Err(RequestError::Encoding));
        assert_eq!(ConnectRequest::parse("/d?token=ab%zz"), Err(RequestError::Encoding));
    }

    #[test]
    fn test_query_plus_is_space_but_path_plus_is_literal() {
        let request = ConnectRequest::parse("/a+b?token=x+y").unwrap();
        assert_eq!(request.doc_id.as_str(), "a+b");
        assert_eq!(request.token.as_deref(), Some("x y"));
    }
}
