//! Tunnel control plane, server side.
//!
//! State machine per connection: `AwaitHandshake -> Authenticating ->
//! Registering -> Serving -> Closed`, dispatching the binary frame
//! codec over the WebSocket upgrade.

use crate::registry::TunnelSession;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket};
use cok_shared::protocol::{
    ConnectRequest, ConnectResponse, DisconnectPayload, ErrorPayload, Frame, HttpResponseMessage,
    MessageType, PingPayload, PongPayload,
};
use cok_shared::{subdomain, Error};
use rand::Rng;
use tokio::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Entry point from the axum WebSocket upgrade.
pub async fn handle_socket(socket: WebSocket, state: AppState, peer_ip: String) {
    let mut socket = socket;
    let request = match await_handshake(&mut socket).await {
        Ok(req) => req,
        Err(()) => return,
    };

    if !state.connect_rate_limiter.try_consume(&peer_ip, 1.0) {
        send_error_and_close(&mut socket, 429, "rate limited").await;
        return;
    }

    let subdomain = match resolve_subdomain(&request) {
        Ok(s) => s,
        Err(msg) => {
            send_error_and_close(&mut socket, 400, &msg).await;
            return;
        }
    };

    if !state.auth.verify(&request.api_key, &subdomain) {
        send_error_and_close(&mut socket, 401, "invalid api key").await;
        return;
    }

    let (session, mut outbound_rx) = match state.registry.register(subdomain.clone(), fingerprint(&request.api_key)) {
        Ok(pair) => pair,
        Err(Error::SubdomainTaken) => {
            send_error_and_close(&mut socket, 409, "subdomain taken").await;
            return;
        }
        Err(Error::CapacityReached) => {
            send_error_and_close(&mut socket, 503, "tunnel capacity reached").await;
            return;
        }
        Err(_) => {
            send_error_and_close(&mut socket, 500, "registration failed").await;
            return;
        }
    };

    serve(socket, state, session, &mut outbound_rx).await;
}

async fn await_handshake(socket: &mut WebSocket) -> Result<ConnectRequest, ()> {
    let Some(Ok(msg)) = socket.recv().await else {
        return Err(());
    };
    let Message::Binary(data) = msg else {
        send_error_and_close(socket, 400, "expected binary ConnectRequest frame").await;
        return Err(());
    };

    let frame = match Frame::decode(&data) {
        Ok(Some((frame, _))) => frame,
        _ => {
            send_error_and_close(socket, 400, "malformed frame").await;
            return Err(());
        }
    };

    if frame.message_type() != Some(MessageType::ConnectRequest) {
        send_error_and_close(socket, 400, "expected ConnectRequest").await;
        return Err(());
    }

    match frame.decode_json::<ConnectRequest>() {
        Ok(req) => Ok(req),
        Err(_) => {
            send_error_and_close(socket, 400, "malformed ConnectRequest payload").await;
            Err(())
        }
    }
}

fn resolve_subdomain(request: &ConnectRequest) -> Result<String, String> {
    match &request.requested_subdomain {
        Some(candidate) => subdomain::validate(candidate).map_err(|e| e.to_string()),
        None => Ok(generate_subdomain()),
    }
}

fn generate_subdomain() -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    (0..8).map(|_| HEX[rng.gen_range(0..16)] as char).collect()
}

fn fingerprint(api_key: &str) -> String {
    api_key.chars().take(8).collect()
}

#[instrument(skip(socket, state, session, outbound_rx), fields(subdomain = %session.subdomain, tunnel_id = %session.id))]
async fn serve(
    mut socket: WebSocket,
    state: AppState,
    session: TunnelSession,
    outbound_rx: &mut tokio::sync::mpsc::Receiver<Vec<u8>>,
) {
    let public_url = format!("https://{}.{}", session.subdomain, state.config.base_domain);
    let ack = ConnectResponse {
        tunnel_id: session.id,
        subdomain: session.subdomain.clone(),
        session_token: fingerprint(&session.id.to_string()),
        public_url,
        expires_at: None,
    };
    let ack_frame = match Frame::encode_json(MessageType::ConnectResponse, &ack) {
        Ok(f) => f,
        Err(_) => {
            state.registry.unregister(session.id);
            return;
        }
    };
    if socket.send(Message::Binary(ack_frame.encode().into())).await.is_err() {
        state.registry.unregister(session.id);
        return;
    }
    info!("tunnel registered");

    let keepalive = Duration::from_secs(30);
    let heartbeat_deadline = Duration::from_secs(90);
    let mut last_activity = Instant::now();
    let mut ping_timer = tokio::time::interval(keepalive);

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        last_activity = Instant::now();
                        match handle_inbound_frame(&data, &state, &session) {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Reply(bytes) => {
                                if socket.send(Message::Binary(bytes.into())).await.is_err() {
                                    break;
                                }
                            }
                            FrameOutcome::Disconnect => {
                                info!("client requested disconnect");
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(d))) => {
                        let _ = socket.send(Message::Pong(d)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "control connection read error");
                        break;
                    }
                }
            }
            Some(frame_bytes) = outbound_rx.recv() => {
                if socket.send(Message::Binary(frame_bytes.into())).await.is_err() {
                    break;
                }
            }
            _ = ping_timer.tick() => {
                if last_activity.elapsed() > heartbeat_deadline {
                    warn!("heartbeat deadline exceeded, closing");
                    break;
                }
                if let Ok(ping) = Frame::encode_json(MessageType::Ping, &PingPayload { timestamp: now_ms() }) {
                    if socket.send(Message::Binary(ping.encode().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    teardown(&state, &session);
}

/// What the `serve` loop must do in response to a decoded inbound frame.
enum FrameOutcome {
    Continue,
    /// An already-encoded frame to send back over the socket.
    Reply(Vec<u8>),
    Disconnect,
}

fn handle_inbound_frame(data: &[u8], state: &AppState, session: &TunnelSession) -> FrameOutcome {
    let frame = match Frame::decode(data) {
        Ok(Some((frame, _))) => frame,
        Ok(None) => return FrameOutcome::Continue,
        Err(e) => {
            warn!(error = %e, "dropping malformed frame");
            return FrameOutcome::Continue;
        }
    };

    match frame.message_type() {
        Some(MessageType::HttpResponse) => match frame.decode_json::<HttpResponseMessage>() {
            Ok(response) => {
                session.untrack_request(response.request_id);
                state.tracker.complete(response.request_id, response);
            }
            Err(e) => warn!(error = %e, "malformed HTTPResponse payload"),
        },
        Some(MessageType::Ping) => match frame.decode_json::<PingPayload>() {
            Ok(ping) => {
                let pong = PongPayload { ping_timestamp: ping.timestamp };
                match Frame::encode_json(MessageType::Pong, &pong) {
                    Ok(f) => return FrameOutcome::Reply(f.encode()),
                    Err(e) => warn!(error = %e, "failed to encode Pong reply"),
                }
            }
            Err(e) => warn!(error = %e, "malformed Ping payload"),
        },
        Some(MessageType::Pong) => {
            let _ = frame.decode_json::<PongPayload>();
        }
        Some(MessageType::Error) => match frame.decode_json::<ErrorPayload>() {
            Ok(payload) => warn!(code = payload.code, message = %payload.message, "client reported error"),
            Err(_) => warn!("malformed Error payload"),
        },
        Some(MessageType::Disconnect) => return FrameOutcome::Disconnect,
        Some(other) => warn!(?other, "unexpected message type on control channel"),
        None => warn!("unknown message type, ignoring"),
    }

    FrameOutcome::Continue
}

fn teardown(state: &AppState, session: &TunnelSession) {
    state.registry.unregister(session.id);
    let owned = session.owned_request_ids();
    if !owned.is_empty() {
        warn!(count = owned.len(), "failing pending requests on disconnect");
    }
    state.tracker.fail_all(&owned, || Error::TransportClosed);
    info!("tunnel closed");
}

async fn send_error_and_close(socket: &mut WebSocket, code: u16, message: &str) {
    if let Ok(frame) = Frame::encode_json(
        MessageType::Error,
        &ErrorPayload { code, message: message.to_string() },
    ) {
        let _ = socket.send(Message::Binary(frame.encode().into())).await;
    }
    let _ = socket
        .send(Message::Binary(
            Frame::encode_json(MessageType::Disconnect, &DisconnectPayload::default())
                .map(|f| f.encode())
                .unwrap_or_default()
                .into(),
        ))
        .await;
    let _ = socket.close().await;
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
