//! Client session.
//!
//! Owns the transport, the reconnect loop, the circuit breaker gating
//! reconnect attempts, and local-origin forwarding via a
//! semaphore-bounded forwarding pool.

use cok_shared::circuit::{CircuitBreaker, CircuitBreakerConfig};
use cok_shared::protocol::{
    ConnectRequest, ConnectResponse, ErrorPayload, Frame, HttpRequestMessage, HttpResponseMessage,
    MessageType, PingPayload, PongPayload,
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

/// Bound on concurrent `forward_to_origin` tasks.
const MAX_CONCURRENT_FORWARDS: usize = 64;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SessionConfig {
    pub server_url: String,
    pub api_key: String,
    pub requested_subdomain: Option<String>,
    pub local_host: String,
    pub local_port: u16,
    /// `None` retries forever. Set via `COK_MAX_RECONNECT_ATTEMPTS`;
    /// there is no CLI flag for this.
    pub max_attempts: Option<u32>,
}

/// Why the reconnect loop gave up. Maps directly onto the CLI's exit codes.
pub enum GiveUp {
    /// Fatal — auth or protocol error the server will never accept;
    /// retrying would not help (exit code 1).
    Fatal(String),
    /// Reconnect attempts exhausted after repeated transient failures
    /// (exit code 2).
    Exhausted,
}

pub struct ClientSession {
    config: SessionConfig,
    breaker: CircuitBreaker,
    http: reqwest::Client,
}

impl ClientSession {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            breaker: CircuitBreaker::new(CircuitBreakerConfig::default()),
            http: reqwest::Client::new(),
        }
    }

    /// Run the reconnect loop forever, or until a fatal error occurs.
    pub async fn run(&self) -> Result<(), GiveUp> {
        let mut attempt: u32 = 0;
        loop {
            if !self.breaker.allow_attempt().await {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }

            match self.connect_and_run().await {
                Ok(()) => {
                    self.breaker.record_success().await;
                    attempt = 0;
                }
                Err(ConnectError::Fatal(msg)) => {
                    return Err(GiveUp::Fatal(msg));
                }
                Err(ConnectError::Transient(msg)) => {
                    warn!(error = %msg, "connection lost, will retry");
                    self.breaker.record_failure().await;
                    attempt = attempt.saturating_add(1);
                    if let Some(max) = self.config.max_attempts {
                        if attempt >= max {
                            return Err(GiveUp::Exhausted);
                        }
                    }
                    let delay = backoff(attempt);
                    info!(delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn connect_and_run(&self) -> Result<(), ConnectError> {
        info!(server = %self.config.server_url, "connecting");
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.server_url)
            .await
            .map_err(|e| ConnectError::Transient(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let hello = ConnectRequest {
            api_key: self.config.api_key.clone(),
            requested_subdomain: self.config.requested_subdomain.clone(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            capabilities: vec![],
        };
        let frame = Frame::encode_json(MessageType::ConnectRequest, &hello)
            .map_err(|e| ConnectError::Fatal(e.to_string()))?;
        write
            .send(Message::Binary(frame.encode()))
            .await
            .map_err(|e| ConnectError::Transient(e.to_string()))?;

        let ack = await_connect_response(&mut read).await?;
        info!(subdomain = %ack.subdomain, public_url = %ack.public_url, "tunnel active");

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(256);
        let forward_permits = Arc::new(Semaphore::new(MAX_CONCURRENT_FORWARDS));
        let mut last_pong = Instant::now();
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);

        loop {
            tokio::select! {
                incoming = read.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => {
                            match self.dispatch_inbound(&data, &outbound_tx, &forward_permits, &mut last_pong) {
                                DispatchOutcome::Continue => {}
                                DispatchOutcome::Reply(bytes) => {
                                    if write.send(Message::Binary(bytes)).await.is_err() {
                                        return Err(ConnectError::Transient("failed to write frame".into()));
                                    }
                                }
                                DispatchOutcome::Disconnect => {
                                    return Err(ConnectError::Transient("server requested disconnect".into()));
                                }
                            }
                        }
                        Some(Ok(Message::Ping(d))) => {
                            let _ = write.send(Message::Pong(d)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(ConnectError::Transient("server closed connection".into()));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(ConnectError::Transient(e.to_string())),
                    }
                }
                Some(bytes) = outbound_rx.recv() => {
                    if write.send(Message::Binary(bytes)).await.is_err() {
                        return Err(ConnectError::Transient("failed to write frame".into()));
                    }
                }
                _ = heartbeat.tick() => {
                    if last_pong.elapsed() > HEARTBEAT_INTERVAL * 2 {
                        return Err(ConnectError::Transient("heartbeat timeout".into()));
                    }
                    if let Ok(ping) = Frame::encode_json(MessageType::Ping, &PingPayload { timestamp: now_ms() }) {
                        if write.send(Message::Binary(ping.encode())).await.is_err() {
                            return Err(ConnectError::Transient("failed to send ping".into()));
                        }
                    }
                }
            }
        }
    }

    fn dispatch_inbound(
        &self,
        data: &[u8],
        outbound_tx: &mpsc::Sender<Vec<u8>>,
        permits: &Arc<Semaphore>,
        last_pong: &mut Instant,
    ) -> DispatchOutcome {
        let frame = match Frame::decode(data) {
            Ok(Some((frame, _))) => frame,
            Ok(None) => return DispatchOutcome::Continue,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame from server");
                return DispatchOutcome::Continue;
            }
        };

        match frame.message_type() {
            Some(MessageType::HttpRequest) => match frame.decode_json::<HttpRequestMessage>() {
                Ok(request) => self.spawn_forward(request, outbound_tx.clone(), permits.clone()),
                Err(e) => warn!(error = %e, "malformed HTTPRequest payload"),
            },
            Some(MessageType::Ping) => match frame.decode_json::<PingPayload>() {
                Ok(ping) => {
                    let pong = PongPayload { ping_timestamp: ping.timestamp };
                    match Frame::encode_json(MessageType::Pong, &pong) {
                        Ok(f) => return DispatchOutcome::Reply(f.encode()),
                        Err(e) => warn!(error = %e, "failed to encode Pong reply"),
                    }
                }
                Err(e) => warn!(error = %e, "malformed Ping payload"),
            },
            Some(MessageType::Pong) => {
                if frame.decode_json::<PongPayload>().is_ok() {
                    *last_pong = Instant::now();
                }
            }
            Some(MessageType::Error) => match frame.decode_json::<ErrorPayload>() {
                Ok(payload) => error!(code = payload.code, message = %payload.message, "server reported error"),
                Err(_) => warn!("malformed Error payload"),
            },
            Some(MessageType::Disconnect) => return DispatchOutcome::Disconnect,
            Some(other) => warn!(?other, "unexpected message type"),
            None => warn!("unknown message type, ignoring"),
        }

        DispatchOutcome::Continue
    }

    fn spawn_forward(&self, request: HttpRequestMessage, outbound_tx: mpsc::Sender<Vec<u8>>, permits: Arc<Semaphore>) {
        let http = self.http.clone();
        let host = self.config.local_host.clone();
        let port = self.config.local_port;
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let response = forward_to_origin(&http, &host, port, request).await;
            if let Ok(frame) = Frame::encode_json(MessageType::HttpResponse, &response) {
                let _ = outbound_tx.send(frame.encode()).await;
            }
        });
    }
}

enum ConnectError {
    Fatal(String),
    Transient(String),
}

/// What `connect_and_run`'s reader loop must do in response to a decoded frame.
enum DispatchOutcome {
    Continue,
    /// An already-encoded frame to send back over the socket.
    Reply(Vec<u8>),
    Disconnect,
}

async fn await_connect_response(
    read: &mut futures_util::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    >,
) -> Result<ConnectResponse, ConnectError> {
    let Some(msg) = read.next().await else {
        return Err(ConnectError::Transient("connection closed before handshake ack".into()));
    };
    let msg = msg.map_err(|e| ConnectError::Transient(e.to_string()))?;
    let Message::Binary(data) = msg else {
        return Err(ConnectError::Transient("expected binary handshake ack".into()));
    };

    let frame = Frame::decode(&data)
        .map_err(|e| ConnectError::Fatal(e.to_string()))?
        .ok_or_else(|| ConnectError::Transient("truncated handshake ack".into()))?
        .0;

    match frame.message_type() {
        Some(MessageType::ConnectResponse) => frame
            .decode_json::<ConnectResponse>()
            .map_err(|e| ConnectError::Fatal(e.to_string())),
        Some(MessageType::Error) => {
            let payload = frame
                .decode_json::<ErrorPayload>()
                .unwrap_or(ErrorPayload { code: 0, message: "unknown error".into() });
            match payload.code {
                400 | 401 | 409 => Err(ConnectError::Fatal(payload.message)),
                _ => Err(ConnectError::Transient(payload.message)),
            }
        }
        _ => Err(ConnectError::Transient("unexpected response to ConnectRequest".into())),
    }
}

async fn forward_to_origin(
    http: &reqwest::Client,
    host: &str,
    port: u16,
    request: HttpRequestMessage,
) -> HttpResponseMessage {
    let url = format!("http://{host}:{port}{}", request.path);
    let method = match reqwest::Method::from_bytes(request.method.as_bytes()) {
        Ok(m) => m,
        Err(_) => return bad_gateway(request.request_id, "invalid method"),
    };

    let mut builder = http.request(method, &url).body(request.body);
    for (name, value) in &request.headers {
        if name.eq_ignore_ascii_case("host") {
            continue;
        }
        builder = builder.header(name, value);
    }

    match tokio::time::timeout(REQUEST_TIMEOUT, builder.send()).await {
        Ok(Ok(response)) => {
            let status = response.status().as_u16();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(k, v)| v.to_str().ok().map(|val| (k.to_string(), val.to_string())))
                .collect();
            let body = response.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
            HttpResponseMessage {
                request_id: request.request_id,
                status,
                headers,
                body,
            }
        }
        Ok(Err(_)) => bad_gateway(request.request_id, "Bad Gateway"),
        Err(_) => gateway_timeout(request.request_id),
    }
}

fn bad_gateway(request_id: uuid::Uuid, message: &str) -> HttpResponseMessage {
    HttpResponseMessage {
        request_id,
        status: 502,
        headers: vec![],
        body: message.as_bytes().to_vec(),
    }
}

fn gateway_timeout(request_id: uuid::Uuid) -> HttpResponseMessage {
    HttpResponseMessage {
        request_id,
        status: 504,
        headers: vec![],
        body: b"Gateway Timeout".to_vec(),
    }
}

/// `backoff(n) = min(reconnect_delay * 2^n, 60s)` with +/-20% jitter.
fn backoff(attempt: u32) -> Duration {
    let base = RECONNECT_BASE_DELAY.as_secs_f64() * 2f64.powi(attempt as i32);
    let capped = base.min(RECONNECT_MAX_DELAY.as_secs_f64());
    let jitter = 1.0 + rand::random::<f64>() * 0.4 - 0.2;
    Duration::from_secs_f64((capped * jitter).max(0.1))
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_caps_at_max_delay() {
        let d = backoff(10);
        assert!(d.as_secs_f64() <= RECONNECT_MAX_DELAY.as_secs_f64() * 1.2 + 0.01);
    }

    #[test]
    fn backoff_grows_with_attempt() {
        let early = backoff(0).as_secs_f64();
        let later = backoff(3).as_secs_f64();
        assert!(later > early);
    }
}
