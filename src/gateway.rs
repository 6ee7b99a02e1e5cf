//! HTTP Gateway
//!
//! axum routes for the join handshake and the WebSocket signaling channel,
//! plus the periodic maintenance task.

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Path, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{debug, info};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ServerConfig;
use crate::error::SignalError;
use crate::handshake::{CreatedRoom, JoinGrant, JoinHandshake};
use crate::relay::SignalingRelay;
use crate::room::{is_valid_room_id, RoomRegistry};
use crate::session;

/// Shared server state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<RoomRegistry>,
    pub relay: Arc<SignalingRelay>,
    pub handshake: Arc<JoinHandshake>,
}

/// Work done by one maintenance pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub timed_out: usize,
    pub tokens_purged: usize,
    pub rooms_evicted: usize,
}

impl AppState {
    pub fn from_config(config: ServerConfig) -> Self {
        let registry = Arc::new(RoomRegistry::from_config(&config));
        let relay = Arc::new(SignalingRelay::new(
            registry.clone(),
            config.ice_servers.clone(),
            config.heartbeat_interval(),
        ));
        let handshake = Arc::new(JoinHandshake::new(registry.clone(), &config));
        Self {
            config: Arc::new(config),
            registry,
            relay,
            handshake,
        }
    }

    /// Heartbeat sweep, token expiry and idle-room eviction
    pub fn run_maintenance(&self, now: Instant) -> MaintenanceReport {
        MaintenanceReport {
            timed_out: self.relay.sweep_heartbeats(now),
            tokens_purged: self.handshake.purge_expired(now),
            rooms_evicted: self.registry.evict_idle(now).len(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChannelParams {
    pub token: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/join", post(join_default_room))
        .route("/rooms", post(create_room))
        .route("/rooms/:room_id/join", post(join_room))
        .route("/rooms/:room_id/invite", get(invite))
        .route("/ws", get(signaling_channel))
        .with_state(state)
}

/// Serve the router until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Run maintenance every `eviction_interval_secs`
pub fn spawn_maintenance(state: AppState) -> JoinHandle<()> {
    let period = state.config.eviction_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let report = state.run_maintenance(Instant::now());
            if report != MaintenanceReport::default() {
                debug!("Maintenance: {:?}", report);
            }
        }
    })
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "rooms": state.registry.room_count() }))
}

async fn create_room(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<CreatedRoom>), SignalError> {
    let created = state.handshake.create_room()?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Address charged by the rate limiter. `X-Forwarded-For` is only believed
/// when the direct peer is a trusted proxy; the rightmost hop that is not
/// itself a trusted proxy is the client.
pub fn client_address(peer: IpAddr, headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> IpAddr {
    if !trusted_proxies.contains(&peer) {
        return peer;
    }
    headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
        .filter(|hop| !trusted_proxies.contains(hop))
        .last()
        .unwrap_or(peer)
}

async fn join_room(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
    Json(request): Json<JoinRequest>,
) -> Result<Json<JoinGrant>, SignalError> {
    let client = client_address(peer.ip(), &headers, &state.config.trusted_proxies);
    state
        .handshake
        .join(&room_id, &request.password, client)
        .map(Json)
}

async fn join_default_room(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<JoinRequest>,
) -> Result<Json<JoinGrant>, SignalError> {
    let client = client_address(peer.ip(), &headers, &state.config.trusted_proxies);
    state
        .handshake
        .join(&state.config.default_room, &request.password, client)
        .map(Json)
}

async fn invite(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<serde_json::Value>, SignalError> {
    if !is_valid_room_id(&room_id) {
        return Err(SignalError::InvalidRoomId);
    }
    let invite_url = state
        .handshake
        .invite_url(&room_id)
        .ok_or(SignalError::InvitesUnavailable)?;
    Ok(Json(json!({ "room": room_id, "invite_url": invite_url })))
}

async fn signaling_channel(
    State(state): State<AppState>,
    Query(params): Query<ChannelParams>,
    ws: WebSocketUpgrade,
) -> Response {
    // Refuse before upgrading; the token is only consumed once upgraded
    if !state.handshake.is_valid_token(&params.token) {
        return SignalError::AuthFailure.into_response();
    }

    ws.max_message_size(state.config.max_message_bytes)
        .on_upgrade(move |socket| async move {
            match state.handshake.redeem(&params.token) {
                Ok(room) => {
                    session::run_session(
                        socket,
                        room,
                        state.relay.clone(),
                        state.config.outbound_queue_bound,
                    )
                    .await
                }
                Err(e) => {
                    info!("Refusing signaling channel: {}", e.code());
                    session::refuse(socket, e).await
                }
            }
        })
}

impl IntoResponse for SignalError {
    fn into_response(self) -> Response {
        let status = match &self {
            SignalError::AuthFailure => StatusCode::UNAUTHORIZED,
            SignalError::RoomCreationDenied | SignalError::InvitesUnavailable => {
                StatusCode::NOT_FOUND
            }
            SignalError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            SignalError::InvalidRoomId | SignalError::MalformedMessage(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "error": self.code(), "message": self.to_string() }));

        match self {
            SignalError::RateLimited { retry_after } => (
                status,
                [(header::RETRY_AFTER, retry_after.as_secs().to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RoomEntry, RoomPolicy};
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn state() -> AppState {
        AppState::from_config(ServerConfig {
            room_policy: RoomPolicy::Restricted,
            rooms: vec![RoomEntry {
                id: "lobby".to_string(),
                password: "swordfish".to_string(),
            }],
            ..ServerConfig::default()
        })
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            SignalError::AuthFailure.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            SignalError::RoomCreationDenied.into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            SignalError::InvalidRoomId.into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            SignalError::InvitesUnavailable.into_response().status(),
            StatusCode::NOT_FOUND
        );

        let limited = SignalError::RateLimited {
            retry_after: Duration::from_secs(90),
        }
        .into_response();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.headers()[header::RETRY_AFTER], "90");
    }

    fn forwarded(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", value.parse().unwrap());
        headers
    }

    #[test]
    fn test_forwarded_for_ignored_from_untrusted_peer() {
        let peer: IpAddr = "198.51.100.4".parse().unwrap();
        let proxies: Vec<IpAddr> = vec!["10.0.0.1".parse().unwrap()];
        assert_eq!(
            client_address(peer, &forwarded("203.0.113.9"), &proxies),
            peer
        );
        assert_eq!(client_address(peer, &forwarded("203.0.113.9"), &[]), peer);
    }

    #[test]
    fn test_forwarded_for_from_trusted_proxy() {
        let proxy: IpAddr = "10.0.0.1".parse().unwrap();
        let inner: IpAddr = "10.0.0.2".parse().unwrap();
        let proxies = vec![proxy, inner];

        // A client-supplied hop on the left cannot displace the real one
        assert_eq!(
            client_address(proxy, &forwarded("1.2.3.4, 203.0.113.9"), &proxies),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
        // Chained proxies are skipped
        assert_eq!(
            client_address(proxy, &forwarded("203.0.113.9, 10.0.0.2"), &proxies),
            "203.0.113.9".parse::<IpAddr>().unwrap()
        );
        // No usable header: charge the proxy itself
        assert_eq!(client_address(proxy, &HeaderMap::new(), &proxies), proxy);
        assert_eq!(client_address(proxy, &forwarded("garbage"), &proxies), proxy);
    }

    #[test]
    fn test_maintenance_purges_tokens_and_rooms() {
        let state = state();
        let client = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let now = Instant::now();

        state
            .handshake
            .join_at("lobby", "swordfish", client, now)
            .unwrap();
        assert_eq!(state.registry.room_count(), 1);
        assert_eq!(state.run_maintenance(now), MaintenanceReport::default());

        let later = now + Duration::from_secs(61);
        let report = state.run_maintenance(later);
        assert_eq!(report.tokens_purged, 1);
        assert_eq!(state.registry.room_count(), 0);
    }
}
