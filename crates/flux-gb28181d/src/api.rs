// 运维 HTTP 接口，应答统一为 {code, msg, data}

use crate::engine::Engine;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use flux_gb28181::dispatcher::RECORD_QUERY_TIMEOUT;
use flux_gb28181::manscdp::{PlaybackControl, PtzCommand};
use flux_gb28181::{ErrorKind, Gb28181Error, InviteRequest};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize)]
struct Reply<T: Serialize> {
    code: i32,
    msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

fn ok<T: Serialize>(data: T) -> Json<Reply<T>> {
    Json(Reply {
        code: 0,
        msg: "success".to_string(),
        data: Some(data),
    })
}

/// 引擎错误 → HTTP 应答
struct ApiError(Gb28181Error);

impl From<Gb28181Error> for ApiError {
    fn from(err: Gb28181Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Parse => StatusCode::BAD_REQUEST,
            ErrorKind::Duplicate | ErrorKind::State => StatusCode::CONFLICT,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Device | ErrorKind::MediaServer | ErrorKind::Transport => StatusCode::BAD_GATEWAY,
            ErrorKind::Auth => StatusCode::FORBIDDEN,
            ErrorKind::Persistence => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Reply::<()> {
            code: self.0.code(),
            msg: self.0.to_string(),
            data: None,
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<Reply<T>>, ApiError>;

#[derive(Debug, Deserialize)]
struct StreamRequest {
    stream_id: String,
}

#[derive(Debug, Deserialize)]
struct PlaybackRequest {
    stream_id: String,
    #[serde(flatten)]
    control: PlaybackControl,
}

#[derive(Debug, Deserialize)]
struct DeviceRequest {
    device_id: String,
}

#[derive(Debug, Deserialize)]
struct RecordRequest {
    device_id: String,
    channel_id: String,
    /// Unix 秒
    start_time: i64,
    end_time: i64,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PtzRequest {
    device_id: String,
    channel_id: String,
    #[serde(flatten)]
    command: PtzCommand,
}

#[derive(Debug, Deserialize)]
struct RestartRequest {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

#[derive(Debug, Serialize)]
struct QuerySent {
    sn: u32,
}

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/api/v1/gb28181/stats", get(stats))
        .route("/api/v1/gb28181/invite", post(invite))
        .route("/api/v1/gb28181/bye", post(bye))
        .route("/api/v1/gb28181/playback", post(playback))
        .route("/api/v1/gb28181/sessions", get(list_sessions))
        .route("/api/v1/gb28181/sessions/*stream_id", get(get_session))
        .route("/api/v1/gb28181/catalog", post(query_catalog))
        .route("/api/v1/gb28181/device-info", post(query_device_info))
        .route("/api/v1/gb28181/device-status", post(query_device_status))
        .route("/api/v1/gb28181/records", post(query_records))
        .route("/api/v1/gb28181/ptz", post(ptz))
        .route("/api/v1/gb28181/teleboot", post(teleboot))
        .route("/api/v1/gb28181/restart", post(restart))
        .route("/api/v1/gb28181/devices", get(list_devices))
        .route(
            "/api/v1/gb28181/devices/:device_id",
            get(get_device).delete(delete_device),
        )
        .route(
            "/api/v1/gb28181/devices/:device_id/channels",
            get(list_device_channels),
        )
        .with_state(engine)
}

async fn stats(State(engine): State<Engine>) -> ApiResult<serde_json::Value> {
    let identity = engine.endpoint.identity();
    Ok(ok(serde_json::json!({
        "id": identity.id,
        "sip_port": identity.port,
        "devices": engine.registry.device_count(),
        "online_devices": engine.registry.online_devices().len(),
        "active_sessions": engine.sessions.active_count(),
        "dialogs": engine.dialogs.all().len(),
        "subscriptions": engine.subscriptions.active(),
        "pending_record_queries": engine.dispatcher.pending_record_queries(),
        "dropped_datagrams": engine.endpoint.transactions().transport().dropped(),
        "cascade_registered": engine.cascade.as_ref().map(|c| c.is_registered()),
    })))
}

async fn invite(
    State(engine): State<Engine>,
    Json(req): Json<InviteRequest>,
) -> ApiResult<flux_gb28181::SessionSnapshot> {
    let session = engine.sessions.invite(req).await?;
    Ok(ok(session))
}

async fn bye(
    State(engine): State<Engine>,
    Json(req): Json<StreamRequest>,
) -> ApiResult<flux_gb28181::SessionSnapshot> {
    let session = engine.sessions.stop(&req.stream_id).await?;
    Ok(ok(session))
}

async fn playback(State(engine): State<Engine>, Json(req): Json<PlaybackRequest>) -> ApiResult<()> {
    engine
        .sessions
        .playback_control(&req.stream_id, req.control)
        .await?;
    Ok(ok(()))
}

async fn list_sessions(State(engine): State<Engine>) -> ApiResult<Vec<flux_gb28181::SessionSnapshot>> {
    Ok(ok(engine.sessions.list()))
}

async fn get_session(
    State(engine): State<Engine>,
    Path(stream_id): Path<String>,
) -> ApiResult<flux_gb28181::SessionSnapshot> {
    // 流 ID 形如 设备/通道[.类型.起.止]
    let stream_id = stream_id.trim_start_matches('/');
    let session = engine
        .sessions
        .snapshot(&stream_id)
        .ok_or_else(|| Gb28181Error::NotFound(format!("session {}", stream_id)))?;
    Ok(ok(session))
}

async fn query_catalog(State(engine): State<Engine>, Json(req): Json<DeviceRequest>) -> ApiResult<QuerySent> {
    let sn = engine.dispatcher.query_catalog(&req.device_id).await?;
    Ok(ok(QuerySent { sn }))
}

async fn query_device_info(
    State(engine): State<Engine>,
    Json(req): Json<DeviceRequest>,
) -> ApiResult<QuerySent> {
    let sn = engine.dispatcher.query_device_info(&req.device_id).await?;
    Ok(ok(QuerySent { sn }))
}

async fn query_device_status(
    State(engine): State<Engine>,
    Json(req): Json<DeviceRequest>,
) -> ApiResult<QuerySent> {
    let sn = engine.dispatcher.query_device_status(&req.device_id).await?;
    Ok(ok(QuerySent { sn }))
}

async fn query_records(
    State(engine): State<Engine>,
    Json(req): Json<RecordRequest>,
) -> ApiResult<serde_json::Value> {
    let timeout = req
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(RECORD_QUERY_TIMEOUT);
    let items = engine
        .dispatcher
        .query_records(&req.device_id, &req.channel_id, req.start_time, req.end_time, timeout)
        .await?;
    Ok(ok(serde_json::json!({
        "device_id": req.device_id,
        "channel_id": req.channel_id,
        "sum_num": items.len(),
        "items": items,
    })))
}

async fn ptz(State(engine): State<Engine>, Json(req): Json<PtzRequest>) -> ApiResult<()> {
    engine
        .dispatcher
        .ptz(&req.device_id, &req.channel_id, &req.command)
        .await?;
    Ok(ok(()))
}

async fn teleboot(State(engine): State<Engine>, Json(req): Json<DeviceRequest>) -> ApiResult<()> {
    engine.dispatcher.teleboot(&req.device_id).await?;
    Ok(ok(()))
}

/// 更换本地编码或端口后重新绑定传输层
async fn restart(State(engine): State<Engine>, Json(req): Json<RestartRequest>) -> ApiResult<serde_json::Value> {
    let current = engine.endpoint.identity();
    let port = req.port.unwrap_or(current.port);
    let local = engine.endpoint.restart(req.id, port).await?;
    let identity = engine.endpoint.identity();
    Ok(ok(serde_json::json!({
        "id": identity.id,
        "host": identity.host,
        "port": local.port(),
    })))
}

async fn list_devices(State(engine): State<Engine>) -> ApiResult<Vec<serde_json::Value>> {
    let devices = engine
        .registry
        .list_devices()
        .into_iter()
        .map(|d| {
            let channel_count = engine.registry.channels(&d.device_id).len();
            serde_json::json!({
                "device_id": d.device_id,
                "name": d.name,
                "manufacturer": d.manufacturer,
                "host": d.host,
                "port": d.port,
                "transport": d.transport.as_str(),
                "online": d.is_online(),
                "channel_count": channel_count,
                "keepalive_time": d.keepalive_time,
            })
        })
        .collect();
    Ok(ok(devices))
}

async fn get_device(
    State(engine): State<Engine>,
    Path(device_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let device = engine
        .registry
        .get_device(&device_id)
        .ok_or_else(|| Gb28181Error::NotFound(format!("device {}", device_id)))?;
    let facts = engine.registry.recent_facts(&device_id).unwrap_or_default();
    Ok(ok(serde_json::json!({
        "device": device,
        "facts": facts,
    })))
}

async fn list_device_channels(
    State(engine): State<Engine>,
    Path(device_id): Path<String>,
) -> ApiResult<Vec<flux_gb28181::registry::Channel>> {
    if engine.registry.get_device(&device_id).is_none() {
        return Err(Gb28181Error::NotFound(format!("device {}", device_id)).into());
    }
    Ok(ok(engine.registry.channels(&device_id)))
}

async fn delete_device(
    State(engine): State<Engine>,
    Path(device_id): Path<String>,
) -> ApiResult<()> {
    engine.registry.remove_device(&device_id).await?;
    tracing::info!(target: "gb28181d", %device_id, "device removed by operator");
    Ok(ok(()))
}
