// HTTP 接口
// 流媒体服务器回调（/hook/*）与管理接口（/api/v1/*）

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use gbcms_core::cascade::CascadeManager;
use gbcms_core::context::CmsContext;
use gbcms_core::invite::{self, PlaybackControl, StreamRequest};
use gbcms_core::recover;
use gbcms_core::stream::StreamType;
use gbcms_core::subscribe::SubscriptionEngine;
use gbcms_core::CmsError;
use gbcms_media::{HookBody, HookReply};
use gbcms_sip::xml::PtzCommand;
use gbcms_sip::MediaSetup;
use gbcms_store::entity::log;
use gbcms_store::WriteOp;
use serde::Deserialize;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<CmsContext>,
    pub cascades: Arc<CascadeManager>,
    pub subs: Arc<SubscriptionEngine>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/hook/on_publish", post(on_publish))
        .route("/hook/on_publish_done", post(on_publish_done))
        .route("/hook/on_play", post(on_play))
        .route("/hook/on_play_done", post(on_play_done))
        .route("/hook/on_idle_timeout", post(on_idle_timeout))
        .route("/hook/on_receive_timeout", post(on_idle_timeout))
        .route("/hook/on_started", post(on_started))
        .route("/api/v1/devices", get(list_devices))
        .route("/api/v1/devices/:device_id", get(get_device))
        .route("/api/v1/devices/:device_id/channels", get(list_channels))
        .route("/api/v1/devices/:device_id/catalog", post(refresh_catalog))
        .route("/api/v1/devices/:device_id/positions", get(list_positions))
        .route("/api/v1/devices/:device_id/alarms", get(list_alarms))
        .route("/api/v1/streams", get(list_streams))
        .route("/api/v1/stream/start", post(start_stream))
        .route("/api/v1/stream/stop", post(stop_stream))
        .route("/api/v1/playback/control", post(playback_control))
        .route("/api/v1/ptz", post(ptz))
        .route("/api/v1/records/query", post(query_records))
        .route("/api/v1/broadcast", post(broadcast))
        .route("/api/v1/restart", post(restart))
        .route("/api/v1/platforms", get(list_platforms))
        .route("/api/v1/platforms/:platform_id/start", post(start_platform))
        .route("/api/v1/platforms/:platform_id/stop", post(stop_platform))
        .route("/api/v1/logs", get(list_logs))
        .route(
            "/api/v1/devices/:device_id/status_logs",
            get(list_status_logs),
        )
        .with_state(state)
}

fn status_of(e: &CmsError) -> StatusCode {
    match e {
        CmsError::NotFound(..) | CmsError::Offline(_) => StatusCode::NOT_FOUND,
        CmsError::BadRequest(_) | CmsError::Config(_) => StatusCode::BAD_REQUEST,
        CmsError::Busy(_) => StatusCode::CONFLICT,
        CmsError::Auth(_) => StatusCode::BAD_GATEWAY,
        CmsError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

type ApiResult = std::result::Result<Json<serde_json::Value>, StatusCode>;

fn map_err(e: CmsError) -> StatusCode {
    let status = status_of(&e);
    tracing::warn!(target: "gbcmsd", code = %status, "api error: {}", e);
    status
}

/// 操作流水落库（不阻塞应答）
async fn audit(state: &AppState, action: &str, target: &str, detail: Option<String>) {
    let op = WriteOp::AppendLog(log::Model {
        id: 0,
        action: action.to_string(),
        target: target.to_string(),
        detail,
        time: chrono::Utc::now(),
    });
    if let Err(e) = state.ctx.writer.post(op).await {
        tracing::warn!(target: "gbcmsd", action, "append audit log failed: {}", e);
    }
}

/// 按配置偏好挑选播放地址
fn preferred_url<'a>(urls: &'a [String], fmt: &str) -> Option<&'a str> {
    urls.iter()
        .find(|u| u.contains(fmt))
        .or_else(|| urls.first())
        .map(String::as_str)
}

// ---- 流媒体回调 ----

async fn on_publish(State(state): State<AppState>, Json(body): Json<HookBody>) -> Json<HookReply> {
    if state.ctx.engine.mark_published(&body.stream_id).await {
        Json(HookReply::ok())
    } else {
        Json(HookReply::reject("unknown stream"))
    }
}

async fn on_publish_done(
    State(state): State<AppState>,
    Json(body): Json<HookBody>,
) -> Json<HookReply> {
    if let Err(e) = state
        .ctx
        .engine
        .close_stream(&body.stream_id, &state.ctx.dialogs)
        .await
    {
        tracing::warn!(target: "gbcmsd", stream_id = %body.stream_id, "close on publish_done failed: {}", e);
    }
    Json(HookReply::ok())
}

/// 出口消费方接入，仅记录
async fn on_play(Json(body): Json<HookBody>) -> Json<HookReply> {
    tracing::debug!(
        target: "gbcmsd",
        stream_id = %body.stream_id,
        remote = body.remote_addr.as_deref().unwrap_or(""),
        "player attached"
    );
    Json(HookReply::ok())
}

/// 出口消费方断开：拆出口，上级对话补发 BYE
async fn on_play_done(
    State(state): State<AppState>,
    Json(body): Json<HookBody>,
) -> Json<HookReply> {
    let Some(sink_id) = body.sink_id else {
        return Json(HookReply::ok());
    };
    if let Some(entry) = state.ctx.engine.get(&body.stream_id) {
        let call_id = entry
            .sinks
            .get(&sink_id)
            .and_then(|s| s.value().call_id.clone());
        if let Some(call_id) = call_id {
            state.ctx.dialogs.send_bye(&call_id).await;
        }
    }
    if let Err(e) = state.ctx.engine.close_sink(&body.stream_id, &sink_id).await {
        tracing::warn!(target: "gbcmsd", sink_id = %sink_id, "close sink failed: {}", e);
    }
    Json(HookReply::ok())
}

async fn on_idle_timeout(
    State(state): State<AppState>,
    Json(body): Json<HookBody>,
) -> Json<HookReply> {
    if let Err(e) = state
        .ctx
        .engine
        .close_stream(&body.stream_id, &state.ctx.dialogs)
        .await
    {
        tracing::warn!(target: "gbcmsd", stream_id = %body.stream_id, "close on timeout failed: {}", e);
    }
    Json(HookReply::ok())
}

/// 媒体服务器重启：对账并拆除失效流
async fn on_started(State(state): State<AppState>) -> Json<HookReply> {
    match recover::reconcile_after_media_restart(&state.ctx).await {
        Ok(_) => Json(HookReply::ok()),
        Err(e) => {
            tracing::warn!(target: "gbcmsd", "reconcile after media restart failed: {}", e);
            Json(HookReply::reject(e.to_string()))
        }
    }
}

// ---- 设备 ----

async fn list_devices(State(state): State<AppState>) -> ApiResult {
    let rows = state.ctx.store.devices().await.map_err(|e| map_err(e.into()))?;
    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|d| {
            serde_json::json!({
                "device_id": d.device_id,
                "name": d.name,
                "manufacturer": d.manufacturer,
                "model": d.model,
                "transport": d.transport,
                "remote_addr": d.remote_addr,
                "online": state.ctx.devices.is_online(&d.device_id),
                "channel_count": d.channel_count,
                "keepalive_time": d.keepalive_time,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "devices": items })))
}

async fn get_device(State(state): State<AppState>, Path(device_id): Path<String>) -> ApiResult {
    let Some(d) = state
        .ctx
        .store
        .device(&device_id)
        .await
        .map_err(|e| map_err(e.into()))?
    else {
        return Err(StatusCode::NOT_FOUND);
    };
    Ok(Json(serde_json::json!({
        "device_id": d.device_id,
        "name": d.name,
        "manufacturer": d.manufacturer,
        "model": d.model,
        "firmware": d.firmware,
        "transport": d.transport,
        "remote_addr": d.remote_addr,
        "expires": d.expires,
        "register_time": d.register_time,
        "keepalive_time": d.keepalive_time,
        "online": state.ctx.devices.is_online(&d.device_id),
        "channel_count": d.channel_count,
    })))
}

async fn list_channels(State(state): State<AppState>, Path(device_id): Path<String>) -> ApiResult {
    let rows = state
        .ctx
        .store
        .channels_of(&device_id)
        .await
        .map_err(|e| map_err(e.into()))?;
    Ok(Json(serde_json::json!({ "channels": rows })))
}

async fn refresh_catalog(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult {
    invite::refresh_catalog(&state.ctx, &device_id)
        .await
        .map_err(map_err)?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn list_positions(State(state): State<AppState>, Path(device_id): Path<String>) -> ApiResult {
    let rows = state
        .ctx
        .store
        .positions_of(&device_id, 100)
        .await
        .map_err(|e| map_err(e.into()))?;
    Ok(Json(serde_json::json!({ "positions": rows })))
}

async fn list_alarms(State(state): State<AppState>, Path(device_id): Path<String>) -> ApiResult {
    let rows = state
        .ctx
        .store
        .alarms_of(&device_id, 100)
        .await
        .map_err(|e| map_err(e.into()))?;
    Ok(Json(serde_json::json!({ "alarms": rows })))
}

// ---- 流 ----

async fn list_streams(State(state): State<AppState>) -> ApiResult {
    let items: Vec<serde_json::Value> = state
        .ctx
        .engine
        .active_streams()
        .iter()
        .map(|s| {
            let urls = s.play_urls();
            serde_json::json!({
                "stream_id": s.stream_id,
                "stream_type": s.stream_type.as_str(),
                "device_id": s.device_id,
                "channel_id": s.channel_id,
                "ssrc": s.ssrc(),
                "publish": s.published(),
                "sinks": s.sinks.len(),
                "url": preferred_url(&urls, &state.ctx.cfg.media.prefer_stream_fmt),
                "urls": urls,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "streams": items })))
}

#[derive(Debug, Deserialize)]
struct StartStreamBody {
    device_id: String,
    channel_id: String,
    /// play / playback / download，默认 play
    #[serde(default)]
    stream_type: Option<String>,
    #[serde(default)]
    start: i64,
    #[serde(default)]
    stop: i64,
    #[serde(default)]
    speed: u32,
    /// udp / passive / active，默认 udp
    #[serde(default)]
    setup: Option<String>,
}

async fn start_stream(State(state): State<AppState>, Json(body): Json<StartStreamBody>) -> ApiResult {
    let stream_type = match body.stream_type.as_deref() {
        None | Some("play") => StreamType::Play,
        Some(other) => StreamType::parse(other).ok_or(StatusCode::BAD_REQUEST)?,
    };
    if stream_type.is_playback() && (body.start == 0 || body.stop == 0) {
        return Err(StatusCode::BAD_REQUEST);
    }
    let setup = match body.setup.as_deref() {
        None => invite::default_setup(&state.ctx, &body.device_id, &body.channel_id).await,
        Some(s) => MediaSetup::parse(s).ok_or(StatusCode::BAD_REQUEST)?,
    };

    let entry = invite::start_stream(
        &state.ctx,
        StreamRequest {
            stream_type,
            device_id: body.device_id,
            channel_id: body.channel_id,
            start: body.start,
            stop: body.stop,
            speed: body.speed,
            setup,
        },
    )
    .await
    .map_err(map_err)?;
    audit(&state, "stream_start", &entry.stream_id, None).await;

    let urls = entry.play_urls();
    Ok(Json(serde_json::json!({
        "stream_id": entry.stream_id,
        "ssrc": format!("{:010}", entry.ssrc()),
        "publish": entry.published(),
        "url": preferred_url(&urls, &state.ctx.cfg.media.prefer_stream_fmt),
        "urls": urls,
    })))
}

#[derive(Debug, Deserialize)]
struct StreamIdBody {
    stream_id: String,
}

async fn stop_stream(State(state): State<AppState>, Json(body): Json<StreamIdBody>) -> ApiResult {
    invite::stop_stream(&state.ctx, &body.stream_id)
        .await
        .map_err(map_err)?;
    audit(&state, "stream_stop", &body.stream_id, None).await;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct PlaybackControlBody {
    stream_id: String,
    /// play / pause / scale / seek
    action: String,
    #[serde(default)]
    value: Option<f64>,
}

async fn playback_control(
    State(state): State<AppState>,
    Json(body): Json<PlaybackControlBody>,
) -> ApiResult {
    let ctrl = match body.action.as_str() {
        "play" => PlaybackControl::Play,
        "pause" => PlaybackControl::Pause,
        "scale" => PlaybackControl::Scale(body.value.ok_or(StatusCode::BAD_REQUEST)? as f32),
        "seek" => PlaybackControl::Seek(body.value.ok_or(StatusCode::BAD_REQUEST)? as i64),
        _ => return Err(StatusCode::BAD_REQUEST),
    };
    invite::playback_control(&state.ctx, &body.stream_id, ctrl)
        .await
        .map_err(map_err)?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct PtzBody {
    device_id: String,
    channel_id: String,
    /// stop / up / down / left / right / zoom_in / zoom_out
    command: String,
    #[serde(default = "default_ptz_speed")]
    speed: u8,
}

fn default_ptz_speed() -> u8 {
    0x80
}

fn parse_ptz(command: &str) -> Option<PtzCommand> {
    match command {
        "stop" => Some(PtzCommand::Stop),
        "up" => Some(PtzCommand::Up),
        "down" => Some(PtzCommand::Down),
        "left" => Some(PtzCommand::Left),
        "right" => Some(PtzCommand::Right),
        "zoom_in" => Some(PtzCommand::ZoomIn),
        "zoom_out" => Some(PtzCommand::ZoomOut),
        _ => None,
    }
}

async fn ptz(State(state): State<AppState>, Json(body): Json<PtzBody>) -> ApiResult {
    let cmd = parse_ptz(&body.command).ok_or(StatusCode::BAD_REQUEST)?;
    invite::ptz_control(&state.ctx, &body.device_id, &body.channel_id, cmd, body.speed)
        .await
        .map_err(map_err)?;
    audit(&state, "ptz", &body.channel_id, Some(body.command)).await;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Debug, Deserialize)]
struct RecordQueryBody {
    device_id: String,
    channel_id: String,
    start: i64,
    stop: i64,
}

async fn query_records(
    State(state): State<AppState>,
    Json(body): Json<RecordQueryBody>,
) -> ApiResult {
    let records = invite::query_records(
        &state.ctx,
        &body.device_id,
        &body.channel_id,
        body.start,
        body.stop,
    )
    .await
    .map_err(map_err)?;

    let items: Vec<serde_json::Value> = records
        .iter()
        .map(|r| {
            serde_json::json!({
                "device_id": r.device_id,
                "name": r.name,
                "start_time": r.start_time,
                "end_time": r.end_time,
                "type": r.record_type,
                "file_path": r.file_path,
                "file_size": r.file_size,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "records": items })))
}

#[derive(Debug, Deserialize)]
struct BroadcastBody {
    device_id: String,
    channel_id: String,
}

async fn broadcast(State(state): State<AppState>, Json(body): Json<BroadcastBody>) -> ApiResult {
    let entry = invite::start_broadcast(&state.ctx, &body.device_id, &body.channel_id)
        .await
        .map_err(map_err)?;
    audit(&state, "broadcast", &body.channel_id, None).await;
    Ok(Json(serde_json::json!({ "stream_id": entry.stream_id })))
}

#[derive(Debug, Deserialize)]
struct RestartBody {
    #[serde(default)]
    listen_ip: Option<String>,
    #[serde(default)]
    port: Option<u16>,
}

/// 信令重启：关流、停级联、重绑端口后再起级联
async fn restart(State(state): State<AppState>, Json(body): Json<RestartBody>) -> ApiResult {
    let listen_ip = body
        .listen_ip
        .unwrap_or_else(|| state.ctx.cfg.sip.listen_ip.clone());
    let port = body.port.unwrap_or(state.ctx.cfg.sip.port);
    recover::restart_transport(&state.ctx, &state.cascades, &listen_ip, port)
        .await
        .map_err(map_err)?;
    audit(&state, "restart", &format!("{}:{}", listen_ip, port), None).await;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// ---- 级联平台 ----

async fn list_platforms(State(state): State<AppState>) -> ApiResult {
    let rows = state
        .ctx
        .store
        .platforms()
        .await
        .map_err(|e| map_err(e.into()))?;
    let items: Vec<serde_json::Value> = rows
        .iter()
        .map(|p| {
            serde_json::json!({
                "id": p.id,
                "name": p.name,
                "enable": p.enable,
                "ip": p.ip,
                "port": p.port,
                "transport": p.transport,
                "share_all": p.share_all,
                "online": state.cascades.get(&p.id).map(|u| u.is_online()).unwrap_or(false),
                "register_time": p.register_time,
            })
        })
        .collect();
    Ok(Json(serde_json::json!({ "platforms": items })))
}

async fn start_platform(
    State(state): State<AppState>,
    Path(platform_id): Path<String>,
) -> ApiResult {
    let Some(p) = state
        .ctx
        .store
        .platform(&platform_id)
        .await
        .map_err(|e| map_err(e.into()))?
    else {
        return Err(StatusCode::NOT_FOUND);
    };
    state.cascades.start(p).map_err(map_err)?;
    audit(&state, "platform_start", &platform_id, None).await;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn stop_platform(
    State(state): State<AppState>,
    Path(platform_id): Path<String>,
) -> ApiResult {
    state.cascades.stop(&platform_id);
    audit(&state, "platform_stop", &platform_id, None).await;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

// ---- 流水查询 ----

async fn list_logs(State(state): State<AppState>) -> ApiResult {
    let rows = state.ctx.store.logs(100).await.map_err(|e| map_err(e.into()))?;
    Ok(Json(serde_json::json!({ "logs": rows })))
}

async fn list_status_logs(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
) -> ApiResult {
    let rows = state
        .ctx
        .store
        .status_logs_of(&device_id, 100)
        .await
        .map_err(|e| map_err(e.into()))?;
    Ok(Json(serde_json::json!({ "status_logs": rows })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use gbcms_core::Config;
    use gbcms_sip::SipTransport;
    use gbcms_store::Store;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let db = gbcms_store::repo::connect("sqlite::memory:").await.unwrap();
        gbcms_store::repo::init_schema(&db).await.unwrap();
        let writer = gbcms_store::spawn_writer(db.clone());
        let ctx = CmsContext::new(Config::default(), SipTransport::new(), Store::new(db), writer);
        let cascades = CascadeManager::new(ctx.clone());
        let subs = Arc::new(SubscriptionEngine::new());
        AppState { ctx, cascades, subs }
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(test_state().await);
        let resp = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_on_publish_unknown_stream_rejected() {
        let app = router(test_state().await);
        let resp = app
            .oneshot(
                Request::post("/hook/on_publish")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"stream_id":"d1/c1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let reply = body_json(resp).await;
        assert_eq!(reply["code"], -1);
    }

    #[tokio::test]
    async fn test_list_devices_empty() {
        let app = router(test_state().await);
        let resp = app
            .oneshot(Request::get("/api/v1/devices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["devices"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_start_stream_offline_device_404() {
        let app = router(test_state().await);
        let resp = app
            .oneshot(
                Request::post("/api/v1/stream/start")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"device_id":"34020000001110000001","channel_id":"34020000001320000001"}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_playback_bad_action_400() {
        let app = router(test_state().await);
        let resp = app
            .oneshot(
                Request::post("/api/v1/playback/control")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"stream_id":"d/c","action":"rewind"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_status_of_busy_and_auth() {
        assert_eq!(
            status_of(&CmsError::Busy("目录刷新进行中".to_string())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(&CmsError::Auth("凭证被拒".to_string())),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_parse_ptz_commands() {
        assert!(matches!(parse_ptz("up"), Some(PtzCommand::Up)));
        assert!(matches!(parse_ptz("zoom_out"), Some(PtzCommand::ZoomOut)));
        assert!(parse_ptz("spin").is_none());
    }
}
