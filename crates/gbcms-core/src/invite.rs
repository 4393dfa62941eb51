// 点播编排
// 实时/回放/下载的 INVITE 全流程、语音广播、云台与回放控制、设备查询

use crate::context::CmsContext;
use crate::dialog::{Dialog, Direction};
use crate::error::{CmsError, Result};
use crate::stream::{stream_id, InsertOutcome, StreamEntry, StreamType};
use chrono::{TimeZone, Utc};
use gbcms_sip::message::{new_branch, new_call_id, new_tag};
use gbcms_sip::sdp::{build_sdp, InviteType, MediaSetup, SdpBuild, SdpInfo, AUDIO_RTPMAP, PS_RTPMAP};
use gbcms_sip::xml::{self, Manscdp, PtzCommand, RecordItem};
use gbcms_sip::{SipMethod, SipRequest, SipResponse, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

const MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);
const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// 开流请求
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub stream_type: StreamType,
    pub device_id: String,
    pub channel_id: String,
    /// 回放/下载的时间范围（epoch 秒）
    pub start: i64,
    pub stop: i64,
    /// 下载倍速，0 表示不携带
    pub speed: u32,
    pub setup: MediaSetup,
}

impl StreamRequest {
    pub fn play(device_id: &str, channel_id: &str) -> Self {
        Self {
            stream_type: StreamType::Play,
            device_id: device_id.to_string(),
            channel_id: channel_id.to_string(),
            start: 0,
            stop: 0,
            speed: 0,
            setup: MediaSetup::Udp,
        }
    }
}

/// 构造本级发起的带公共头部的请求
pub fn base_request(
    ctx: &CmsContext,
    method: SipMethod,
    uri: String,
    to_user: &str,
    tp: Transport,
) -> SipRequest {
    let mut req = SipRequest::new(method, uri);
    req.add_header(
        "Via",
        format!(
            "SIP/2.0/{} {}:{};rport;branch={}",
            tp.as_str(),
            ctx.cfg.sip.public_ip,
            ctx.cfg.sip.port,
            new_branch()
        ),
    );
    req.add_header("From", format!("<{}>;tag={}", ctx.local_uri(), new_tag()));
    req.add_header(
        "To",
        format!("<sip:{}@{}>", to_user, ctx.cfg.sip.domain),
    );
    req.add_header("Call-ID", new_call_id(&ctx.cfg.sip.public_ip));
    req.add_header("CSeq", format!("1 {}", method));
    req.add_header("Contact", format!("<{}>", ctx.contact_uri()));
    req.add_header("Max-Forwards", "70");
    req.add_header("User-Agent", "gbcms");
    req
}

/// 给设备发 MANSCDP MESSAGE 并等待最终响应
pub async fn message_to_device(
    ctx: &CmsContext,
    device_id: &str,
    body: String,
) -> Result<SipResponse> {
    let (addr, tp) = ctx
        .devices
        .addr_of(device_id)
        .ok_or_else(|| CmsError::Offline(device_id.to_string()))?;
    let mut req = base_request(
        ctx,
        SipMethod::Message,
        format!("sip:{}@{}", device_id, addr),
        device_id,
        tp,
    );
    req.headers.set("Content-Type", "Application/MANSCDP+xml");
    req.set_body(body);

    let resp = ctx.transport.request_reply(&req, addr, tp, MESSAGE_TIMEOUT).await?;
    if resp.status_code >= 300 {
        return Err(CmsError::BadRequest(format!(
            "MESSAGE 被 {} 拒绝: {}",
            device_id, resp.status_code
        )));
    }
    Ok(resp)
}

fn build_ack(invite: &SipRequest, resp: &SipResponse, addr: SocketAddr) -> SipRequest {
    let mut ack = invite.clone();
    ack.method = SipMethod::Ack;
    ack.body = None;
    ack.headers.remove("Content-Type");
    ack.headers.remove("Subject");
    if let Some(to) = resp.header("To") {
        let to = to.to_string();
        ack.headers.set("To", to);
    }
    let num = invite.cseq().map(|(n, _)| n).unwrap_or(1);
    ack.headers.set("CSeq", format!("{} ACK", num));
    if let Some(via) = invite.header("Via") {
        let base = via.split(';').next().unwrap_or(via).to_string();
        ack.headers.set("Via", format!("{};rport;branch={}", base, new_branch()));
    }
    // Contact 里常是内网地址，按真实来源地址发 ACK
    ack.rewrite_uri_host(addr);
    ack
}

/// 收流方式取值链：通道覆盖 > 设备默认 > 全局配置
pub async fn default_setup(ctx: &CmsContext, device_id: &str, channel_id: &str) -> MediaSetup {
    if let Ok(Some(ch)) = ctx.store.channel(device_id, channel_id).await {
        if let Some(setup) = ch.setup.as_deref().and_then(MediaSetup::parse) {
            return setup;
        }
    }
    if let Ok(Some(dev)) = ctx.store.device(device_id).await {
        if let Some(setup) = dev.media_setup.as_deref().and_then(MediaSetup::parse) {
            return setup;
        }
    }
    MediaSetup::parse(&ctx.cfg.sip.device_default_media_transport).unwrap_or_default()
}

/// 以 UAS 身份保存对话模板：交换 From/To，后续对话内请求由本级发出
pub fn uas_template(req: &SipRequest, local_tag: &str, remote: SocketAddr) -> SipRequest {
    let mut t = req.clone();
    let from = req.header("From").unwrap_or("").to_string();
    let to = req.header("To").unwrap_or("").to_string();
    t.headers.set("From", format!("{};tag={}", to, local_tag));
    t.headers.set("To", from);
    t.headers.set("CSeq", format!("1 {}", req.method));
    t.body = None;
    t.headers.remove("Content-Type");
    t.headers.remove("Subject");
    if let Some(user) = req.from_user() {
        t.uri = format!("sip:{}@{}", user, remote);
    }
    t
}

/// 点播/回放/下载开流。同一流标识并发调用只发起一次 INVITE。
pub async fn start_stream(ctx: &Arc<CmsContext>, req: StreamRequest) -> Result<Arc<StreamEntry>> {
    let id = stream_id(
        req.stream_type,
        &req.device_id,
        &req.channel_id,
        req.start,
        req.stop,
    );
    let invite_timeout = Duration::from_secs(ctx.cfg.sip.invite_timeout);

    let (addr, tp) = ctx
        .devices
        .addr_of(&req.device_id)
        .ok_or_else(|| CmsError::Offline(req.device_id.clone()))?;

    let ssrc = ctx.ssrc.next(req.stream_type.is_playback());
    let entry = match ctx.engine.try_insert(
        &id,
        req.stream_type,
        &req.device_id,
        &req.channel_id,
        ssrc,
    ) {
        InsertOutcome::Existing(entry) => {
            entry.wait_published(invite_timeout).await?;
            return Ok(entry);
        }
        InsertOutcome::Created(entry) => entry,
    };

    match invite_source(ctx, &req, &entry, addr, tp, invite_timeout).await {
        Ok(()) => Ok(entry),
        Err(e) => {
            // 失败补偿：撤占位并释放媒体资源
            ctx.engine.discard(&id);
            if let Err(close_err) = ctx.engine.media.close_source(&id).await {
                tracing::debug!(target: "gbcms::invite", stream_id = %id, "cleanup source: {}", close_err);
            }
            if let Some(call_id) = entry.source_call_id() {
                ctx.dialogs.remove(&call_id).await;
            }
            Err(e)
        }
    }
}

/// Subject 头：通道:设备,本级:SSRC
fn invite_subject(channel_id: &str, device_id: &str, local_id: &str, ssrc: u32) -> String {
    format!("{}:{},{}:{:010}", channel_id, device_id, local_id, ssrc)
}

/// 下载倍速上限 4
fn cap_speed(speed: u32) -> u32 {
    speed.min(4)
}

async fn invite_source(
    ctx: &Arc<CmsContext>,
    req: &StreamRequest,
    entry: &Arc<StreamEntry>,
    addr: SocketAddr,
    tp: Transport,
    invite_timeout: Duration,
) -> Result<()> {
    let id = &entry.stream_id;
    let speed = cap_speed(req.speed);
    let source = ctx
        .engine
        .media
        .create_source(
            id,
            entry.ssrc(),
            req.setup.as_str(),
            entry.stream_type.session_name(),
            speed,
        )
        .await?;
    let port = source.port();
    // SSRC 以服务器指派为准
    if source.ssrc != 0 {
        entry.set_ssrc(source.ssrc);
    }
    entry.set_urls(source.urls);

    let invite_type = match req.stream_type {
        StreamType::Play => InviteType::Play,
        StreamType::Playback => InviteType::Playback,
        StreamType::Download => InviteType::Download,
        StreamType::Broadcast => InviteType::Broadcast,
    };
    let sdp = build_sdp(
        &ctx.cfg.sip.id,
        &SdpBuild {
            media: "video",
            invite_type,
            ip: &ctx.cfg.media.stream_ip,
            port,
            start_time: req.start,
            stop_time: req.stop,
            setup: req.setup,
            speed,
            ssrc: entry.ssrc(),
            rtpmap: PS_RTPMAP,
            direction: "recvonly",
        },
    );

    let mut invite = base_request(
        ctx,
        SipMethod::Invite,
        format!("sip:{}@{}", req.channel_id, addr),
        &req.channel_id,
        tp,
    );
    invite.headers.set(
        "Subject",
        invite_subject(&req.channel_id, &req.device_id, &ctx.cfg.sip.id, entry.ssrc()),
    );
    invite.headers.set("Content-Type", "application/sdp");
    invite.set_body(sdp);

    let resp = ctx
        .transport
        .request_reply(&invite, addr, tp, invite_timeout)
        .await?;
    if resp.status_code != 200 {
        return Err(CmsError::BadRequest(format!(
            "{} INVITE 失败: {} {}",
            req.channel_id, resp.status_code, resp.reason_phrase
        )));
    }

    let ack = build_ack(&invite, &resp, addr);
    ctx.transport.send_oneway(&ack, addr, tp).await?;

    // 对话模板：INVITE + 对端 To tag
    let mut template = invite.clone();
    if let Some(to) = resp.header("To") {
        let to = to.to_string();
        template.headers.set("To", to);
    }
    template.body = None;
    template.headers.remove("Content-Type");
    template.headers.remove("Subject");
    let call_id = template.call_id().unwrap_or_default().to_string();
    entry.set_call_id(&call_id);
    ctx.dialogs
        .insert(Dialog {
            call_id,
            stream_id: id.clone(),
            device_id: req.device_id.clone(),
            channel_id: req.channel_id.clone(),
            direction: Direction::Out,
            template,
            remote: addr,
            transport: tp,
        })
        .await;

    // TCP 主动模式由媒体服务器向设备发起连接
    if let Some(body) = &resp.body {
        match SdpInfo::parse(body) {
            Ok(answer) => {
                if req.setup == MediaSetup::Active {
                    ctx.engine.media.set_answer(id, &answer.media_addr(), 0).await?;
                }
            }
            Err(e) => {
                tracing::warn!(target: "gbcms::invite", stream_id = %id, "answer SDP unparsable: {}", e);
            }
        }
    }

    ctx.engine.persist(entry, req.start, req.stop).await?;
    entry.wait_published(invite_timeout).await?;
    ctx.engine.persist(entry, req.start, req.stop).await?;
    Ok(())
}

/// 停流（幂等）
pub async fn stop_stream(ctx: &CmsContext, stream_id: &str) -> Result<()> {
    ctx.engine.close_stream(stream_id, &ctx.dialogs).await
}

/// 广播会合标识：流号加随机尾缀。
/// 作为 Notify/Broadcast 的 SourceID 下发，设备回呼 INVITE 的 request-URI user 即此值。
fn broadcast_source_id(stream_id: &str) -> String {
    format!("{}-{:08x}", stream_id, rand::random::<u32>())
}

/// 语音广播：Notify/Broadcast 通知设备，设备反向 INVITE 取音频流
pub async fn start_broadcast(
    ctx: &Arc<CmsContext>,
    device_id: &str,
    channel_id: &str,
) -> Result<Arc<StreamEntry>> {
    let id = stream_id(StreamType::Broadcast, device_id, channel_id, 0, 0);
    let invite_timeout = Duration::from_secs(ctx.cfg.sip.invite_timeout);

    let entry = match ctx.engine.try_insert(&id, StreamType::Broadcast, device_id, channel_id, 0) {
        InsertOutcome::Existing(entry) => return Ok(entry),
        InsertOutcome::Created(entry) => entry,
    };

    let source_id = broadcast_source_id(&id);
    let (tx, rx) = oneshot::channel();
    ctx.broadcasts.insert(source_id.clone(), tx);

    let result = async {
        let body = xml::notify_broadcast(ctx.sn.next_sn(), &source_id, channel_id);
        message_to_device(ctx, device_id, body).await?;

        let (invite, addr, tp) = tokio::time::timeout(invite_timeout, rx)
            .await
            .map_err(|_| CmsError::Timeout(format!("{} 未发起广播 INVITE", channel_id)))?
            .map_err(|_| CmsError::Other("broadcast rendezvous dropped".to_string()))?;

        answer_broadcast_invite(ctx, &entry, &invite, addr, tp).await
    }
    .await;

    ctx.broadcasts.remove(&source_id);
    match result {
        Ok(()) => Ok(entry),
        Err(e) => {
            ctx.engine.discard(&id);
            Err(e)
        }
    }
}

/// 应答设备的广播 INVITE：把本级音频流转发到设备宣告的收流地址
async fn answer_broadcast_invite(
    ctx: &Arc<CmsContext>,
    entry: &Arc<StreamEntry>,
    invite: &SipRequest,
    addr: SocketAddr,
    tp: Transport,
) -> Result<()> {
    let offer = SdpInfo::parse(invite.body.as_deref().unwrap_or(""))
        .map_err(|e| CmsError::BadRequest(format!("广播 offer SDP 不合法: {}", e)))?;

    let ssrc = offer.ssrc.unwrap_or_else(|| ctx.ssrc.next(false));
    entry.set_ssrc(ssrc);
    let (_, created) = ctx
        .engine
        .add_sink(
            entry,
            gbcms_media::FORWARD_BROADCAST,
            &offer.media_addr(),
            offer.answer_setup(),
            None,
            None,
        )
        .await?;
    let local_port = created.local_port();

    let sdp = build_sdp(
        &ctx.cfg.sip.id,
        &SdpBuild {
            media: "audio",
            invite_type: InviteType::Broadcast,
            ip: &ctx.cfg.media.stream_ip,
            port: local_port,
            start_time: 0,
            stop_time: 0,
            setup: offer.answer_setup(),
            speed: 0,
            ssrc,
            rtpmap: AUDIO_RTPMAP,
            direction: "sendonly",
        },
    );

    let mut resp = SipResponse::for_request(200, "OK", invite);
    resp.add_header("Contact", format!("<{}>", ctx.contact_uri()));
    resp.add_header("Content-Type", "application/sdp");
    let local_tag = resp.to_tag().unwrap_or_default().to_string();
    resp.set_body(sdp);

    let call_id = invite.call_id().unwrap_or_default().to_string();
    let ack_rx = ctx.acks.register(&call_id);
    ctx.transport.send_response(&resp, addr, tp).await?;

    if tokio::time::timeout(Duration::from_secs(5), ack_rx).await.is_err() {
        ctx.acks.cancel(&call_id);
        tracing::warn!(target: "gbcms::invite", call_id = %call_id, "broadcast ACK missing");
    }

    entry.set_call_id(&call_id);
    entry.set_published(true);
    ctx.dialogs
        .insert(Dialog {
            call_id,
            stream_id: entry.stream_id.clone(),
            device_id: entry.device_id.clone(),
            channel_id: entry.channel_id.clone(),
            direction: Direction::In,
            template: uas_template(invite, &local_tag, addr),
            remote: addr,
            transport: tp,
        })
        .await;
    ctx.engine.persist(entry, 0, 0).await?;
    Ok(())
}

/// 回放控制动作
#[derive(Debug, Clone, Copy)]
pub enum PlaybackControl {
    Play,
    Pause,
    /// 倍速
    Scale(f32),
    /// 拖动到相对起点的秒数
    Seek(i64),
}

/// MANSRTSP 控制体
pub fn mansrtsp_body(ctrl: PlaybackControl, cseq: u32) -> String {
    match ctrl {
        PlaybackControl::Play => {
            format!("PLAY RTSP/1.0\r\nCSeq: {}\r\nRange: npt=now-\r\n", cseq)
        }
        PlaybackControl::Pause => {
            format!("PAUSE RTSP/1.0\r\nCSeq: {}\r\nPauseTime: now\r\n", cseq)
        }
        PlaybackControl::Scale(scale) => {
            format!("PLAY RTSP/1.0\r\nCSeq: {}\r\nScale: {:.1}\r\n", cseq, scale)
        }
        PlaybackControl::Seek(secs) => {
            format!("PLAY RTSP/1.0\r\nCSeq: {}\r\nRange: npt={}-\r\n", cseq, secs)
        }
    }
}

/// 对回放流下发控制（对话内 INFO）
pub async fn playback_control(
    ctx: &CmsContext,
    stream_id: &str,
    ctrl: PlaybackControl,
) -> Result<()> {
    let entry = ctx
        .engine
        .get(stream_id)
        .ok_or_else(|| CmsError::NotFound("流", stream_id.to_string()))?;
    if !entry.stream_type.is_playback() {
        return Err(CmsError::BadRequest("仅回放/下载流支持控制".to_string()));
    }
    let call_id = entry
        .source_call_id()
        .ok_or_else(|| CmsError::NotFound("源对话", stream_id.to_string()))?;
    let body = mansrtsp_body(ctrl, ctx.sn.next_sn());
    ctx.dialogs.send_info(&call_id, body).await
}

/// 云台控制
pub async fn ptz_control(
    ctx: &CmsContext,
    device_id: &str,
    channel_id: &str,
    cmd: PtzCommand,
    speed: u8,
) -> Result<()> {
    let body = xml::control_ptz(ctx.sn.next_sn(), channel_id, &xml::ptz_cmd(cmd, speed));
    message_to_device(ctx, device_id, body).await?;
    Ok(())
}

/// 刷新设备目录。同设备已有刷新在跑时返回设备忙。
pub async fn refresh_catalog(ctx: &CmsContext, device_id: &str) -> Result<()> {
    let key = format!("catalog:{}", device_id);
    if !ctx.catalogs.tasks.begin(&key) {
        return Err(CmsError::Busy(format!("{} 目录刷新进行中", device_id)));
    }
    let result = message_to_device(ctx, device_id, xml::query_catalog(ctx.sn.next_sn(), device_id))
        .await
        .map(|_| ());
    ctx.catalogs.tasks.end(&key);
    result
}

fn gb_time(epoch: i64) -> String {
    Utc.timestamp_opt(epoch, 0)
        .single()
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default()
}

/// 查询录像列表，聚合分包后返回
pub async fn query_records(
    ctx: &CmsContext,
    device_id: &str,
    channel_id: &str,
    start: i64,
    stop: i64,
) -> Result<Vec<RecordItem>> {
    let sn = ctx.sn.next_sn();
    let rx = ctx.records.register(sn);
    let body = xml::query_record_info(sn, channel_id, &gb_time(start), &gb_time(stop), "all");

    if let Err(e) = message_to_device(ctx, device_id, body).await {
        ctx.records.cancel(sn);
        return Err(e);
    }
    match tokio::time::timeout(QUERY_TIMEOUT, rx).await {
        Ok(Ok(records)) => Ok(records),
        _ => {
            ctx.records.cancel(sn);
            Err(CmsError::Timeout(format!("{} 录像查询超时", channel_id)))
        }
    }
}

/// 带 SN 回调的查询，应答以整包 MANSCDP 返回
async fn query_with_callback(
    ctx: &CmsContext,
    device_id: &str,
    build: impl FnOnce(u32) -> String,
) -> Result<Manscdp> {
    let (tx, rx) = oneshot::channel();
    let sn = ctx.sn.next_sn_with_callback(Box::new(move |m| {
        let _ = tx.send(m.clone());
    }));

    if let Err(e) = message_to_device(ctx, device_id, build(sn)).await {
        ctx.sn.cancel(sn);
        return Err(e);
    }
    match tokio::time::timeout(MESSAGE_TIMEOUT, rx).await {
        Ok(Ok(body)) => Ok(body),
        _ => {
            ctx.sn.cancel(sn);
            Err(CmsError::Timeout(format!("{} 查询超时", device_id)))
        }
    }
}

/// 查询设备信息（注册成功后自动触发）
pub async fn query_device_info(ctx: &CmsContext, device_id: &str) -> Result<Manscdp> {
    query_with_callback(ctx, device_id, |sn| xml::query_device_info(sn, device_id)).await
}

/// 查询设备工作状态
pub async fn query_device_status(ctx: &CmsContext, device_id: &str) -> Result<Manscdp> {
    query_with_callback(ctx, device_id, |sn| xml::query_device_status(sn, device_id)).await
}
