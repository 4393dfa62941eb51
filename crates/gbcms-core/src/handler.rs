// 入站信令分发
// 按方法与来源（下级设备 / 上级平台）路由，承载注册鉴权与上级点流

use crate::cascade::{self, CascadeManager};
use crate::catalog::is_directory;
use crate::context::CmsContext;
use crate::dialog::{Dialog, Direction};
use crate::invite::{self, uas_template};
use crate::stream::{self, StreamType};
use crate::subscribe::{self, SubscriptionEngine, SubscribeEvent};
use async_trait::async_trait;
use chrono::Utc;
use gbcms_sip::auth::{make_challenge, verify_authorization};
use gbcms_sip::sdp::{build_sdp, InviteType, SdpBuild, SdpInfo, PS_RTPMAP};
use gbcms_sip::xml::{self, parse_manscdp, Manscdp, ManscdpRoot};
use gbcms_sip::{RequestHandler, SipMethod, SipRequest, SipResponse, Transport};
use gbcms_store::entity::{device, platform};
use gbcms_store::WriteOp;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

/// 请求来源
enum Origin {
    Device(String),
    Superior(platform::Model),
}

pub struct Dispatcher {
    ctx: Arc<CmsContext>,
    cascades: Arc<CascadeManager>,
    pub subs: Arc<SubscriptionEngine>,
}

#[async_trait]
impl RequestHandler for Dispatcher {
    async fn handle_request(&self, req: SipRequest, addr: SocketAddr, tp: Transport) {
        let span = tracing::info_span!(
            target: "gbcms::sip",
            "request",
            method = %req.method,
            from = req.from_user().unwrap_or("-"),
            remote = %addr
        );
        async {
            // 分发前过滤：来源 IP 与 User-Agent 黑名单
            let blocked = self.ctx.blacklist.blocks_ip(&addr.ip().to_string())
                || req
                    .header("User-Agent")
                    .is_some_and(|ua| self.ctx.blacklist.blocks_user_agent(ua));
            if blocked {
                tracing::warn!(target: "gbcms::sip", remote = %addr, "blacklisted request rejected");
                if let Err(e) = self.reply(&req, 403, "Forbidden", addr, tp).await {
                    tracing::debug!(target: "gbcms::sip", "reject send failed: {}", e);
                }
                return;
            }

            let result = match req.method {
                SipMethod::Register => self.on_register(&req, addr, tp).await,
                SipMethod::Message => self.on_message(&req, addr, tp).await,
                SipMethod::Invite => self.on_invite(&req, addr, tp).await,
                SipMethod::Ack => self.on_ack(&req).await,
                SipMethod::Bye => self.on_bye(&req, addr, tp).await,
                SipMethod::Subscribe => self.on_subscribe(&req, addr, tp).await,
                SipMethod::Notify => self.on_notify(&req, addr, tp).await,
                SipMethod::Info => self.on_info(&req, addr, tp).await,
                SipMethod::Cancel => self.reply(&req, 200, "OK", addr, tp).await,
            };
            if let Err(e) = result {
                tracing::warn!(target: "gbcms::sip", "handle {} failed: {}", req.method, e);
            }
        }
        .instrument(span)
        .await
    }
}

impl Dispatcher {
    pub fn new(
        ctx: Arc<CmsContext>,
        cascades: Arc<CascadeManager>,
        subs: Arc<SubscriptionEngine>,
    ) -> Arc<Self> {
        Arc::new(Self { ctx, cascades, subs })
    }

    async fn reply(
        &self,
        req: &SipRequest,
        code: u16,
        reason: &str,
        addr: SocketAddr,
        tp: Transport,
    ) -> crate::Result<()> {
        let resp = SipResponse::for_request(code, reason, req);
        self.ctx.transport.send_response(&resp, addr, tp).await?;
        Ok(())
    }

    /// 来源分类：From 编码命中上级平台配置即视为上级
    async fn classify(&self, req: &SipRequest) -> Option<Origin> {
        let from = req.from_user()?.to_string();
        match self.ctx.store.platform(&from).await {
            Ok(Some(p)) => Some(Origin::Superior(p)),
            _ => Some(Origin::Device(from)),
        }
    }

    // ---- REGISTER ----

    async fn on_register(
        &self,
        req: &SipRequest,
        addr: SocketAddr,
        tp: Transport,
    ) -> crate::Result<()> {
        let Some(device_id) = req.from_user().map(str::to_string) else {
            return self.reply(req, 400, "Bad Request", addr, tp).await;
        };
        // 上级平台不会向本级注册
        if matches!(self.classify(req).await, Some(Origin::Superior(_))) {
            return self.reply(req, 400, "Bad Request", addr, tp).await;
        }
        if self.ctx.blacklist.blocks_device(&device_id) {
            tracing::warn!(target: "gbcms::sip", device_id = %device_id, "blacklisted REGISTER rejected");
            return self.reply(req, 403, "Forbidden", addr, tp).await;
        }

        let existing = self.ctx.store.device(&device_id).await?;
        let password = existing
            .as_ref()
            .and_then(|d| d.password.clone())
            .unwrap_or_else(|| self.ctx.cfg.sip.password.clone());

        let authorized = match req.header("Authorization") {
            Some(auth) => verify_authorization(
                auth,
                &device_id,
                &self.ctx.cfg.sip.domain,
                &req.uri,
                &password,
                "REGISTER",
            ),
            None => false,
        };
        if !authorized {
            let mut resp = SipResponse::for_request(401, "Unauthorized", req);
            let (_, challenge) = make_challenge(&self.ctx.cfg.sip.domain, &device_id);
            resp.add_header("WWW-Authenticate", challenge);
            self.ctx.transport.send_response(&resp, addr, tp).await?;
            return Ok(());
        }

        let expires = req
            .expires()
            .unwrap_or(self.ctx.cfg.sip.register_expires)
            .min(self.ctx.cfg.sip.register_expires);

        // 注销
        if expires == 0 {
            let mut resp = SipResponse::for_request(200, "OK", req);
            resp.add_header("Expires", "0");
            self.ctx.transport.send_response(&resp, addr, tp).await?;
            self.ctx
                .engine
                .close_device_streams(&device_id, &self.ctx.dialogs)
                .await;
            self.ctx.devices.mark_offline(&device_id).await;
            return Ok(());
        }

        let mut resp = SipResponse::for_request(200, "OK", req);
        resp.add_header("Date", Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string());
        resp.add_header("Expires", expires.to_string());
        self.ctx.transport.send_response(&resp, addr, tp).await?;

        let first_register = existing.is_none() || existing.as_ref().is_some_and(|d| !d.online);
        let mut row = existing.unwrap_or_else(|| device::Model {
            device_id: device_id.clone(),
            name: device_id.clone(),
            manufacturer: String::new(),
            model: String::new(),
            firmware: String::new(),
            transport: tp.as_str().to_string(),
            remote_addr: addr.to_string(),
            expires: expires as i32,
            register_time: Utc::now(),
            keepalive_time: Utc::now(),
            online: true,
            channel_count: 0,
            password: None,
            media_setup: None,
            sub_catalog: true,
            sub_position: false,
            sub_alarm: true,
        });
        row.transport = tp.as_str().to_string();
        row.remote_addr = addr.to_string();
        row.expires = expires as i32;
        row.register_time = Utc::now();
        row.keepalive_time = Utc::now();
        row.online = true;
        self.ctx.devices.mark_online(row, addr, tp).await;

        // 首次上线拉设备信息和目录，并建立事件订阅
        if first_register {
            let ctx = self.ctx.clone();
            let subs = self.subs.clone();
            let device_id = device_id.clone();
            tokio::spawn(async move {
                after_register(&ctx, &subs, &device_id).await;
            });
        }
        Ok(())
    }

    // ---- MESSAGE ----

    async fn on_message(
        &self,
        req: &SipRequest,
        addr: SocketAddr,
        tp: Transport,
    ) -> crate::Result<()> {
        let Some(body) = req.body.as_deref() else {
            return self.reply(req, 400, "Bad Request", addr, tp).await;
        };
        let (root, msg) = match parse_manscdp(body.as_bytes()) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(target: "gbcms::sip", "MANSCDP unparsable: {}", e);
                return self.reply(req, 400, "Bad Request", addr, tp).await;
            }
        };
        let origin = self.classify(req).await;

        match (root, origin) {
            (ManscdpRoot::Notify, Some(Origin::Device(from))) => {
                // 未注册设备的心跳回 400，促使其重新注册
                if msg.cmd_type == "Keepalive" {
                    let known = self.ctx.devices.keepalive(&from, addr).await;
                    let (code, reason) = if known { (200, "OK") } else { (400, "Bad Request") };
                    return self.reply(req, code, reason, addr, tp).await;
                }
                self.reply(req, 200, "OK", addr, tp).await?;
                self.on_device_notify(&from, &msg).await
            }
            (ManscdpRoot::Response, Some(Origin::Device(from))) => {
                self.reply(req, 200, "OK", addr, tp).await?;
                self.on_device_response(&from, &msg).await
            }
            (ManscdpRoot::Query, Some(Origin::Superior(p))) => {
                self.reply(req, 200, "OK", addr, tp).await?;
                self.on_superior_query(&p, &msg, addr, tp).await
            }
            (ManscdpRoot::Control, Some(Origin::Superior(_))) => {
                self.reply(req, 200, "OK", addr, tp).await?;
                self.on_superior_control(&msg).await
            }
            (ManscdpRoot::Response, Some(Origin::Superior(_))) => {
                // 上级对本级通知的确认
                self.reply(req, 200, "OK", addr, tp).await
            }
            _ => self.reply(req, 400, "Bad Request", addr, tp).await,
        }
    }

    async fn on_device_notify(&self, from: &str, msg: &Manscdp) -> crate::Result<()> {
        match msg.cmd_type.as_str() {
            "Alarm" => {
                subscribe::ingest_alarm(&self.ctx, msg).await?;
                // 报警需要应答确认
                if let Some(sn) = msg.sn {
                    let ack = xml::response_alarm_ack(sn, &msg.device_id);
                    let _ = invite::message_to_device(&self.ctx, from, ack).await;
                }
                Ok(())
            }
            "MobilePosition" => subscribe::ingest_position(&self.ctx, msg).await,
            "Catalog" => {
                self.ctx.catalogs.ingest(from, msg).await;
                Ok(())
            }
            "MediaStatus" => {
                // 121：回放/下载源播完
                if msg.notify_type == Some(121) {
                    self.close_playback_of(&msg.device_id).await;
                }
                Ok(())
            }
            "Broadcast" => Ok(()),
            other => {
                tracing::debug!(target: "gbcms::sip", cmd = other, "unhandled Notify");
                Ok(())
            }
        }
    }

    async fn close_playback_of(&self, channel_id: &str) {
        let targets: Vec<String> = self
            .ctx
            .engine
            .active_streams()
            .into_iter()
            .filter(|s| s.channel_id == channel_id && s.stream_type.is_playback())
            .map(|s| s.stream_id.clone())
            .collect();
        for id in targets {
            if let Err(e) = self.ctx.engine.close_stream(&id, &self.ctx.dialogs).await {
                tracing::warn!(target: "gbcms::stream", stream_id = %id, "close after MediaStatus failed: {}", e);
            }
        }
    }

    async fn on_device_response(&self, from: &str, msg: &Manscdp) -> crate::Result<()> {
        // SN 回调优先
        if let Some(sn) = msg.sn {
            if self.ctx.sn.dispatch(sn, msg) {
                // DeviceInfo 同时刷新设备行
                if msg.cmd_type == "DeviceInfo" {
                    self.update_device_info(from, msg).await;
                }
                return Ok(());
            }
        }
        match msg.cmd_type.as_str() {
            "Catalog" => {
                self.ctx.catalogs.ingest(from, msg).await;
                Ok(())
            }
            "RecordInfo" => {
                self.ctx.records.ingest(msg);
                Ok(())
            }
            "DeviceInfo" => {
                self.update_device_info(from, msg).await;
                Ok(())
            }
            other => {
                tracing::debug!(target: "gbcms::sip", cmd = other, "unmatched Response");
                Ok(())
            }
        }
    }

    async fn update_device_info(&self, device_id: &str, msg: &Manscdp) {
        if let Ok(Some(mut row)) = self.ctx.store.device(device_id).await {
            if !msg.device_name.trim().is_empty() {
                row.name = msg.device_name.trim().to_string();
            }
            row.manufacturer = msg.manufacturer.trim().to_string();
            row.model = msg.model.trim().to_string();
            row.firmware = msg.firmware.trim().to_string();
            let _ = self.ctx.writer.post(WriteOp::SaveDevice(row)).await;
        }
    }

    async fn on_superior_query(
        &self,
        p: &platform::Model,
        msg: &Manscdp,
        addr: SocketAddr,
        tp: Transport,
    ) -> crate::Result<()> {
        let sn = msg.sn.unwrap_or(0);
        match msg.cmd_type.as_str() {
            "Catalog" => {
                let ctx = self.ctx.clone();
                let p = p.clone();
                tokio::spawn(async move {
                    if let Err(e) = cascade::answer_catalog_query(&ctx, &p, sn, addr, tp).await {
                        tracing::error!(target: "gbcms::cascade", "answer catalog failed: {}", e);
                    }
                });
                Ok(())
            }
            "DeviceInfo" => {
                let body = xml::response_device_info(
                    sn,
                    &p.cms_id,
                    "GB28181 CMS",
                    "gbcms",
                    "cms",
                    env!("CARGO_PKG_VERSION"),
                );
                self.message_to_superior(p, body, addr, tp).await
            }
            "DeviceStatus" => {
                let body = xml::response_device_status(sn, &p.cms_id, true);
                self.message_to_superior(p, body, addr, tp).await
            }
            other => {
                tracing::debug!(target: "gbcms::sip", cmd = other, "unhandled superior Query");
                Ok(())
            }
        }
    }

    async fn message_to_superior(
        &self,
        p: &platform::Model,
        body: String,
        addr: SocketAddr,
        tp: Transport,
    ) -> crate::Result<()> {
        let mut req = invite::base_request(
            &self.ctx,
            SipMethod::Message,
            format!("sip:{}@{}", p.id, addr),
            &p.id,
            tp,
        );
        req.headers.set("Content-Type", "Application/MANSCDP+xml");
        req.set_body(body);
        self.ctx
            .transport
            .request_reply(&req, addr, tp, Duration::from_secs(5))
            .await?;
        Ok(())
    }

    /// 上级控制命令转发给通道所属设备
    async fn on_superior_control(&self, msg: &Manscdp) -> crate::Result<()> {
        let Some(ptz) = msg.ptz_cmd.clone() else {
            return Ok(());
        };
        let channel_id = msg.device_id.clone();
        let Some(channel) = self.ctx.store.channel_owner(&channel_id).await? else {
            return Err(crate::CmsError::NotFound("通道", channel_id));
        };
        let body = xml::control_ptz(self.ctx.sn.next_sn(), &channel_id, &ptz);
        invite::message_to_device(&self.ctx, &channel.root_id, body).await?;
        Ok(())
    }

    // ---- INVITE ----

    async fn on_invite(
        &self,
        req: &SipRequest,
        addr: SocketAddr,
        tp: Transport,
    ) -> crate::Result<()> {
        match self.classify(req).await {
            Some(Origin::Superior(p)) => self.on_superior_invite(req, &p, addr, tp).await,
            Some(Origin::Device(_)) => {
                // 设备主动 INVITE 只出现在广播取流，request-URI user 必须命中下发的 SourceID
                let Some(key) = req.uri_user().map(str::to_string) else {
                    return self.reply(req, 400, "Bad Request", addr, tp).await;
                };
                match self.ctx.broadcasts.remove(&key) {
                    Some((_, tx)) => {
                        self.reply(req, 100, "Trying", addr, tp).await?;
                        let _ = tx.send((req.clone(), addr, tp));
                        Ok(())
                    }
                    None => self.reply(req, 404, "Not Found", addr, tp).await,
                }
            }
            None => self.reply(req, 400, "Bad Request", addr, tp).await,
        }
    }

    /// 上级点流：向下开流后加转发出口指向上级收流地址
    async fn on_superior_invite(
        &self,
        req: &SipRequest,
        p: &platform::Model,
        addr: SocketAddr,
        tp: Transport,
    ) -> crate::Result<()> {
        let Some(channel_id) = req.uri_user().map(str::to_string) else {
            return self.reply(req, 400, "Bad Request", addr, tp).await;
        };
        if is_directory(&channel_id) {
            return self.reply(req, 400, "Bad Request", addr, tp).await;
        }
        let offer = match SdpInfo::parse(req.body.as_deref().unwrap_or("")) {
            Ok(o) => o,
            Err(_) => return self.reply(req, 400, "Bad Request", addr, tp).await,
        };
        let Some(invite_type) = offer.invite_type else {
            return self.reply(req, 488, "Not Acceptable Here", addr, tp).await;
        };
        let stream_type = match invite_type {
            InviteType::Play => StreamType::Play,
            InviteType::Playback => StreamType::Playback,
            InviteType::Download => StreamType::Download,
            _ => return self.reply(req, 488, "Not Acceptable Here", addr, tp).await,
        };
        // 未共享给该上级的通道直接拒绝
        if !cascade::channel_shared_with(&self.ctx, p, &channel_id).await? {
            return self.reply(req, 403, "Forbidden", addr, tp).await;
        }

        let (entry, forward) = match self.ctx.store.channel_owner(&channel_id).await? {
            Some(channel) => {
                self.reply(req, 100, "Trying", addr, tp).await?;
                let entry = invite::start_stream(
                    &self.ctx,
                    invite::StreamRequest {
                        stream_type,
                        device_id: channel.root_id.clone(),
                        channel_id: channel_id.clone(),
                        start: offer.start_time,
                        stop: offer.stop_time,
                        speed: offer.download_speed.unwrap_or(0),
                        setup: invite::default_setup(&self.ctx, &channel.root_id, &channel_id).await,
                    },
                )
                .await;
                match entry {
                    Ok(entry) => (entry, gbcms_media::FORWARD_CASCADED),
                    Err(e) => {
                        tracing::warn!(target: "gbcms::invite", channel_id = %channel_id, "pull for superior failed: {}", e);
                        return self.reply(req, 503, "Service Unavailable", addr, tp).await;
                    }
                }
            }
            None => {
                // JT/1078 网关通道：流由网关推上来，只能实时且须已在推
                let Some(jt) = self.ctx.store.jt_device_by_gb(&channel_id).await? else {
                    return self.reply(req, 404, "Not Found", addr, tp).await;
                };
                if stream_type != StreamType::Play {
                    return self.reply(req, 488, "Not Acceptable Here", addr, tp).await;
                }
                let id = stream::stream_id(StreamType::Play, &jt.gb_id, &jt.gb_id, 0, 0);
                let Some(entry) = self.ctx.engine.get(&id) else {
                    return self.reply(req, 404, "Not Found", addr, tp).await;
                };
                self.reply(req, 100, "Trying", addr, tp).await?;
                (entry, gbcms_media::FORWARD_GATEWAY_1078)
            }
        };

        let call_id = req.call_id().unwrap_or_default().to_string();
        let (_, created) = self
            .ctx
            .engine
            .add_sink(
                &entry,
                forward,
                &offer.media_addr(),
                offer.answer_setup(),
                Some(call_id.clone()),
                Some(p.id.clone()),
            )
            .await?;
        let local_port = created.local_port();

        let sdp = build_sdp(
            &p.cms_id,
            &SdpBuild {
                media: "video",
                invite_type,
                ip: &self.ctx.cfg.media.stream_ip,
                port: local_port,
                start_time: offer.start_time,
                stop_time: offer.stop_time,
                setup: offer.answer_setup(),
                speed: 0,
                ssrc: offer.ssrc.unwrap_or(entry.ssrc()),
                rtpmap: PS_RTPMAP,
                direction: "sendonly",
            },
        );

        let mut resp = SipResponse::for_request(200, "OK", req);
        resp.add_header("Contact", format!("<{}>", self.ctx.contact_uri()));
        resp.add_header("Content-Type", "application/sdp");
        let local_tag = resp.to_tag().unwrap_or_default().to_string();
        resp.set_body(sdp);

        let ack_rx = self.ctx.acks.register(&call_id);
        self.ctx.transport.send_response(&resp, addr, tp).await?;

        self.ctx
            .dialogs
            .insert(Dialog {
                call_id: call_id.clone(),
                stream_id: entry.stream_id.clone(),
                device_id: entry.device_id.clone(),
                channel_id,
                direction: Direction::In,
                template: uas_template(req, &local_tag, addr),
                remote: addr,
                transport: tp,
            })
            .await;

        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(Duration::from_secs(5), ack_rx).await.is_err() {
                ctx.acks.cancel(&call_id);
                tracing::warn!(target: "gbcms::invite", call_id = %call_id, "superior ACK missing");
            }
        });
        Ok(())
    }

    async fn on_ack(&self, req: &SipRequest) -> crate::Result<()> {
        if let Some(call_id) = req.call_id() {
            self.ctx.acks.complete(call_id);
        }
        Ok(())
    }

    // ---- BYE ----

    async fn on_bye(
        &self,
        req: &SipRequest,
        addr: SocketAddr,
        tp: Transport,
    ) -> crate::Result<()> {
        self.reply(req, 200, "OK", addr, tp).await?;
        let Some(call_id) = req.call_id().map(str::to_string) else {
            return Ok(());
        };
        let Some(dialog) = self.ctx.dialogs.get(&call_id) else {
            tracing::debug!(target: "gbcms::sip", call_id = %call_id, "BYE for unknown dialog");
            return Ok(());
        };

        match dialog.direction {
            // 源端挂断：整流拆除
            Direction::Out => {
                self.ctx.dialogs.remove(&call_id).await;
                self.ctx
                    .engine
                    .close_stream(&dialog.stream_id, &self.ctx.dialogs)
                    .await?;
            }
            // 上级挂断（或广播设备挂断）：只拆对应出口
            Direction::In => {
                self.ctx.dialogs.remove(&call_id).await;
                if dialog.stream_id.ends_with(".broadcast") {
                    self.ctx
                        .engine
                        .close_stream(&dialog.stream_id, &self.ctx.dialogs)
                        .await?;
                } else if let Some((entry, sink)) = self.ctx.engine.sink_by_call_id(&call_id) {
                    self.ctx.engine.close_sink(&entry.stream_id, &sink.sink_id).await?;
                }
            }
        }
        Ok(())
    }

    // ---- SUBSCRIBE / NOTIFY / INFO ----

    /// 上级订阅本级目录：应答后整目录逐帧 NOTIFY
    async fn on_subscribe(
        &self,
        req: &SipRequest,
        addr: SocketAddr,
        tp: Transport,
    ) -> crate::Result<()> {
        let Some(Origin::Superior(p)) = self.classify(req).await else {
            return self.reply(req, 400, "Bad Request", addr, tp).await;
        };
        let expires = req.expires().unwrap_or(3600);
        let mut resp = SipResponse::for_request(200, "OK", req);
        resp.add_header("Expires", expires.to_string());
        self.ctx.transport.send_response(&resp, addr, tp).await?;

        if expires == 0 {
            return Ok(());
        }
        let sn = req
            .body
            .as_deref()
            .and_then(|b| parse_manscdp(b.as_bytes()).ok())
            .and_then(|(_, m)| m.sn)
            .unwrap_or(0);
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            if let Err(e) = cascade::notify_catalog(&ctx, &p, sn, addr, tp).await {
                tracing::error!(target: "gbcms::cascade", "catalog NOTIFY failed: {}", e);
            }
        });
        Ok(())
    }

    /// 设备订阅事件通知。上级不会向本级发 NOTIFY。
    async fn on_notify(
        &self,
        req: &SipRequest,
        addr: SocketAddr,
        tp: Transport,
    ) -> crate::Result<()> {
        let Some(Origin::Device(from)) = self.classify(req).await else {
            return self.reply(req, 400, "Bad Request", addr, tp).await;
        };
        let Some(body) = req.body.as_deref() else {
            return self.reply(req, 400, "Bad Request", addr, tp).await;
        };
        match parse_manscdp(body.as_bytes()) {
            Ok((_, msg)) => {
                self.reply(req, 200, "OK", addr, tp).await?;
                self.on_device_notify(&from, &msg).await
            }
            Err(_) => self.reply(req, 400, "Bad Request", addr, tp).await,
        }
    }

    /// 上级的回放控制 INFO 转发到源对话
    async fn on_info(
        &self,
        req: &SipRequest,
        addr: SocketAddr,
        tp: Transport,
    ) -> crate::Result<()> {
        if !matches!(self.classify(req).await, Some(Origin::Superior(_))) {
            return self.reply(req, 400, "Bad Request", addr, tp).await;
        }
        let dialog = req.call_id().and_then(|c| self.ctx.dialogs.get(c));
        let Some(dialog) = dialog else {
            return self.reply(req, 481, "Call/Transaction Does Not Exist", addr, tp).await;
        };
        let Some(entry) = self.ctx.engine.get(&dialog.stream_id) else {
            return self.reply(req, 481, "Call/Transaction Does Not Exist", addr, tp).await;
        };
        let Some(source_call) = entry.source_call_id() else {
            return self.reply(req, 481, "Call/Transaction Does Not Exist", addr, tp).await;
        };
        let Some(body) = req.body.clone() else {
            return self.reply(req, 400, "Bad Request", addr, tp).await;
        };

        match self.ctx.dialogs.send_info(&source_call, body).await {
            Ok(()) => self.reply(req, 200, "OK", addr, tp).await,
            Err(e) => {
                tracing::warn!(target: "gbcms::sip", "forward INFO failed: {}", e);
                self.reply(req, 503, "Service Unavailable", addr, tp).await
            }
        }
    }
}

/// 注册成功后的设备初始化：设备信息、目录、事件订阅
async fn after_register(ctx: &Arc<CmsContext>, subs: &Arc<SubscriptionEngine>, device_id: &str) {
    if let Ok(info) = invite::query_device_info(ctx, device_id).await {
        if let Ok(Some(mut row)) = ctx.store.device(device_id).await {
            if !info.device_name.trim().is_empty() {
                row.name = info.device_name.trim().to_string();
            }
            row.manufacturer = info.manufacturer.trim().to_string();
            row.model = info.model.trim().to_string();
            row.firmware = info.firmware.trim().to_string();
            let _ = ctx.writer.post(WriteOp::SaveDevice(row)).await;
        }
    }
    if let Err(e) = invite::refresh_catalog(ctx, device_id).await {
        tracing::warn!(target: "gbcms::catalog", device_id, "initial catalog query failed: {}", e);
    }

    // 按设备订阅开关建立事件订阅，移动位置订阅带上报间隔
    let row = match ctx.store.device(device_id).await {
        Ok(Some(row)) => row,
        _ => return,
    };
    let sub_cfg = &ctx.cfg.subscribe;
    let mut wanted = Vec::new();
    if row.sub_catalog {
        wanted.push((SubscribeEvent::Catalog, sub_cfg.expires, 0));
    }
    if row.sub_alarm {
        wanted.push((SubscribeEvent::Alarm, sub_cfg.expires, 0));
    }
    if row.sub_position {
        wanted.push((
            SubscribeEvent::MobilePosition,
            sub_cfg.mobile_position_expires,
            sub_cfg.mobile_position_interval,
        ));
    }
    for (event, expires, interval) in wanted {
        if let Err(e) = subs.subscribe(ctx, device_id, event, expires, interval).await {
            tracing::debug!(target: "gbcms::subscribe", device_id, event = event.as_str(), "subscribe skipped: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use gbcms_sip::SipTransport;
    use gbcms_store::Store;

    async fn test_ctx() -> Arc<CmsContext> {
        let db = gbcms_store::repo::connect("sqlite::memory:").await.unwrap();
        gbcms_store::repo::init_schema(&db).await.unwrap();
        let writer = gbcms_store::spawn_writer(db.clone());
        CmsContext::new(Config::default(), SipTransport::new(), Store::new(db), writer)
    }

    fn request_from(method: SipMethod, from_user: &str) -> SipRequest {
        let mut req = SipRequest::new(method, "sip:34020000002000000001@3402000000");
        req.add_header("Via", "SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bK1");
        req.add_header("From", format!("<sip:{}@3402000000>;tag=1", from_user));
        req.add_header("To", "<sip:34020000002000000001@3402000000>");
        req.add_header("Call-ID", "t1");
        req.add_header("CSeq", format!("1 {}", method));
        req
    }

    #[tokio::test]
    async fn test_classify_superior_by_platform_row() {
        let ctx = test_ctx().await;
        ctx.writer
            .submit(WriteOp::SavePlatform(platform::Model {
                id: "41010000002000000088".to_string(),
                name: "上级".to_string(),
                enable: true,
                domain: "4101000000".to_string(),
                ip: "10.9.9.9".to_string(),
                port: 5060,
                transport: "UDP".to_string(),
                cms_id: "34020000002000000001".to_string(),
                password: "pw".to_string(),
                expires: 3600,
                keepalive_secs: 60,
                catalog_group: 1,
                share_all: false,
                online: false,
                register_time: None,
            }))
            .await
            .unwrap();

        let cascades = CascadeManager::new(ctx.clone());
        let subs = Arc::new(SubscriptionEngine::new());
        let dispatcher = Dispatcher::new(ctx, cascades, subs);

        let sup = request_from(SipMethod::Message, "41010000002000000088");
        assert!(matches!(
            dispatcher.classify(&sup).await,
            Some(Origin::Superior(_))
        ));
        let dev = request_from(SipMethod::Message, "34020000001320000001");
        assert!(matches!(
            dispatcher.classify(&dev).await,
            Some(Origin::Device(_))
        ));
    }

    #[tokio::test]
    async fn test_device_invite_matches_waiter_by_request_uri_only() {
        let ctx = test_ctx().await;
        let (tx, _rx) = tokio::sync::oneshot::channel();
        // 会合键是下发的 SourceID，不是设备编码
        ctx.broadcasts
            .insert("34020000001370000001-00ab12cd".to_string(), tx);

        let cascades = CascadeManager::new(ctx.clone());
        let subs = Arc::new(SubscriptionEngine::new());
        let dispatcher = Dispatcher::new(ctx.clone(), cascades, subs);

        // request-URI user 为本级编码，From 为设备编码：都不命中会合键
        let req = request_from(SipMethod::Invite, "34020000001370000001");
        let addr: SocketAddr = "10.0.0.1:5060".parse().unwrap();
        let _ = dispatcher.on_invite(&req, addr, Transport::Udp).await;
        assert!(ctx
            .broadcasts
            .contains_key("34020000001370000001-00ab12cd"));
    }
}
