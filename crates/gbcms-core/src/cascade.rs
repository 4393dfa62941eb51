// 级联客户端
// 向上级平台注册、心跳与注销，以及上级目录查询的分包应答

use crate::context::CmsContext;
use crate::error::{CmsError, Result};
use crate::invite::base_request;
use chrono::Utc;
use dashmap::DashMap;
use gbcms_sip::auth::{make_authorization, parse_digest_header};
use gbcms_sip::message::new_branch;
use gbcms_sip::xml::{self, CatalogItem};
use gbcms_sip::{SipMethod, SipRequest, Transport};
use gbcms_store::entity::platform;
use gbcms_store::WriteOp;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(8);

/// 注册应答归类。retried 表示已带 Digest 凭证重试过：
/// 此时再收 401/403 即凭证被拒，不再退避重试。
fn settle_register(platform_id: &str, status: u16, retried: bool) -> Result<()> {
    match status {
        200 => Ok(()),
        401 | 403 if retried => Err(CmsError::Auth(format!(
            "上级 {} 拒绝凭证: {}",
            platform_id, status
        ))),
        code => Err(CmsError::BadRequest(format!(
            "上级 {} 注册失败: {}",
            platform_id, code
        ))),
    }
}

/// 单个上级平台的 UA 实例
pub struct CascadeUa {
    ctx: Arc<CmsContext>,
    platform: platform::Model,
    remote: SocketAddr,
    transport: Transport,
    online: AtomicBool,
    /// 注册 200 的 Via received/rport 观测地址
    nat_addr: Mutex<Option<String>>,
    stop_tx: watch::Sender<bool>,
}

impl CascadeUa {
    fn new(ctx: Arc<CmsContext>, platform: platform::Model) -> Result<Arc<Self>> {
        let remote: SocketAddr = format!("{}:{}", platform.ip, platform.port)
            .parse()
            .map_err(|_| CmsError::Config(format!("上级 {} 地址不合法", platform.id)))?;
        let transport = Transport::parse(&platform.transport).unwrap_or_default();
        let (stop_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            ctx,
            platform,
            remote,
            transport,
            online: AtomicBool::new(false),
            nat_addr: Mutex::new(None),
            stop_tx,
        }))
    }

    pub fn platform_id(&self) -> &str {
        &self.platform.id
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    /// 上级视角看到的本级公网地址，无 NAT 观测时为 None
    pub fn nat_addr(&self) -> Option<String> {
        self.nat_addr.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record_nat(&self, observed: Option<String>) {
        if let Some(addr) = observed {
            tracing::debug!(target: "gbcms::cascade", platform = %self.platform.id, nat = %addr, "NAT address observed");
            *self.nat_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);
        }
    }

    fn build_register(&self, expires: u32) -> SipRequest {
        let mut req = SipRequest::new(
            SipMethod::Register,
            format!("sip:{}@{}", self.platform.id, self.platform.domain),
        );
        req.add_header(
            "Via",
            format!(
                "SIP/2.0/{} {}:{};rport;branch={}",
                self.transport.as_str(),
                self.ctx.cfg.sip.public_ip,
                self.ctx.cfg.sip.port,
                new_branch()
            ),
        );
        let aor = format!("<sip:{}@{}>", self.platform.cms_id, self.ctx.cfg.sip.domain);
        req.add_header(
            "From",
            format!("{};tag={}", aor, gbcms_sip::message::new_tag()),
        );
        req.add_header("To", aor);
        req.add_header(
            "Call-ID",
            gbcms_sip::message::new_call_id(&self.ctx.cfg.sip.public_ip),
        );
        req.add_header("CSeq", "1 REGISTER");
        req.add_header("Contact", format!("<{}>", self.ctx.contact_uri()));
        req.add_header("Max-Forwards", "70");
        req.add_header("Expires", expires.to_string());
        req
    }

    /// 注册一次。401 挑战按 Digest 应答后重试一次。
    async fn register_once(&self, expires: u32) -> Result<()> {
        let req = self.build_register(expires);
        let resp = self
            .ctx
            .transport
            .request_reply(&req, self.remote, self.transport, REGISTER_TIMEOUT)
            .await?;

        let (resp, retried) = if resp.status_code == 401 {
            let challenge = resp
                .header("WWW-Authenticate")
                .and_then(parse_digest_header)
                .ok_or_else(|| CmsError::BadRequest("401 缺少 WWW-Authenticate".to_string()))?;
            let mut retry = self.build_register(expires);
            retry.headers.set("CSeq", "2 REGISTER");
            let auth = make_authorization(
                &self.platform.cms_id,
                &self.platform.password,
                "REGISTER",
                &retry.uri.clone(),
                &challenge,
            )
            .ok_or_else(|| CmsError::BadRequest("挑战缺少 realm/nonce".to_string()))?;
            retry.add_header("Authorization", auth);
            let resp = self
                .ctx
                .transport
                .request_reply(&retry, self.remote, self.transport, REGISTER_TIMEOUT)
                .await?;
            (resp, true)
        } else {
            (resp, false)
        };

        settle_register(&self.platform.id, resp.status_code, retried)?;
        self.record_nat(resp.nat_addr());
        Ok(())
    }

    async fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Relaxed);
        let mut row = self.platform.clone();
        row.online = online;
        row.register_time = online.then(Utc::now);
        if let Err(e) = self.ctx.writer.submit(WriteOp::SavePlatform(row)).await {
            tracing::error!(target: "gbcms::cascade", "persist platform status failed: {}", e);
        }
    }

    async fn keepalive_once(&self) -> Result<()> {
        let mut req = base_request(
            &self.ctx,
            SipMethod::Message,
            format!("sip:{}@{}", self.platform.id, self.remote),
            &self.platform.id,
            self.transport,
        );
        req.headers.set("Content-Type", "Application/MANSCDP+xml");
        req.set_body(xml::notify_keepalive(
            self.ctx.sn.next_sn(),
            &self.platform.cms_id,
        ));
        let resp = self
            .ctx
            .transport
            .request_reply(&req, self.remote, self.transport, REGISTER_TIMEOUT)
            .await?;
        if resp.status_code >= 300 {
            return Err(CmsError::BadRequest(format!(
                "心跳被拒: {}",
                resp.status_code
            )));
        }
        Ok(())
    }

    /// 注册 + 心跳主循环。注册失败退避重试，心跳一旦失败立即重新注册；
    /// 凭证被拒则停循环，平台保持启用但离线，等配置修正后重启。
    async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();
        let expires = self.platform.expires.max(60) as u32;
        let keepalive = Duration::from_secs(self.platform.keepalive_secs.max(10) as u64);
        let refresh = Duration::from_secs((expires / 2) as u64);

        'outer: loop {
            if *stop_rx.borrow() {
                break;
            }
            match self.register_once(expires).await {
                Ok(()) => {
                    tracing::info!(target: "gbcms::cascade", platform = %self.platform.id, "registered to superior");
                    self.set_online(true).await;
                }
                Err(e @ CmsError::Auth(_)) => {
                    tracing::error!(target: "gbcms::cascade", platform = %self.platform.id, "register halted: {}", e);
                    self.set_online(false).await;
                    break 'outer;
                }
                Err(e) => {
                    tracing::warn!(target: "gbcms::cascade", platform = %self.platform.id, "register failed: {}", e);
                    self.set_online(false).await;
                    tokio::select! {
                        _ = stop_rx.changed() => break 'outer,
                        _ = tokio::time::sleep(Duration::from_secs(30)) => continue 'outer,
                    }
                }
            }

            let mut keepalive_tick = tokio::time::interval(keepalive);
            keepalive_tick.tick().await;
            let refresh_at = tokio::time::Instant::now() + refresh;

            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break 'outer,
                    _ = tokio::time::sleep_until(refresh_at) => {
                        // 注册续期
                        continue 'outer;
                    }
                    _ = keepalive_tick.tick() => {
                        if let Err(e) = self.keepalive_once().await {
                            tracing::warn!(target: "gbcms::cascade", platform = %self.platform.id, "keepalive failed, re-registering: {}", e);
                            self.set_online(false).await;
                            continue 'outer;
                        }
                    }
                }
            }
        }

        // 退出前注销并拆除该上级的全部转发出口
        if self.is_online() {
            if let Err(e) = self.register_once(0).await {
                tracing::warn!(target: "gbcms::cascade", platform = %self.platform.id, "unregister failed: {}", e);
            }
            self.set_online(false).await;
        }
        let closed = self
            .ctx
            .engine
            .close_platform_sinks(&self.platform.id, &self.ctx.dialogs)
            .await;
        if closed > 0 {
            tracing::info!(target: "gbcms::cascade", platform = %self.platform.id, closed, "platform forward sinks closed");
        }
        tracing::info!(target: "gbcms::cascade", platform = %self.platform.id, "cascade UA stopped");
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }
}

/// 级联 UA 管理器
pub struct CascadeManager {
    ctx: Arc<CmsContext>,
    uas: DashMap<String, Arc<CascadeUa>>,
}

impl CascadeManager {
    pub fn new(ctx: Arc<CmsContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            uas: DashMap::new(),
        })
    }

    /// 启动单个平台的 UA，重复启动先停旧的
    pub fn start(&self, platform: platform::Model) -> Result<()> {
        if let Some((_, old)) = self.uas.remove(&platform.id) {
            old.stop();
        }
        let ua = CascadeUa::new(self.ctx.clone(), platform)?;
        self.uas.insert(ua.platform_id().to_string(), ua.clone());
        tokio::spawn(ua.run());
        Ok(())
    }

    /// 启动所有启用的平台
    pub async fn start_enabled(&self) -> Result<usize> {
        let platforms = self.ctx.store.platforms_enabled().await?;
        let mut started = 0;
        for p in platforms {
            match self.start(p) {
                Ok(()) => started += 1,
                Err(e) => tracing::error!(target: "gbcms::cascade", "start UA failed: {}", e),
            }
        }
        Ok(started)
    }

    pub fn stop(&self, platform_id: &str) {
        if let Some((_, ua)) = self.uas.remove(platform_id) {
            ua.stop();
        }
    }

    pub fn stop_all(&self) {
        for entry in self.uas.iter() {
            entry.value().stop();
        }
        self.uas.clear();
    }

    pub fn get(&self, platform_id: &str) -> Option<Arc<CascadeUa>> {
        self.uas.get(platform_id).map(|u| u.clone())
    }

    /// 按来源地址识别上级（上级请求的 From 编码与配置核对之外的兜底）
    pub fn by_addr(&self, addr: SocketAddr) -> Option<Arc<CascadeUa>> {
        self.uas
            .iter()
            .find(|u| u.value().remote_addr().ip() == addr.ip())
            .map(|u| u.value().clone())
    }
}

fn catalog_item(ch: gbcms_store::entity::channel::Model, parent: &str) -> CatalogItem {
    CatalogItem {
        device_id: ch.device_id,
        name: ch.name,
        manufacturer: ch.manufacturer.unwrap_or_default(),
        model: ch.model.unwrap_or_default(),
        civil_code: ch.civil_code.unwrap_or_default(),
        parent_id: parent.to_string(),
        status: ch.status,
        parental: ch.parental.unwrap_or(0) as u8,
    }
}

/// 通道是否共享给指定上级：开了 share_all 全共享，否则查绑定表
pub async fn channel_shared_with(
    ctx: &CmsContext,
    platform: &platform::Model,
    channel_id: &str,
) -> Result<bool> {
    if platform.share_all {
        return Ok(true);
    }
    Ok(ctx
        .store
        .platform_channel(&platform.id, channel_id)
        .await?
        .is_some())
}

/// 收集共享给上级的目录项（共享通道 + 车载终端虚拟通道）。
/// share_all 平台给全量通道，否则按绑定表。
async fn shared_catalog_items(
    ctx: &CmsContext,
    platform: &platform::Model,
) -> Result<Vec<CatalogItem>> {
    let mut items: Vec<CatalogItem> = Vec::new();
    if platform.share_all {
        for ch in ctx.store.channels().await? {
            items.push(catalog_item(ch, &platform.cms_id));
        }
    } else {
        for pc in ctx.store.platform_channels(&platform.id).await? {
            if let Some(ch) = ctx.store.channel(&pc.root_id, &pc.channel_id).await? {
                items.push(catalog_item(ch, &platform.cms_id));
            }
        }
    }
    // 车载终端以虚拟通道并入目录
    for jt in ctx.store.jt_devices().await? {
        items.push(CatalogItem {
            device_id: jt.gb_id,
            name: jt.plate,
            parent_id: platform.cms_id.clone(),
            status: if jt.online { "ON" } else { "OFF" }.to_string(),
            ..Default::default()
        });
    }
    Ok(items)
}

/// 应答上级的 Query/Catalog：共享通道逐帧上报，每帧一条
pub async fn answer_catalog_query(
    ctx: &Arc<CmsContext>,
    platform: &platform::Model,
    sn: u32,
    remote: SocketAddr,
    transport: Transport,
) -> Result<()> {
    let items = shared_catalog_items(ctx, platform).await?;
    let sum = items.len() as u32;
    for item in &items {
        let mut req = base_request(
            ctx,
            SipMethod::Message,
            format!("sip:{}@{}", platform.id, remote),
            &platform.id,
            transport,
        );
        req.headers.set("Content-Type", "Application/MANSCDP+xml");
        req.set_body(xml::response_catalog_part(sn, &platform.cms_id, sum, item));
        if let Err(e) = ctx
            .transport
            .request_reply(&req, remote, transport, REGISTER_TIMEOUT)
            .await
        {
            tracing::warn!(target: "gbcms::cascade", platform = %platform.id, "catalog part not acked: {}", e);
        }
    }
    tracing::info!(target: "gbcms::cascade", platform = %platform.id, channels = sum, "catalog answered");
    Ok(())
}

/// 上级 SUBSCRIBE 后的全量目录推送，每帧一条 NOTIFY
pub async fn notify_catalog(
    ctx: &Arc<CmsContext>,
    platform: &platform::Model,
    sn: u32,
    remote: SocketAddr,
    transport: Transport,
) -> Result<()> {
    let items = shared_catalog_items(ctx, platform).await?;
    let sum = items.len() as u32;
    for item in &items {
        let mut req = base_request(
            ctx,
            SipMethod::Notify,
            format!("sip:{}@{}", platform.id, remote),
            &platform.id,
            transport,
        );
        req.headers.set("Event", "Catalog");
        req.headers.set("Content-Type", "Application/MANSCDP+xml");
        req.set_body(xml::notify_catalog_part(sn, &platform.cms_id, sum, item));
        if let Err(e) = ctx
            .transport
            .request_reply(&req, remote, transport, REGISTER_TIMEOUT)
            .await
        {
            tracing::warn!(target: "gbcms::cascade", platform = %platform.id, "catalog NOTIFY part not acked: {}", e);
        }
    }
    tracing::info!(target: "gbcms::cascade", platform = %platform.id, channels = sum, "catalog pushed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use gbcms_sip::SipTransport;
    use gbcms_store::entity::{channel, device, platform_channel};
    use gbcms_store::Store;

    async fn test_ctx() -> Arc<CmsContext> {
        let db = gbcms_store::repo::connect("sqlite::memory:").await.unwrap();
        gbcms_store::repo::init_schema(&db).await.unwrap();
        let writer = gbcms_store::spawn_writer(db.clone());
        CmsContext::new(Config::default(), SipTransport::new(), Store::new(db), writer)
    }

    fn platform_row(id: &str, share_all: bool) -> platform::Model {
        platform::Model {
            id: id.to_string(),
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
            share_all,
            online: false,
            register_time: None,
        }
    }

    fn device_row(id: &str) -> device::Model {
        device::Model {
            device_id: id.to_string(),
            name: id.to_string(),
            manufacturer: String::new(),
            model: String::new(),
            firmware: String::new(),
            transport: "UDP".to_string(),
            remote_addr: "192.168.1.64:5060".to_string(),
            expires: 3600,
            register_time: Utc::now(),
            keepalive_time: Utc::now(),
            online: true,
            channel_count: 0,
            password: None,
            media_setup: None,
            sub_catalog: true,
            sub_position: false,
            sub_alarm: true,
        }
    }

    fn channel_row(root: &str, id: &str) -> channel::Model {
        channel::Model {
            root_id: root.to_string(),
            device_id: id.to_string(),
            name: format!("通道{}", id),
            manufacturer: None,
            model: None,
            owner: None,
            civil_code: None,
            address: None,
            parental: Some(0),
            parent_id: None,
            business_group_id: None,
            register_way: None,
            secrecy: None,
            ip_address: None,
            port: None,
            status: "ON".to_string(),
            longitude: None,
            latitude: None,
            ptz_type: None,
            sub_count: 0,
            setup: None,
        }
    }

    #[test]
    fn test_settle_register_status_mapping() {
        assert!(settle_register("p", 200, false).is_ok());
        assert!(settle_register("p", 200, true).is_ok());
        assert!(matches!(
            settle_register("p", 401, true),
            Err(CmsError::Auth(_))
        ));
        assert!(matches!(
            settle_register("p", 403, true),
            Err(CmsError::Auth(_))
        ));
        assert!(matches!(
            settle_register("p", 401, false),
            Err(CmsError::BadRequest(_))
        ));
        assert!(matches!(
            settle_register("p", 503, true),
            Err(CmsError::BadRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_nat_addr_recorded_once_observed() {
        let ctx = test_ctx().await;
        let ua = CascadeUa::new(ctx, platform_row("41010000002000000088", false)).unwrap();
        assert!(ua.nat_addr().is_none());

        ua.record_nat(Some("59.41.1.2:15060".to_string()));
        assert_eq!(ua.nat_addr().as_deref(), Some("59.41.1.2:15060"));
        // 无观测不清掉已有值
        ua.record_nat(None);
        assert_eq!(ua.nat_addr().as_deref(), Some("59.41.1.2:15060"));
    }

    #[tokio::test]
    async fn test_channel_shared_with_binding_or_share_all() {
        let ctx = test_ctx().await;
        ctx.writer
            .submit(WriteOp::SaveDevice(device_row("d1")))
            .await
            .unwrap();
        ctx.writer
            .submit(WriteOp::SaveChannels(vec![
                channel_row("d1", "c1"),
                channel_row("d1", "c2"),
            ]))
            .await
            .unwrap();
        ctx.writer
            .submit(WriteOp::ReplacePlatformChannels {
                platform_id: "p1".to_string(),
                channels: vec![platform_channel::Model {
                    platform_id: "p1".to_string(),
                    channel_id: "c1".to_string(),
                    root_id: "d1".to_string(),
                }],
            })
            .await
            .unwrap();

        let bound = platform_row("p1", false);
        assert!(channel_shared_with(&ctx, &bound, "c1").await.unwrap());
        assert!(!channel_shared_with(&ctx, &bound, "c2").await.unwrap());

        let open = platform_row("p2", true);
        assert!(channel_shared_with(&ctx, &open, "c2").await.unwrap());
    }

    #[tokio::test]
    async fn test_shared_catalog_items_share_all_takes_every_channel() {
        let ctx = test_ctx().await;
        ctx.writer
            .submit(WriteOp::SaveDevice(device_row("d1")))
            .await
            .unwrap();
        ctx.writer
            .submit(WriteOp::SaveChannels(vec![
                channel_row("d1", "c1"),
                channel_row("d1", "c2"),
            ]))
            .await
            .unwrap();

        let open = platform_row("p2", true);
        let items = shared_catalog_items(&ctx, &open).await.unwrap();
        assert_eq!(items.len(), 2);
        assert!(items.iter().all(|i| i.parent_id == open.cms_id));

        // 未开 share_all 且无绑定则目录为空
        let closed = platform_row("p1", false);
        assert!(shared_catalog_items(&ctx, &closed).await.unwrap().is_empty());
    }
}
