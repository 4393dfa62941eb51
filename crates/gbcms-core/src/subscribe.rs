// 订阅引擎
// 向设备订阅目录/报警/移动位置，对话落库、重启恢复、到期前续订；NOTIFY 内容落历史表

use crate::context::CmsContext;
use crate::error::{CmsError, Result};
use crate::invite::base_request;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use dashmap::DashMap;
use gbcms_sip::xml::{self, Manscdp};
use gbcms_sip::{SipMethod, SipRequest};
use gbcms_store::entity::{alarm, position, sip_dialog};
use gbcms_store::WriteOp;
use std::time::Duration;

const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(8);
/// 续订提前量（秒）：RefreshTime = 现在 + Expires − 60
const REFRESH_AHEAD_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeEvent {
    Catalog,
    Alarm,
    MobilePosition,
}

impl SubscribeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscribeEvent::Catalog => "Catalog",
            SubscribeEvent::Alarm => "Alarm",
            SubscribeEvent::MobilePosition => "MobilePosition",
        }
    }

    /// sip_dialogs.dialog_type 取值
    pub fn dialog_type(&self) -> &'static str {
        match self {
            SubscribeEvent::Catalog => "subscribe_catalog",
            SubscribeEvent::Alarm => "subscribe_alarm",
            SubscribeEvent::MobilePosition => "subscribe_position",
        }
    }

    pub fn from_dialog_type(s: &str) -> Option<Self> {
        match s {
            "subscribe_catalog" => Some(SubscribeEvent::Catalog),
            "subscribe_alarm" => Some(SubscribeEvent::Alarm),
            "subscribe_position" => Some(SubscribeEvent::MobilePosition),
            _ => None,
        }
    }

    fn body(&self, sn: u32, device_id: &str, interval: u32) -> String {
        match self {
            SubscribeEvent::Catalog => xml::query_catalog(sn, device_id),
            SubscribeEvent::Alarm => xml::query_alarm(sn, device_id, "", ""),
            SubscribeEvent::MobilePosition => xml::query_mobile_position(sn, device_id, interval),
        }
    }
}

struct Subscription {
    device_id: String,
    event: SubscribeEvent,
    call_id: String,
    template: SipRequest,
    expires: u32,
    interval: u32,
    /// 续订时刻，与 sip_dialogs.refresh_time 同步
    refresh_at: DateTime<Utc>,
}

fn sub_key(device_id: &str, event: SubscribeEvent) -> String {
    format!("{}:{}", device_id, event.as_str())
}

fn next_refresh(expires: u32) -> DateTime<Utc> {
    let lead = (expires as i64 - REFRESH_AHEAD_SECS).max(1);
    Utc::now() + chrono::Duration::seconds(lead)
}

/// 订阅引擎（本级作为订阅方）
#[derive(Default)]
pub struct SubscriptionEngine {
    subs: DashMap<String, Subscription>,
}

impl SubscriptionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.subs.len()
    }

    pub fn is_subscribed(&self, device_id: &str, event: SubscribeEvent) -> bool {
        self.subs.contains_key(&sub_key(device_id, event))
    }

    fn dialog_row(sub: &Subscription, remote_addr: &str, transport: &str) -> sip_dialog::Model {
        sip_dialog::Model {
            call_id: sub.call_id.clone(),
            stream_id: String::new(),
            device_id: sub.device_id.clone(),
            channel_id: String::new(),
            direction: "out".to_string(),
            dialog_type: sub.event.dialog_type().to_string(),
            request: sub.template.to_string(),
            remote_addr: remote_addr.to_string(),
            transport: transport.to_string(),
            cseq: sub.template.cseq().map(|(n, _)| n as i32).unwrap_or(1),
            refresh_time: Some(sub.refresh_at),
            created_at: Utc::now(),
        }
    }

    async fn persist(&self, ctx: &CmsContext, key: &str, remote_addr: &str, transport: &str) {
        let Some(sub) = self.subs.get(key) else {
            return;
        };
        let row = Self::dialog_row(&sub, remote_addr, transport);
        drop(sub);
        if let Err(e) = ctx.writer.submit(WriteOp::SaveDialog(row)).await {
            tracing::error!(target: "gbcms::subscribe", key, "persist subscription failed: {}", e);
        }
    }

    /// 重启恢复：订阅类对话行回灌内存，续订时刻沿用落库值
    pub fn restore(&self, row: &sip_dialog::Model, default_interval: u32) -> bool {
        let Some(event) = SubscribeEvent::from_dialog_type(&row.dialog_type) else {
            return false;
        };
        let Ok(template) = SipRequest::from_string(&row.request) else {
            return false;
        };
        let expires = template.expires().unwrap_or(3600);
        self.subs.insert(
            sub_key(&row.device_id, event),
            Subscription {
                device_id: row.device_id.clone(),
                event,
                call_id: row.call_id.clone(),
                template,
                expires,
                interval: default_interval,
                refresh_at: row.refresh_time.unwrap_or_else(Utc::now),
            },
        );
        true
    }

    /// 发起订阅。成功后登记、落库，并在到期前自动续订。
    pub async fn subscribe(
        &self,
        ctx: &CmsContext,
        device_id: &str,
        event: SubscribeEvent,
        expires: u32,
        interval: u32,
    ) -> Result<()> {
        let (addr, tp) = ctx
            .devices
            .addr_of(device_id)
            .ok_or_else(|| CmsError::Offline(device_id.to_string()))?;

        let mut req = base_request(
            ctx,
            SipMethod::Subscribe,
            format!("sip:{}@{}", device_id, addr),
            device_id,
            tp,
        );
        req.headers.set("Event", event.as_str().to_string());
        req.headers.set("Expires", expires.to_string());
        req.headers.set("Content-Type", "Application/MANSCDP+xml");
        req.set_body(event.body(ctx.sn.next_sn(), device_id, interval));

        let resp = ctx
            .transport
            .request_reply(&req, addr, tp, SUBSCRIBE_TIMEOUT)
            .await?;
        if resp.status_code != 200 {
            return Err(CmsError::BadRequest(format!(
                "{} 订阅 {} 失败: {}",
                device_id,
                event.as_str(),
                resp.status_code
            )));
        }

        // 对话化：续订沿用 Call-ID 并推进 CSeq
        let mut template = req.clone();
        if let Some(to) = resp.header("To") {
            let to = to.to_string();
            template.headers.set("To", to);
        }
        let key = sub_key(device_id, event);
        self.subs.insert(
            key.clone(),
            Subscription {
                device_id: device_id.to_string(),
                event,
                call_id: template.call_id().unwrap_or_default().to_string(),
                template,
                expires,
                interval,
                refresh_at: next_refresh(expires),
            },
        );
        self.persist(ctx, &key, &addr.to_string(), tp.as_str()).await;
        tracing::info!(target: "gbcms::subscribe", device_id, event = event.as_str(), "subscribed");
        Ok(())
    }

    /// 退订（Expires: 0），尽力而为，落库行一并删除
    pub async fn unsubscribe(&self, ctx: &CmsContext, device_id: &str, event: SubscribeEvent) {
        let Some((_, sub)) = self.subs.remove(&sub_key(device_id, event)) else {
            return;
        };
        if let Err(e) = ctx
            .writer
            .submit(WriteOp::DeleteDialog(sub.call_id.clone()))
            .await
        {
            tracing::warn!(target: "gbcms::subscribe", device_id, "delete subscription row failed: {}", e);
        }
        let Some((addr, tp)) = ctx.devices.addr_of(device_id) else {
            return;
        };
        let mut req = sub.template.new_in_dialog_request(SipMethod::Subscribe);
        req.headers.set("Event", event.as_str().to_string());
        req.headers.set("Expires", "0");
        if let Err(e) = ctx.transport.request_reply(&req, addr, tp, SUBSCRIBE_TIMEOUT).await {
            tracing::debug!(target: "gbcms::subscribe", device_id, "unsubscribe not answered: {}", e);
        }
    }

    /// 续订扫描（每分钟一次）：refresh_at 已到的订阅逐个续订。
    /// 设备离线或续订失败时移除并删行，设备重新上线后由上层重新发起。
    pub async fn refresh_due(&self, ctx: &CmsContext) {
        let now = Utc::now();
        let due: Vec<String> = self
            .subs
            .iter()
            .filter(|s| s.value().refresh_at <= now)
            .map(|s| s.key().clone())
            .collect();

        for key in due {
            let Some(mut sub) = self.subs.get_mut(&key) else {
                continue;
            };
            let Some((addr, tp)) = ctx.devices.addr_of(&sub.device_id) else {
                let call_id = sub.call_id.clone();
                drop(sub);
                self.drop_sub(ctx, &key, &call_id).await;
                continue;
            };

            let mut req = sub.template.new_in_dialog_request(SipMethod::Subscribe);
            req.headers.set("Event", sub.event.as_str().to_string());
            req.headers.set("Expires", sub.expires.to_string());
            req.headers.set("Content-Type", "Application/MANSCDP+xml");
            req.set_body(sub.event.body(ctx.sn.next_sn(), &sub.device_id, sub.interval));
            sub.template = req.clone();

            let expires = sub.expires;
            let device_id = sub.device_id.clone();
            let call_id = sub.call_id.clone();
            drop(sub);

            match ctx.transport.request_reply(&req, addr, tp, SUBSCRIBE_TIMEOUT).await {
                Ok(resp) if resp.status_code == 200 => {
                    if let Some(mut sub) = self.subs.get_mut(&key) {
                        sub.refresh_at = next_refresh(expires);
                    }
                    self.persist(ctx, &key, &addr.to_string(), tp.as_str()).await;
                    tracing::debug!(target: "gbcms::subscribe", device_id = %device_id, "subscription refreshed");
                }
                Ok(resp) => {
                    tracing::warn!(target: "gbcms::subscribe", device_id = %device_id, code = resp.status_code, "refresh rejected");
                    self.drop_sub(ctx, &key, &call_id).await;
                }
                Err(e) => {
                    tracing::warn!(target: "gbcms::subscribe", device_id = %device_id, "refresh failed: {}", e);
                    self.drop_sub(ctx, &key, &call_id).await;
                }
            }
        }
    }

    async fn drop_sub(&self, ctx: &CmsContext, key: &str, call_id: &str) {
        self.subs.remove(key);
        if let Err(e) = ctx.writer.submit(WriteOp::DeleteDialog(call_id.to_string())).await {
            tracing::warn!(target: "gbcms::subscribe", key, "delete subscription row failed: {}", e);
        }
    }
}

/// 解析国标时间（设备本地时间按 UTC 对待）
pub fn parse_gb_time(raw: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(raw.trim(), "%Y-%m-%dT%H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

/// MobilePosition 通知落库
pub async fn ingest_position(ctx: &CmsContext, body: &Manscdp) -> Result<()> {
    let (Some(longitude), Some(latitude)) = (body.longitude, body.latitude) else {
        return Err(CmsError::BadRequest("位置通知缺少经纬度".to_string()));
    };
    ctx.writer
        .post(WriteOp::AppendPosition(position::Model {
            id: 0,
            device_id: body.device_id.clone(),
            channel_id: None,
            time: parse_gb_time(&body.time).unwrap_or_else(Utc::now),
            longitude,
            latitude,
            speed: body.speed,
            direction: body.direction,
            altitude: body.altitude,
        }))
        .await?;
    Ok(())
}

/// Alarm 通知落库
pub async fn ingest_alarm(ctx: &CmsContext, body: &Manscdp) -> Result<()> {
    fn opt(s: &str) -> Option<String> {
        (!s.trim().is_empty()).then(|| s.trim().to_string())
    }
    ctx.writer
        .post(WriteOp::AppendAlarm(alarm::Model {
            id: 0,
            device_id: body.device_id.clone(),
            channel_id: None,
            priority: opt(&body.alarm_priority),
            method: opt(&body.alarm_method),
            alarm_type: None,
            time: parse_gb_time(&body.alarm_time).unwrap_or_else(Utc::now),
            description: opt(&body.alarm_description),
            longitude: body.longitude,
            latitude: body.latitude,
        }))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use gbcms_sip::SipTransport;
    use gbcms_store::Store;
    use std::sync::Arc;

    async fn test_ctx() -> Arc<CmsContext> {
        let db = gbcms_store::repo::connect("sqlite::memory:").await.unwrap();
        gbcms_store::repo::init_schema(&db).await.unwrap();
        let writer = gbcms_store::spawn_writer(db.clone());
        CmsContext::new(Config::default(), SipTransport::new(), Store::new(db), writer)
    }

    fn subscribe_row(device_id: &str, dialog_type: &str, call_id: &str) -> sip_dialog::Model {
        let template = format!(
            "SUBSCRIBE sip:{}@192.168.1.64:5060 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKs\r\n\
             From: <sip:34020000002000000001@3402000000>;tag=f1\r\n\
             To: <sip:{}@3402000000>;tag=t1\r\n\
             Call-ID: {}\r\n\
             CSeq: 1 SUBSCRIBE\r\n\
             Event: Catalog\r\n\
             Expires: 3600\r\n\
             Content-Length: 0\r\n\r\n",
            device_id, device_id, call_id
        );
        sip_dialog::Model {
            call_id: call_id.to_string(),
            stream_id: String::new(),
            device_id: device_id.to_string(),
            channel_id: String::new(),
            direction: "out".to_string(),
            dialog_type: dialog_type.to_string(),
            request: template,
            remote_addr: "192.168.1.64:5060".to_string(),
            transport: "UDP".to_string(),
            cseq: 1,
            refresh_time: Some(Utc::now() - chrono::Duration::seconds(5)),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_sub_key_distinct_per_event() {
        assert_ne!(
            sub_key("d1", SubscribeEvent::Catalog),
            sub_key("d1", SubscribeEvent::Alarm)
        );
        assert_eq!(sub_key("d1", SubscribeEvent::MobilePosition), "d1:MobilePosition");
    }

    #[test]
    fn test_dialog_type_roundtrip() {
        for event in [
            SubscribeEvent::Catalog,
            SubscribeEvent::Alarm,
            SubscribeEvent::MobilePosition,
        ] {
            assert_eq!(SubscribeEvent::from_dialog_type(event.dialog_type()), Some(event));
        }
        assert!(SubscribeEvent::from_dialog_type("invite").is_none());
    }

    #[test]
    fn test_restore_from_persisted_dialog() {
        let engine = SubscriptionEngine::new();
        let row = subscribe_row("d1", "subscribe_catalog", "sub-1");
        assert!(engine.restore(&row, 5));
        assert!(engine.is_subscribed("d1", SubscribeEvent::Catalog));
        assert_eq!(engine.count(), 1);

        // 续订周期沿用模板里的 Expires
        let sub = engine.subs.get("d1:Catalog").unwrap();
        assert_eq!(sub.expires, 3600);
        assert_eq!(sub.call_id, "sub-1");
        drop(sub);

        // INVITE 类对话不归订阅引擎
        let mut invite = subscribe_row("d2", "invite", "call-x");
        invite.dialog_type = "invite".to_string();
        assert!(!engine.restore(&invite, 5));
    }

    #[tokio::test]
    async fn test_refresh_due_drops_offline_and_deletes_row() {
        let ctx = test_ctx().await;
        let engine = SubscriptionEngine::new();
        let row = subscribe_row("d1", "subscribe_position", "sub-2");
        ctx.writer
            .submit(WriteOp::SaveDialog(row.clone()))
            .await
            .unwrap();
        assert!(engine.restore(&row, 5));

        // refresh_time 已到且设备离线：订阅移除、落库行删除
        engine.refresh_due(&ctx).await;
        assert_eq!(engine.count(), 0);
        assert!(ctx.store.dialog("sub-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_refresh_due_skips_not_yet_due() {
        let ctx = test_ctx().await;
        let engine = SubscriptionEngine::new();
        let mut row = subscribe_row("d1", "subscribe_alarm", "sub-3");
        row.refresh_time = Some(Utc::now() + chrono::Duration::seconds(600));
        assert!(engine.restore(&row, 5));

        engine.refresh_due(&ctx).await;
        assert_eq!(engine.count(), 1);
    }

    #[test]
    fn test_parse_gb_time() {
        let t = parse_gb_time("2024-06-18T15:20:56").unwrap();
        assert_eq!(t.timestamp(), 1718724056);
        assert!(parse_gb_time("not-a-time").is_none());
        assert!(parse_gb_time("2024-06-18 15:20:56").is_none());
    }

    #[test]
    fn test_event_bodies() {
        let catalog = SubscribeEvent::Catalog.body(1, "d1", 0);
        assert!(catalog.contains("<CmdType>Catalog</CmdType>"));
        let pos = SubscribeEvent::MobilePosition.body(2, "d1", 5);
        assert!(pos.contains("<Interval>5</Interval>"));
        let alarm = SubscribeEvent::Alarm.body(3, "d1", 0);
        assert!(alarm.contains("<CmdType>Alarm</CmdType>"));
    }
}
