// 对话存储
// INVITE 成功后的对话快照，支撑对话内 BYE/INFO，并落库供重启后补发 BYE

use chrono::Utc;
use dashmap::DashMap;
use gbcms_sip::{SipMethod, SipRequest, SipTransport, Transport};
use gbcms_store::entity::sip_dialog;
use gbcms_store::{WriteHandle, WriteOp};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

const BYE_TIMEOUT: Duration = Duration::from_secs(3);

/// 对话方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// 本级为 UAC：向下级设备发起的源端对话
    Out,
    /// 本级为 UAS：上级拉流建立的对话
    In,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Out => "out",
            Direction::In => "in",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "out" => Some(Direction::Out),
            "in" => Some(Direction::In),
            _ => None,
        }
    }
}

/// 对话快照。template 为最近一次对话内请求，派生下一请求时 CSeq 递增。
#[derive(Debug, Clone)]
pub struct Dialog {
    pub call_id: String,
    pub stream_id: String,
    pub device_id: String,
    pub channel_id: String,
    pub direction: Direction,
    pub template: SipRequest,
    pub remote: SocketAddr,
    pub transport: Transport,
}

pub struct DialogStore {
    transport: Arc<SipTransport>,
    writer: WriteHandle,
    dialogs: DashMap<String, Dialog>,
}

impl DialogStore {
    pub fn new(transport: Arc<SipTransport>, writer: WriteHandle) -> Self {
        Self {
            transport,
            writer,
            dialogs: DashMap::new(),
        }
    }

    pub async fn insert(&self, dialog: Dialog) {
        let row = sip_dialog::Model {
            call_id: dialog.call_id.clone(),
            stream_id: dialog.stream_id.clone(),
            device_id: dialog.device_id.clone(),
            channel_id: dialog.channel_id.clone(),
            direction: dialog.direction.as_str().to_string(),
            dialog_type: "invite".to_string(),
            request: dialog.template.to_string(),
            remote_addr: dialog.remote.to_string(),
            transport: dialog.transport.as_str().to_string(),
            cseq: dialog.template.cseq().map(|(n, _)| n as i32).unwrap_or(1),
            refresh_time: None,
            created_at: Utc::now(),
        };
        self.dialogs.insert(dialog.call_id.clone(), dialog);
        if let Err(e) = self.writer.submit(WriteOp::SaveDialog(row)).await {
            tracing::error!(target: "gbcms::dialog", "persist dialog failed: {}", e);
        }
    }

    /// 重启恢复：只进内存，不回写。订阅对话归订阅引擎管。
    pub fn restore(&self, row: &sip_dialog::Model) -> bool {
        if row.dialog_type != "invite" {
            return false;
        }
        let Ok(template) = SipRequest::from_string(&row.request) else {
            return false;
        };
        let Ok(remote) = row.remote_addr.parse::<SocketAddr>() else {
            return false;
        };
        let Some(direction) = Direction::parse(&row.direction) else {
            return false;
        };
        self.dialogs.insert(
            row.call_id.clone(),
            Dialog {
                call_id: row.call_id.clone(),
                stream_id: row.stream_id.clone(),
                device_id: row.device_id.clone(),
                channel_id: row.channel_id.clone(),
                direction,
                template,
                remote,
                transport: Transport::parse(&row.transport).unwrap_or_default(),
            },
        );
        true
    }

    pub fn get(&self, call_id: &str) -> Option<Dialog> {
        self.dialogs.get(call_id).map(|d| d.clone())
    }

    pub fn by_stream(&self, stream_id: &str) -> Vec<Dialog> {
        self.dialogs
            .iter()
            .filter(|d| d.value().stream_id == stream_id)
            .map(|d| d.value().clone())
            .collect()
    }

    pub fn all(&self) -> Vec<Dialog> {
        self.dialogs.iter().map(|d| d.value().clone()).collect()
    }

    pub async fn remove(&self, call_id: &str) {
        self.dialogs.remove(call_id);
        if let Err(e) = self.writer.submit(WriteOp::DeleteDialog(call_id.to_string())).await {
            tracing::error!(target: "gbcms::dialog", "delete dialog row failed: {}", e);
        }
    }

    /// 派生下一条对话内请求并推进模板 CSeq
    pub async fn next_request(&self, call_id: &str, method: SipMethod) -> Option<(SipRequest, SocketAddr, Transport)> {
        let mut entry = self.dialogs.get_mut(call_id)?;
        let req = entry.template.new_in_dialog_request(method);
        entry.template = req.clone();
        let row = sip_dialog::Model {
            call_id: entry.call_id.clone(),
            stream_id: entry.stream_id.clone(),
            device_id: entry.device_id.clone(),
            channel_id: entry.channel_id.clone(),
            direction: entry.direction.as_str().to_string(),
            dialog_type: "invite".to_string(),
            request: req.to_string(),
            remote_addr: entry.remote.to_string(),
            transport: entry.transport.as_str().to_string(),
            cseq: req.cseq().map(|(n, _)| n as i32).unwrap_or(1),
            refresh_time: None,
            created_at: Utc::now(),
        };
        let remote = entry.remote;
        let transport = entry.transport;
        drop(entry);
        if let Err(e) = self.writer.submit(WriteOp::SaveDialog(row)).await {
            tracing::warn!(target: "gbcms::dialog", call_id, "persist dialog advance failed: {}", e);
        }
        Some((req, remote, transport))
    }

    /// 发送对话内 INFO（回放控制等），等待最终响应
    pub async fn send_info(&self, call_id: &str, body: String) -> crate::error::Result<()> {
        let Some((mut req, remote, tp)) = self.next_request(call_id, SipMethod::Info).await else {
            return Err(crate::error::CmsError::NotFound("对话", call_id.to_string()));
        };
        req.headers.set("Content-Type", "Application/MANSRTSP");
        req.set_body(body);
        let resp = self
            .transport
            .request_reply(&req, remote, tp, BYE_TIMEOUT)
            .await?;
        if resp.status_code >= 300 {
            return Err(crate::error::CmsError::BadRequest(format!(
                "INFO 被拒绝: {}",
                resp.status_code
            )));
        }
        Ok(())
    }

    /// 挂断对话。尽力而为：响应超时也会移除本地状态。
    pub async fn send_bye(&self, call_id: &str) {
        let Some((req, remote, tp)) = self.next_request(call_id, SipMethod::Bye).await else {
            return;
        };
        match self.transport.request_reply(&req, remote, tp, BYE_TIMEOUT).await {
            Ok(resp) => {
                tracing::debug!(target: "gbcms::dialog", call_id, code = resp.status_code, "BYE answered");
            }
            Err(e) => {
                tracing::warn!(target: "gbcms::dialog", call_id, "BYE not answered: {}", e);
            }
        }
        self.remove(call_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> DialogStore {
        let db = gbcms_store::repo::connect("sqlite::memory:").await.unwrap();
        gbcms_store::repo::init_schema(&db).await.unwrap();
        let writer = gbcms_store::spawn_writer(db);
        DialogStore::new(SipTransport::new(), writer)
    }

    fn sample_invite() -> SipRequest {
        let raw = "INVITE sip:34020000001320000001@192.168.1.64:5060 SIP/2.0\r\n\
                   Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKa\r\n\
                   From: <sip:34020000002000000001@3402000000>;tag=f1\r\n\
                   To: <sip:34020000001320000001@3402000000>;tag=t1\r\n\
                   Call-ID: dlg-1\r\n\
                   CSeq: 1 INVITE\r\n\
                   Content-Length: 0\r\n\
                   \r\n";
        SipRequest::from_string(raw).unwrap()
    }

    #[tokio::test]
    async fn test_next_request_advances_cseq() {
        let store = setup().await;
        store
            .insert(Dialog {
                call_id: "dlg-1".to_string(),
                stream_id: "d/c".to_string(),
                device_id: "d".to_string(),
                channel_id: "c".to_string(),
                direction: Direction::Out,
                template: sample_invite(),
                remote: "192.168.1.64:5060".parse().unwrap(),
                transport: Transport::Udp,
            })
            .await;

        let (first, _, _) = store.next_request("dlg-1", SipMethod::Info).await.unwrap();
        assert_eq!(first.cseq(), Some((2, "INFO".to_string())));
        let (second, _, _) = store.next_request("dlg-1", SipMethod::Bye).await.unwrap();
        assert_eq!(second.cseq(), Some((3, "BYE".to_string())));
        assert_eq!(second.call_id(), Some("dlg-1"));
    }

    #[tokio::test]
    async fn test_restore_roundtrip() {
        let store = setup().await;
        let row = sip_dialog::Model {
            call_id: "dlg-2".to_string(),
            stream_id: "d/c".to_string(),
            device_id: "d".to_string(),
            channel_id: "c".to_string(),
            direction: "out".to_string(),
            dialog_type: "invite".to_string(),
            request: sample_invite().to_string(),
            remote_addr: "192.168.1.64:5060".to_string(),
            transport: "UDP".to_string(),
            cseq: 1,
            refresh_time: None,
            created_at: Utc::now(),
        };
        assert!(store.restore(&row));
        let dialog = store.get("dlg-2").unwrap();
        assert_eq!(dialog.direction, Direction::Out);
        assert_eq!(dialog.template.cseq(), Some((1, "INVITE".to_string())));

        let mut bad = row.clone();
        bad.request = "garbage".to_string();
        bad.call_id = "dlg-3".to_string();
        assert!(!store.restore(&bad));
    }

    #[tokio::test]
    async fn test_by_stream_lookup() {
        let store = setup().await;
        for (call_id, stream) in [("a", "s1"), ("b", "s1"), ("c", "s2")] {
            let mut template = sample_invite();
            template.headers.set("Call-ID", call_id);
            store
                .insert(Dialog {
                    call_id: call_id.to_string(),
                    stream_id: stream.to_string(),
                    device_id: "d".to_string(),
                    channel_id: "c".to_string(),
                    direction: Direction::In,
                    template,
                    remote: "10.0.0.9:5060".parse().unwrap(),
                    transport: Transport::Udp,
                })
                .await;
        }
        assert_eq!(store.by_stream("s1").len(), 2);
        store.remove("a").await;
        assert_eq!(store.by_stream("s1").len(), 1);
    }
}
