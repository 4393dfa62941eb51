// 核心上下文
// 各编排模块共享的单例集合，进程内只构建一份

use crate::catalog::{CatalogIngestor, RecordCollector};
use crate::config::Config;
use crate::device::DeviceRegistry;
use crate::dialog::DialogStore;
use crate::stream::{AckWaiters, SsrcAlloc, StreamEngine};
use dashmap::DashMap;
use gbcms_media::MediaClient;
use gbcms_sip::sn::SnRegistry;
use gbcms_sip::{SipRequest, SipTransport, Transport};
use gbcms_store::{Store, WriteHandle};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;

/// 广播会合：Notify/Broadcast 发出后等待设备反向 INVITE。
/// key 为下发的 SourceID，设备回呼 INVITE 的 request-URI user 即此值。
pub type BroadcastWaiters = DashMap<String, oneshot::Sender<(SipRequest, SocketAddr, Transport)>>;

/// 信令黑名单过滤器。启动时从库加载，分发前同步查询。
#[derive(Default)]
pub struct BlacklistFilter {
    ips: dashmap::DashSet<String>,
    user_agents: dashmap::DashSet<String>,
    devices: dashmap::DashSet<String>,
}

impl BlacklistFilter {
    pub fn load(&self, rows: &[gbcms_store::entity::blacklist::Model]) {
        for row in rows {
            match row.kind.as_str() {
                "ip" => {
                    self.ips.insert(row.value.clone());
                }
                "user_agent" => {
                    self.user_agents.insert(row.value.clone());
                }
                "device" => {
                    self.devices.insert(row.value.clone());
                }
                other => {
                    tracing::warn!(target: "gbcms::sip", kind = other, "unknown blacklist kind ignored");
                }
            }
        }
    }

    pub fn blocks_ip(&self, ip: &str) -> bool {
        self.ips.contains(ip)
    }

    pub fn blocks_user_agent(&self, ua: &str) -> bool {
        self.user_agents.contains(ua)
    }

    pub fn blocks_device(&self, device_id: &str) -> bool {
        self.devices.contains(device_id)
    }
}

pub struct CmsContext {
    pub cfg: Config,
    pub transport: Arc<SipTransport>,
    pub store: Store,
    pub writer: WriteHandle,
    pub devices: Arc<DeviceRegistry>,
    pub dialogs: Arc<DialogStore>,
    pub engine: Arc<StreamEngine>,
    pub catalogs: Arc<CatalogIngestor>,
    pub records: Arc<RecordCollector>,
    pub sn: Arc<SnRegistry>,
    pub ssrc: SsrcAlloc,
    pub acks: AckWaiters,
    pub broadcasts: BroadcastWaiters,
    pub blacklist: BlacklistFilter,
    /// 信令重启串行锁。持有期间不得发起其他重启。
    pub restart_lock: tokio::sync::Mutex<()>,
}

impl CmsContext {
    pub fn new(
        cfg: Config,
        transport: Arc<SipTransport>,
        store: Store,
        writer: WriteHandle,
    ) -> Arc<Self> {
        let media = MediaClient::new(cfg.media.url.clone(), cfg.media.secret.clone());
        let devices = Arc::new(DeviceRegistry::new(
            store.clone(),
            writer.clone(),
            std::time::Duration::from_secs(cfg.sip.alive_expires),
        ));
        let dialogs = Arc::new(DialogStore::new(transport.clone(), writer.clone()));
        let engine = Arc::new(StreamEngine::new(media, writer.clone(), cfg.media.url.clone()));
        let catalogs = Arc::new(CatalogIngestor::new(store.clone(), writer.clone()));
        let ssrc = SsrcAlloc::new(&cfg.sip.domain);

        Arc::new(Self {
            cfg,
            transport,
            store,
            writer,
            devices,
            dialogs,
            engine,
            catalogs,
            records: RecordCollector::new(),
            sn: Arc::new(SnRegistry::new()),
            ssrc,
            acks: AckWaiters::default(),
            broadcasts: DashMap::new(),
            blacklist: BlacklistFilter::default(),
            restart_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// 本级 SIP 身份 `sip:编码@域`
    pub fn local_uri(&self) -> String {
        format!("sip:{}@{}", self.cfg.sip.id, self.cfg.sip.domain)
    }

    /// 本级对外联系地址 `sip:编码@ip:port`
    pub fn contact_uri(&self) -> String {
        format!(
            "sip:{}@{}:{}",
            self.cfg.sip.id, self.cfg.sip.public_ip, self.cfg.sip.port
        )
    }
}
