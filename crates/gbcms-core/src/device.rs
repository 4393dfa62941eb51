// 设备注册表
// 在线状态与注册来源地址的内存索引，心跳超时判离线并拆除其流

use crate::dialog::DialogStore;
use crate::stream::StreamEngine;
use chrono::Utc;
use dashmap::DashMap;
use gbcms_sip::Transport;
use gbcms_store::entity::{device, status_log};
use gbcms_store::{Store, WriteHandle, WriteOp};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct OnlineInfo {
    pub remote: SocketAddr,
    pub transport: Transport,
    pub expires: u32,
    pub last_keepalive: Instant,
}

pub struct DeviceRegistry {
    store: Store,
    writer: WriteHandle,
    online: DashMap<String, OnlineInfo>,
    alive_expires: Duration,
}

impl DeviceRegistry {
    pub fn new(store: Store, writer: WriteHandle, alive_expires: Duration) -> Self {
        Self {
            store,
            writer,
            online: DashMap::new(),
            alive_expires,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// 注册成功，登记在线并整行落库
    pub async fn mark_online(
        &self,
        model: device::Model,
        remote: SocketAddr,
        transport: Transport,
    ) {
        self.online.insert(
            model.device_id.clone(),
            OnlineInfo {
                remote,
                transport,
                expires: model.expires as u32,
                last_keepalive: Instant::now(),
            },
        );
        tracing::info!(target: "gbcms::device", device_id = %model.device_id, remote = %remote, "device online");
        let device_id = model.device_id.clone();
        if let Err(e) = self.writer.submit(WriteOp::SaveDevice(model)).await {
            tracing::error!(target: "gbcms::device", "persist device failed: {}", e);
        }
        self.append_status(&device_id, "ON").await;
    }

    /// 心跳。返回 false 表示设备未注册（需要设备重新注册）。
    pub async fn keepalive(&self, device_id: &str, remote: SocketAddr) -> bool {
        let Some(mut info) = self.online.get_mut(device_id) else {
            return false;
        };
        info.last_keepalive = Instant::now();
        // 设备换端口重连后按最新地址回包
        info.remote = remote;
        drop(info);

        if let Ok(Some(mut row)) = self.store.device(device_id).await {
            row.keepalive_time = Utc::now();
            row.online = true;
            row.remote_addr = remote.to_string();
            if let Err(e) = self.writer.post(WriteOp::SaveDevice(row)).await {
                tracing::warn!(target: "gbcms::device", device_id, "persist keepalive failed: {}", e);
            }
        }
        true
    }

    pub async fn mark_offline(&self, device_id: &str) {
        self.online.remove(device_id);
        if let Ok(Some(mut row)) = self.store.device(device_id).await {
            if row.online {
                row.online = false;
                if let Err(e) = self.writer.submit(WriteOp::SaveDevice(row)).await {
                    tracing::error!(target: "gbcms::device", device_id, "persist offline failed: {}", e);
                }
                self.append_status(device_id, "OFF").await;
            }
        }
        tracing::info!(target: "gbcms::device", device_id, "device offline");
    }

    /// 上下线流水
    async fn append_status(&self, device_id: &str, status: &str) {
        let op = WriteOp::AppendStatusLog(status_log::Model {
            id: 0,
            device_id: device_id.to_string(),
            status: status.to_string(),
            time: Utc::now(),
        });
        if let Err(e) = self.writer.submit(op).await {
            tracing::warn!(target: "gbcms::device", device_id, "append status log failed: {}", e);
        }
    }

    pub fn is_online(&self, device_id: &str) -> bool {
        self.online.contains_key(device_id)
    }

    pub fn addr_of(&self, device_id: &str) -> Option<(SocketAddr, Transport)> {
        self.online.get(device_id).map(|i| (i.remote, i.transport))
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }

    /// 重启恢复：数据库中在线的设备先按在线对待，给一个完整心跳周期的宽限
    pub fn restore(&self, row: &device::Model) -> bool {
        let Ok(remote) = row.remote_addr.parse::<SocketAddr>() else {
            return false;
        };
        self.online.insert(
            row.device_id.clone(),
            OnlineInfo {
                remote,
                transport: Transport::parse(&row.transport).unwrap_or_default(),
                expires: row.expires as u32,
                last_keepalive: Instant::now(),
            },
        );
        true
    }

    fn expired_ids(&self, now: Instant) -> Vec<String> {
        self.online
            .iter()
            .filter(|e| now.duration_since(e.value().last_keepalive) > self.alive_expires)
            .map(|e| e.key().clone())
            .collect()
    }

    /// 心跳巡检：周期为 alive_expires/4
    pub fn spawn_sweeper(
        self: Arc<Self>,
        engine: Arc<StreamEngine>,
        dialogs: Arc<DialogStore>,
    ) -> tokio::task::JoinHandle<()> {
        let period = self.alive_expires / 4;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
            loop {
                ticker.tick().await;
                for device_id in self.expired_ids(Instant::now()) {
                    tracing::warn!(target: "gbcms::device", device_id = %device_id, "keepalive expired");
                    engine.close_device_streams(&device_id, &dialogs).await;
                    self.mark_offline(&device_id).await;
                }
            }
        })
    }

    #[cfg(test)]
    fn touch_at(&self, device_id: &str, at: Instant) {
        if let Some(mut info) = self.online.get_mut(device_id) {
            info.last_keepalive = at;
        }
    }
}
