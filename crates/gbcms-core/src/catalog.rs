// 目录接收器
// 多包目录应答的聚合、字段规范化、层级修补，以及录像查询结果的聚合

use chrono::Utc;
use dashmap::DashMap;
use gbcms_sip::xml::{DeviceItem, Manscdp, RecordItem};
use gbcms_store::entity::channel;
use gbcms_store::{Store, WriteHandle, WriteOp};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// 目录包间隔超过此值视为应答结束，落库已收到的部分
const CATALOG_IDLE: Duration = Duration::from_secs(10);

/// 编码的类型位（第 11~13 位）
pub fn type_code(device_id: &str) -> Option<u32> {
    if device_id.len() != 20 || !device_id.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    device_id[10..13].parse().ok()
}

/// 目录节点是否为组织目录。131~199 为前端设备类编码，其余都按目录对待。
pub fn is_directory(device_id: &str) -> bool {
    match type_code(device_id) {
        Some(code) => !(131..=199).contains(&code),
        None => false,
    }
}

/// 规范化在线状态：各厂商会上报 ON/On/Online/OK 等写法
pub fn normalize_status(raw: &str) -> String {
    match raw.trim().to_ascii_uppercase().as_str() {
        "" | "ON" | "ONLINE" | "OK" => "ON".to_string(),
        "OFF" | "OFFLINE" | "LOST" => "OFF".to_string(),
        other => other.to_string(),
    }
}

fn opt(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// 单个目录项转通道行
pub fn normalize_item(root_id: &str, item: &DeviceItem) -> channel::Model {
    let parental = match item.parental {
        Some(p) => p as i32,
        // 厂商漏报 Parental 时按编码类型推断
        None => i32::from(is_directory(&item.device_id)),
    };
    channel::Model {
        root_id: root_id.to_string(),
        device_id: item.device_id.clone(),
        name: if item.name.trim().is_empty() {
            item.device_id.clone()
        } else {
            item.name.trim().to_string()
        },
        manufacturer: opt(&item.manufacturer),
        model: opt(&item.model),
        owner: opt(&item.owner),
        civil_code: opt(&item.civil_code),
        address: opt(&item.address),
        parental: Some(parental),
        parent_id: opt(&item.parent_id),
        business_group_id: opt(&item.business_group_id),
        register_way: item.register_way.map(|v| v as i32),
        secrecy: item.secrecy.map(|v| v as i32),
        ip_address: None,
        port: None,
        status: normalize_status(&item.status),
        longitude: item.longitude,
        latitude: item.latitude,
        ptz_type: None,
        sub_count: 0,
        setup: None,
    }
}

/// 层级修补与 SubCount 重算：
/// 父节点缺失或悬空时挂到设备根下；父节点存在但不是目录时沿链上移，
/// 直至最近的目录祖先。目录节点的 SubCount 只计直接的非目录子节点。
pub fn repair_hierarchy(root_id: &str, mut channels: Vec<channel::Model>) -> Vec<channel::Model> {
    let known: HashSet<String> = channels.iter().map(|c| c.device_id.clone()).collect();
    let dirs: HashSet<String> = channels
        .iter()
        .filter(|c| c.parental == Some(1))
        .map(|c| c.device_id.clone())
        .collect();
    let parent_of: HashMap<String, Option<String>> = channels
        .iter()
        .map(|c| (c.device_id.clone(), c.parent_id.clone()))
        .collect();

    for c in channels.iter_mut() {
        c.parent_id = Some(resolve_parent(
            root_id,
            c.parent_id.as_deref(),
            &known,
            &dirs,
            &parent_of,
        ));
    }

    let mut child_count: HashMap<String, i32> = HashMap::new();
    for c in &channels {
        if c.parental == Some(1) {
            continue;
        }
        if let Some(p) = &c.parent_id {
            *child_count.entry(p.clone()).or_default() += 1;
        }
    }
    for c in channels.iter_mut() {
        if c.parental == Some(1) {
            c.sub_count = child_count.get(&c.device_id).copied().unwrap_or(0);
        }
    }
    channels
}

/// 沿父链找最近的目录祖先；悬空或成环时挂到设备根下
fn resolve_parent(
    root_id: &str,
    start: Option<&str>,
    known: &HashSet<String>,
    dirs: &HashSet<String>,
    parent_of: &HashMap<String, Option<String>>,
) -> String {
    let mut cur = start.map(str::to_string);
    let mut hops = 0usize;
    loop {
        let Some(p) = cur else {
            return root_id.to_string();
        };
        if p == root_id {
            return p;
        }
        if !known.contains(&p) {
            return root_id.to_string();
        }
        if dirs.contains(&p) {
            return p;
        }
        cur = parent_of.get(&p).cloned().flatten();
        hops += 1;
        if hops > known.len() {
            return root_id.to_string();
        }
    }
}

struct CatalogJob {
    sum_num: Option<u32>,
    items: Vec<channel::Model>,
    last_update: Instant,
}

/// 正在执行的一次性任务去重（目录刷新等）
#[derive(Default)]
pub struct UniqueTasks {
    running: DashMap<String, Instant>,
}

impl UniqueTasks {
    /// 任务未在执行时登记并返回 true
    pub fn begin(&self, key: &str) -> bool {
        match self.running.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(e) => {
                e.insert(Instant::now());
                true
            }
        }
    }

    pub fn end(&self, key: &str) {
        self.running.remove(key);
    }
}

/// 目录接收器。按设备聚合分包，收满 SumNum 或静默超时后落库。
pub struct CatalogIngestor {
    store: Store,
    writer: WriteHandle,
    pending: Mutex<HashMap<String, CatalogJob>>,
    pub tasks: UniqueTasks,
}

impl CatalogIngestor {
    pub fn new(store: Store, writer: WriteHandle) -> Self {
        Self {
            store,
            writer,
            pending: Mutex::new(HashMap::new()),
            tasks: UniqueTasks::default(),
        }
    }

    /// 收一包目录应答。聚合完成时落库并返回通道总数。
    pub async fn ingest(&self, root_id: &str, body: &Manscdp) -> Option<usize> {
        let items: Vec<channel::Model> = body
            .device_list
            .as_ref()
            .map(|l| l.items.iter().map(|i| normalize_item(root_id, i)).collect())
            .unwrap_or_default();

        let complete = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let job = pending.entry(root_id.to_string()).or_insert(CatalogJob {
                sum_num: None,
                items: Vec::new(),
                last_update: Instant::now(),
            });
            if job.sum_num.is_none() {
                job.sum_num = body.sum_num;
            }
            job.items.extend(items);
            job.last_update = Instant::now();

            let done = match job.sum_num {
                Some(sum) => job.items.len() as u32 >= sum,
                // SumNum 缺失：单包即完整
                None => true,
            };
            if done {
                pending.remove(root_id)
            } else {
                None
            }
        };
        match complete {
            Some(job) => Some(self.finalize(root_id, job.items).await),
            None => None,
        }
    }

    async fn finalize(&self, root_id: &str, items: Vec<channel::Model>) -> usize {
        // 同一包内重复编码去重，后到覆盖先到
        let mut dedup: HashMap<String, channel::Model> = HashMap::new();
        for item in items {
            dedup.insert(item.device_id.clone(), item);
        }
        let mut channels = repair_hierarchy(root_id, dedup.into_values().collect());
        let count = channels.len();

        // 管理员设置的通道级收流方式在目录重建后保留
        if let Ok(old) = self.store.channels_of(root_id).await {
            let overrides: HashMap<String, String> = old
                .into_iter()
                .filter_map(|c| c.setup.map(|s| (c.device_id, s)))
                .collect();
            if !overrides.is_empty() {
                for c in channels.iter_mut() {
                    if let Some(s) = overrides.get(&c.device_id) {
                        c.setup = Some(s.clone());
                    }
                }
            }
        }

        if let Err(e) = self
            .writer
            .submit(WriteOp::DeleteChannels {
                root_id: root_id.to_string(),
            })
            .await
        {
            tracing::error!(target: "gbcms::catalog", root_id, "clear old catalog failed: {}", e);
        }
        if let Err(e) = self.writer.submit(WriteOp::SaveChannels(channels)).await {
            tracing::error!(target: "gbcms::catalog", root_id, "persist catalog failed: {}", e);
            return 0;
        }

        if let Ok(Some(mut row)) = self.store.device(root_id).await {
            row.channel_count = count as i32;
            let _ = self.writer.post(WriteOp::SaveDevice(row)).await;
        }
        tracing::info!(target: "gbcms::catalog", root_id, channels = count, "catalog stored");
        count
    }

    /// 静默聚合任务巡检，挂到外层定时任务里周期调用
    pub async fn sweep_stalled(&self) {
        self.sweep_older_than(CATALOG_IDLE).await;
    }

    async fn sweep_older_than(&self, idle: Duration) {
        let stalled: Vec<(String, Option<u32>, Vec<channel::Model>)> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            let keys: Vec<String> = pending
                .iter()
                .filter(|(_, j)| j.last_update.elapsed() >= idle && !j.items.is_empty())
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| pending.remove(&k).map(|j| (k, j.sum_num, j.items)))
                .collect()
        };
        for (root_id, sum_num, items) in stalled {
            // 已有完整快照时残包直接丢弃，保留上次目录
            let short = sum_num.is_some_and(|sum| (items.len() as u32) < sum);
            if short {
                let existing = self
                    .store
                    .channels_of(&root_id)
                    .await
                    .map(|v| v.len())
                    .unwrap_or(0);
                if existing > 0 {
                    tracing::warn!(
                        target: "gbcms::catalog",
                        root_id = %root_id,
                        recv = items.len(),
                        "catalog response incomplete, keeping previous snapshot"
                    );
                    continue;
                }
            }
            tracing::warn!(target: "gbcms::catalog", root_id = %root_id, "catalog response incomplete, storing partial");
            self.finalize(&root_id, items).await;
        }
    }
}

struct RecordJob {
    sum_num: Option<u32>,
    items: Vec<RecordItem>,
    tx: oneshot::Sender<Vec<RecordItem>>,
}

/// 录像查询结果聚合，按 SN 关联
#[derive(Default)]
pub struct RecordCollector {
    pending: Mutex<HashMap<u32, RecordJob>>,
}

impl RecordCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, sn: u32) -> oneshot::Receiver<Vec<RecordItem>> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(
            sn,
            RecordJob {
                sum_num: None,
                items: Vec::new(),
                tx,
            },
        );
        rx
    }

    pub fn cancel(&self, sn: u32) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&sn);
    }

    /// 收一包 RecordInfo 应答，收满后投递给等待方
    pub fn ingest(&self, body: &Manscdp) -> bool {
        let Some(sn) = body.sn else {
            return false;
        };
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let Some(job) = pending.get_mut(&sn) else {
            return false;
        };
        if job.sum_num.is_none() {
            job.sum_num = body.sum_num;
        }
        if let Some(list) = &body.record_list {
            job.items.extend(list.items.iter().cloned());
        }
        let done = match job.sum_num {
            Some(sum) => job.items.len() as u32 >= sum,
            None => true,
        };
        if done {
            if let Some(job) = pending.remove(&sn) {
                let _ = job.tx.send(job.items);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gbcms_sip::xml::{DeviceList, RecordList};

    #[test]
    fn test_type_code_and_directory() {
        // 第 11~13 位 132 → 前端设备
        assert_eq!(type_code("34020000001320000001"), Some(132));
        assert!(!is_directory("34020000001320000001"));
        // 215 → 业务分组目录
        assert!(is_directory("34020000002150000001"));
        // 118 → 目录（不在 131..=199）
        assert!(is_directory("34020000001180000001"));
        assert!(!is_directory("short-id"));
    }

    #[test]
    fn test_normalize_status() {
        assert_eq!(normalize_status("on"), "ON");
        assert_eq!(normalize_status("Online"), "ON");
        assert_eq!(normalize_status(""), "ON");
        assert_eq!(normalize_status("OFF"), "OFF");
        assert_eq!(normalize_status("lost"), "OFF");
    }

    fn item(id: &str, parent: &str, parental: Option<u8>) -> DeviceItem {
        DeviceItem {
            device_id: id.to_string(),
            name: format!("n-{}", id),
            parent_id: parent.to_string(),
            parental,
            status: "ON".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_normalize_item_infers_parental() {
        let root = "34020000001110000001";
        let cam = normalize_item(root, &item("34020000001320000001", "", None));
        assert_eq!(cam.parental, Some(0));
        let group = normalize_item(root, &item("34020000002150000001", "", None));
        assert_eq!(group.parental, Some(1));
    }

    #[test]
    fn test_repair_hierarchy_and_sub_count() {
        let root = "34020000001110000001";
        let group = "34020000002150000001";
        let channels = vec![
            normalize_item(root, &item(group, "", Some(1))),
            normalize_item(root, &item("34020000001320000001", group, Some(0))),
            normalize_item(root, &item("34020000001320000002", group, Some(0))),
            // 悬空父节点
            normalize_item(root, &item("34020000001320000003", "99999999999999999999", Some(0))),
        ];
        let repaired = repair_hierarchy(root, channels);

        let by_id: HashMap<String, &channel::Model> =
            repaired.iter().map(|c| (c.device_id.clone(), c)).collect();
        assert_eq!(
            by_id["34020000001320000003"].parent_id.as_deref(),
            Some(root)
        );
        assert_eq!(by_id[group].sub_count, 2);
        assert_eq!(by_id[group].parent_id.as_deref(), Some(root));
    }

    #[test]
    fn test_sub_count_excludes_directory_children() {
        let root = "34020000001110000001";
        let group = "34020000002150000001";
        let subgroup = "34020000002150000002";
        let channels = vec![
            normalize_item(root, &item(group, "", Some(1))),
            normalize_item(root, &item(subgroup, group, Some(1))),
            normalize_item(root, &item("34020000001320000001", group, Some(0))),
        ];
        let repaired = repair_hierarchy(root, channels);

        let by_id: HashMap<String, &channel::Model> =
            repaired.iter().map(|c| (c.device_id.clone(), c)).collect();
        // 子目录不计入 SubCount
        assert_eq!(by_id[group].sub_count, 1);
        assert_eq!(by_id[subgroup].sub_count, 0);
        assert_eq!(by_id[subgroup].parent_id.as_deref(), Some(group));
    }

    #[test]
    fn test_non_directory_parent_climbs_to_directory_ancestor() {
        let root = "34020000001110000001";
        let group = "34020000002150000001";
        let cam1 = "34020000001320000001";
        let cam2 = "34020000001320000002";
        let cam3 = "34020000001320000003";
        // cam2 挂在 cam1 下、cam3 挂在 cam2 下，都应上移到 group
        let channels = vec![
            normalize_item(root, &item(group, "", Some(1))),
            normalize_item(root, &item(cam1, group, Some(0))),
            normalize_item(root, &item(cam2, cam1, Some(0))),
            normalize_item(root, &item(cam3, cam2, Some(0))),
        ];
        let repaired = repair_hierarchy(root, channels);

        let by_id: HashMap<String, &channel::Model> =
            repaired.iter().map(|c| (c.device_id.clone(), c)).collect();
        assert_eq!(by_id[cam2].parent_id.as_deref(), Some(group));
        assert_eq!(by_id[cam3].parent_id.as_deref(), Some(group));
        assert_eq!(by_id[group].sub_count, 3);
    }

    #[test]
    fn test_parent_cycle_falls_back_to_root() {
        let root = "34020000001110000001";
        let cam1 = "34020000001320000001";
        let cam2 = "34020000001320000002";
        let channels = vec![
            normalize_item(root, &item(cam1, cam2, Some(0))),
            normalize_item(root, &item(cam2, cam1, Some(0))),
        ];
        let repaired = repair_hierarchy(root, channels);
        assert!(repaired.iter().all(|c| c.parent_id.as_deref() == Some(root)));
    }

    #[test]
    fn test_unique_tasks() {
        let tasks = UniqueTasks::default();
        assert!(tasks.begin("catalog:d1"));
        assert!(!tasks.begin("catalog:d1"));
        tasks.end("catalog:d1");
        assert!(tasks.begin("catalog:d1"));
    }

    fn device_row(id: &str) -> gbcms_store::entity::device::Model {
        gbcms_store::entity::device::Model {
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

    fn catalog_part(sum: u32, items: Vec<DeviceItem>) -> Manscdp {
        Manscdp {
            cmd_type: "Catalog".to_string(),
            sn: Some(1),
            sum_num: Some(sum),
            device_list: Some(DeviceList {
                num: Some(items.len() as u32),
                items,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_multi_part_assembly() {
        let db = gbcms_store::repo::connect("sqlite::memory:").await.unwrap();
        gbcms_store::repo::init_schema(&db).await.unwrap();
        let writer = gbcms_store::spawn_writer(db.clone());
        let store = Store::new(db);
        let ingestor = CatalogIngestor::new(store.clone(), writer.clone());
        let root = "34020000001110000001";
        writer.submit(WriteOp::SaveDevice(device_row(root))).await.unwrap();

        let part1 = catalog_part(2, vec![item("34020000001320000001", root, Some(0))]);
        assert_eq!(ingestor.ingest(root, &part1).await, None);

        let part2 = catalog_part(2, vec![item("34020000001320000002", root, Some(0))]);
        assert_eq!(ingestor.ingest(root, &part2).await, Some(2));

        let rows = store.channels_of(root).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|c| c.status == "ON"));
    }

    #[tokio::test]
    async fn test_stalled_partial_discarded_when_snapshot_exists() {
        let db = gbcms_store::repo::connect("sqlite::memory:").await.unwrap();
        gbcms_store::repo::init_schema(&db).await.unwrap();
        let writer = gbcms_store::spawn_writer(db.clone());
        let store = Store::new(db);
        let ingestor = CatalogIngestor::new(store.clone(), writer.clone());
        let root = "34020000001110000001";
        writer.submit(WriteOp::SaveDevice(device_row(root))).await.unwrap();

        // 先有一份完整快照
        let old = vec![
            normalize_item(root, &item("34020000001320000008", root, Some(0))),
            normalize_item(root, &item("34020000001320000009", root, Some(0))),
        ];
        writer.submit(WriteOp::SaveChannels(old)).await.unwrap();

        // 3 包只到了 1 包
        let part = catalog_part(3, vec![item("34020000001320000001", root, Some(0))]);
        assert_eq!(ingestor.ingest(root, &part).await, None);
        ingestor.sweep_older_than(Duration::ZERO).await;

        let rows = store.channels_of(root).await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|c| c.device_id.as_str()).collect();
        assert_eq!(rows.len(), 2);
        assert!(ids.contains(&"34020000001320000008"));
    }

    #[tokio::test]
    async fn test_stalled_partial_stored_on_first_run() {
        let db = gbcms_store::repo::connect("sqlite::memory:").await.unwrap();
        gbcms_store::repo::init_schema(&db).await.unwrap();
        let writer = gbcms_store::spawn_writer(db.clone());
        let store = Store::new(db);
        let ingestor = CatalogIngestor::new(store.clone(), writer.clone());
        let root = "34020000001110000001";
        writer.submit(WriteOp::SaveDevice(device_row(root))).await.unwrap();

        // 库里没有旧快照时残包仍然落库
        let part = catalog_part(3, vec![item("34020000001320000001", root, Some(0))]);
        assert_eq!(ingestor.ingest(root, &part).await, None);
        ingestor.sweep_older_than(Duration::ZERO).await;

        let rows = store.channels_of(root).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_id, "34020000001320000001");
    }

    #[test]
    fn test_record_collector() {
        let collector = RecordCollector::new();
        let mut rx = collector.register(77);

        let part = Manscdp {
            cmd_type: "RecordInfo".to_string(),
            sn: Some(77),
            sum_num: Some(2),
            record_list: Some(RecordList {
                num: Some(1),
                items: vec![RecordItem {
                    device_id: "c1".to_string(),
                    name: "r1".to_string(),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        };
        assert!(collector.ingest(&part));
        assert!(rx.try_recv().is_err());

        let mut part2 = part;
        part2.record_list.as_mut().unwrap().items[0].name = "r2".to_string();
        assert!(collector.ingest(&part2));
        let records = rx.try_recv().unwrap();
        assert_eq!(records.len(), 2);

        // 未注册 SN 的应答不吞
        assert!(!collector.ingest(&Manscdp {
            sn: Some(99),
            ..Default::default()
        }));
    }
}
