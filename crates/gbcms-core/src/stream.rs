// 流与转发出口引擎
// 流标识规范化、SSRC 分配、同流并发去重与拆流顺序

use crate::dialog::DialogStore;
use crate::error::{CmsError, Result};
use chrono::Utc;
use dashmap::DashMap;
use gbcms_media::{MediaClient, SinkAdd, SinkCreated};
use gbcms_store::entity::{sink, stream};
use gbcms_store::{WriteHandle, WriteOp};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};

/// 流的业务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Play,
    Playback,
    Download,
    Broadcast,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Play => "play",
            StreamType::Playback => "playback",
            StreamType::Download => "download",
            StreamType::Broadcast => "broadcast",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "play" => Some(StreamType::Play),
            "playback" => Some(StreamType::Playback),
            "download" => Some(StreamType::Download),
            "broadcast" => Some(StreamType::Broadcast),
            _ => None,
        }
    }

    pub fn is_playback(&self) -> bool {
        matches!(self, StreamType::Playback | StreamType::Download)
    }

    /// SDP s= 行用的会话名
    pub fn session_name(&self) -> &'static str {
        match self {
            StreamType::Play => "Play",
            StreamType::Playback => "Playback",
            StreamType::Download => "Download",
            StreamType::Broadcast => "Broadcast",
        }
    }
}

/// 规范化流标识。
/// 实时：`dev/ch`；回放/下载：`dev/ch.类型.起.止`；广播：`dev/ch.broadcast`。
pub fn stream_id(
    stream_type: StreamType,
    device_id: &str,
    channel_id: &str,
    start: i64,
    stop: i64,
) -> String {
    match stream_type {
        StreamType::Play => format!("{}/{}", device_id, channel_id),
        StreamType::Playback | StreamType::Download => format!(
            "{}/{}.{}.{}.{}",
            device_id,
            channel_id,
            stream_type.as_str(),
            start,
            stop
        ),
        StreamType::Broadcast => format!("{}/{}.broadcast", device_id, channel_id),
    }
}

/// 解析流标识，返回 (类型, 设备, 通道, 起, 止)
pub fn parse_stream_id(id: &str) -> Option<(StreamType, String, String, i64, i64)> {
    let (device_id, rest) = id.split_once('/')?;
    let mut parts = rest.split('.');
    let channel_id = parts.next()?.to_string();
    match parts.next() {
        None => Some((StreamType::Play, device_id.to_string(), channel_id, 0, 0)),
        Some("broadcast") => Some((
            StreamType::Broadcast,
            device_id.to_string(),
            channel_id,
            0,
            0,
        )),
        Some(kind) => {
            let stream_type = StreamType::parse(kind)?;
            let start: i64 = parts.next()?.parse().ok()?;
            let stop: i64 = parts.next()?.parse().ok()?;
            Some((stream_type, device_id.to_string(), channel_id, start, stop))
        }
    }
}

/// SSRC 分配器。十进制 10 位：首位 0 实时 / 1 回放，
/// 中间 5 位取域编码第 4~8 位，末 4 位为循环序号。
pub struct SsrcAlloc {
    domain_mid: String,
    seq: AtomicU32,
}

impl SsrcAlloc {
    pub fn new(domain: &str) -> Self {
        let mid: String = domain.chars().skip(3).take(5).collect();
        Self {
            domain_mid: format!("{:0>5}", mid),
            seq: AtomicU32::new(1),
        }
    }

    pub fn next(&self, playback: bool) -> u32 {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 10000;
        let prefix = if playback { 1 } else { 0 };
        let text = format!("{}{}{:04}", prefix, self.domain_mid, seq);
        // 10 位十进制上限 1999999999，在 u32 范围内
        text.parse().unwrap_or(seq)
    }
}

/// 等待对端 ACK 的临时会合点，key 为 Call-ID
#[derive(Default)]
pub struct AckWaiters {
    waiting: DashMap<String, oneshot::Sender<()>>,
}

impl AckWaiters {
    pub fn register(&self, call_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiting.insert(call_id.to_string(), tx);
        rx
    }

    pub fn complete(&self, call_id: &str) -> bool {
        match self.waiting.remove(call_id) {
            Some((_, tx)) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, call_id: &str) {
        self.waiting.remove(call_id);
    }
}

/// 转发出口
#[derive(Debug, Clone)]
pub struct SinkEntry {
    pub sink_id: String,
    pub forward_type: String,
    pub target: String,
    /// 上级拉流对话的 Call-ID
    pub call_id: Option<String>,
    pub platform_id: Option<String>,
}

/// 活跃流
pub struct StreamEntry {
    pub stream_id: String,
    pub stream_type: StreamType,
    pub device_id: String,
    pub channel_id: String,
    /// 以媒体服务器指派为准，source/create 后可被改写
    ssrc: AtomicU32,
    /// 与源设备对话的 Call-ID
    pub call_id: Mutex<Option<String>>,
    /// 媒体服务器返回的播放地址
    pub urls: Mutex<Vec<String>>,
    pub sinks: DashMap<String, SinkEntry>,
    publish_tx: watch::Sender<bool>,
}

impl StreamEntry {
    fn new(
        stream_id: String,
        stream_type: StreamType,
        device_id: String,
        channel_id: String,
        ssrc: u32,
    ) -> Self {
        let (publish_tx, _) = watch::channel(false);
        Self {
            stream_id,
            stream_type,
            device_id,
            channel_id,
            ssrc: AtomicU32::new(ssrc),
            call_id: Mutex::new(None),
            urls: Mutex::new(Vec::new()),
            sinks: DashMap::new(),
            publish_tx,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc.load(Ordering::Relaxed)
    }

    pub fn set_ssrc(&self, ssrc: u32) {
        self.ssrc.store(ssrc, Ordering::Relaxed);
    }

    pub fn published(&self) -> bool {
        *self.publish_tx.borrow()
    }

    pub fn set_published(&self, value: bool) {
        self.publish_tx.send_replace(value);
    }

    pub fn set_call_id(&self, call_id: &str) {
        *self.call_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(call_id.to_string());
    }

    pub fn source_call_id(&self) -> Option<String> {
        self.call_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_urls(&self, urls: Vec<String>) {
        *self.urls.lock().unwrap_or_else(|e| e.into_inner()) = urls;
    }

    pub fn play_urls(&self) -> Vec<String> {
        self.urls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 等待推流确认
    pub async fn wait_published(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.publish_tx.subscribe();
        let fut = async {
            loop {
                if *rx.borrow() {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(CmsError::Other("stream entry dropped".to_string()));
                }
            }
        };
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| CmsError::Timeout(format!("等待 {} 推流超时", self.stream_id)))?
    }
}

/// 插入结果：同一流标识并发开流时只有一个 Created
pub enum InsertOutcome {
    Created(Arc<StreamEntry>),
    Existing(Arc<StreamEntry>),
}

/// 流引擎：内存态活跃流 + 媒体服务器控制 + 持久化
pub struct StreamEngine {
    pub media: MediaClient,
    writer: WriteHandle,
    streams: DashMap<String, Arc<StreamEntry>>,
    media_node: String,
}

impl StreamEngine {
    pub fn new(media: MediaClient, writer: WriteHandle, media_node: impl Into<String>) -> Self {
        Self {
            media,
            writer,
            streams: DashMap::new(),
            media_node: media_node.into(),
        }
    }

    /// 同流去重插入。已有表项直接复用，避免向设备重复 INVITE。
    pub fn try_insert(
        &self,
        id: &str,
        stream_type: StreamType,
        device_id: &str,
        channel_id: &str,
        ssrc: u32,
    ) -> InsertOutcome {
        match self.streams.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => InsertOutcome::Existing(e.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let entry = Arc::new(StreamEntry::new(
                    id.to_string(),
                    stream_type,
                    device_id.to_string(),
                    channel_id.to_string(),
                    ssrc,
                ));
                e.insert(entry.clone());
                InsertOutcome::Created(entry)
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<StreamEntry>> {
        self.streams.get(id).map(|e| e.clone())
    }

    pub fn active_streams(&self) -> Vec<Arc<StreamEntry>> {
        self.streams.iter().map(|e| e.value().clone()).collect()
    }

    /// 开流失败时撤销占位（不触发拆流流程）
    pub fn discard(&self, id: &str) {
        self.streams.remove(id);
    }

    /// 持久化流行
    pub async fn persist(&self, entry: &StreamEntry, start: i64, stop: i64) -> Result<()> {
        self.writer
            .submit(WriteOp::SaveStream(stream::Model {
                stream_id: entry.stream_id.clone(),
                stream_type: entry.stream_type.as_str().to_string(),
                device_id: entry.device_id.clone(),
                channel_id: entry.channel_id.clone(),
                call_id: entry.source_call_id(),
                media_server: self.media_node.clone(),
                ssrc: entry.ssrc() as i64,
                publish: entry.published(),
                urls: {
                    let urls = entry.play_urls();
                    (!urls.is_empty()).then(|| serde_json::to_string(&urls).unwrap_or_default())
                },
                start_time: (start != 0).then_some(start),
                stop_time: (stop != 0).then_some(stop),
                created_at: Utc::now(),
            }))
            .await?;
        Ok(())
    }

    /// 推流确认（媒体服务器回调触发）
    pub async fn mark_published(&self, stream_id: &str) -> bool {
        let Some(entry) = self.get(stream_id) else {
            return false;
        };
        entry.set_published(true);
        if let Err(e) = self.persist(&entry, 0, 0).await {
            tracing::warn!(target: "gbcms::stream", stream_id, "persist publish flag failed: {}", e);
        }
        true
    }

    /// 添加转发出口并落库。出口编号由媒体服务器指派，
    /// forward_type 取 broadcast / cascaded / gateway_1078。
    pub async fn add_sink(
        &self,
        entry: &StreamEntry,
        forward_type: &str,
        target: &str,
        setup: gbcms_sip::sdp::MediaSetup,
        call_id: Option<String>,
        platform_id: Option<String>,
    ) -> Result<(SinkEntry, SinkCreated)> {
        let created = self
            .media
            .add_sink(
                forward_type,
                &SinkAdd {
                    source: &entry.stream_id,
                    addr: target,
                    setup: setup.as_str(),
                    answer_setup: setup.answer().as_str(),
                    ssrc: entry.ssrc(),
                    session_name: entry.stream_type.session_name(),
                    trans_stream_protocol: "ps",
                },
            )
            .await?;

        let sink_entry = SinkEntry {
            sink_id: created.sink_id.clone(),
            forward_type: forward_type.to_string(),
            target: target.to_string(),
            call_id: call_id.clone(),
            platform_id: platform_id.clone(),
        };
        entry.sinks.insert(created.sink_id.clone(), sink_entry.clone());

        self.writer
            .submit(WriteOp::SaveSink(sink::Model {
                sink_id: created.sink_id.clone(),
                stream_id: entry.stream_id.clone(),
                forward_type: forward_type.to_string(),
                target: target.to_string(),
                call_id,
                platform_id,
                created_at: Utc::now(),
            }))
            .await?;
        Ok((sink_entry, created))
    }

    /// 关闭单个出口。幂等：不存在视为成功。
    pub async fn close_sink(&self, stream_id: &str, sink_id: &str) -> Result<()> {
        if let Some(entry) = self.get(stream_id) {
            entry.sinks.remove(sink_id);
        }
        if let Err(e) = self.media.close_sink(stream_id, sink_id).await {
            tracing::warn!(target: "gbcms::stream", sink_id, "close sink on media server failed: {}", e);
        }
        self.writer.submit(WriteOp::DeleteSink(sink_id.to_string())).await?;
        Ok(())
    }

    /// 拆除绑定到指定上级的全部出口，返回拆除数
    pub async fn close_platform_sinks(&self, platform_id: &str, dialogs: &DialogStore) -> usize {
        let bound: Vec<(String, SinkEntry)> = self
            .streams
            .iter()
            .flat_map(|e| {
                e.value()
                    .sinks
                    .iter()
                    .filter(|s| s.value().platform_id.as_deref() == Some(platform_id))
                    .map(|s| (e.key().clone(), s.value().clone()))
                    .collect::<Vec<_>>()
            })
            .collect();
        let count = bound.len();
        for (stream_id, sink) in bound {
            if let Some(call_id) = &sink.call_id {
                dialogs.send_bye(call_id).await;
            }
            if let Err(e) = self.close_sink(&stream_id, &sink.sink_id).await {
                tracing::warn!(target: "gbcms::stream", sink_id = %sink.sink_id, "close platform sink failed: {}", e);
            }
        }
        count
    }

    /// 按上级对话 Call-ID 查找出口
    pub fn sink_by_call_id(&self, call_id: &str) -> Option<(Arc<StreamEntry>, SinkEntry)> {
        for entry in self.streams.iter() {
            for sink in entry.value().sinks.iter() {
                if sink.value().call_id.as_deref() == Some(call_id) {
                    return Some((entry.value().clone(), sink.value().clone()));
                }
            }
        }
        None
    }

    /// 整流拆除，顺序固定：出口 → 源对话 BYE → 媒体关源 → 删行。
    /// 幂等：流不存在直接返回。
    pub async fn close_stream(&self, stream_id: &str, dialogs: &DialogStore) -> Result<()> {
        let Some((_, entry)) = self.streams.remove(stream_id) else {
            return Ok(());
        };
        tracing::info!(target: "gbcms::stream", stream_id, "closing stream");

        for sink in entry.sinks.iter() {
            let sink = sink.value();
            if let Err(e) = self.media.close_sink(stream_id, &sink.sink_id).await {
                tracing::warn!(target: "gbcms::stream", sink_id = %sink.sink_id, "close sink failed: {}", e);
            }
            if let Some(call_id) = &sink.call_id {
                dialogs.send_bye(call_id).await;
            }
        }

        if let Some(call_id) = entry.source_call_id() {
            dialogs.send_bye(&call_id).await;
        }

        if let Err(e) = self.media.close_source(stream_id).await {
            tracing::warn!(target: "gbcms::stream", stream_id, "close source failed: {}", e);
        }

        self.writer
            .submit(WriteOp::DeleteStreamSinks(stream_id.to_string()))
            .await?;
        self.writer
            .submit(WriteOp::DeleteStream(stream_id.to_string()))
            .await?;
        Ok(())
    }

    /// 设备离线时拆除其全部流
    pub async fn close_device_streams(&self, device_id: &str, dialogs: &DialogStore) {
        let ids: Vec<String> = self
            .streams
            .iter()
            .filter(|e| e.value().device_id == device_id)
            .map(|e| e.key().clone())
            .collect();
        for id in ids {
            if let Err(e) = self.close_stream(&id, dialogs).await {
                tracing::error!(target: "gbcms::stream", stream_id = %id, "close failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_forms() {
        assert_eq!(
            stream_id(StreamType::Play, "34020000001110000001", "34020000001320000001", 0, 0),
            "34020000001110000001/34020000001320000001"
        );
        assert_eq!(
            stream_id(
                StreamType::Playback,
                "dev",
                "ch",
                1718724056,
                1718724356
            ),
            "dev/ch.playback.1718724056.1718724356"
        );
        assert_eq!(
            stream_id(StreamType::Broadcast, "dev", "ch", 0, 0),
            "dev/ch.broadcast"
        );
    }

    #[test]
    fn test_parse_stream_id_roundtrip() {
        for (ty, start, stop) in [
            (StreamType::Play, 0, 0),
            (StreamType::Playback, 100, 200),
            (StreamType::Download, 100, 200),
            (StreamType::Broadcast, 0, 0),
        ] {
            let id = stream_id(ty, "d1", "c1", start, stop);
            let (ty2, dev, ch, s, e) = parse_stream_id(&id).unwrap();
            assert_eq!(ty2, ty);
            assert_eq!(dev, "d1");
            assert_eq!(ch, "c1");
            assert_eq!(s, start);
            assert_eq!(e, stop);
        }
        assert!(parse_stream_id("no-slash").is_none());
        assert!(parse_stream_id("d/c.playback.x.y").is_none());
    }

    #[test]
    fn test_ssrc_format() {
        let alloc = SsrcAlloc::new("3402000000");
        let live = alloc.next(false);
        let vod = alloc.next(true);

        let live_text = format!("{:010}", live);
        let vod_text = format!("{:010}", vod);
        assert!(live_text.starts_with('0'));
        assert!(vod_text.starts_with('1'));
        // 中间 5 位取域编码第 4~8 位
        assert_eq!(&live_text[1..6], "20000");
        assert_ne!(&live_text[6..], &vod_text[6..]);
    }

    #[tokio::test]
    async fn test_try_insert_at_most_once() {
        let media = MediaClient::new("http://127.0.0.1:1", "");
        let db = gbcms_store::repo::connect("sqlite::memory:").await.unwrap();
        gbcms_store::repo::init_schema(&db).await.unwrap();
        let writer = gbcms_store::spawn_writer(db);
        let engine = StreamEngine::new(media, writer, "node-1");

        let first = engine.try_insert("d/c", StreamType::Play, "d", "c", 1);
        let second = engine.try_insert("d/c", StreamType::Play, "d", "c", 2);
        assert!(matches!(first, InsertOutcome::Created(_)));
        match second {
            InsertOutcome::Existing(e) => assert_eq!(e.ssrc(), 1),
            InsertOutcome::Created(_) => panic!("duplicate create"),
        }

        engine.discard("d/c");
        assert!(engine.get("d/c").is_none());
    }

    #[tokio::test]
    async fn test_wait_published() {
        let entry = StreamEntry::new("d/c".into(), StreamType::Play, "d".into(), "c".into(), 1);
        let entry = Arc::new(entry);

        let waiter = entry.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_published(Duration::from_secs(1)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        entry.set_published(true);
        handle.await.unwrap().unwrap();

        // 未确认推流时等待超时
        let cold = StreamEntry::new("x/y".into(), StreamType::Play, "x".into(), "y".into(), 2);
        assert!(cold.wait_published(Duration::from_millis(30)).await.is_err());
    }

    #[test]
    fn test_ssrc_adopts_server_assignment() {
        let entry = StreamEntry::new("d/c".into(), StreamType::Play, "d".into(), "c".into(), 7);
        assert_eq!(entry.ssrc(), 7);
        entry.set_ssrc(100123);
        assert_eq!(entry.ssrc(), 100123);
    }

    #[tokio::test]
    async fn test_close_platform_sinks() {
        let media = MediaClient::new("http://127.0.0.1:1", "");
        let db = gbcms_store::repo::connect("sqlite::memory:").await.unwrap();
        gbcms_store::repo::init_schema(&db).await.unwrap();
        let writer = gbcms_store::spawn_writer(db.clone());
        let engine = StreamEngine::new(media, writer.clone(), "node-1");
        let dialogs = DialogStore::new(gbcms_sip::SipTransport::new(), writer);

        let InsertOutcome::Created(entry) = engine.try_insert("d/c", StreamType::Play, "d", "c", 1)
        else {
            panic!("expected fresh entry");
        };
        entry.sinks.insert(
            "s-p1".to_string(),
            SinkEntry {
                sink_id: "s-p1".to_string(),
                forward_type: "cascaded".to_string(),
                target: "10.0.0.2:9000".to_string(),
                call_id: None,
                platform_id: Some("p1".to_string()),
            },
        );
        entry.sinks.insert(
            "s-free".to_string(),
            SinkEntry {
                sink_id: "s-free".to_string(),
                forward_type: "broadcast".to_string(),
                target: "10.0.0.3:9000".to_string(),
                call_id: None,
                platform_id: None,
            },
        );

        assert_eq!(engine.close_platform_sinks("p1", &dialogs).await, 1);
        assert!(entry.sinks.get("s-p1").is_none());
        assert!(entry.sinks.get("s-free").is_some());
    }

    #[test]
    fn test_ack_waiters_rendezvous() {
        let waiters = AckWaiters::default();
        let rx = waiters.register("call-1");
        assert!(waiters.complete("call-1"));
        assert!(rx.blocking_recv().is_ok());
        assert!(!waiters.complete("call-1"));
    }
}
