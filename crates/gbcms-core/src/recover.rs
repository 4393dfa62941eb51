// 重启恢复
// 数据库快照回灌内存态，并与媒体服务器实况对账，残留会话补发 BYE

use crate::context::CmsContext;
use crate::error::Result;
use crate::stream::{SinkEntry, StreamType};
use crate::subscribe::SubscriptionEngine;
use chrono::Utc;
use gbcms_media::{SinkInfo, StreamInfo};
use gbcms_store::entity::stream;
use gbcms_store::WriteOp;
use std::collections::HashMap;
use std::sync::Arc;

/// 恢复结果统计
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoverySummary {
    pub devices: usize,
    pub dialogs: usize,
    pub subscriptions: usize,
    pub streams_restored: usize,
    pub streams_dropped: usize,
    pub jt_devices: usize,
}

/// 启动时执行一次。顺序固定：设备 → 对话/订阅 → 流对账 → 车载终端。
pub async fn run(ctx: &Arc<CmsContext>, subs: &Arc<SubscriptionEngine>) -> Result<RecoverySummary> {
    let mut summary = RecoverySummary::default();

    ctx.blacklist.load(&ctx.store.blacklist().await?);

    // 在线设备按在线对待，给一个完整心跳周期的宽限
    for row in ctx.store.devices().await? {
        if row.online && ctx.devices.restore(&row) {
            summary.devices += 1;
        }
    }

    for row in ctx.store.dialogs().await? {
        if row.dialog_type.starts_with("subscribe") {
            if subs.restore(&row, ctx.cfg.subscribe.mobile_position_interval) {
                summary.subscriptions += 1;
            } else {
                tracing::warn!(target: "gbcms::recover", call_id = %row.call_id, "subscription snapshot unusable, dropping");
                ctx.writer.submit(WriteOp::DeleteDialog(row.call_id)).await?;
            }
            continue;
        }
        if ctx.dialogs.restore(&row) {
            summary.dialogs += 1;
        } else {
            tracing::warn!(target: "gbcms::recover", call_id = %row.call_id, "dialog snapshot unusable, dropping");
            ctx.writer.submit(WriteOp::DeleteDialog(row.call_id)).await?;
        }
    }

    // 媒体服务器不可达时跳过流对账，等 on_started 回调再对一次
    match ctx.engine.media.list_sources().await {
        Ok(sources) => {
            let live: HashMap<String, StreamInfo> =
                sources.into_iter().map(|s| (s.stream_id.clone(), s)).collect();
            let live_sinks: HashMap<String, SinkInfo> = ctx
                .engine
                .media
                .list_sinks()
                .await
                .unwrap_or_default()
                .into_iter()
                .map(|s| (s.sink_id.clone(), s))
                .collect();
            let (restored, dropped) =
                reconcile_streams(ctx, ctx.store.streams().await?, &live, &live_sinks).await;
            summary.streams_restored = restored;
            summary.streams_dropped = dropped;
        }
        Err(e) => {
            tracing::warn!(target: "gbcms::recover", "media server unreachable, stream reconcile deferred: {}", e);
        }
    }

    summary.jt_devices = restore_jt_devices(ctx).await?;

    tracing::info!(
        target: "gbcms::recover",
        devices = summary.devices,
        dialogs = summary.dialogs,
        subscriptions = summary.subscriptions,
        streams = summary.streams_restored,
        dropped = summary.streams_dropped,
        jt = summary.jt_devices,
        "recovery done"
    );
    Ok(summary)
}

/// 车载终端回灌：心跳过期的置离线，其余保持在线继续服务
async fn restore_jt_devices(ctx: &Arc<CmsContext>) -> Result<usize> {
    let mut alive = 0;
    for mut jt in ctx.store.jt_devices().await? {
        if !jt.enable || !jt.online {
            continue;
        }
        let stale = jt
            .last_seen
            .map_or(true, |t| (Utc::now() - t).num_seconds() > ctx.cfg.sip.alive_expires as i64);
        if stale {
            tracing::info!(target: "gbcms::recover", phone = %jt.phone, "jt device heartbeat expired, marked offline");
            jt.online = false;
            ctx.writer.submit(WriteOp::SaveJtDevice(jt)).await?;
        } else {
            alive += 1;
        }
    }
    Ok(alive)
}

/// 流对账：媒体服务器上还活着的流回灌引擎，死流挂断并删行
async fn reconcile_streams(
    ctx: &Arc<CmsContext>,
    rows: Vec<stream::Model>,
    live: &HashMap<String, StreamInfo>,
    live_sinks: &HashMap<String, SinkInfo>,
) -> (usize, usize) {
    let mut restored = 0;
    let mut dropped = 0;
    for row in rows {
        match live.get(&row.stream_id) {
            Some(info) => {
                if restore_stream(ctx, &row, info, live_sinks).await {
                    restored += 1;
                }
            }
            None => {
                drop_stream_row(ctx, &row).await;
                dropped += 1;
            }
        }
    }
    (restored, dropped)
}

async fn restore_stream(
    ctx: &Arc<CmsContext>,
    row: &stream::Model,
    info: &StreamInfo,
    live_sinks: &HashMap<String, SinkInfo>,
) -> bool {
    let Some(stream_type) = StreamType::parse(&row.stream_type) else {
        tracing::warn!(target: "gbcms::recover", stream_id = %row.stream_id, "unknown stream type, dropping");
        drop_stream_row(ctx, row).await;
        return false;
    };
    let entry = match ctx.engine.try_insert(
        &row.stream_id,
        stream_type,
        &row.device_id,
        &row.channel_id,
        row.ssrc as u32,
    ) {
        crate::stream::InsertOutcome::Created(entry) => entry,
        crate::stream::InsertOutcome::Existing(entry) => entry,
    };
    if let Some(call_id) = &row.call_id {
        entry.set_call_id(call_id);
    }
    if let Some(urls) = row.urls.as_deref() {
        match serde_json::from_str::<Vec<String>>(urls) {
            Ok(urls) => entry.set_urls(urls),
            Err(e) => {
                tracing::warn!(target: "gbcms::recover", stream_id = %row.stream_id, "urls snapshot unparsable: {}", e);
            }
        }
    }
    entry.set_published(info.publish || row.publish);

    // 出口逐个与媒体服务器实况比对：编号缺失或转发方式不符的一律拆掉
    match ctx.store.sinks_of(&row.stream_id).await {
        Ok(sinks) => {
            for s in sinks {
                let matched = live_sinks
                    .get(&s.sink_id)
                    .is_some_and(|live| live.forward_type == s.forward_type);
                if !matched {
                    tracing::warn!(
                        target: "gbcms::recover",
                        sink_id = %s.sink_id,
                        forward_type = %s.forward_type,
                        "sink missing on media server or forward type mismatch, dropping"
                    );
                    if let Some(call_id) = &s.call_id {
                        ctx.dialogs.send_bye(call_id).await;
                    }
                    if let Err(e) = ctx.writer.submit(WriteOp::DeleteSink(s.sink_id.clone())).await {
                        tracing::warn!(target: "gbcms::recover", sink_id = %s.sink_id, "delete sink row failed: {}", e);
                    }
                    continue;
                }
                entry.sinks.insert(
                    s.sink_id.clone(),
                    SinkEntry {
                        sink_id: s.sink_id,
                        forward_type: s.forward_type,
                        target: s.target,
                        call_id: s.call_id,
                        platform_id: s.platform_id,
                    },
                );
            }
        }
        Err(e) => {
            tracing::warn!(target: "gbcms::recover", stream_id = %row.stream_id, "load sinks failed: {}", e);
        }
    }
    tracing::info!(target: "gbcms::recover", stream_id = %row.stream_id, "stream restored");
    true
}

/// 死流善后：对话补发 BYE，流与出口行删除
async fn drop_stream_row(ctx: &Arc<CmsContext>, row: &stream::Model) {
    for dialog in ctx.dialogs.by_stream(&row.stream_id) {
        ctx.dialogs.send_bye(&dialog.call_id).await;
    }
    if let Err(e) = ctx
        .writer
        .submit(WriteOp::DeleteStreamSinks(row.stream_id.clone()))
        .await
    {
        tracing::warn!(target: "gbcms::recover", stream_id = %row.stream_id, "delete sinks failed: {}", e);
    }
    if let Err(e) = ctx
        .writer
        .submit(WriteOp::DeleteStream(row.stream_id.clone()))
        .await
    {
        tracing::warn!(target: "gbcms::recover", stream_id = %row.stream_id, "delete stream failed: {}", e);
    }
    tracing::info!(target: "gbcms::recover", stream_id = %row.stream_id, "stale stream dropped");
}

/// 信令重启：关流 → 停级联 → 重绑端口 → 起级联。
/// 全程持有重启锁，重复调用串行执行。
pub async fn restart_transport(
    ctx: &Arc<CmsContext>,
    cascades: &Arc<crate::cascade::CascadeManager>,
    listen_ip: &str,
    port: u16,
) -> Result<()> {
    let _guard = ctx.restart_lock.lock().await;
    tracing::warn!(target: "gbcms::recover", listen_ip, port, "sip transport restarting");

    for entry in ctx.engine.active_streams() {
        if let Err(e) = ctx.engine.close_stream(&entry.stream_id, &ctx.dialogs).await {
            tracing::warn!(target: "gbcms::recover", stream_id = %entry.stream_id, "close before restart failed: {}", e);
        }
    }
    cascades.stop_all();
    ctx.transport.rebind(listen_ip, port).await?;
    cascades.start_enabled().await?;

    tracing::info!(target: "gbcms::recover", "sip transport restarted");
    Ok(())
}

/// 媒体服务器重启回调（on_started）时的对账：
/// 引擎里媒体侧已不存在的流全部拆除。
pub async fn reconcile_after_media_restart(ctx: &Arc<CmsContext>) -> Result<usize> {
    let live: HashMap<String, StreamInfo> = ctx
        .engine
        .media
        .list_sources()
        .await?
        .into_iter()
        .map(|s| (s.stream_id.clone(), s))
        .collect();

    let mut closed = 0;
    for entry in ctx.engine.active_streams() {
        if !live.contains_key(&entry.stream_id) {
            if let Err(e) = ctx.engine.close_stream(&entry.stream_id, &ctx.dialogs).await {
                tracing::warn!(target: "gbcms::recover", stream_id = %entry.stream_id, "close after media restart failed: {}", e);
            } else {
                closed += 1;
            }
        }
    }
    if closed > 0 {
        tracing::warn!(target: "gbcms::recover", closed, "streams torn down after media restart");
    }
    Ok(closed)
}
