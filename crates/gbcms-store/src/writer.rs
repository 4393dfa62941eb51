// 单写入者队列
// 所有写操作汇入一个任务，按 50ms 窗口合并为单事务提交。
// upsert 统一实现为删后插，避免逐列枚举冲突更新。

use crate::entity::{
    alarm, blacklist, channel, device, jt_device, log, platform, platform_channel, position, sink,
    sip_dialog, status_log, stream,
};
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveValue::NotSet, ColumnTrait, DatabaseConnection, DatabaseTransaction, DbErr, EntityTrait,
    IntoActiveModel, QueryFilter, TransactionTrait,
};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const BATCH_WINDOW: Duration = Duration::from_millis(50);
const BATCH_MAX: usize = 256;

/// 写操作。Save* 为删后插的整行 upsert。
#[derive(Debug)]
pub enum WriteOp {
    SaveDevice(device::Model),
    DeleteDevice(String),
    SaveChannels(Vec<channel::Model>),
    DeleteChannels { root_id: String },
    SavePlatform(platform::Model),
    DeletePlatform(String),
    ReplacePlatformChannels {
        platform_id: String,
        channels: Vec<platform_channel::Model>,
    },
    SaveJtDevice(jt_device::Model),
    DeleteJtDevice(String),
    SaveStream(stream::Model),
    DeleteStream(String),
    SaveSink(sink::Model),
    DeleteSink(String),
    DeleteStreamSinks(String),
    SaveDialog(sip_dialog::Model),
    DeleteDialog(String),
    AppendPosition(position::Model),
    AppendAlarm(alarm::Model),
    AppendStatusLog(status_log::Model),
    AppendLog(log::Model),
    SaveBlacklist(blacklist::Model),
    DeleteBlacklist(String),
    /// 清理历史表。位置用 positions_before，报警与日志类用 alarms_before。
    Purge {
        positions_before: DateTime<Utc>,
        alarms_before: DateTime<Utc>,
    },
}

struct WriteReq {
    op: WriteOp,
    ack: Option<oneshot::Sender<Result<()>>>,
}

/// 写入句柄，可自由克隆
#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::Sender<WriteReq>,
}

impl WriteHandle {
    /// 提交并等待落库确认
    pub async fn submit(&self, op: WriteOp) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WriteReq { op, ack: Some(ack_tx) })
            .await
            .map_err(|_| StoreError::WriterClosed)?;
        ack_rx.await.map_err(|_| StoreError::WriterClosed)?
    }

    /// 提交后不等待（历史类写入）
    pub async fn post(&self, op: WriteOp) -> Result<()> {
        self.tx
            .send(WriteReq { op, ack: None })
            .await
            .map_err(|_| StoreError::WriterClosed)
    }
}

/// 启动写入任务
pub fn spawn_writer(db: DatabaseConnection) -> WriteHandle {
    let (tx, mut rx) = mpsc::channel::<WriteReq>(1024);
    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            let deadline = tokio::time::Instant::now() + BATCH_WINDOW;
            while batch.len() < BATCH_MAX {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(req)) => batch.push(req),
                    Ok(None) | Err(_) => break,
                }
            }
            run_batch(&db, batch).await;
        }
        tracing::info!(target: "gbcms::store", "write queue drained, writer stopped");
    });
    WriteHandle { tx }
}

async fn run_batch(db: &DatabaseConnection, batch: Vec<WriteReq>) {
    let count = batch.len();
    let (ops, acks): (Vec<_>, Vec<_>) = batch.into_iter().map(|r| (r.op, r.ack)).unzip();

    let result: std::result::Result<(), DbErr> = async {
        let txn = db.begin().await?;
        for op in ops {
            apply(&txn, op).await?;
        }
        txn.commit().await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            for ack in acks.into_iter().flatten() {
                let _ = ack.send(Ok(()));
            }
        }
        Err(e) => {
            tracing::error!(target: "gbcms::store", ops = count, "write batch failed: {}", e);
            let msg = e.to_string();
            for ack in acks.into_iter().flatten() {
                let _ = ack.send(Err(StoreError::Write(msg.clone())));
            }
        }
    }
}

async fn apply(txn: &DatabaseTransaction, op: WriteOp) -> std::result::Result<(), DbErr> {
    match op {
        WriteOp::SaveDevice(m) => {
            device::Entity::delete_by_id(&m.device_id).exec(txn).await?;
            device::Entity::insert(m.into_active_model()).exec(txn).await?;
        }
        WriteOp::DeleteDevice(id) => {
            device::Entity::delete_by_id(&id).exec(txn).await?;
        }
        WriteOp::SaveChannels(models) => {
            for m in models {
                channel::Entity::delete_by_id((m.root_id.clone(), m.device_id.clone()))
                    .exec(txn)
                    .await?;
                channel::Entity::insert(m.into_active_model()).exec(txn).await?;
            }
        }
        WriteOp::DeleteChannels { root_id } => {
            channel::Entity::delete_many()
                .filter(channel::Column::RootId.eq(root_id))
                .exec(txn)
                .await?;
        }
        WriteOp::SavePlatform(m) => {
            platform::Entity::delete_by_id(&m.id).exec(txn).await?;
            platform::Entity::insert(m.into_active_model()).exec(txn).await?;
        }
        WriteOp::DeletePlatform(id) => {
            platform::Entity::delete_by_id(&id).exec(txn).await?;
            platform_channel::Entity::delete_many()
                .filter(platform_channel::Column::PlatformId.eq(&id))
                .exec(txn)
                .await?;
        }
        WriteOp::ReplacePlatformChannels {
            platform_id,
            channels,
        } => {
            platform_channel::Entity::delete_many()
                .filter(platform_channel::Column::PlatformId.eq(&platform_id))
                .exec(txn)
                .await?;
            for m in channels {
                platform_channel::Entity::insert(m.into_active_model())
                    .exec(txn)
                    .await?;
            }
        }
        WriteOp::SaveJtDevice(m) => {
            jt_device::Entity::delete_by_id(&m.phone).exec(txn).await?;
            jt_device::Entity::insert(m.into_active_model()).exec(txn).await?;
        }
        WriteOp::DeleteJtDevice(phone) => {
            jt_device::Entity::delete_by_id(&phone).exec(txn).await?;
        }
        WriteOp::SaveStream(m) => {
            stream::Entity::delete_by_id(&m.stream_id).exec(txn).await?;
            stream::Entity::insert(m.into_active_model()).exec(txn).await?;
        }
        WriteOp::DeleteStream(id) => {
            stream::Entity::delete_by_id(&id).exec(txn).await?;
        }
        WriteOp::SaveSink(m) => {
            sink::Entity::delete_by_id(&m.sink_id).exec(txn).await?;
            sink::Entity::insert(m.into_active_model()).exec(txn).await?;
        }
        WriteOp::DeleteSink(id) => {
            sink::Entity::delete_by_id(&id).exec(txn).await?;
        }
        WriteOp::DeleteStreamSinks(stream_id) => {
            sink::Entity::delete_many()
                .filter(sink::Column::StreamId.eq(stream_id))
                .exec(txn)
                .await?;
        }
        WriteOp::SaveDialog(m) => {
            sip_dialog::Entity::delete_by_id(&m.call_id).exec(txn).await?;
            sip_dialog::Entity::insert(m.into_active_model()).exec(txn).await?;
        }
        WriteOp::DeleteDialog(call_id) => {
            sip_dialog::Entity::delete_by_id(&call_id).exec(txn).await?;
        }
        WriteOp::AppendPosition(m) => {
            let mut am = m.into_active_model();
            am.id = NotSet;
            position::Entity::insert(am).exec(txn).await?;
        }
        WriteOp::AppendAlarm(m) => {
            let mut am = m.into_active_model();
            am.id = NotSet;
            alarm::Entity::insert(am).exec(txn).await?;
        }
        WriteOp::AppendStatusLog(m) => {
            let mut am = m.into_active_model();
            am.id = NotSet;
            status_log::Entity::insert(am).exec(txn).await?;
        }
        WriteOp::AppendLog(m) => {
            let mut am = m.into_active_model();
            am.id = NotSet;
            log::Entity::insert(am).exec(txn).await?;
        }
        WriteOp::SaveBlacklist(m) => {
            blacklist::Entity::delete_by_id(&m.value).exec(txn).await?;
            blacklist::Entity::insert(m.into_active_model()).exec(txn).await?;
        }
        WriteOp::DeleteBlacklist(id) => {
            blacklist::Entity::delete_by_id(&id).exec(txn).await?;
        }
        WriteOp::Purge {
            positions_before,
            alarms_before,
        } => {
            position::Entity::delete_many()
                .filter(position::Column::Time.lt(positions_before))
                .exec(txn)
                .await?;
            alarm::Entity::delete_many()
                .filter(alarm::Column::Time.lt(alarms_before))
                .exec(txn)
                .await?;
            status_log::Entity::delete_many()
                .filter(status_log::Column::Time.lt(alarms_before))
                .exec(txn)
                .await?;
            log::Entity::delete_many()
                .filter(log::Column::Time.lt(alarms_before))
                .exec(txn)
                .await?;
        }
    }
    Ok(())
}
