// 类型化读取与建表
// 写入走 writer 队列，这里只读

use crate::entity::{
    alarm, blacklist, channel, device, jt_device, log, platform, platform_channel, position, sink,
    sip_dialog, status_log, stream,
};
use crate::error::Result;
use sea_orm::{
    ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Schema,
};

/// 连接数据库（sqlite://path 或 sqlite::memory:）
pub async fn connect(url: &str) -> Result<DatabaseConnection> {
    let db = Database::connect(url).await?;
    Ok(db)
}

async fn create_table<E: EntityTrait>(db: &DatabaseConnection, entity: E) -> Result<()> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let mut stmt = schema.create_table_from_entity(entity);
    stmt.if_not_exists();
    db.execute(backend.build(&stmt)).await?;
    Ok(())
}

/// 建表（幂等）
pub async fn init_schema(db: &DatabaseConnection) -> Result<()> {
    create_table(db, device::Entity).await?;
    create_table(db, channel::Entity).await?;
    create_table(db, platform::Entity).await?;
    create_table(db, platform_channel::Entity).await?;
    create_table(db, jt_device::Entity).await?;
    create_table(db, stream::Entity).await?;
    create_table(db, sink::Entity).await?;
    create_table(db, sip_dialog::Entity).await?;
    create_table(db, position::Entity).await?;
    create_table(db, alarm::Entity).await?;
    create_table(db, status_log::Entity).await?;
    create_table(db, log::Entity).await?;
    create_table(db, blacklist::Entity).await?;
    tracing::info!(target: "gbcms::store", "database schema ready");
    Ok(())
}

/// 只读仓库
#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
}

impl Store {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub fn conn(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn device(&self, device_id: &str) -> Result<Option<device::Model>> {
        Ok(device::Entity::find_by_id(device_id).one(&self.db).await?)
    }

    pub async fn devices(&self) -> Result<Vec<device::Model>> {
        Ok(device::Entity::find().all(&self.db).await?)
    }

    pub async fn channel(&self, root_id: &str, channel_id: &str) -> Result<Option<channel::Model>> {
        Ok(channel::Entity::find_by_id((root_id.to_string(), channel_id.to_string()))
            .one(&self.db)
            .await?)
    }

    pub async fn channels(&self) -> Result<Vec<channel::Model>> {
        Ok(channel::Entity::find()
            .order_by_asc(channel::Column::DeviceId)
            .all(&self.db)
            .await?)
    }

    pub async fn channels_of(&self, root_id: &str) -> Result<Vec<channel::Model>> {
        Ok(channel::Entity::find()
            .filter(channel::Column::RootId.eq(root_id))
            .order_by_asc(channel::Column::DeviceId)
            .all(&self.db)
            .await?)
    }

    /// 按通道编码反查所属设备（上级点流时只给出通道编码）
    pub async fn channel_owner(&self, channel_id: &str) -> Result<Option<channel::Model>> {
        Ok(channel::Entity::find()
            .filter(channel::Column::DeviceId.eq(channel_id))
            .one(&self.db)
            .await?)
    }

    pub async fn platform(&self, id: &str) -> Result<Option<platform::Model>> {
        Ok(platform::Entity::find_by_id(id).one(&self.db).await?)
    }

    pub async fn platforms(&self) -> Result<Vec<platform::Model>> {
        Ok(platform::Entity::find().all(&self.db).await?)
    }

    pub async fn platforms_enabled(&self) -> Result<Vec<platform::Model>> {
        Ok(platform::Entity::find()
            .filter(platform::Column::Enable.eq(true))
            .all(&self.db)
            .await?)
    }

    pub async fn platform_channels(&self, platform_id: &str) -> Result<Vec<platform_channel::Model>> {
        Ok(platform_channel::Entity::find()
            .filter(platform_channel::Column::PlatformId.eq(platform_id))
            .all(&self.db)
            .await?)
    }

    /// 通道是否共享给该上级
    pub async fn platform_channel(
        &self,
        platform_id: &str,
        channel_id: &str,
    ) -> Result<Option<platform_channel::Model>> {
        Ok(
            platform_channel::Entity::find_by_id((platform_id.to_string(), channel_id.to_string()))
                .one(&self.db)
                .await?,
        )
    }

    pub async fn jt_devices(&self) -> Result<Vec<jt_device::Model>> {
        Ok(jt_device::Entity::find().all(&self.db).await?)
    }

    pub async fn jt_device(&self, phone: &str) -> Result<Option<jt_device::Model>> {
        Ok(jt_device::Entity::find_by_id(phone).one(&self.db).await?)
    }

    /// 按映射出的国标编码反查车载终端
    pub async fn jt_device_by_gb(&self, gb_id: &str) -> Result<Option<jt_device::Model>> {
        Ok(jt_device::Entity::find()
            .filter(jt_device::Column::GbId.eq(gb_id))
            .one(&self.db)
            .await?)
    }

    pub async fn stream(&self, stream_id: &str) -> Result<Option<stream::Model>> {
        Ok(stream::Entity::find_by_id(stream_id).one(&self.db).await?)
    }

    pub async fn streams(&self) -> Result<Vec<stream::Model>> {
        Ok(stream::Entity::find().all(&self.db).await?)
    }

    pub async fn sink(&self, sink_id: &str) -> Result<Option<sink::Model>> {
        Ok(sink::Entity::find_by_id(sink_id).one(&self.db).await?)
    }

    pub async fn sinks_of(&self, stream_id: &str) -> Result<Vec<sink::Model>> {
        Ok(sink::Entity::find()
            .filter(sink::Column::StreamId.eq(stream_id))
            .all(&self.db)
            .await?)
    }

    pub async fn dialog(&self, call_id: &str) -> Result<Option<sip_dialog::Model>> {
        Ok(sip_dialog::Entity::find_by_id(call_id).one(&self.db).await?)
    }

    pub async fn dialogs(&self) -> Result<Vec<sip_dialog::Model>> {
        Ok(sip_dialog::Entity::find().all(&self.db).await?)
    }

    /// 某设备某类订阅的现存对话
    pub async fn dialog_of_type(
        &self,
        device_id: &str,
        dialog_type: &str,
    ) -> Result<Option<sip_dialog::Model>> {
        Ok(sip_dialog::Entity::find()
            .filter(sip_dialog::Column::DeviceId.eq(device_id))
            .filter(sip_dialog::Column::DialogType.eq(dialog_type))
            .one(&self.db)
            .await?)
    }

    /// 到期待续订的订阅对话
    pub async fn dialogs_due(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Vec<sip_dialog::Model>> {
        Ok(sip_dialog::Entity::find()
            .filter(sip_dialog::Column::RefreshTime.lte(now))
            .all(&self.db)
            .await?)
    }

    pub async fn is_blacklisted(&self, value: &str) -> Result<bool> {
        Ok(blacklist::Entity::find_by_id(value)
            .one(&self.db)
            .await?
            .is_some())
    }

    pub async fn blacklist(&self) -> Result<Vec<blacklist::Model>> {
        Ok(blacklist::Entity::find().all(&self.db).await?)
    }

    pub async fn positions_of(&self, device_id: &str, limit: u64) -> Result<Vec<position::Model>> {
        use sea_orm::QuerySelect;
        Ok(position::Entity::find()
            .filter(position::Column::DeviceId.eq(device_id))
            .order_by_desc(position::Column::Time)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn alarms_of(&self, device_id: &str, limit: u64) -> Result<Vec<alarm::Model>> {
        use sea_orm::QuerySelect;
        Ok(alarm::Entity::find()
            .filter(alarm::Column::DeviceId.eq(device_id))
            .order_by_desc(alarm::Column::Time)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn status_logs_of(
        &self,
        device_id: &str,
        limit: u64,
    ) -> Result<Vec<status_log::Model>> {
        use sea_orm::QuerySelect;
        Ok(status_log::Entity::find()
            .filter(status_log::Column::DeviceId.eq(device_id))
            .order_by_desc(status_log::Column::Time)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn logs(&self, limit: u64) -> Result<Vec<log::Model>> {
        use sea_orm::QuerySelect;
        Ok(log::Entity::find()
            .order_by_desc(log::Column::Time)
            .limit(limit)
            .all(&self.db)
            .await?)
    }
}
