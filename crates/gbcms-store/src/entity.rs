// 数据库实体定义
// 所有表使用字符串业务主键（国标编码），位置/报警历史用自增主键

use sea_orm::entity::prelude::*;

/// 下级设备（注册到本平台的 SIP UA）
pub mod device {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "devices")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub device_id: String,
        pub name: String,
        pub manufacturer: String,
        pub model: String,
        pub firmware: String,
        /// UDP / TCP
        pub transport: String,
        /// 注册来源地址 ip:port
        pub remote_addr: String,
        pub expires: i32,
        pub register_time: ChronoDateTimeUtc,
        pub keepalive_time: ChronoDateTimeUtc,
        pub online: bool,
        pub channel_count: i32,
        /// 为空时使用全局口令
        pub password: Option<String>,
        /// 点播收流方式缺省值 udp / passive / active，为空时用全局配置
        pub media_setup: Option<String>,
        pub sub_catalog: bool,
        pub sub_position: bool,
        pub sub_alarm: bool,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(has_many = "super::channel::Entity")]
        Channel,
    }

    impl Related<super::channel::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Channel.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

/// 设备目录通道，联合主键 (root_id, device_id)
pub mod channel {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "channels")]
    pub struct Model {
        /// 所属设备编码
        #[sea_orm(primary_key, auto_increment = false)]
        pub root_id: String,
        /// 通道编码
        #[sea_orm(primary_key, auto_increment = false)]
        pub device_id: String,
        pub name: String,
        pub manufacturer: Option<String>,
        pub model: Option<String>,
        pub owner: Option<String>,
        pub civil_code: Option<String>,
        pub address: Option<String>,
        pub parental: Option<i32>,
        pub parent_id: Option<String>,
        pub business_group_id: Option<String>,
        pub register_way: Option<i32>,
        pub secrecy: Option<i32>,
        pub ip_address: Option<String>,
        pub port: Option<i32>,
        /// 规范化为 ON / OFF
        pub status: String,
        pub longitude: Option<f64>,
        pub latitude: Option<f64>,
        pub ptz_type: Option<i32>,
        pub sub_count: i32,
        /// 通道级收流方式覆盖，目录重建时保留
        pub setup: Option<String>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {
        #[sea_orm(
            belongs_to = "super::device::Entity",
            from = "Column::RootId",
            to = "super::device::Column::DeviceId"
        )]
        Device,
    }

    impl Related<super::device::Entity> for Entity {
        fn to() -> RelationDef {
            Relation::Device.def()
        }
    }

    impl ActiveModelBehavior for ActiveModel {}
}

/// 上级级联平台
pub mod platform {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "platforms")]
    pub struct Model {
        /// 上级平台国标编码
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        pub name: String,
        pub enable: bool,
        pub domain: String,
        pub ip: String,
        pub port: i32,
        /// UDP / TCP
        pub transport: String,
        /// 向上级注册时本级使用的编码
        pub cms_id: String,
        pub password: String,
        pub expires: i32,
        pub keepalive_secs: i32,
        /// 目录应答分包时每包通道数
        pub catalog_group: i32,
        /// 共享全部通道；关闭时只共享 platform_channels 里登记的通道
        pub share_all: bool,
        pub online: bool,
        pub register_time: Option<ChronoDateTimeUtc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 共享给上级平台的通道，联合主键 (platform_id, channel_id)
pub mod platform_channel {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "platform_channels")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub platform_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub channel_id: String,
        /// 通道所属设备编码
        pub root_id: String,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// JT/T 1078 车载终端
pub mod jt_device {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "jt_devices")]
    pub struct Model {
        /// 终端手机号（SIM）
        #[sea_orm(primary_key, auto_increment = false)]
        pub phone: String,
        pub plate: String,
        /// 车载通道映射出的国标编码
        pub gb_id: String,
        pub channel_count: i32,
        pub enable: bool,
        pub online: bool,
        pub last_seen: Option<ChronoDateTimeUtc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 活跃流（源端会话）
pub mod stream {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "streams")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub stream_id: String,
        /// play / playback / download / broadcast
        pub stream_type: String,
        pub device_id: String,
        pub channel_id: String,
        /// 与源设备的 INVITE 对话 Call-ID
        pub call_id: Option<String>,
        pub media_server: String,
        pub ssrc: i64,
        /// 媒体服务器已确认收到推流
        pub publish: bool,
        /// 媒体服务器返回的播放地址，JSON 数组
        pub urls: Option<String>,
        pub start_time: Option<i64>,
        pub stop_time: Option<i64>,
        pub created_at: ChronoDateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 流的转发出口
pub mod sink {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "sinks")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub sink_id: String,
        pub stream_id: String,
        /// broadcast / cascaded / gateway_1078
        pub forward_type: String,
        /// 目标收流地址 ip:port
        pub target: String,
        /// 上级拉流时的 INVITE 对话 Call-ID
        pub call_id: Option<String>,
        pub platform_id: Option<String>,
        pub created_at: ChronoDateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// SIP 对话快照。INVITE 对话重启后据此补发 BYE，
/// 订阅对话据此续订（refresh_time 为下次续订时刻）。
pub mod sip_dialog {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "sip_dialogs")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub call_id: String,
        pub stream_id: String,
        pub device_id: String,
        pub channel_id: String,
        /// out：本级为 UAC；in：本级为 UAS（上级拉流）
        pub direction: String,
        /// invite / subscribe_catalog / subscribe_position / subscribe_alarm
        pub dialog_type: String,
        /// 序列化的对话内请求模板
        pub request: String,
        pub remote_addr: String,
        pub transport: String,
        /// 对话内 CSeq 高水位
        pub cseq: i32,
        /// 订阅续订时刻（到期前 60 秒）
        pub refresh_time: Option<ChronoDateTimeUtc>,
        pub created_at: ChronoDateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 移动位置通知历史
pub mod position {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "positions")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub device_id: String,
        pub channel_id: Option<String>,
        pub time: ChronoDateTimeUtc,
        pub longitude: f64,
        pub latitude: f64,
        pub speed: Option<f64>,
        pub direction: Option<f64>,
        pub altitude: Option<f64>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 报警通知历史
pub mod alarm {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "alarms")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub device_id: String,
        pub channel_id: Option<String>,
        pub priority: Option<String>,
        pub method: Option<String>,
        pub alarm_type: Option<String>,
        pub time: ChronoDateTimeUtc,
        pub description: Option<String>,
        pub longitude: Option<f64>,
        pub latitude: Option<f64>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 设备上下线流水
pub mod status_log {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "status_logs")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub device_id: String,
        /// ON / OFF
        pub status: String,
        pub time: ChronoDateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 操作日志（管理接口触发的动作）
pub mod log {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "logs")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        /// stream_start / stream_stop / ptz / broadcast / restart …
        pub action: String,
        /// 作用对象（流号或设备编码）
        pub target: String,
        pub detail: Option<String>,
        pub time: ChronoDateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 信令黑名单。kind 取 ip / user_agent / device。
pub mod blacklist {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "blacklist")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub value: String,
        pub kind: String,
        pub reason: Option<String>,
        pub created_at: ChronoDateTimeUtc,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
