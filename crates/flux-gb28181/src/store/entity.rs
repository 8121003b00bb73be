use chrono::{DateTime as ChronoDateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// 设备实体
pub mod device {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "device")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub id: String,
        pub name: String,
        pub manufacturer: String,
        pub model: String,
        pub firmware: String,
        pub charset: String,
        pub transport: String,
        pub host: String,
        pub port: i32,
        pub status: String,
        pub contact: String,
        pub realm: String,
        pub password: Option<String>,
        pub media_transport: Option<String>,
        pub expires: i64,
        pub register_time: Option<ChronoDateTime<Utc>>,
        pub keepalive_time: Option<ChronoDateTime<Utc>>,
        pub keepalive_deadline: Option<ChronoDateTime<Utc>>,
        pub created_at: ChronoDateTime<Utc>,
        pub updated_at: ChronoDateTime<Utc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 通道实体，(device_id, channel_id) 唯一
pub mod channel {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "channel")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub device_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub channel_id: String,
        pub name: String,
        pub kind: String,
        pub status: String,
        pub manufacturer: String,
        pub model: String,
        pub owner: String,
        pub civil_code: String,
        pub address: String,
        pub parent_id: String,
        pub business_group_id: String,
        pub parental: bool,
        pub longitude: Option<f64>,
        pub latitude: Option<f64>,
        pub ptz_type: Option<i32>,
        pub updated_at: ChronoDateTime<Utc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 对话实体，保存原始 INVITE 文本
pub mod dialog {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "dialog")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub call_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub local_tag: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub remote_tag: String,
        pub role: String,
        pub device_id: String,
        pub is_uac: bool,
        pub local_seq: i64,
        pub remote_seq: i64,
        pub remote_target: String,
        pub route_set: Json,
        pub invite_raw: String,
        pub ack_raw: Option<String>,
        pub early: bool,
        pub transport: String,
        pub remote_addr: String,
        pub created_at: ChronoDateTime<Utc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 订阅实体，(device_id, event) 唯一
pub mod subscription {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "subscription")]
    pub struct Model {
        #[sea_orm(primary_key, auto_increment = false)]
        pub device_id: String,
        #[sea_orm(primary_key, auto_increment = false)]
        pub event: String,
        pub expires: i64,
        pub call_id: Option<String>,
        pub local_tag: Option<String>,
        pub remote_tag: Option<String>,
        pub next_refresh_at: Option<ChronoDateTime<Utc>>,
        pub updated_at: ChronoDateTime<Utc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 移动位置记录
pub mod position_log {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "position_log")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub device_id: String,
        pub channel_id: String,
        pub longitude: f64,
        pub latitude: f64,
        pub speed: Option<f64>,
        pub direction: Option<f64>,
        pub altitude: Option<f64>,
        pub report_time: String,
        pub created_at: ChronoDateTime<Utc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 报警记录
pub mod alarm_log {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "alarm_log")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub device_id: String,
        pub channel_id: String,
        pub priority: String,
        pub method: String,
        pub alarm_type: Option<String>,
        pub description: String,
        pub longitude: Option<f64>,
        pub latitude: Option<f64>,
        pub alarm_time: String,
        pub created_at: ChronoDateTime<Utc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}

/// 已结束会话记录
pub mod session_log {
    use super::*;

    #[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
    #[sea_orm(table_name = "session_log")]
    pub struct Model {
        #[sea_orm(primary_key)]
        pub id: i64,
        pub stream_id: String,
        pub invite_type: String,
        pub device_id: String,
        pub channel_id: String,
        pub ssrc: String,
        pub state: String,
        pub reason: Option<String>,
        pub created_at: ChronoDateTime<Utc>,
        pub ended_at: ChronoDateTime<Utc>,
    }

    #[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
    pub enum Relation {}

    impl ActiveModelBehavior for ActiveModel {}
}
