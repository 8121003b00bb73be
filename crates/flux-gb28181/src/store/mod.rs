// 关系型持久化：设备、通道、对话、订阅、位置/报警/会话日志

pub mod entity;

pub use entity::{alarm_log, channel, device, dialog, position_log, session_log, subscription};

use crate::Result;
use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectOptions, ConnectionTrait, Database, DatabaseConnection,
    EntityTrait, IntoActiveModel, QueryFilter, QueryOrder, QuerySelect, Statement,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS device (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        manufacturer TEXT NOT NULL,
        model TEXT NOT NULL,
        firmware TEXT NOT NULL,
        charset TEXT NOT NULL,
        transport TEXT NOT NULL,
        host TEXT NOT NULL,
        port INTEGER NOT NULL,
        status TEXT NOT NULL DEFAULT 'OFF',
        contact TEXT NOT NULL,
        realm TEXT NOT NULL,
        password TEXT,
        media_transport TEXT,
        expires INTEGER NOT NULL,
        register_time TEXT,
        keepalive_time TEXT,
        keepalive_deadline TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS channel (
        device_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        status TEXT NOT NULL,
        manufacturer TEXT NOT NULL,
        model TEXT NOT NULL,
        owner TEXT NOT NULL,
        civil_code TEXT NOT NULL,
        address TEXT NOT NULL,
        parent_id TEXT NOT NULL,
        business_group_id TEXT NOT NULL,
        parental INTEGER NOT NULL,
        longitude REAL,
        latitude REAL,
        ptz_type INTEGER,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (device_id, channel_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS dialog (
        call_id TEXT NOT NULL,
        local_tag TEXT NOT NULL,
        remote_tag TEXT NOT NULL,
        role TEXT NOT NULL,
        device_id TEXT NOT NULL,
        is_uac INTEGER NOT NULL,
        local_seq INTEGER NOT NULL,
        remote_seq INTEGER NOT NULL,
        remote_target TEXT NOT NULL,
        route_set TEXT NOT NULL,
        invite_raw TEXT NOT NULL,
        ack_raw TEXT,
        early INTEGER NOT NULL DEFAULT 0,
        transport TEXT NOT NULL,
        remote_addr TEXT NOT NULL,
        created_at TEXT NOT NULL,
        PRIMARY KEY (call_id, local_tag, remote_tag)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS subscription (
        device_id TEXT NOT NULL,
        event TEXT NOT NULL,
        expires INTEGER NOT NULL,
        call_id TEXT,
        local_tag TEXT,
        remote_tag TEXT,
        next_refresh_at TEXT,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (device_id, event)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS position_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        longitude REAL NOT NULL,
        latitude REAL NOT NULL,
        speed REAL,
        direction REAL,
        altitude REAL,
        report_time TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS alarm_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        device_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        priority TEXT NOT NULL,
        method TEXT NOT NULL,
        alarm_type TEXT,
        description TEXT NOT NULL,
        longitude REAL,
        latitude REAL,
        alarm_time TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS session_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        stream_id TEXT NOT NULL,
        invite_type TEXT NOT NULL,
        device_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        ssrc TEXT NOT NULL,
        state TEXT NOT NULL,
        reason TEXT,
        created_at TEXT NOT NULL,
        ended_at TEXT NOT NULL
    )
    "#,
];

/// 保留天数
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub position_days: u32,
    pub alarm_days: u32,
    pub log_days: u32,
}

/// 数据库句柄
#[derive(Clone)]
pub struct Store {
    db: DatabaseConnection,
}

impl Store {
    /// 连接数据库并建表
    pub async fn connect(url: &str) -> Result<Self> {
        let mut options = ConnectOptions::new(url.to_string());
        options.sqlx_logging(false);
        if url.contains(":memory:") {
            // 内存库每个连接各自独立，只能保留一个长期连接
            options
                .max_connections(1)
                .min_connections(1)
                .max_lifetime(Duration::from_secs(u32::MAX as u64));
        }
        let db = Database::connect(options).await?;
        let store = Self { db };
        store.init_schema().await?;
        tracing::info!(target: "gb28181::store", %url, "database ready");
        Ok(store)
    }

    /// 内存库，测试与无持久化部署使用
    pub async fn memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn init_schema(&self) -> Result<()> {
        for sql in SCHEMA {
            self.db
                .execute(Statement::from_string(
                    self.db.get_database_backend(),
                    sql.to_string(),
                ))
                .await?;
        }
        Ok(())
    }

    // ---- device ----

    pub async fn save_device(&self, model: device::Model) -> Result<()> {
        device::Entity::insert(model.into_active_model())
            .on_conflict(
                OnConflict::column(device::Column::Id)
                    .update_columns([
                        device::Column::Name,
                        device::Column::Manufacturer,
                        device::Column::Model,
                        device::Column::Firmware,
                        device::Column::Charset,
                        device::Column::Transport,
                        device::Column::Host,
                        device::Column::Port,
                        device::Column::Status,
                        device::Column::Contact,
                        device::Column::Realm,
                        device::Column::Password,
                        device::Column::MediaTransport,
                        device::Column::Expires,
                        device::Column::RegisterTime,
                        device::Column::KeepaliveTime,
                        device::Column::KeepaliveDeadline,
                        device::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete_device(&self, device_id: &str) -> Result<()> {
        device::Entity::delete_by_id(device_id.to_string())
            .exec(&self.db)
            .await?;
        channel::Entity::delete_many()
            .filter(channel::Column::DeviceId.eq(device_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn load_devices(&self) -> Result<Vec<device::Model>> {
        Ok(device::Entity::find().all(&self.db).await?)
    }

    // ---- channel ----

    pub async fn save_channel(&self, model: channel::Model) -> Result<()> {
        channel::Entity::insert(model.into_active_model())
            .on_conflict(
                OnConflict::columns([channel::Column::DeviceId, channel::Column::ChannelId])
                    .update_columns([
                        channel::Column::Name,
                        channel::Column::Kind,
                        channel::Column::Status,
                        channel::Column::Manufacturer,
                        channel::Column::Model,
                        channel::Column::Owner,
                        channel::Column::CivilCode,
                        channel::Column::Address,
                        channel::Column::ParentId,
                        channel::Column::BusinessGroupId,
                        channel::Column::Parental,
                        channel::Column::Longitude,
                        channel::Column::Latitude,
                        channel::Column::PtzType,
                        channel::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete_channel(&self, device_id: &str, channel_id: &str) -> Result<()> {
        channel::Entity::delete_by_id((device_id.to_string(), channel_id.to_string()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn load_channels(&self) -> Result<Vec<channel::Model>> {
        Ok(channel::Entity::find().all(&self.db).await?)
    }

    // ---- dialog ----

    pub async fn save_dialog(&self, model: dialog::Model) -> Result<()> {
        dialog::Entity::insert(model.into_active_model())
            .on_conflict(
                OnConflict::columns([
                    dialog::Column::CallId,
                    dialog::Column::LocalTag,
                    dialog::Column::RemoteTag,
                ])
                .update_columns([
                    dialog::Column::LocalSeq,
                    dialog::Column::RemoteSeq,
                    dialog::Column::RemoteTarget,
                    dialog::Column::RouteSet,
                    dialog::Column::InviteRaw,
                    dialog::Column::AckRaw,
                    dialog::Column::Early,
                ])
                .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete_dialog(&self, call_id: &str, local_tag: &str, remote_tag: &str) -> Result<()> {
        dialog::Entity::delete_by_id((
            call_id.to_string(),
            local_tag.to_string(),
            remote_tag.to_string(),
        ))
        .exec(&self.db)
        .await?;
        Ok(())
    }

    pub async fn load_dialogs(&self) -> Result<Vec<dialog::Model>> {
        Ok(dialog::Entity::find().all(&self.db).await?)
    }

    // ---- subscription ----

    pub async fn save_subscription(&self, model: subscription::Model) -> Result<()> {
        subscription::Entity::insert(model.into_active_model())
            .on_conflict(
                OnConflict::columns([subscription::Column::DeviceId, subscription::Column::Event])
                    .update_columns([
                        subscription::Column::Expires,
                        subscription::Column::CallId,
                        subscription::Column::LocalTag,
                        subscription::Column::RemoteTag,
                        subscription::Column::NextRefreshAt,
                        subscription::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;
        Ok(())
    }

    pub async fn delete_subscription(&self, device_id: &str, event: &str) -> Result<()> {
        subscription::Entity::delete_by_id((device_id.to_string(), event.to_string()))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    pub async fn load_subscriptions(&self) -> Result<Vec<subscription::Model>> {
        Ok(subscription::Entity::find().all(&self.db).await?)
    }

    // ---- 日志 ----

    pub async fn append_position(&self, mut model: position_log::ActiveModel) -> Result<()> {
        model.id = sea_orm::ActiveValue::NotSet;
        model.insert(&self.db).await?;
        Ok(())
    }

    pub async fn append_alarm(&self, mut model: alarm_log::ActiveModel) -> Result<()> {
        model.id = sea_orm::ActiveValue::NotSet;
        model.insert(&self.db).await?;
        Ok(())
    }

    pub async fn append_session_log(&self, mut model: session_log::ActiveModel) -> Result<()> {
        model.id = sea_orm::ActiveValue::NotSet;
        model.insert(&self.db).await?;
        Ok(())
    }

    pub async fn recent_positions(&self, device_id: &str, limit: u64) -> Result<Vec<position_log::Model>> {
        Ok(position_log::Entity::find()
            .filter(position_log::Column::DeviceId.eq(device_id))
            .order_by_desc(position_log::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn recent_alarms(&self, device_id: &str, limit: u64) -> Result<Vec<alarm_log::Model>> {
        Ok(alarm_log::Entity::find()
            .filter(alarm_log::Column::DeviceId.eq(device_id))
            .order_by_desc(alarm_log::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    pub async fn session_logs(&self, limit: u64) -> Result<Vec<session_log::Model>> {
        Ok(session_log::Entity::find()
            .order_by_desc(session_log::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    /// 按保留天数清理日志表，返回删除行数
    pub async fn sweep_retention(&self, retention: Retention) -> Result<u64> {
        let now = Utc::now();
        let position_cutoff = now - ChronoDuration::days(retention.position_days as i64);
        let alarm_cutoff = now - ChronoDuration::days(retention.alarm_days as i64);
        let log_cutoff = now - ChronoDuration::days(retention.log_days as i64);

        let positions = position_log::Entity::delete_many()
            .filter(position_log::Column::CreatedAt.lt(position_cutoff))
            .exec(&self.db)
            .await?
            .rows_affected;
        let alarms = alarm_log::Entity::delete_many()
            .filter(alarm_log::Column::CreatedAt.lt(alarm_cutoff))
            .exec(&self.db)
            .await?
            .rows_affected;
        let sessions = session_log::Entity::delete_many()
            .filter(session_log::Column::EndedAt.lt(log_cutoff))
            .exec(&self.db)
            .await?
            .rows_affected;

        Ok(positions + alarms + sessions)
    }

    /// 每日清理任务
    pub fn spawn_retention_sweeper(&self, retention: Retention, cancel: CancellationToken) {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 3600));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match store.sweep_retention(retention).await {
                            Ok(removed) => tracing::info!(target: "gb28181::store", removed, "retention sweep finished"),
                            Err(e) => tracing::error!(target: "gb28181::store", "retention sweep failed: {}", e),
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::ActiveValue::Set;

    #[tokio::test]
    async fn test_channel_upsert_keeps_single_row() {
        let store = Store::memory().await.unwrap();
        let mut model = channel::Model {
            device_id: "34020000001320000001".to_string(),
            channel_id: "34020000001310000001".to_string(),
            name: "cam".to_string(),
            kind: "camera".to_string(),
            status: "ON".to_string(),
            manufacturer: String::new(),
            model: String::new(),
            owner: String::new(),
            civil_code: String::new(),
            address: String::new(),
            parent_id: String::new(),
            business_group_id: String::new(),
            parental: false,
            longitude: None,
            latitude: None,
            ptz_type: None,
            updated_at: Utc::now(),
        };
        store.save_channel(model.clone()).await.unwrap();
        model.status = "OFF".to_string();
        store.save_channel(model).await.unwrap();

        let rows = store.load_channels().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, "OFF");
    }

    #[tokio::test]
    async fn test_retention_sweep() {
        let store = Store::memory().await.unwrap();
        let old = Utc::now() - ChronoDuration::days(10);
        for created_at in [old, Utc::now()] {
            store
                .append_alarm(alarm_log::ActiveModel {
                    device_id: Set("34020000001320000001".to_string()),
                    channel_id: Set("34020000001340000001".to_string()),
                    priority: Set("1".to_string()),
                    method: Set("2".to_string()),
                    alarm_type: Set(None),
                    description: Set("motion".to_string()),
                    longitude: Set(None),
                    latitude: Set(None),
                    alarm_time: Set("2024-01-01T00:00:00".to_string()),
                    created_at: Set(created_at),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        let removed = store
            .sweep_retention(Retention { position_days: 7, alarm_days: 7, log_days: 7 })
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.recent_alarms("34020000001320000001", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_file_database_survives_reconnect() {
        use crate::registry::Device;
        use crate::sip::transport::Destination;

        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("gb28181.db").display());

        let store = Store::connect(&url).await.unwrap();
        let device = Device::new("34020000001320000001", Destination::udp("127.0.0.1:5070".parse().unwrap()));
        store.save_device(device::Model::from(&device)).await.unwrap();
        drop(store);

        let reopened = Store::connect(&url).await.unwrap();
        let rows = reopened.load_devices().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "34020000001320000001");
    }
}
