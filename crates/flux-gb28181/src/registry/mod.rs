// 设备 / 通道注册表
// 内存 DashMap + 同步持久化；按设备 ID 串行化写操作

mod model;

pub use model::{
    type_code, AlarmFact, CatalogEntry, CatalogEvent, CatalogMerge, Channel, ChannelKind, Device,
    DeviceStatusReport, OnlineStatus, Position, RecentFacts,
};

use crate::events::{DomainEvent, EventBus};
use crate::sip::auth::{AuthOutcome, DigestAuthenticator};
use crate::sip::message::{extract_uri, header_param, SipRequest};
use crate::sip::transport::Destination;
use crate::store::{alarm_log, position_log, Store};
use crate::{Gb28181Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use sea_orm::ActiveValue::Set;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 注册表配置
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub realm: String,
    /// 全局注册密码，None 表示不鉴权
    pub password: Option<String>,
    pub alive_expires: Duration,
    pub default_register_expires: u32,
    /// 需要丢弃的通道类别或类型码
    pub drop_channel_types: Vec<String>,
    pub alarm_history: usize,
    /// 设备默认媒体传输方式（device_id -> setup）
    pub default_media_transport: HashMap<String, String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            realm: "3402000000".to_string(),
            password: None,
            alive_expires: Duration::from_secs(180),
            default_register_expires: 3600,
            drop_channel_types: Vec::new(),
            alarm_history: 32,
            default_media_transport: HashMap::new(),
        }
    }
}

/// REGISTER 处理结果
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    Registered {
        device: Device,
        expires: u32,
        first_online: bool,
    },
    Unregistered {
        device_id: String,
    },
    /// 401，附 WWW-Authenticate
    Challenge(String),
    /// 403
    Reject(String),
}

/// 设备注册表
pub struct DeviceRegistry {
    config: RegistryConfig,
    devices: DashMap<String, Device>,
    channels: DashMap<String, HashMap<String, Channel>>,
    channel_index: DashMap<String, String>,
    facts: DashMap<String, RecentFacts>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    store: Option<Store>,
    events: EventBus,
}

impl DeviceRegistry {
    pub fn new(config: RegistryConfig, store: Option<Store>, events: EventBus) -> Self {
        Self {
            config,
            devices: DashMap::new(),
            channels: DashMap::new(),
            channel_index: DashMap::new(),
            facts: DashMap::new(),
            locks: DashMap::new(),
            store,
            events,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// 启动时从数据库加载设备和通道
    pub async fn load(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let devices = store.load_devices().await?;
        let count = devices.len();
        for model in devices {
            let device = Device::from(model);
            self.devices.insert(device.device_id.clone(), device);
        }
        for model in store.load_channels().await? {
            let channel = Channel::from(model);
            self.channel_index
                .insert(channel.channel_id.clone(), channel.device_id.clone());
            self.channels
                .entry(channel.device_id.clone())
                .or_default()
                .insert(channel.channel_id.clone(), channel);
        }
        tracing::info!(target: "gb28181::registry", devices = count, "registry loaded");
        Ok(count)
    }

    /// 按设备 ID 加锁，串行化同一设备的修改
    async fn lock(&self, device_id: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    async fn persist_device(&self, device: &Device) -> Result<()> {
        if let Some(store) = &self.store {
            store.save_device(device.into()).await?;
        }
        Ok(())
    }

    /// 处理 REGISTER：鉴权、注销或刷新注册
    pub async fn register(
        &self,
        req: &SipRequest,
        source: Destination,
        auth: &DigestAuthenticator,
        now: Instant,
    ) -> Result<RegisterOutcome> {
        let device_id = req
            .from_user()
            .ok_or_else(|| Gb28181Error::Parse("REGISTER without From user".to_string()))?
            .to_string();

        let _guard = self.lock(&device_id).await;

        let password = self
            .devices
            .get(&device_id)
            .and_then(|d| d.password.clone())
            .or_else(|| self.config.password.clone());

        match auth.verify(req, &device_id, password.as_deref(), now) {
            AuthOutcome::Authorized => {}
            AuthOutcome::Challenge(www) => return Ok(RegisterOutcome::Challenge(www)),
            AuthOutcome::Forbidden(reason) => {
                tracing::warn!(target: "gb28181::registry", %device_id, %reason, "REGISTER rejected");
                return Ok(RegisterOutcome::Reject(reason));
            }
        }

        let contact = req.headers.get("Contact").unwrap_or_default().to_string();
        let expires = req
            .headers
            .expires()
            .or_else(|| header_param(&contact, "expires").and_then(|v| v.parse().ok()))
            .unwrap_or(self.config.default_register_expires);

        if expires == 0 {
            let removed = self.devices.remove(&device_id).map(|(_, d)| d);
            self.drop_channels(&device_id);
            if let Some(store) = &self.store {
                store.delete_device(&device_id).await?;
            }
            if let Some(mut device) = removed {
                tracing::info!(target: "gb28181::registry", %device_id, "device unregistered");
                device.status = OnlineStatus::Off;
                self.events.publish(DomainEvent::Offline { device });
            }
            return Ok(RegisterOutcome::Unregistered { device_id });
        }

        let mut device = self
            .devices
            .get(&device_id)
            .map(|d| d.clone())
            .unwrap_or_else(|| Device::new(device_id.clone(), source));
        let was_online = device.is_online();

        let wall = Utc::now();
        device.transport = source.transport;
        device.host = source.addr.ip().to_string();
        device.port = source.addr.port();
        device.contact = extract_uri(&contact).to_string();
        device.realm = self.config.realm.clone();
        device.expires = expires;
        device.status = OnlineStatus::On;
        device.register_time = Some(wall);
        device.keepalive_time = Some(wall);
        self.extend_deadline(&mut device, now);
        if device.media_transport.is_none() {
            device.media_transport = self.config.default_media_transport.get(&device_id).cloned();
        }
        device.updated_at = wall;

        self.persist_device(&device).await?;
        self.devices.insert(device_id.clone(), device.clone());

        let first_online = !was_online;
        if first_online {
            tracing::info!(target: "gb28181::registry", %device_id, remote = %source, "device online");
            self.events.publish(DomainEvent::Online { device: device.clone() });
        }

        Ok(RegisterOutcome::Registered {
            device,
            expires,
            first_online,
        })
    }

    /// 截止时间只前移不后退
    fn extend_deadline(&self, device: &mut Device, now: Instant) {
        let candidate = now + self.config.alive_expires;
        let deadline = match device.keepalive_deadline {
            Some(current) if current > candidate => current,
            _ => candidate,
        };
        device.keepalive_deadline = Some(deadline);
        let remaining = deadline.saturating_duration_since(now);
        device.keepalive_deadline_at = chrono::Duration::from_std(remaining)
            .ok()
            .map(|d| Utc::now() + d);
    }

    /// 心跳：只接受来自注册源地址的心跳
    pub async fn keepalive(&self, device_id: &str, source: Destination, now: Instant) -> Result<Device> {
        let _guard = self.lock(device_id).await;

        let mut device = self
            .devices
            .get(device_id)
            .map(|d| d.clone())
            .ok_or_else(|| Gb28181Error::NotFound(format!("device {}", device_id)))?;

        check_source(&device, source)?;

        let was_online = device.is_online();
        device.status = OnlineStatus::On;
        device.keepalive_time = Some(Utc::now());
        self.extend_deadline(&mut device, now);
        device.updated_at = Utc::now();

        self.persist_device(&device).await?;
        self.devices.insert(device_id.to_string(), device.clone());

        if !was_online {
            tracing::info!(target: "gb28181::registry", %device_id, "device back online by keepalive");
            self.events.publish(DomainEvent::Online { device: device.clone() });
        }
        Ok(device)
    }

    fn should_drop(&self, channel: &Channel) -> bool {
        self.config.drop_channel_types.iter().any(|t| {
            t.eq_ignore_ascii_case(channel.kind.as_str())
                || type_code(&channel.channel_id) == Some(t.as_str())
        })
    }

    /// 合并一页目录
    pub async fn apply_catalog(&self, device_id: &str, entries: Vec<CatalogEntry>) -> Result<CatalogMerge> {
        let _guard = self.lock(device_id).await;

        if !self.devices.contains_key(device_id) {
            return Err(Gb28181Error::NotFound(format!("device {}", device_id)));
        }

        let mut merge = CatalogMerge::default();
        let mut upserts = Vec::new();
        let mut deletes = Vec::new();

        {
            let mut table = self.channels.entry(device_id.to_string()).or_default();
            for entry in entries {
                let mut channel = entry.channel;
                channel.device_id = device_id.to_string();
                let id = channel.channel_id.clone();

                let remove = matches!(entry.event, Some(CatalogEvent::Del)) || self.should_drop(&channel);
                if remove {
                    if self.should_drop(&channel) {
                        merge.dropped += 1;
                    }
                    if table.remove(&id).is_some() {
                        merge.removed += 1;
                        deletes.push(id);
                    }
                    continue;
                }

                match entry.event {
                    Some(CatalogEvent::On) => channel.status = OnlineStatus::On,
                    Some(CatalogEvent::Off) | Some(CatalogEvent::Vlost) | Some(CatalogEvent::Defect) => {
                        channel.status = OnlineStatus::Off
                    }
                    _ => {}
                }

                // 只有状态变化的事件：保留已有属性
                let status_only = matches!(
                    entry.event,
                    Some(CatalogEvent::On | CatalogEvent::Off | CatalogEvent::Vlost | CatalogEvent::Defect)
                );
                let merged = match table.get(&id) {
                    Some(existing) if status_only => {
                        let mut c = existing.clone();
                        c.status = channel.status;
                        c.updated_at = Utc::now();
                        c
                    }
                    _ => channel,
                };

                if table.insert(id.clone(), merged.clone()).is_some() {
                    merge.updated += 1;
                } else {
                    merge.added += 1;
                }
                upserts.push(merged);
            }
        }

        for id in &deletes {
            self.channel_index.remove(id);
        }
        for channel in &upserts {
            self.channel_index
                .insert(channel.channel_id.clone(), device_id.to_string());
        }

        if let Some(store) = &self.store {
            for id in &deletes {
                store.delete_channel(device_id, id).await?;
            }
            for channel in &upserts {
                store.save_channel(channel.into()).await?;
            }
        }

        let size = self.channels.get(device_id).map(|t| t.len()).unwrap_or(0);
        {
            let mut facts = self.facts.entry(device_id.to_string()).or_default();
            facts.catalog_at = Some(Utc::now());
            facts.catalog_size = size;
        }

        tracing::debug!(target: "gb28181::registry", %device_id, ?merge, "catalog merged");
        self.events.publish(DomainEvent::CatalogChanged {
            device_id: device_id.to_string(),
            channels: size,
        });
        Ok(merge)
    }

    /// DeviceInfo 应答：更新元数据
    pub async fn update_info(
        &self,
        device_id: &str,
        name: Option<String>,
        manufacturer: Option<String>,
        model: Option<String>,
        firmware: Option<String>,
    ) -> Result<Device> {
        let _guard = self.lock(device_id).await;
        let mut device = self
            .devices
            .get(device_id)
            .map(|d| d.clone())
            .ok_or_else(|| Gb28181Error::NotFound(format!("device {}", device_id)))?;

        if let Some(v) = name.filter(|v| !v.is_empty()) {
            device.name = v;
        }
        if let Some(v) = manufacturer {
            device.manufacturer = v;
        }
        if let Some(v) = model {
            device.model = v;
        }
        if let Some(v) = firmware {
            device.firmware = v;
        }
        device.updated_at = Utc::now();

        self.persist_device(&device).await?;
        self.devices.insert(device_id.to_string(), device.clone());
        Ok(device)
    }

    /// DeviceStatus 应答
    pub async fn update_status(&self, device_id: &str, report: DeviceStatusReport) -> Result<()> {
        let _guard = self.lock(device_id).await;
        let mut device = self
            .devices
            .get_mut(device_id)
            .ok_or_else(|| Gb28181Error::NotFound(format!("device {}", device_id)))?;
        device.status_report = Some(DeviceStatusReport {
            reported_at: Some(Utc::now()),
            ..report
        });
        Ok(())
    }

    /// 记录位置并更新通道坐标
    pub async fn record_position(&self, device_id: &str, position: Position) -> Result<()> {
        let _guard = self.lock(device_id).await;
        if !self.devices.contains_key(device_id) {
            return Err(Gb28181Error::NotFound(format!("device {}", device_id)));
        }

        if let Some(mut table) = self.channels.get_mut(device_id) {
            if let Some(ch) = table.get_mut(&position.channel_id) {
                ch.longitude = Some(position.longitude);
                ch.latitude = Some(position.latitude);
            }
        }

        if let Some(store) = &self.store {
            store
                .append_position(position_log::ActiveModel {
                    device_id: Set(device_id.to_string()),
                    channel_id: Set(position.channel_id.clone()),
                    longitude: Set(position.longitude),
                    latitude: Set(position.latitude),
                    speed: Set(position.speed),
                    direction: Set(position.direction),
                    altitude: Set(position.altitude),
                    report_time: Set(position.time.clone()),
                    created_at: Set(position.received_at),
                    ..Default::default()
                })
                .await?;
        }

        self.facts.entry(device_id.to_string()).or_default().last_position = Some(position.clone());
        self.events.publish(DomainEvent::Position {
            device_id: device_id.to_string(),
            position,
        });
        Ok(())
    }

    /// 追加报警
    pub async fn record_alarm(&self, device_id: &str, alarm: AlarmFact) -> Result<()> {
        let _guard = self.lock(device_id).await;
        if !self.devices.contains_key(device_id) {
            return Err(Gb28181Error::NotFound(format!("device {}", device_id)));
        }

        if let Some(store) = &self.store {
            store
                .append_alarm(alarm_log::ActiveModel {
                    device_id: Set(device_id.to_string()),
                    channel_id: Set(alarm.channel_id.clone()),
                    priority: Set(alarm.priority.clone()),
                    method: Set(alarm.method.clone()),
                    alarm_type: Set(alarm.alarm_type.clone()),
                    description: Set(alarm.description.clone()),
                    longitude: Set(alarm.longitude),
                    latitude: Set(alarm.latitude),
                    alarm_time: Set(alarm.time.clone()),
                    created_at: Set(alarm.received_at),
                    ..Default::default()
                })
                .await?;
        }

        self.facts
            .entry(device_id.to_string())
            .or_default()
            .push_alarm(alarm.clone(), self.config.alarm_history);
        self.events.publish(DomainEvent::Alarm {
            device_id: device_id.to_string(),
            alarm,
        });
        Ok(())
    }

    /// 运维删除设备
    pub async fn remove_device(&self, device_id: &str) -> Result<Device> {
        let _guard = self.lock(device_id).await;
        let (_, mut device) = self
            .devices
            .remove(device_id)
            .ok_or_else(|| Gb28181Error::NotFound(format!("device {}", device_id)))?;
        self.drop_channels(device_id);
        self.facts.remove(device_id);
        if let Some(store) = &self.store {
            store.delete_device(device_id).await?;
        }
        if device.is_online() {
            device.status = OnlineStatus::Off;
            self.events.publish(DomainEvent::Offline { device: device.clone() });
        }
        Ok(device)
    }

    fn drop_channels(&self, device_id: &str) {
        if let Some((_, table)) = self.channels.remove(device_id) {
            for id in table.keys() {
                self.channel_index
                    .remove_if(id, |_, owner| owner == device_id);
            }
        }
    }

    /// 将心跳超时的设备置为离线
    pub async fn reap_expired(&self, now: Instant) -> Vec<Device> {
        let expired: Vec<String> = self
            .devices
            .iter()
            .filter(|d| d.is_online() && d.keepalive_deadline.map(|t| t <= now).unwrap_or(true))
            .map(|d| d.device_id.clone())
            .collect();

        let mut reaped = Vec::new();
        for device_id in expired {
            let _guard = self.lock(&device_id).await;
            let Some(mut device) = self.devices.get(&device_id).map(|d| d.clone()) else {
                continue;
            };
            // 加锁后复查，心跳可能刚刚到达
            if !device.is_online() || device.keepalive_deadline.map(|t| t > now).unwrap_or(false) {
                continue;
            }
            device.status = OnlineStatus::Off;
            device.keepalive_deadline = None;
            device.updated_at = Utc::now();
            if let Err(e) = self.persist_device(&device).await {
                tracing::error!(target: "gb28181::registry", %device_id, "persist offline state failed: {}", e);
            }
            self.devices.insert(device_id.clone(), device.clone());

            tracing::info!(target: "gb28181::registry", %device_id, "keepalive expired, device offline");
            self.events.publish(DomainEvent::Offline { device: device.clone() });
            reaped.push(device);
        }
        reaped
    }

    /// 每秒扫描一次心跳截止时间
    pub fn spawn_reaper(self: &Arc<Self>, cancel: CancellationToken) {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        registry.reap_expired(Instant::now()).await;
                    }
                }
            }
        });
    }

    // ---- 查询（快照读） ----

    /// 设备上报必须来自注册时的地址：未注册 NotFound，地址不符 Auth
    pub fn verify_source(&self, device_id: &str, source: Destination) -> Result<Device> {
        let device = self
            .get_device(device_id)
            .ok_or_else(|| Gb28181Error::NotFound(format!("device {}", device_id)))?;
        check_source(&device, source)?;
        Ok(device)
    }

    pub fn get_device(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    pub fn list_devices(&self) -> Vec<Device> {
        let mut list: Vec<Device> = self.devices.iter().map(|d| d.clone()).collect();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        list
    }

    pub fn online_devices(&self) -> Vec<Device> {
        self.devices
            .iter()
            .filter(|d| d.is_online())
            .map(|d| d.clone())
            .collect()
    }

    /// 设备通道列表，状态已考虑设备在线情况
    pub fn channels(&self, device_id: &str) -> Vec<Channel> {
        let online = self
            .devices
            .get(device_id)
            .map(|d| d.is_online())
            .unwrap_or(false);
        let mut list: Vec<Channel> = self
            .channels
            .get(device_id)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        for ch in &mut list {
            ch.status = ch.effective_status(online);
        }
        list.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        list
    }

    pub fn get_channel(&self, device_id: &str, channel_id: &str) -> Option<Channel> {
        let online = self.devices.get(device_id)?.is_online();
        let mut ch = self.channels.get(device_id)?.get(channel_id)?.clone();
        ch.status = ch.effective_status(online);
        Some(ch)
    }

    /// 只按通道 ID 查找
    pub fn find_channel(&self, channel_id: &str) -> Option<Channel> {
        let device_id = self.channel_index.get(channel_id)?.clone();
        self.get_channel(&device_id, channel_id)
    }

    pub fn recent_facts(&self, device_id: &str) -> Option<RecentFacts> {
        self.facts.get(device_id).map(|f| f.clone())
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}

fn check_source(device: &Device, source: Destination) -> Result<()> {
    if device.host != source.addr.ip().to_string() {
        return Err(Gb28181Error::Auth(format!(
            "message for {} from unexpected source {}",
            device.device_id, source
        )));
    }
    Ok(())
}
