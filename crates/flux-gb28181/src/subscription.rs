// 订阅引擎：目录 / 报警 / 移动位置 / PTZ 位置的 SUBSCRIBE 对话维护

use crate::dispatcher::{reply_code, MessageDispatcher};
use crate::manscdp;
use crate::registry::DeviceRegistry;
use crate::sip::dialog::{Dialog, DialogId, DialogRole, DialogStore};
use crate::sip::endpoint::SipEndpoint;
use crate::sip::message::{SipMethod, SipRequest};
use crate::sip::transport::Destination;
use crate::store::{subscription, Store};
use crate::{Gb28181Error, Result};
use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// 首次失败后的重试间隔
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscribeEvent {
    Catalog,
    Alarm,
    MobilePosition,
    PtzPosition,
}

impl SubscribeEvent {
    pub const ALL: [SubscribeEvent; 4] = [
        SubscribeEvent::Catalog,
        SubscribeEvent::Alarm,
        SubscribeEvent::MobilePosition,
        SubscribeEvent::PtzPosition,
    ];

    /// Event 头与 CmdType 同名
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscribeEvent::Catalog => "Catalog",
            SubscribeEvent::Alarm => "Alarm",
            SubscribeEvent::MobilePosition => "MobilePosition",
            SubscribeEvent::PtzPosition => "PTZPosition",
        }
    }

    pub fn role(&self) -> DialogRole {
        match self {
            SubscribeEvent::Catalog => DialogRole::SubscribeCatalog,
            SubscribeEvent::Alarm => DialogRole::SubscribeAlarm,
            SubscribeEvent::MobilePosition => DialogRole::SubscribePosition,
            SubscribeEvent::PtzPosition => DialogRole::SubscribePtz,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// SUBSCRIBE 的 Expires
    pub expires: u32,
    /// 各事件的全局订阅周期，0 表示不订阅
    pub catalog_interval: u32,
    pub alarm_interval: u32,
    pub position_interval: u32,
    pub ptz_interval: u32,
    /// 移动位置上报间隔（消息体 Interval）
    pub mobile_position_interval: u32,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            expires: 3600,
            catalog_interval: 0,
            alarm_interval: 0,
            position_interval: 0,
            ptz_interval: 0,
            mobile_position_interval: 5,
        }
    }
}

impl SubscriptionConfig {
    pub fn enabled(&self, event: SubscribeEvent) -> bool {
        let interval = match event {
            SubscribeEvent::Catalog => self.catalog_interval,
            SubscribeEvent::Alarm => self.alarm_interval,
            SubscribeEvent::MobilePosition => self.position_interval,
            SubscribeEvent::PtzPosition => self.ptz_interval,
        };
        interval > 0
    }
}

/// 刷新时刻：expires/2 减去不超过 10% 的随机抖动
pub fn refresh_delay(expires: u32) -> Duration {
    let half_ms = u64::from(expires.max(2)) * 500;
    let max_jitter = half_ms / 10;
    let jitter = if max_jitter > 0 {
        rand::thread_rng().gen_range(0..max_jitter)
    } else {
        0
    };
    Duration::from_millis(half_ms - jitter)
}

/// 订阅 / 刷新循环；attempt 返回对端确认的 Expires
pub(crate) async fn refresh_loop<F, Fut>(cancel: CancellationToken, expires: u32, mut attempt: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<u32>>,
{
    let cap = Duration::from_millis(u64::from(expires.max(2)) * 500);
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let wait = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = attempt() => match outcome {
                Ok(granted) => {
                    backoff = INITIAL_BACKOFF;
                    refresh_delay(granted)
                }
                Err(e) => {
                    let wait = backoff.min(cap);
                    tracing::warn!(target: "gb28181::subscription", retry_in = ?wait, "subscribe failed: {}", e);
                    backoff = (backoff * 2).min(cap);
                    wait
                }
            },
        };
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

struct Slot {
    cancel: CancellationToken,
    dialog: Arc<Mutex<Option<DialogId>>>,
}

pub struct SubscriptionEngine {
    config: SubscriptionConfig,
    endpoint: Arc<SipEndpoint>,
    dialogs: Arc<DialogStore>,
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<MessageDispatcher>,
    store: Option<Store>,
    slots: DashMap<(String, SubscribeEvent), Slot>,
    root: CancellationToken,
    sn: AtomicU32,
}

impl SubscriptionEngine {
    pub fn new(
        config: SubscriptionConfig,
        endpoint: Arc<SipEndpoint>,
        dialogs: Arc<DialogStore>,
        registry: Arc<DeviceRegistry>,
        dispatcher: Arc<MessageDispatcher>,
        store: Option<Store>,
        root: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            endpoint,
            dialogs,
            registry,
            dispatcher,
            store,
            slots: DashMap::new(),
            root,
            sn: AtomicU32::new(1),
        })
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.config
    }

    /// 启动时为所有在线设备建立订阅；重启前遗留的订阅对话直接丢弃
    pub async fn start_all(self: &Arc<Self>) -> Result<usize> {
        for stale in self.dialogs.all().into_iter().filter(|d| d.role.is_subscription()) {
            self.dialogs.remove(&stale.id).await?;
        }
        let devices = self.registry.online_devices();
        for device in &devices {
            self.start_device(&device.device_id);
        }
        Ok(devices.len())
    }

    /// 设备上线：按配置（重新）建立订阅
    pub fn start_device(self: &Arc<Self>, device_id: &str) -> usize {
        let mut started = 0;
        for event in SubscribeEvent::ALL {
            if self.config.enabled(event) {
                self.spawn(device_id, event);
                started += 1;
            }
        }
        started
    }

    fn spawn(self: &Arc<Self>, device_id: &str, event: SubscribeEvent) {
        let key = (device_id.to_string(), event);
        let dialog = Arc::new(Mutex::new(None));
        let cancel = self.root.child_token();
        let replaced = self
            .slots
            .insert(
                key,
                Slot {
                    cancel: cancel.clone(),
                    dialog: dialog.clone(),
                },
            )
            .and_then(|old| {
                old.cancel.cancel();
                let id = old.dialog.lock().ok().and_then(|g| g.clone());
                id
            });

        let engine = self.clone();
        let device_id = device_id.to_string();
        tokio::spawn(async move {
            // 被替换的旧订阅对话不再刷新，从对话表删除
            if let Some(id) = replaced {
                if let Err(e) = engine.dialogs.remove(&id).await {
                    tracing::warn!(target: "gb28181::subscription", %device_id, dialog = %id, "drop replaced dialog failed: {}", e);
                }
            }
            tracing::info!(target: "gb28181::subscription", %device_id, event = event.as_str(), "subscription started");
            refresh_loop(cancel, engine.config.expires, || {
                engine.subscribe_once(&device_id, event, &dialog)
            })
            .await;
            tracing::debug!(target: "gb28181::subscription", %device_id, event = event.as_str(), "subscription task stopped");
        });
    }

    /// 新建或在已有对话内刷新
    async fn subscribe_once(
        &self,
        device_id: &str,
        event: SubscribeEvent,
        slot: &Mutex<Option<DialogId>>,
    ) -> Result<u32> {
        let device = self
            .registry
            .get_device(device_id)
            .ok_or_else(|| Gb28181Error::NotFound(format!("device {}", device_id)))?;
        if !device.is_online() {
            return Err(Gb28181Error::State(format!("device {} is offline", device_id)));
        }
        let body = self.body(device_id, event);

        let existing = slot.lock().ok().and_then(|g| g.clone());
        if let Some(id) = existing.filter(|id| self.dialogs.contains(id)) {
            let (mut req, dest) = self
                .dialogs
                .next_request(&id, SipMethod::Subscribe, &self.endpoint.identity())
                .await?;
            self.decorate(&mut req, event, self.config.expires, body.clone());
            match self.endpoint.request_final(req, dest).await {
                Ok(resp) => {
                    let granted = resp.headers.expires().unwrap_or(self.config.expires);
                    self.persist(device_id, event, Some(&id), granted).await?;
                    tracing::debug!(target: "gb28181::subscription", %device_id, event = event.as_str(), granted, "subscription refreshed");
                    return Ok(granted);
                }
                Err(Gb28181Error::Device { code: 481, .. }) => {
                    tracing::info!(target: "gb28181::subscription", %device_id, event = event.as_str(), "subscription dialog gone, re-subscribing");
                    self.dialogs.remove(&id).await?;
                }
                Err(e) => return Err(e),
            }
        }

        let dest = device
            .destination()
            .ok_or_else(|| Gb28181Error::State(format!("device {} has no address", device_id)))?;
        let mut req = self.endpoint.new_request(SipMethod::Subscribe, device_id, dest);
        self.decorate(&mut req, event, self.config.expires, body);
        let resp = self.endpoint.request_final(req.clone(), dest).await?;
        let granted = resp.headers.expires().unwrap_or(self.config.expires);

        let dialog = Dialog::from_uac_response(event.role(), device_id, &req, &resp, dest)?;
        let id = dialog.id.clone();
        self.dialogs.insert(dialog).await?;
        if let Ok(mut guard) = slot.lock() {
            *guard = Some(id.clone());
        }
        self.persist(device_id, event, Some(&id), granted).await?;
        tracing::info!(target: "gb28181::subscription", %device_id, event = event.as_str(), granted, dialog = %id, "subscribed");
        Ok(granted)
    }

    fn body(&self, device_id: &str, event: SubscribeEvent) -> String {
        let sn = self.sn.fetch_add(1, Ordering::Relaxed);
        let interval = (event == SubscribeEvent::MobilePosition).then_some(self.config.mobile_position_interval);
        manscdp::subscribe_query(event.as_str(), sn, device_id, interval)
    }

    fn decorate(&self, req: &mut SipRequest, event: SubscribeEvent, expires: u32, body: String) {
        req.headers.set("Event", event.as_str());
        req.headers.set("Expires", expires.to_string());
        req.set_body(manscdp::CONTENT_TYPE, body);
    }

    async fn persist(&self, device_id: &str, event: SubscribeEvent, id: Option<&DialogId>, granted: u32) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let next = chrono::Duration::from_std(refresh_delay(granted)).ok().map(|d| Utc::now() + d);
        store
            .save_subscription(subscription::Model {
                device_id: device_id.to_string(),
                event: event.as_str().to_string(),
                expires: i64::from(granted),
                call_id: id.map(|i| i.call_id.clone()),
                local_tag: id.map(|i| i.local_tag.clone()),
                remote_tag: id.map(|i| i.remote_tag.clone()),
                next_refresh_at: next,
                updated_at: Utc::now(),
            })
            .await
    }

    /// 设备发来的 NOTIFY；返回应答码
    pub async fn on_notify(self: &Arc<Self>, req: &SipRequest, source: Destination) -> (u16, &'static str) {
        let Some(dialog) = self.dialogs.find_for_request(req).filter(|d| d.role.is_subscription()) else {
            tracing::debug!(target: "gb28181::subscription", call_id = ?req.headers.call_id(), "NOTIFY outside any subscription");
            return (481, "Call/Transaction Does Not Exist");
        };
        if let Some(cseq) = req.headers.cseq() {
            self.dialogs.observe_remote_seq(&dialog.id, cseq.seq);
        }

        let span = tracing::info_span!("gb28181.sip.notify", device_id = %dialog.device_id, remote = %source);
        let reply = async {
            let Some(body) = req.body.as_deref().filter(|b| !b.trim().is_empty()) else {
                return (200, "OK");
            };
            let result = match manscdp::parse(body) {
                Ok(msg) => self.dispatcher.dispatch(&msg, &dialog.device_id, source).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => (200, "OK"),
                Err(e) => {
                    tracing::warn!(target: "gb28181::subscription", device_id = %dialog.device_id, "NOTIFY rejected: {}", e);
                    reply_code(&e)
                }
            }
        }
        .instrument(span)
        .await;

        let terminated = req
            .headers
            .get("Subscription-State")
            .map(|s| s.trim().to_ascii_lowercase().starts_with("terminated"))
            .unwrap_or(false);
        if terminated {
            if let Some(event) = SubscribeEvent::ALL.into_iter().find(|e| e.role() == dialog.role) {
                tracing::info!(target: "gb28181::subscription", device_id = %dialog.device_id, event = event.as_str(), "subscription terminated by device, restarting");
                let _ = self.dialogs.remove(&dialog.id).await;
                self.spawn(&dialog.device_id, event);
            }
        }
        reply
    }

    /// 设备离线：取消刷新任务并丢弃对话
    pub async fn on_device_offline(&self, device_id: &str) -> usize {
        let slots = self.take_slots(device_id);
        for (event, id) in &slots {
            if let Some(id) = id {
                let _ = self.dialogs.remove(id).await;
            }
            if let Some(store) = &self.store {
                let _ = store.delete_subscription(device_id, event.as_str()).await;
            }
        }
        if !slots.is_empty() {
            tracing::info!(target: "gb28181::subscription", %device_id, count = slots.len(), "subscriptions cancelled");
        }
        slots.len()
    }

    /// 主动退订：在已有对话上发送 Expires: 0
    pub async fn unsubscribe(&self, device_id: &str) -> Result<usize> {
        let slots = self.take_slots(device_id);
        let identity = self.endpoint.identity();
        for (event, id) in &slots {
            let Some(id) = id else {
                continue;
            };
            if self.dialogs.contains(id) {
                let (mut req, dest) = self.dialogs.next_request(id, SipMethod::Subscribe, &identity).await?;
                let body = self.body(device_id, *event);
                self.decorate(&mut req, *event, 0, body);
                if let Err(e) = self.endpoint.request_final(req, dest).await {
                    tracing::warn!(target: "gb28181::subscription", %device_id, event = event.as_str(), "unsubscribe failed: {}", e);
                }
                self.dialogs.remove(id).await?;
            }
            if let Some(store) = &self.store {
                store.delete_subscription(device_id, event.as_str()).await?;
            }
        }
        Ok(slots.len())
    }

    fn take_slots(&self, device_id: &str) -> Vec<(SubscribeEvent, Option<DialogId>)> {
        let keys: Vec<_> = self
            .slots
            .iter()
            .filter(|e| e.key().0 == device_id)
            .map(|e| e.key().clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| self.slots.remove(&key))
            .map(|((_, event), slot)| {
                slot.cancel.cancel();
                let id = slot.dialog.lock().ok().and_then(|g| g.clone());
                (event, id)
            })
            .collect()
    }

    /// 当前订阅对话
    pub fn dialog_of(&self, device_id: &str, event: SubscribeEvent) -> Option<DialogId> {
        self.slots
            .get(&(device_id.to_string(), event))
            .and_then(|s| s.dialog.lock().ok().and_then(|g| g.clone()))
    }

    pub fn active(&self) -> usize {
        self.slots.len()
    }
}
