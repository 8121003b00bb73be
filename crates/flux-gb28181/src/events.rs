// 领域事件总线：注册表 / 订阅 / 会话状态变化的广播

use crate::registry::{AlarmFact, Device, Position};
use crate::session::SessionSnapshot;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    Online { device: Device },
    Offline { device: Device },
    Position { device_id: String, position: Position },
    Alarm { device_id: String, alarm: AlarmFact },
    CatalogChanged { device_id: String, channels: usize },
    Invite { session: SessionSnapshot },
    SessionEnded { session: SessionSnapshot },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::Online { .. } => "online",
            DomainEvent::Offline { .. } => "offline",
            DomainEvent::Position { .. } => "position",
            DomainEvent::Alarm { .. } => "alarm",
            DomainEvent::CatalogChanged { .. } => "catalog_changed",
            DomainEvent::Invite { .. } => "on_invite",
            DomainEvent::SessionEnded { .. } => "session_ended",
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.sender.subscribe()
    }

    /// 发布事件；没有订阅者时静默丢弃
    pub fn publish(&self, event: DomainEvent) -> usize {
        tracing::debug!(target: "gb28181::events", event = event.name(), "publish");
        self.sender.send(event).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
