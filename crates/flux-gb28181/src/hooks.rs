// Webhook 推送：订阅事件总线，按 URL 排队 POST
// 每个 URL 一个有界队列，满时丢弃最旧事件；单次尝试，5 秒超时

use crate::events::{DomainEvent, EventBus};
use crate::Result;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct HookConfig {
    pub online: Option<String>,
    pub offline: Option<String>,
    pub position: Option<String>,
    pub on_invite: Option<String>,
    pub alarm: Option<String>,
    pub queue_capacity: usize,
    pub timeout: Option<Duration>,
}

struct HookQueue {
    url: String,
    items: Mutex<VecDeque<Value>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl HookQueue {
    fn push(&self, body: Value) {
        let mut items = match self.items.lock() {
            Ok(items) => items,
            Err(poisoned) => poisoned.into_inner(),
        };
        if items.len() >= self.capacity {
            items.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(target: "gb28181::hooks", url = %self.url, "hook queue full, dropping oldest event");
        }
        items.push_back(body);
        drop(items);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<Value> {
        match self.items.lock() {
            Ok(mut items) => items.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }
}

/// Webhook 分发器
pub struct HookDispatcher {
    queues: HashMap<&'static str, Arc<HookQueue>>,
    client: reqwest::Client,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl HookDispatcher {
    pub fn new(config: HookConfig) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout.unwrap_or(DEFAULT_HOOK_TIMEOUT))
            .build()?;
        let capacity = config.queue_capacity.max(1);

        let mut queues = HashMap::new();
        let routes = [
            ("online", config.online),
            ("offline", config.offline),
            ("position", config.position),
            ("on_invite", config.on_invite),
            ("alarm", config.alarm),
        ];
        for (name, url) in routes {
            if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
                queues.insert(
                    name,
                    Arc::new(HookQueue {
                        url,
                        items: Mutex::new(VecDeque::new()),
                        capacity,
                        notify: Notify::new(),
                        dropped: AtomicU64::new(0),
                    }),
                );
            }
        }

        Ok(Arc::new(Self {
            queues,
            client,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }))
    }

    /// 将事件放入对应 URL 的队列；未配置的事件忽略
    pub fn enqueue(&self, event: &DomainEvent) -> bool {
        let Some(queue) = self.queues.get(event.name()) else {
            return false;
        };
        match serde_json::to_value(event) {
            Ok(body) => {
                queue.push(body);
                true
            }
            Err(e) => {
                tracing::error!(target: "gb28181::hooks", event = event.name(), "serialize hook body failed: {}", e);
                false
            }
        }
    }

    /// 因队列溢出丢弃的事件数
    pub fn dropped(&self) -> u64 {
        self.queues
            .values()
            .map(|q| q.dropped.load(Ordering::Relaxed))
            .sum()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// 启动事件订阅与每个 URL 的投递任务
    pub fn spawn(self: &Arc<Self>, bus: &EventBus, cancel: CancellationToken) {
        if self.queues.is_empty() {
            return;
        }

        let mut rx = bus.subscribe();
        let this = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(event) => {
                            this.enqueue(&event);
                        }
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!(target: "gb28181::hooks", skipped = n, "hook subscriber lagged");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });

        for queue in self.queues.values() {
            let this = self.clone();
            let queue = queue.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                this.deliver_loop(queue, token).await;
            });
        }
    }

    async fn deliver_loop(&self, queue: Arc<HookQueue>, cancel: CancellationToken) {
        loop {
            while let Some(body) = queue.pop() {
                self.post(&queue.url, &body).await;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = queue.notify.notified() => {}
            }
        }
    }

    /// 单次投递，失败只记日志
    async fn post(&self, url: &str, body: &Value) {
        let event = body.get("event").and_then(Value::as_str).unwrap_or("unknown");
        match self.client.post(url).json(body).send().await {
            Ok(resp) if resp.status().is_success() => {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(target: "gb28181::hooks", %url, event, "hook delivered");
            }
            Ok(resp) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(target: "gb28181::hooks", %url, event, status = %resp.status(), "hook rejected");
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(target: "gb28181::hooks", %url, event, "hook delivery failed: {}", e);
            }
        }
    }
}
