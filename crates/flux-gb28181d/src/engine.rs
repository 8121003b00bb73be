// 按配置装配信令引擎的各个组件

use anyhow::{anyhow, Context};
use flux_config::Gb28181Config;
use flux_gb28181::cascade::CascadeClient;
use flux_gb28181::config as cfg;
use flux_gb28181::dispatcher::MessageDispatcher;
use flux_gb28181::hooks::HookDispatcher;
use flux_gb28181::media::{HttpMediaServer, MediaServer};
use flux_gb28181::registry::DeviceRegistry;
use flux_gb28181::sip::dialog::DialogStore;
use flux_gb28181::sip::endpoint::detect_local_ip;
use flux_gb28181::sip::transaction::{Timers, TransactionLayer};
use flux_gb28181::sip::{LocalIdentity, SipEndpoint, SipTransport};
use flux_gb28181::store::Store;
use flux_gb28181::subscription::SubscriptionEngine;
use flux_gb28181::{EventBus, SessionManager, SipServer};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const EVENT_BUS_CAPACITY: usize = 1024;
const MEDIA_RPC_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Engine {
    pub registry: Arc<DeviceRegistry>,
    pub dialogs: Arc<DialogStore>,
    pub endpoint: Arc<SipEndpoint>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<MessageDispatcher>,
    pub subscriptions: Arc<SubscriptionEngine>,
    pub cascade: Option<Arc<CascadeClient>>,
}

impl Engine {
    /// 建立持久化、传输层和各组件并启动后台任务
    pub async fn start(config: &Gb28181Config, cancel: CancellationToken) -> anyhow::Result<Self> {
        let store = Store::connect(&config.database.url)
            .await
            .with_context(|| format!("failed to open database {}", config.database.url))?;
        let events = EventBus::new(EVENT_BUS_CAPACITY);

        // 先订阅事件总线，避免遗漏启动阶段的事件
        let hooks = HookDispatcher::new(cfg::hook_config(config))?;
        hooks.spawn(&events, cancel.clone());

        let registry = Arc::new(DeviceRegistry::new(
            cfg::registry_config(config),
            Some(store.clone()),
            events.clone(),
        ));
        let devices = registry.load().await?;

        let dialogs = Arc::new(DialogStore::new(Some(store.clone())));
        let restored = dialogs.load().await?;
        tracing::info!(target: "gb28181d", devices, dialogs = restored, "state restored");

        let sip = &config.sip;
        let bind_ip: IpAddr = sip
            .listen_ip
            .parse()
            .map_err(|e| anyhow!("invalid sip.listen_ip {}: {}", sip.listen_ip, e))?;
        let (transport, inbound) =
            SipTransport::bind(SocketAddr::new(bind_ip, sip.port), sip.transport_queue).await?;
        let local = transport.local_addr();

        let (host, advertise_fixed) = advertise_host(&sip.public_ip, bind_ip);
        let identity = LocalIdentity {
            id: sip.id.clone(),
            realm: sip.realm.clone(),
            host: host.clone(),
            port: local.port(),
        };
        let transactions = TransactionLayer::new(transport, Timers::default());
        let endpoint = SipEndpoint::new(transactions, identity, bind_ip, advertise_fixed);

        let media_ip = if sip.media_ip.trim().is_empty() {
            host
        } else {
            sip.media_ip.clone()
        };
        let media: Arc<dyn MediaServer> = Arc::new(HttpMediaServer::new(
            sip.media_server.clone(),
            media_ip,
            MEDIA_RPC_TIMEOUT,
        )?);

        let sessions = SessionManager::new(
            cfg::session_config(config),
            endpoint.clone(),
            dialogs.clone(),
            registry.clone(),
            media,
            events.clone(),
            Some(store.clone()),
        );
        let dispatcher = MessageDispatcher::new(registry.clone(), sessions.clone(), endpoint.clone());
        let subscriptions = SubscriptionEngine::new(
            cfg::subscription_config(config),
            endpoint.clone(),
            dialogs.clone(),
            registry.clone(),
            dispatcher.clone(),
            Some(store.clone()),
            cancel.clone(),
        );
        let cascade = cfg::cascade_config(config).map(|c| {
            CascadeClient::new(c, endpoint.clone(), registry.clone(), sessions.clone())
        });

        let server = SipServer::new(
            endpoint.clone(),
            registry.clone(),
            dialogs.clone(),
            sessions.clone(),
            dispatcher.clone(),
            subscriptions.clone(),
            cascade.clone(),
            events.clone(),
        );
        server.start(inbound, cfg::worker_config(config), cancel.clone());

        let reclaimed = sessions.reclaim_orphan_dialogs().await;
        if reclaimed > 0 {
            tracing::info!(target: "gb28181d", reclaimed, "orphan media dialogs released");
        }

        registry.spawn_reaper(cancel.clone());
        sessions.spawn_sweeper(cancel.clone());
        store.spawn_retention_sweeper(cfg::retention(config), cancel.clone());

        match subscriptions.start_all().await {
            Ok(n) if n > 0 => tracing::info!(target: "gb28181d", subscriptions = n, "subscriptions started"),
            Ok(_) => {}
            Err(e) => tracing::warn!(target: "gb28181d", error = %e, "failed to start subscriptions"),
        }

        if let Some(cascade) = &cascade {
            cascade.spawn(cancel.clone());
        }

        tracing::info!(
            target: "gb28181d",
            id = %sip.id,
            %local,
            advertised = %endpoint.identity().host,
            "GB28181 engine started"
        );

        Ok(Self {
            registry,
            dialogs,
            endpoint,
            sessions,
            dispatcher,
            subscriptions,
            cascade,
        })
    }
}

/// 对外通告地址：public_ip 优先，其次监听地址，监听 0.0.0.0 时探测出口地址
fn advertise_host(public_ip: &str, bind_ip: IpAddr) -> (String, bool) {
    let public_ip = public_ip.trim();
    if !public_ip.is_empty() {
        return (public_ip.to_string(), true);
    }
    if !bind_ip.is_unspecified() {
        return (bind_ip.to_string(), false);
    }
    let ip = detect_local_ip().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
    (ip.to_string(), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertise_host() {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        assert_eq!(advertise_host("203.0.113.7", any), ("203.0.113.7".to_string(), true));

        let lo = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(advertise_host("", lo), ("127.0.0.1".to_string(), false));

        let (host, fixed) = advertise_host(" ", any);
        assert!(!fixed);
        assert!(host.parse::<IpAddr>().is_ok());
    }
}
