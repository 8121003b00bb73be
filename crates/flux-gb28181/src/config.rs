// 配置文件 → 各组件配置

use crate::cascade::CascadeConfig;
use crate::hooks::{HookConfig, DEFAULT_HOOK_TIMEOUT};
use crate::registry::RegistryConfig;
use crate::sdp::SetupType;
use crate::server::WorkerConfig;
use crate::session::SessionConfig;
use crate::sip::transport::TransportKind;
use crate::store::Retention;
use crate::subscription::SubscriptionConfig;
use flux_config::Gb28181Config;
use std::time::Duration;

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

pub fn registry_config(config: &Gb28181Config) -> RegistryConfig {
    let sip = &config.sip;
    RegistryConfig {
        realm: sip.realm.clone(),
        password: non_empty(&sip.password),
        alive_expires: Duration::from_secs(sip.alive_expires),
        drop_channel_types: sip.global_drop_channel_type.clone(),
        alarm_history: sip.alarm_history,
        default_media_transport: sip.device_default_media_transport.clone(),
        ..Default::default()
    }
}

pub fn session_config(config: &Gb28181Config) -> SessionConfig {
    let sip = &config.sip;
    SessionConfig {
        invite_timeout: Duration::from_secs(sip.invite_timeout),
        default_setup: SetupType::parse(&sip.default_setup_type).unwrap_or(SetupType::TcpPassive),
        prefer_stream_fmt: non_empty(&sip.prefer_stream_fmt),
        media_check_interval: Duration::from_secs(sip.media_check_interval),
        cancel_grace: Duration::from_millis(sip.cancel_grace_ms),
        ..Default::default()
    }
}

pub fn subscription_config(config: &Gb28181Config) -> SubscriptionConfig {
    let sip = &config.sip;
    SubscriptionConfig {
        expires: sip.subscribe_expires,
        catalog_interval: sip.sub_catalog_global_interval,
        alarm_interval: sip.sub_alarm_global_interval,
        position_interval: sip.sub_position_global_interval,
        ptz_interval: sip.sub_ptz_global_interval,
        mobile_position_interval: sip.mobile_position_interval,
    }
}

/// 未启用级联时返回 None
pub fn cascade_config(config: &Gb28181Config) -> Option<CascadeConfig> {
    let c = &config.cascade;
    if !c.enable {
        return None;
    }
    Some(CascadeConfig {
        server_id: c.server_id.clone(),
        server_realm: c.server_realm.clone(),
        server_host: c.server_host.clone(),
        server_port: c.server_port,
        transport: TransportKind::from_str(&c.transport).unwrap_or(TransportKind::Udp),
        local_id: c.local_id.clone(),
        password: non_empty(&c.password),
        register_expires: c.register_expires,
        keepalive_interval: Duration::from_secs(c.keepalive_interval.max(1)),
        catalog_page_size: config.sip.catalog_page_size,
    })
}

pub fn hook_config(config: &Gb28181Config) -> HookConfig {
    let hooks = &config.hooks;
    HookConfig {
        online: non_empty(&hooks.online),
        offline: non_empty(&hooks.offline),
        position: non_empty(&hooks.position),
        on_invite: non_empty(&hooks.on_invite),
        alarm: non_empty(&hooks.alarm),
        queue_capacity: hooks.queue_capacity,
        timeout: Some(DEFAULT_HOOK_TIMEOUT),
    }
}

pub fn retention(config: &Gb28181Config) -> Retention {
    Retention {
        position_days: config.sip.position_reserve_days,
        alarm_days: config.sip.alarm_reserve_days,
        log_days: config.sip.log_reserve_days,
    }
}

pub fn worker_config(config: &Gb28181Config) -> WorkerConfig {
    WorkerConfig {
        lanes: config.sip.worker_lanes.max(1),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_configs_follow_file() {
        let mut config = Gb28181Config::default();
        config.sip.password = "12345678".to_string();
        config.sip.invite_timeout = 5;
        config.sip.default_setup_type = "TCP-active".to_string();
        config.sip.sub_catalog_global_interval = 60;
        config.hooks.online = "http://127.0.0.1:9000/online".to_string();

        let registry = registry_config(&config);
        assert_eq!(registry.password.as_deref(), Some("12345678"));
        assert_eq!(registry.alive_expires, Duration::from_secs(180));

        let session = session_config(&config);
        assert_eq!(session.invite_timeout, Duration::from_secs(5));
        assert_eq!(session.default_setup, SetupType::TcpActive);
        assert!(session.prefer_stream_fmt.is_none());

        assert!(subscription_config(&config).enabled(crate::subscription::SubscribeEvent::Catalog));
        assert!(cascade_config(&config).is_none());

        let hooks = hook_config(&config);
        assert!(hooks.online.is_some());
        assert!(hooks.offline.is_none());
    }

    #[test]
    fn test_default_setup_is_tcp_passive() {
        let config = Gb28181Config::default();
        assert_eq!(session_config(&config).default_setup, SetupType::TcpPassive);
        assert_eq!(SessionConfig::default().default_setup, SetupType::TcpPassive);

        let mut config = Gb28181Config::default();
        config.sip.default_setup_type = "bogus".to_string();
        assert_eq!(session_config(&config).default_setup, SetupType::TcpPassive);
    }

    #[test]
    fn test_cascade_enabled() {
        let mut config = Gb28181Config::default();
        config.cascade.enable = true;
        config.cascade.server_id = "44010000002000000001".to_string();
        config.cascade.server_host = "10.0.0.9".to_string();
        config.cascade.transport = "tcp".to_string();
        let cascade = cascade_config(&config).unwrap();
        assert_eq!(cascade.transport, TransportKind::Tcp);
        assert!(cascade.password.is_none());
        assert_eq!(cascade.keepalive_interval, Duration::from_secs(60));
    }
}
