use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// GB28181 信令服务配置
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Gb28181Config {
    pub sip: SipConfig,
    pub http: HttpConfig,
    pub hooks: HooksConfig,
    pub ip2region: Ip2RegionConfig,
    pub cascade: CascadeConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// SIP 服务配置
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SipConfig {
    pub port: u16,
    pub listen_ip: String,
    /// 对外通告地址，为空时使用监听地址
    pub public_ip: String,
    /// 平台 20 位国标编码
    pub id: String,
    pub realm: String,
    /// 全局注册密码，为空表示不鉴权
    pub password: String,
    /// 心跳超时（秒）
    pub alive_expires: u64,
    pub mobile_position_interval: u32,
    pub subscribe_expires: u32,
    /// INVITE 超时（秒）
    pub invite_timeout: u64,
    /// 媒体服务器 HTTP 地址
    pub media_server: String,
    /// SDP c= 中的媒体地址，为空时使用 public_ip
    pub media_ip: String,
    pub prefer_stream_fmt: String,
    /// device_id -> UDP / TCP-passive / TCP-active
    pub device_default_media_transport: HashMap<String, String>,
    pub global_drop_channel_type: Vec<String>,
    pub sub_catalog_global_interval: u32,
    pub sub_alarm_global_interval: u32,
    pub sub_position_global_interval: u32,
    pub sub_ptz_global_interval: u32,
    pub position_reserve_days: u32,
    pub alarm_reserve_days: u32,
    pub log_reserve_days: u32,
    pub transport_queue: usize,
    pub worker_lanes: usize,
    pub default_setup_type: String,
    /// 媒体保活检查间隔（秒），0 表示不检查
    pub media_check_interval: u64,
    pub cancel_grace_ms: u64,
    pub alarm_history: usize,
    pub catalog_page_size: usize,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            port: 5060,
            listen_ip: "0.0.0.0".to_string(),
            public_ip: String::new(),
            id: "34020000002000000001".to_string(),
            realm: "3402000000".to_string(),
            password: String::new(),
            alive_expires: 180,
            mobile_position_interval: 5,
            subscribe_expires: 3600,
            invite_timeout: 10,
            media_server: "http://127.0.0.1:8081".to_string(),
            media_ip: String::new(),
            prefer_stream_fmt: String::new(),
            device_default_media_transport: HashMap::new(),
            global_drop_channel_type: Vec::new(),
            sub_catalog_global_interval: 0,
            sub_alarm_global_interval: 0,
            sub_position_global_interval: 0,
            sub_ptz_global_interval: 0,
            position_reserve_days: 7,
            alarm_reserve_days: 30,
            log_reserve_days: 7,
            transport_queue: 4096,
            worker_lanes: 8,
            default_setup_type: "TCP-passive".to_string(),
            media_check_interval: 10,
            cancel_grace_ms: 2000,
            alarm_history: 32,
            catalog_page_size: 20,
        }
    }
}

impl SipConfig {
    /// 是否启用了任一订阅
    pub fn any_subscription(&self) -> bool {
        self.sub_catalog_global_interval > 0
            || self.sub_alarm_global_interval > 0
            || self.sub_position_global_interval > 0
            || self.sub_ptz_global_interval > 0
    }
}

/// 运维 HTTP 接口
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub listen: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Webhook 地址，为空表示不推送
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HooksConfig {
    pub online: String,
    pub offline: String,
    pub position: String,
    pub on_invite: String,
    pub alarm: String,
    pub queue_capacity: usize,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            online: String::new(),
            offline: String::new(),
            position: String::new(),
            on_invite: String::new(),
            alarm: String::new(),
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Ip2RegionConfig {
    pub enable: bool,
    pub db_path: PathBuf,
}

/// 级联上级平台
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CascadeConfig {
    pub enable: bool,
    pub server_id: String,
    pub server_realm: String,
    pub server_host: String,
    pub server_port: u16,
    /// UDP / TCP
    pub transport: String,
    /// 向上级呈现的编码，为空时使用 sip.id
    pub local_id: String,
    pub password: String,
    pub register_expires: u32,
    /// 心跳间隔（秒）
    pub keepalive_interval: u64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            enable: false,
            server_id: String::new(),
            server_realm: String::new(),
            server_host: String::new(),
            server_port: 5060,
            transport: "UDP".to_string(),
            local_id: String::new(),
            password: String::new(),
            register_expires: 3600,
            keepalive_interval: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://gb28181.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// text / json
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Gb28181Config::default();
        assert_eq!(config.sip.port, 5060);
        assert_eq!(config.sip.realm, "3402000000");
        assert!(!config.sip.any_subscription());
        assert!(!config.cascade.enable);
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: Gb28181Config = toml::from_str(
            r#"
[sip]
port = 15060
sub_catalog_global_interval = 60

[hooks]
online = "http://127.0.0.1:9000/online"
"#,
        )
        .unwrap();
        assert_eq!(config.sip.port, 15060);
        assert_eq!(config.sip.alive_expires, 180);
        assert!(config.sip.any_subscription());
        assert_eq!(config.hooks.online, "http://127.0.0.1:9000/online");
        assert_eq!(config.hooks.queue_capacity, 256);
    }
}
