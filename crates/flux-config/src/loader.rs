use anyhow::{anyhow, Result};
use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};

use crate::Gb28181Config;

/// 环境变量前缀，例如 GB28181__SIP__PORT=15060
pub const ENV_PREFIX: &str = "GB28181";

/// 配置加载器
pub struct ConfigLoader {
    config_path: PathBuf,
}

impl ConfigLoader {
    /// 创建配置加载器
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    /// 加载配置：TOML 文件 + 环境变量覆盖
    pub fn load(&self) -> Result<Gb28181Config> {
        let mut builder = Config::builder();

        if self.config_path.exists() {
            builder = builder.add_source(File::new(
                self.config_path
                    .to_str()
                    .ok_or_else(|| anyhow!("Invalid config path"))?,
                FileFormat::Toml,
            ));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// 加载并验证
    pub fn load_validated(&self) -> Result<Gb28181Config> {
        let config = self.load()?;
        Self::validate(&config)?;
        Ok(config)
    }

    /// 验证配置
    pub fn validate(config: &Gb28181Config) -> Result<()> {
        let sip = &config.sip;

        if sip.port == 0 {
            return Err(anyhow!("sip.port must not be 0"));
        }

        if sip.id.len() != 20 || !sip.id.chars().all(|c| c.is_ascii_digit()) {
            return Err(anyhow!("sip.id must be a 20-digit GB28181 code, got {}", sip.id));
        }

        if sip.alive_expires == 0 {
            return Err(anyhow!("sip.alive_expires must be greater than 0"));
        }

        if sip.invite_timeout == 0 {
            return Err(anyhow!("sip.invite_timeout must be greater than 0"));
        }

        if sip.any_subscription() && sip.subscribe_expires < 60 {
            return Err(anyhow!(
                "sip.subscribe_expires ({}) must be at least 60 when subscriptions are enabled",
                sip.subscribe_expires
            ));
        }

        for (name, days) in [
            ("position_reserve_days", sip.position_reserve_days),
            ("alarm_reserve_days", sip.alarm_reserve_days),
            ("log_reserve_days", sip.log_reserve_days),
        ] {
            if days == 0 {
                return Err(anyhow!("sip.{} must be at least 1", name));
            }
        }

        if !matches!(
            sip.default_setup_type.to_ascii_lowercase().as_str(),
            "udp" | "tcp-passive" | "passive" | "tcp-active" | "active"
        ) {
            return Err(anyhow!("sip.default_setup_type {} is not supported", sip.default_setup_type));
        }

        let cascade = &config.cascade;
        if cascade.enable {
            if cascade.server_id.len() != 20 {
                return Err(anyhow!("cascade.server_id must be a 20-digit GB28181 code"));
            }
            if cascade.server_host.is_empty() || cascade.server_port == 0 {
                return Err(anyhow!("cascade.server_host and cascade.server_port are required"));
            }
            if !matches!(cascade.transport.to_ascii_lowercase().as_str(), "udp" | "tcp") {
                return Err(anyhow!("cascade.transport must be UDP or TCP"));
            }
            if cascade.keepalive_interval == 0 {
                return Err(anyhow!("cascade.keepalive_interval must be greater than 0"));
            }
        }

        if config.ip2region.enable && !config.ip2region.db_path.exists() {
            return Err(anyhow!(
                "ip2region.db_path {} does not exist",
                config.ip2region.db_path.display()
            ));
        }

        Ok(())
    }
}
