pub mod gb28181;
pub mod loader;

pub use gb28181::{
    CascadeConfig, DatabaseConfig, Gb28181Config, HooksConfig, HttpConfig, Ip2RegionConfig,
    LoggingConfig, SipConfig,
};
pub use loader::ConfigLoader;
