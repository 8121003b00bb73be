use flux_config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// 安装全局日志：RUST_LOG 优先，否则使用 logging.level
pub fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if config.format.eq_ignore_ascii_case("json") {
        builder.json().with_current_span(true).with_span_list(true).init();
    } else {
        builder.with_target(true).init();
    }
}
