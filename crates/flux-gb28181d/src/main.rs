use anyhow::anyhow;
use clap::Parser;
use flux_config::ConfigLoader;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod api;
mod engine;
mod telemetry;

use engine::Engine;

/// 退出时等待服务端事务完成的时长
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// 配置文件路径（TOML），可被 GB28181__SECTION__KEY 环境变量覆盖
    #[arg(long, default_value = "./config/gb28181.toml")]
    config: String,

    /// 覆盖 http.listen
    #[arg(long)]
    http_bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ConfigLoader::new(&args.config).load_validated()?;
    if let Some(bind) = args.http_bind {
        config.http.listen = bind;
    }

    telemetry::init_logging(&config.logging);
    tracing::info!(target: "gb28181d", config = %args.config, "configuration loaded");

    let cancel = CancellationToken::new();
    let engine = Engine::start(&config, cancel.clone()).await?;
    let endpoint = engine.endpoint.clone();

    let addr: SocketAddr = config
        .http
        .listen
        .parse()
        .map_err(|e| anyhow!("invalid http.listen {}: {}", config.http.listen, e))?;
    tracing::info!(target: "gb28181d", %addr, "http listening");

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(target: "gb28181d", error = %e, "failed to listen for ctrl-c");
        }
        tracing::info!(target: "gb28181d", "shutdown requested");
        shutdown.cancel();
    });

    let graceful = cancel.clone();
    axum::Server::bind(&addr)
        .serve(api::router(engine).into_make_service())
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .await?;

    // 会话监督、订阅、级联任务随 cancel 一同退出；服务端事务最多再等 2 秒
    let pending = endpoint.transactions().drain(SHUTDOWN_DRAIN).await;
    endpoint.transactions().transport().shutdown();
    tracing::info!(target: "gb28181d", pending, "GB28181 service stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_point_at_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gb28181.toml");
        std::fs::write(
            &path,
            "[sip]\nport = 15061\nlisten_ip = \"127.0.0.1\"\n\n[http]\nlisten = \"127.0.0.1:18080\"\n\n[logging]\nformat = \"json\"\n",
        )
        .unwrap();

        let args = Args::try_parse_from([
            "flux-gb28181d",
            "--config",
            path.to_str().unwrap(),
            "--http-bind",
            "127.0.0.1:18081",
        ])
        .unwrap();
        assert_eq!(args.http_bind.as_deref(), Some("127.0.0.1:18081"));

        let config = ConfigLoader::new(&args.config).load_validated().unwrap();
        assert_eq!(config.sip.port, 15061);
        assert_eq!(config.http.listen, "127.0.0.1:18080");
        assert_eq!(config.logging.format, "json");
    }
}
