use anyhow::Context;
use clap::Parser;
use console_auth::auth::{self, seed, AuthState};
use console_auth::config::AppConfig;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// 管理后台认证服务
#[derive(Debug, Parser)]
#[command(name = "console-auth", version, about)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, env = "CONSOLE_AUTH_CONFIG", default_value = "config/app.toml")]
    config: PathBuf,

    /// 覆盖监听地址
    #[arg(long, env = "CONSOLE_AUTH_LISTEN")]
    listen: Option<String>,

    /// 覆盖 JWT 签名密钥
    #[arg(long, env = "CONSOLE_AUTH_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,
}

fn init_tracing(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level));
    let registry = tracing_subscriber::registry().with(filter);
    if config.log.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)
        .await
        .with_context(|| format!("loading config from {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(secret) = args.jwt_secret {
        config.jwt.secret = Some(secret);
    }
    init_tracing(&config);

    let listen = config.server.listen.clone();
    let state = AuthState::in_memory(config).context("building auth state")?;
    seed::seed_defaults(&state).await.context("seeding defaults")?;
    state.start_background_tasks().await;

    let app = auth::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    info!("console-auth listening on {}", listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving http")?;

    state.shutdown().await;
    info!("console-auth stopped");
    Ok(())
}
