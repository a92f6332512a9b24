use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use textgate::{api, backend, config, quota, scheduler};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    // 配额执行器：异步初始化，不阻塞启动。
    let store = Arc::new(quota::FileQuotaStore::new(cfg.quota_store_path()));
    let enforcer = Arc::new(quota::QuotaEnforcer::new());
    quota::spawn_init_task(enforcer.clone(), store);

    // 配置了对端实例时启动分布式计量广播。
    if !cfg.quota_peers.is_empty() {
        tracing::info!("分布式配额计量启用，共 {} 个对端", cfg.quota_peers.len());
        let sink = Arc::new(
            quota::HttpUpdateSink::new(
                cfg.quota_peers.clone(),
                Duration::from_millis(cfg.timeout_ms),
            )
            .context("初始化计量广播客户端失败")?,
        );
        quota::spawn_distribution_task(enforcer.clone(), sink);
    }

    // 调度门面：发现后端账号与部署，按模型分组启动调度循环。
    let accounts =
        config::load_accounts(&cfg.accounts_file).context("加载 accounts.json 失败")?;
    tracing::info!(
        "加载 {} 个后端账号，共 {} 个部署",
        accounts.len(),
        accounts.iter().map(|a| a.deployments.len()).sum::<usize>()
    );
    let service = Arc::new(
        backend::OpenAiTextService::new(&cfg).context("初始化后端客户端失败")?,
    );
    let gateway = Arc::new(scheduler::GatewayScheduler::new(&accounts, &cfg, service));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    gateway.spawn_scheduling_loops(shutdown_rx);

    let state = Arc::new(api::AppState { enforcer, gateway });

    let app = Router::new()
        .route("/health", get(handle_health))
        .route(
            "/v1/embeddings/operations",
            post(api::handle_start_embeddings),
        )
        .route(
            "/v1/embeddings/operations/{operation_id}",
            get(api::handle_get_embeddings),
        )
        .route(
            "/v1/completions/operations",
            post(api::handle_start_completions),
        )
        .route(
            "/v1/completions/operations/{operation_id}",
            get(api::handle_get_completions),
        )
        .route("/internal/quota/metrics", post(api::handle_quota_metrics))
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    // 通知全部调度循环在周期间退出。
    let _ = shutdown_tx.send(true);

    Ok(())
}

async fn handle_health() -> &'static str {
    "ok"
}

fn init_tracing(cfg: &config::Config) {
    // 默认把依赖库日志控制在 warn（避免噪声），但确保本项目自身日志至少为 info，
    // 以免环境中预设的 RUST_LOG=warn 把关键日志过滤掉。
    let debug = cfg.debug.trim().to_lowercase();
    let filter = if debug == "off" {
        EnvFilter::new("warn,textgate=info")
    } else {
        let env = std::env::var("RUST_LOG").unwrap_or_default();
        let env = env.trim();
        if env.is_empty() {
            EnvFilter::new("warn,textgate=debug")
        } else if env.contains("textgate") {
            EnvFilter::new(env)
        } else {
            EnvFilter::new(format!("{env},textgate=debug"))
        }
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
