use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tool_gateway::cache::MemoryResponseCache;
use tool_gateway::{Gateway, GatewayConfig, StaticUserResolver, server};

/// Command-line overrides; everything else comes from `GATEWAY_*` variables
#[derive(Debug, Parser)]
#[command(name = "tool-gateway", about = "Tool-executing LLM gateway", version)]
struct Args {
    /// Address to listen on
    #[arg(long)]
    bind: Option<String>,

    /// Upstream API base URL
    #[arg(long)]
    api_base: Option<String>,

    /// Upstream key used for free-tier callers
    #[arg(long)]
    upstream_api_key: Option<String>,

    /// Tool rounds before the model is forced to answer
    #[arg(long)]
    max_rounds: Option<u32>,

    /// Free-tier tokens per quota window
    #[arg(long)]
    quota_limit: Option<i64>,

    /// Disable audit records
    #[arg(long)]
    no_audit: bool,

    /// Cached responses kept in memory; 0 disables the cache
    #[arg(long, env = "GATEWAY_CACHE_CAPACITY", default_value_t = 1024)]
    cache_capacity: usize,
}

fn load_config(args: &Args) -> anyhow::Result<GatewayConfig> {
    let mut config = GatewayConfig::from_env().context("reading GATEWAY_* environment")?;
    if let Some(bind) = &args.bind {
        config = config.with_bind_addr(bind.clone());
    }
    if let Some(base) = &args.api_base {
        config = config.with_api_base(base.clone());
    }
    if let Some(key) = &args.upstream_api_key {
        config = config.with_upstream_api_key(key.clone());
    }
    if let Some(rounds) = args.max_rounds {
        config = config.with_max_rounds(rounds);
    }
    if let Some(limit) = args.quota_limit {
        config = config.with_quota_limit(limit);
    }
    if args.no_audit {
        config = config.with_audit_disabled(true);
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = load_config(&args)?;
    log::info!("starting with {:?}", config);

    let bind_addr = config.bind_addr.clone();
    let resolver = Arc::new(StaticUserResolver::from_config(&config));
    let mut builder = Gateway::builder(config);
    if args.cache_capacity > 0 {
        builder = builder.cache(Arc::new(MemoryResponseCache::new(args.cache_capacity)));
    }
    let gateway = Arc::new(builder.build().context("building gateway")?);

    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding {}", bind_addr))?;
    log::info!("listening on {}", bind_addr);

    let app = server::router(gateway, resolver);
    server::serve(listener, app, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install ctrl-c handler: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("shutting down");
    })
    .await?;
    Ok(())
}
