use borealis::{config::RelayConfig, context::AppContext, error::RelayResult, server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> RelayResult<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "borealis=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RelayConfig::from_env()?;
    let ctx = AppContext::new(config).await?;

    // reopen firehose subscriptions for hosts registered before restart
    ctx.slurper.resubscribe_all().await?;

    server::serve(ctx).await?;

    Ok(())
}
