use anyhow::Result;
use herd_queue::observability::init_tracing;
use post_worker::{background::CreatePost, AppConfig, PostStore};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env();
    init_tracing(config.log_json);

    let mut system = post_worker::build(&config)?;
    system.start()?;

    for n in 1..=config.demo_posts {
        let post = CreatePost {
            content: format!("Demo post #{}", n),
            images: Vec::new(),
        };
        let response = system
            .create_post(post, "demo-user", vec![format!("uploads/demo-{}.png", n)])
            .await?;
        info!("{}", response);
    }

    info!("Queue stats: {}", system.queue_stats().await?);
    info!("Queue health: {}", system.queue_health().await);
    println!("[post-worker] processing posts; press ctrl-c to stop");

    tokio::signal::ctrl_c().await?;

    info!("Final queue stats: {}", system.queue_stats().await?);
    info!("Posts stored: {}", system.posts().count().await?);
    system.shutdown().await?;

    Ok(())
}
