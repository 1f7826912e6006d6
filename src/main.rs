use std::sync::Arc;

use anubis_bot::config::Config;
use anubis_bot::forge::client::GithubForgeClient;
use anubis_bot::scheduler::{ListenerConfig, Scheduler};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    match run().await {
        Err(error) => panic!("{}", error),
        _ => Ok(()),
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;

    let client = Arc::new(GithubForgeClient::new(
        config.owner.clone(),
        config.repo.clone(),
        config.github_token.clone(),
        config.request_timeout,
    )?);

    let listener = ListenerConfig {
        addr: format!("{}:{}", config.host, config.port).parse()?,
        webhook_path: config.webhook_path.clone(),
        webhook_secret: config.webhook_secret.clone(),
        owner_repo: format!("{}/{}", config.owner, config.repo),
        staging_branch: config.staging_branch.clone(),
    };

    let scheduler = Arc::new(Scheduler::new(client, config, listener));

    // The scheduler owns the webhook listener so it can close and recreate it around its own
    // error backoff (§4.5 step 2, §5); it also kicks off an initial full scan immediately, with
    // webhook events and the timer driving every subsequent one.
    scheduler.start().await;

    // `scheduler` runs entirely on spawned tasks from here; park this task forever rather than
    // exiting the process.
    std::future::pending::<()>().await;
    Ok(())
}
