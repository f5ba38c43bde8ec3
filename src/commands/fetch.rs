use anyhow::{bail, Context, Result};
use std::path::Path;
use tracing::info;
use tweetwatch::config::Config;
use tweetwatch::error_utils::serialize_to_json_with_context;
use tweetwatch::source::{FallbackSource, PrimarySource, RssHubSource, SyndicationSource};

/// Fetch one account once, without dedup or delivery, and print the posts
pub async fn execute(env_file: &Path, account: &str, fallback: bool) -> Result<()> {
    let account = account.trim().trim_start_matches('@');
    if account.is_empty() {
        bail!("Account name must not be empty");
    }

    let posts = if fallback {
        let config = Config::load(env_file)?;
        if config.fallback_base_url.is_empty() {
            bail!("FALLBACK_BASE_URL is not configured");
        }
        let source = RssHubSource::new(&config.fallback_base_url, config.fallback_timeout)?;
        FallbackSource::fetch(&source, account)
            .await
            .with_context(|| format!("Fallback fetch for @{account} failed"))?
    } else {
        let source = SyndicationSource::new()?;
        PrimarySource::fetch(&source, account)
            .await
            .with_context(|| format!("Fetch for @{account} failed"))?
    };

    info!("@{account}: fetched {count} posts", count = posts.len());
    println!("{}", serialize_to_json_with_context(&posts, "posts")?);
    Ok(())
}
