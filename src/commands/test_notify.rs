use anyhow::{bail, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::info;
use tweetwatch::config::Config;
use tweetwatch::notify::{test_notice, Dispatcher, TelegramTransport};

pub async fn execute(env_file: &Path) -> Result<()> {
    let config = Config::load(env_file)?;
    config.validate_for_delivery()?;

    let transport = TelegramTransport::new(
        &config.telegram_bot_token,
        &config.telegram_chat_id,
        &config.telegram_api_base,
    )?;
    let dispatcher = Dispatcher::new(Arc::new(transport), config.display_utc_offset_hours);

    if !dispatcher.announce(&test_notice()).await {
        bail!("Test message could not be delivered");
    }
    info!("Test message sent to chat {chat}", chat = config.telegram_chat_id);
    Ok(())
}
