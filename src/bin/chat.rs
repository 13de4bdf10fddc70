use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;
use tracing::info;

use chat_relay::client::{CorrelationTracker, HttpTransport, PollingClient};
use chat_relay::config::ClientConfig;
use chat_relay::models::{ConversationId, Response};

fn render(active: &ConversationId, response: &Response) {
    let prefix = if response.conversation_id() == active {
        String::new()
    } else {
        format!("[{}] ", response.conversation_id())
    };
    match response.message() {
        Some(text) => println!("{prefix}assistant> {text}"),
        None => println!(
            "{prefix}error> {}",
            response.error_description().unwrap_or("unknown error")
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_relay=warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = ClientConfig::from_env()?;
    let client = PollingClient::new(HttpTransport::new(&config)?, config.clone());
    let mut tracker = CorrelationTracker::new();
    let mut conversation = ConversationId::generate();
    info!("Talking to {}", config.base_url);
    println!("Chat ID: {conversation}  (commands: /delete, /clear, /quit)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(config.poll_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/delete" => match client.delete_chat(&mut tracker, &conversation).await {
                        Ok(()) => {
                            conversation = ConversationId::generate();
                            println!("Chat deleted. New chat ID: {conversation}");
                        }
                        Err(e) => println!("error> {e}"),
                    },
                    "/clear" => match client.delete_all(&mut tracker).await {
                        Ok(()) => {
                            conversation = ConversationId::generate();
                            println!("History cleared. New chat ID: {conversation}");
                        }
                        Err(e) => println!("error> {e}"),
                    },
                    text => {
                        if let Err(e) = client.submit(&mut tracker, &conversation, text).await {
                            println!("error> {e}");
                        }
                    }
                }
            }
            _ = ticker.tick(), if !tracker.pending_conversations().is_empty() => {
                for (_, outcome) in client.poll_pending(&mut tracker).await {
                    match outcome {
                        Ok(Some(response)) => render(&conversation, &response),
                        Ok(None) => {}
                        Err(e) => println!("error> {e}"),
                    }
                }
            }
        }
    }
    Ok(())
}
