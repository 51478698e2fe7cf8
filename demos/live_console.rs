use std::env;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bililive_sdk::collab::{ChatModel, ChatRelay, CollabError, RelayEvent};
use bililive_sdk::config::LiveConfig;
use bililive_sdk::live::LiveClient;
use bililive_sdk::stream::events::{EventKind, GuardTier, LiveEvent};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

/// Stand-in model that answers every question the same way.
struct CannedModel;

#[async_trait]
impl ChatModel for CannedModel {
    async fn chat(&self, text: &str) -> Result<String, CollabError> {
        Ok(format!("I heard \"{text}\", but no model is wired up yet."))
    }
}

fn required(name: &str) -> Result<String, Box<dyn Error>> {
    env::var(name).map_err(|_| format!("{name} must be set").into())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = LiveConfig::new(
        required("BILI_ACCESS_KEY_ID")?,
        SecretString::new(required("BILI_ACCESS_KEY_SECRET")?),
        required("BILI_ID_CODE")?,
        required("BILI_APP_ID")?.parse()?,
    );
    let run_for = env::var("LIVE_CONSOLE_SECONDS")
        .ok()
        .and_then(|value| value.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(300));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = LiveClient::new(config)?;

        let (relay, mut relay_events) = ChatRelay::new(Arc::new(CannedModel));
        client.attach_relay(Arc::new(relay));
        client.on_gift(|gift| {
            println!("[gift] {} x{} {}", gift.uname, gift.gift_num, gift.gift_name);
        });
        client.on_super_chat(|sc| {
            println!("[super_chat] {} ({} CNY): {}", sc.uname, sc.rmb, sc.message);
        });
        client.on_guard(|guard| {
            let tier = match guard.tier() {
                Some(GuardTier::Governor) => "governor",
                Some(GuardTier::Admiral) => "admiral",
                Some(GuardTier::Captain) => "captain",
                None => "unknown",
            };
            println!("[guard] {} bought {tier}", guard.user_info.uname);
        });
        client.on(EventKind::Unknown, |event| {
            if let LiveEvent::Unknown(envelope) = event {
                println!("[unknown] {}", envelope.cmd);
            }
        });

        let session = client.start().await?;
        println!(
            "live session {} for room {} ({})",
            session.game_id, session.anchor.room_id, session.anchor.uname
        );
        client.wait_authenticated().await?;

        if let Some(mut status) = client.subscribe_status().await {
            tokio::spawn(async move {
                while status.changed().await.is_ok() {
                    let current = *status.borrow();
                    println!("[stream] {current:?}");
                }
            });
        }

        let printer = tokio::spawn(async move {
            while let Some(event) = relay_events.recv().await {
                match event {
                    RelayEvent::Question(question) => {
                        println!("[question] {}: {}", question.uname, question.text);
                    }
                    RelayEvent::Answer { question, reply } => {
                        println!("[answer] @{} {reply}", question.uname);
                    }
                }
            }
        });

        tokio::time::sleep(run_for).await;
        client.close().await?;
        printer.abort();
        Ok::<(), Box<dyn Error>>(())
    })
}
