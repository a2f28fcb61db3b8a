//! Telegram IM: all teloxide usage is confined here. Exposes the transport (send one message)
//! and the receiver (parse commands, submit to the dispatcher, reply via the outbound hub).

use std::sync::Arc;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::RequestError;

use crate::config::Config;
use crate::im::commands::{self, Command};
use crate::im::daemon::OutboundHub;
use crate::im::delivery::{ChatDelivery, ChatSink};
use crate::im::log::truncate_content_default;
use crate::im::transport::{ImChannelCapabilities, ImTransport, SendError};
use crate::queue::{Dispatcher, NotificationSink, Notifier, OriginatorId, TenantId, TenantRegistry};
use crate::resolver::HttpResolver;

pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org/bot";

/// Telegram send implementation: parses channel_id as "telegram:CHAT_ID" and calls send_message.
/// All teloxide types stay inside this module.
pub struct TelegramTransport {
    bot: Bot,
}

impl TelegramTransport {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait::async_trait]
impl ImTransport for TelegramTransport {
    fn capabilities(&self) -> ImChannelCapabilities {
        ImChannelCapabilities {
            max_message_len: TELEGRAM_MAX_MESSAGE_LEN,
            channel_id_prefix: "telegram",
        }
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<(), SendError> {
        let chat_id = parse_chat_id(channel_id)?;
        self.bot
            .send_message(chat_id, text)
            .await
            .map_err(|e| match e {
                RequestError::RetryAfter(secs) => SendError::RateLimited {
                    retry_after_secs: secs.duration().as_secs_f64(),
                },
                other => SendError::Other(other.to_string()),
            })?;
        Ok(())
    }
}

pub fn tenant_id(chat_id: ChatId) -> TenantId {
    TenantId(format!("telegram:{}", chat_id.0))
}

fn parse_chat_id(channel_id: &str) -> Result<ChatId, SendError> {
    let s = channel_id
        .strip_prefix("telegram:")
        .ok_or_else(|| SendError::Other("invalid channel_id (expected telegram:CHAT_ID)".into()))?;
    let id: i64 = s
        .parse()
        .map_err(|_| SendError::Other(format!("invalid telegram chat_id: {}", channel_id)))?;
    Ok(ChatId(id))
}

fn format_user(msg: &Message) -> String {
    msg.from
        .as_ref()
        .map(|u| {
            u.username
                .as_ref()
                .map(|s| format!("@{}", s))
                .unwrap_or_else(|| u.first_name.clone())
        })
        .unwrap_or_else(|| "?".to_string())
}

fn originator_id(msg: &Message) -> OriginatorId {
    match msg.from.as_ref() {
        Some(user) => OriginatorId(format!("telegram:{}", user.id.0)),
        None => OriginatorId(format!("telegram:{}", msg.chat.id.0)),
    }
}

/// Reply text for one parsed command. Bypass commands are submitted to the dispatcher here.
fn handle_command(
    command: Command,
    dispatcher: &Arc<Dispatcher>,
    tenant: TenantId,
    originator: OriginatorId,
    requester: String,
) -> String {
    match command {
        Command::Help => commands::help_text(),
        Command::Queue => {
            let status = dispatcher.registry().status(&tenant);
            format!(
                "Queue for this chat: {} waiting, {} in progress.",
                status.queued, status.in_flight
            )
        }
        Command::Bypass { kind, link } => {
            match dispatcher.submit_request(tenant, originator, requester, &link, &kind) {
                Ok(accepted) if accepted.position <= 1 => "⏳ Resolving your link…".to_string(),
                Ok(accepted) => format!("⏳ Queued at position {}.", accepted.position),
                Err(e) => format!("❌ {}.\n\n{}", e, commands::help_text()),
            }
        }
    }
}

/// Run the Telegram receiver (long polling). Commands are answered through the outbound hub;
/// accepted bypass requests are queued on the dispatcher under this chat's tenant id.
/// Returns when the bot stops (e.g. Ctrl+C).
pub async fn run_telegram_receiver(
    bot: Bot,
    dispatcher: Arc<Dispatcher>,
    outbound: Arc<OutboundHub<TelegramTransport>>,
) {
    teloxide::repl(bot, move |_bot: Bot, msg: Message| {
        let dispatcher = Arc::clone(&dispatcher);
        let outbound = Arc::clone(&outbound);

        async move {
            let tenant = tenant_id(msg.chat.id);
            let requester = format_user(&msg);

            let Some(text) = msg.text().map(str::trim) else {
                tracing::debug!(channel = "telegram", chat_id = msg.chat.id.0, from = %requester, "non-text message ignored");
                return Ok(());
            };
            tracing::info!(
                channel = "telegram",
                chat_id = msg.chat.id.0,
                from = %requester,
                direction = "incoming",
                content = %truncate_content_default(text),
                "message received"
            );

            let Some(command) = commands::parse_command(text) else {
                if msg.chat.is_private() {
                    if let Err(e) = outbound.send(&tenant.0, commands::help_text()).await {
                        tracing::warn!(channel = "telegram", chat_id = msg.chat.id.0, error = %e, "help reply not queued");
                    }
                }
                return Ok(());
            };

            let reply = handle_command(command, &dispatcher, tenant.clone(), originator_id(&msg), requester);
            if let Err(e) = outbound.send(&tenant.0, reply).await {
                tracing::warn!(channel = "telegram", chat_id = msg.chat.id.0, error = %e, "reply not queued");
            }
            Ok(())
        }
    })
    .await;
}

/// Pre-check Telegram API (getMe). Returns Ok(()) if reachable and token valid.
async fn check_telegram_api(token: &str) -> Result<(), String> {
    let url = format!("{}{}/getMe", TELEGRAM_API_BASE, token);
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| format!("reqwest client: {}", e))?;
    let res = client
        .get(&url)
        .send()
        .await
        .map_err(|e| format!("Telegram API unreachable: {}", e))?;
    if !res.status().is_success() {
        return Err(format!("getMe returned status {}", res.status()));
    }
    let body = res.text().await.map_err(|e| format!("read body: {}", e))?;
    if body.trim().is_empty() {
        return Err("getMe returned empty body (API may be blocked or proxy needed)".to_string());
    }
    let _: serde_json::Value = serde_json::from_str(&body)
        .map_err(|_| format!("getMe invalid JSON (raw: {} bytes)", body.len()))?;
    Ok(())
}

/// Build the dispatcher for this bot: HTTP resolver, chat delivery and the optional log/error chats.
fn build_dispatcher(
    config: &Config,
    registry: Arc<TenantRegistry>,
    outbound: &Arc<OutboundHub<TelegramTransport>>,
) -> Result<Arc<Dispatcher>, String> {
    let resolver = HttpResolver::new(config.resolver_base_url.clone(), config.resolver_timeout)
        .map_err(|e| e.to_string())?;
    let sink = |channel_id: &Option<String>| {
        channel_id.as_ref().map(|id| {
            Arc::new(ChatSink::new(Arc::clone(outbound), id.clone())) as Arc<dyn NotificationSink>
        })
    };
    let notifier = Notifier::new(sink(&config.log_channel_id), sink(&config.error_channel_id));
    Ok(Dispatcher::new(
        registry,
        Arc::new(resolver),
        Arc::new(ChatDelivery::new(Arc::clone(outbound))),
        notifier,
        config.resolver_timeout,
    ))
}

/// Run the Telegram bot: check the token, spawn the outbound hub and dispatcher, then run the
/// receiver. No-op if no bot token is configured.
pub async fn run_telegram_bot(registry: Arc<TenantRegistry>) {
    let config = crate::config::ensure_loaded();
    let token = match config.telegram_bot_token.as_deref() {
        Some(t) if !t.trim().is_empty() => t.to_string(),
        _ => {
            tracing::warn!(channel = "telegram", "bot_token missing, Telegram bot disabled");
            return;
        }
    };

    if let Err(e) = check_telegram_api(&token).await {
        tracing::error!(channel = "telegram", error = %e, "API check failed (set HTTPS_PROXY if blocked)");
        return;
    }

    let bot = Bot::new(&token);
    match bot.get_me().await {
        Ok(me) => {
            let name = me.user.username.as_deref().unwrap_or("(no username)");
            tracing::info!(channel = "telegram", bot = %name, "bot started");
        }
        Err(e) => {
            tracing::error!(channel = "telegram", error = %e, "get_me failed");
            return;
        }
    }

    let outbound = OutboundHub::new(Arc::new(TelegramTransport::new(bot.clone())));
    let dispatcher = match build_dispatcher(config, registry, &outbound) {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(channel = "telegram", error = %e, "resolver setup failed");
            return;
        }
    };

    run_telegram_receiver(bot, dispatcher, outbound).await;
}
