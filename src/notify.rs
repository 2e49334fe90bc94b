// Written by Paul Clevett
// (C)Copyright Wolf Software Systems Ltd
// https://wolf.uk.com

//! Task notifications — log line always, Discord / Slack / Telegram when configured

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::NotifyConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    fn emoji(&self) -> &'static str {
        match self {
            Self::Info => "ℹ️",
            Self::Success => "✅",
            Self::Warning => "⚠️",
            Self::Error => "❌",
        }
    }

    fn discord_color(&self) -> u32 {
        match self {
            Self::Info => 5793266,
            Self::Success => 65280,
            Self::Warning => 16753920,
            Self::Error => 16711680,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, body: &str, severity: Severity);
}

/// Writes notifications to the log only
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, body: &str, severity: Severity) {
        log_notification(title, body, severity);
    }
}

fn log_notification(title: &str, body: &str, severity: Severity) {
    match severity {
        Severity::Info | Severity::Success => info!("{}: {}", title, body),
        Severity::Warning => warn!("{}: {}", title, body),
        Severity::Error => error!("{}: {}", title, body),
    }
}

/// Logs, then posts to every configured channel. Channel failures are logged and swallowed.
pub struct WebhookNotifier {
    config: NotifyConfig,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(config: NotifyConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, title: &str, body: &str, severity: Severity) {
        log_notification(title, body, severity);
        let title = format!("{} {}", severity.emoji(), title);
        let config = &self.config;

        if !config.discord_webhook.is_empty() {
            if let Err(e) = send_discord(&self.client, &config.discord_webhook, &title, body, severity).await {
                warn!("Discord notification failed: {}", e);
            }
        }
        if !config.slack_webhook.is_empty() {
            if let Err(e) = send_slack(&self.client, &config.slack_webhook, &title, body).await {
                warn!("Slack notification failed: {}", e);
            }
        }
        if !config.telegram_bot_token.is_empty() && !config.telegram_chat_id.is_empty() {
            if let Err(e) = send_telegram(&self.client, &config.telegram_bot_token, &config.telegram_chat_id, &title, body).await {
                warn!("Telegram notification failed: {}", e);
            }
        }
    }
}

/// The configured notifier: webhooks when any channel is set, log-only otherwise
pub fn from_config(config: &NotifyConfig) -> Box<dyn Notifier> {
    if !config.has_channels() {
        return Box::new(LogNotifier);
    }
    match WebhookNotifier::new(config.clone()) {
        Ok(n) => Box::new(n),
        Err(e) => {
            warn!("Webhook notifications disabled: {}", e);
            Box::new(LogNotifier)
        }
    }
}

// ── Discord webhook ──
async fn send_discord(client: &reqwest::Client, webhook_url: &str, title: &str, message: &str, severity: Severity) -> Result<(), String> {
    let payload = serde_json::json!({
        "embeds": [{
            "title": title,
            "description": message,
            "color": severity.discord_color(),
            "footer": { "text": "WolfBackup" },
            "timestamp": chrono::Utc::now().to_rfc3339()
        }]
    });

    let resp = client.post(webhook_url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if resp.status().is_success() {
        info!("Discord notification sent: {}", title);
        Ok(())
    } else {
        Err(format!("Discord HTTP {}", resp.status()))
    }
}

// ── Slack webhook ──
async fn send_slack(client: &reqwest::Client, webhook_url: &str, title: &str, message: &str) -> Result<(), String> {
    let payload = serde_json::json!({
        "blocks": [
            { "type": "header", "text": { "type": "plain_text", "text": title } },
            { "type": "section", "text": { "type": "mrkdwn", "text": message } },
            { "type": "context", "elements": [{ "type": "mrkdwn", "text": format!("_WolfBackup on {}, {}_", host_label(), chrono::Utc::now().format("%Y-%m-%d %H:%M UTC")) }] }
        ]
    });

    let resp = client.post(webhook_url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if resp.status().is_success() {
        info!("Slack notification sent: {}", title);
        Ok(())
    } else {
        Err(format!("Slack HTTP {}", resp.status()))
    }
}

// ── Telegram bot ──
async fn send_telegram(client: &reqwest::Client, bot_token: &str, chat_id: &str, title: &str, message: &str) -> Result<(), String> {
    let url = format!("https://api.telegram.org/bot{}/sendMessage", bot_token);
    let text = format!("*{}*\n\n{}", title, message);

    let payload = serde_json::json!({
        "chat_id": chat_id,
        "text": text,
        "parse_mode": "Markdown",
        "disable_web_page_preview": true
    });

    let resp = client.post(&url)
        .json(&payload)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if resp.status().is_success() {
        info!("Telegram notification sent: {}", title);
        Ok(())
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(format!("Telegram error: {}", body))
    }
}

/// Name of the machine running the orchestrator
fn host_label() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
