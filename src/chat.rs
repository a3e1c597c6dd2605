use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use teloxide::prelude::*;

/// Destination for rendered release announcements.
#[async_trait]
pub trait ChatSink: Send + Sync {
    /// Post `text` announcing a release of `repository`.
    async fn post(&self, repository: &str, text: &str) -> Result<()>;
}

/// Posts announcements through a bot account, to the chat routed for the
/// repository or to the default chat.
#[derive(Clone)]
pub struct TelegramChat {
    bot: Bot,
    default_chat: ChatId,
    routes: HashMap<String, ChatId>,
}

impl std::fmt::Debug for TelegramChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramChat")
            .field("default_chat", &self.default_chat)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

impl TelegramChat {
    pub fn new(bot_token: impl Into<String>, chat_id: i64) -> Self {
        Self {
            bot: Bot::new(bot_token),
            default_chat: ChatId(chat_id),
            routes: HashMap::new(),
        }
    }

    /// Route repositories (canonical ids) to their own chats.
    pub fn with_routes(mut self, routes: impl IntoIterator<Item = (String, i64)>) -> Self {
        self.routes = routes
            .into_iter()
            .map(|(repository, chat)| (repository, ChatId(chat)))
            .collect();
        self
    }

    pub fn chat_for(&self, repository: &str) -> ChatId {
        self.routes
            .get(repository)
            .copied()
            .unwrap_or(self.default_chat)
    }
}

#[async_trait]
impl ChatSink for TelegramChat {
    async fn post(&self, repository: &str, text: &str) -> Result<()> {
        let chat = self.chat_for(repository);
        self.bot
            .send_message(chat, text)
            .await
            .with_context(|| format!("failed to post to chat {:?}", chat))?;
        Ok(())
    }
}
