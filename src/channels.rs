//! Channel directory, history pagination and channel lifecycle

use crate::error::{Error, Result};
use crate::models::{sanitize_uuid, Channel, ChatMessage, Persistence};
use crate::network::{ApiClient, Response, Route};
use crate::users::UserService;
use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Messages per history page.
const HISTORY_PAGE: u32 = 25;

pub struct ChannelService {
    api: Arc<ApiClient>,
    users: Arc<UserService>,
    paginating: Mutex<HashSet<String>>,
}

impl ChannelService {
    pub fn new(api: Arc<ApiClient>, users: Arc<UserService>) -> Self {
        Self {
            api,
            users,
            paginating: Mutex::new(HashSet::new()),
        }
    }

    pub async fn channel_ids(&self) -> Result<Vec<String>> {
        self.api
            .get(Route::Channels.builder().build())
            .await?
            .ok()?
            .json()
    }

    pub async fn get(&self, id: &str) -> Result<Channel> {
        let response = self
            .api
            .get(Route::Channels.builder().path(id).build())
            .await?
            .ok()?;
        self.decode_channel(&response).await
    }

    pub async fn channels(&self) -> Result<Vec<Channel>> {
        let ids = self.channel_ids().await?;
        try_join_all(ids.iter().map(|id| self.get(id))).await
    }

    /// Create a group channel; the server answers with the new id.
    pub async fn create_group(
        &self,
        name: &str,
        persistence: Persistence,
        participants: &[String],
    ) -> Result<Channel> {
        persistence.validate()?;
        let response = self
            .api
            .post(
                Route::Channels
                    .builder()
                    .field("name", name)
                    .field("persistence", persistence.to_json())
                    .field("participants", Value::from(participants.to_vec()))
                    .build(),
            )
            .await?
            .ok()?;
        let id = response.plain_body().trim().to_string();
        self.get(&id).await
    }

    /// Open the DM with `uuid`, creating it on the server when there is
    /// none yet.
    pub async fn get_or_create_dm(&self, uuid: &str) -> Result<Channel> {
        let uuid = sanitize_uuid(uuid)?;
        let response = self
            .api
            .post(
                Route::Channels
                    .builder()
                    .field("persistence", Persistence::Channel.to_json())
                    .field("participants", Value::from(vec![uuid]))
                    .build(),
            )
            .await?
            .ok()?;
        let id = response.plain_body().trim().to_string();
        self.get(&id).await
    }

    /// Rename a channel and/or change its retention policy.
    pub async fn update(
        &self,
        id: &str,
        name: Option<&str>,
        persistence: Option<Persistence>,
    ) -> Result<()> {
        let mut builder = Route::Channels.builder().path(id);
        if let Some(name) = name {
            builder = builder.field("name", name);
        }
        if let Some(persistence) = persistence {
            persistence.validate()?;
            builder = builder.field("persistence", persistence.to_json());
        }
        self.api.patch(builder.build()).await?.ok()?;
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        self.api
            .delete(Route::Channels.builder().path(id).build())
            .await?
            .ok()?;
        Ok(())
    }

    /// Send a message; the server echoes the stored message back.
    pub async fn send_message(&self, channel_id: &str, content: &str) -> Result<ChatMessage> {
        let response = self
            .api
            .post(
                Route::Channels
                    .builder()
                    .path(channel_id)
                    .path("messages")
                    .field("content", content)
                    .build(),
            )
            .await?
            .ok()?;
        self.decode_message(channel_id, response.body_value().clone())
            .await
    }

    /// One page of messages strictly older than `before` (pass the
    /// oldest loaded timestamp, or now when nothing is loaded yet).
    /// While a page for the channel is already in flight further calls
    /// return `Ok(None)` instead of issuing overlapping requests.
    pub async fn messages_before(
        &self,
        channel_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Option<Vec<ChatMessage>>> {
        let Some(_guard) = PaginationGuard::acquire(&self.paginating, channel_id) else {
            return Ok(None);
        };
        self.fetch_history(channel_id, before).await.map(Some)
    }

    async fn fetch_history(
        &self,
        channel_id: &str,
        before: DateTime<Utc>,
    ) -> Result<Vec<ChatMessage>> {
        let response = self
            .api
            .get(
                Route::Channels
                    .builder()
                    .path(channel_id)
                    .path("messages")
                    .query("before", before.to_rfc3339())
                    .query("count", HISTORY_PAGE)
                    .build(),
            )
            .await?
            .ok()?;
        let values: Vec<Value> = response.json()?;
        let mut messages = Vec::with_capacity(values.len());
        for value in values {
            messages.push(self.decode_message(channel_id, value).await?);
        }
        Ok(messages)
    }

    // ========================================================================
    // Wire decoding
    // ========================================================================

    /// Channels arrive as uuid lists; participants and message senders
    /// are resolved through the user cache, so repeated members cost
    /// one request at most.
    async fn decode_channel(&self, response: &Response) -> Result<Channel> {
        let id: String = response.body("id")?;
        let name: String = response.body_or("name", String::new());
        let persistence = Persistence::from_json(&response.body::<Value>("persistence")?)?;
        let owner_id: String = response.body("owner")?;
        let participant_ids: Vec<String> = response.body_or("participants", Vec::new());

        let owner = self.users.get(&owner_id).await?;
        let members = try_join_all(
            participant_ids
                .iter()
                .filter(|uuid| **uuid != owner_id)
                .map(|uuid| self.users.get(uuid)),
        )
        .await?;

        let mut messages = Vec::new();
        for value in response.body_or::<Vec<Value>>("messages", Vec::new()) {
            messages.push(self.decode_message(&id, value).await?);
        }

        if response.body_or("dm", false) {
            let own_uuid = self.api.own_uuid().ok_or(Error::NotLoggedIn)?;
            Channel::dm(id, name, persistence, owner, members, messages, &own_uuid)
        } else {
            Ok(Channel::group(
                id,
                name,
                persistence,
                owner,
                members,
                messages,
            ))
        }
    }

    async fn decode_message(&self, channel_id: &str, value: Value) -> Result<ChatMessage> {
        let field = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| Error::Decode(format!("missing message field `{name}`")))
        };
        let sender = self.users.get(&field("sender")?).await?;
        let sender_display_name = value
            .get("display_name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| sender.name.clone());
        let timestamp: DateTime<Utc> = field("timestamp")?
            .parse()
            .map_err(|_| Error::Decode("invalid message timestamp".into()))?;
        Ok(ChatMessage {
            id: field("id")?,
            channel_id: channel_id.to_string(),
            sender,
            sender_display_name,
            content: field("content")?,
            timestamp,
        })
    }
}

/// Marks a channel as having a history fetch in flight; releases the
/// mark when dropped, also on cancellation.
struct PaginationGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> PaginationGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        if set.lock().insert(id.to_string()) {
            Some(Self {
                set,
                id: id.to_string(),
            })
        } else {
            None
        }
    }
}

impl Drop for PaginationGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pagination_is_deduplicated_per_channel() {
        let pending = Mutex::new(HashSet::new());
        let first = PaginationGuard::acquire(&pending, "ch1");
        assert!(first.is_some());
        // a second fetch for the same channel is refused while pending
        assert!(PaginationGuard::acquire(&pending, "ch1").is_none());
        // other channels are unaffected
        assert!(PaginationGuard::acquire(&pending, "ch2").is_some());

        drop(first);
        assert!(PaginationGuard::acquire(&pending, "ch1").is_some());
    }
}
