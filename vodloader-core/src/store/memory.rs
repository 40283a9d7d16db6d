use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{
    BroadcastSession, Category, Channel, ChatMessage, LifecycleError, MetadataUpdate,
    RecordedPart,
};

use super::{
    CaptureStore, ChannelFilter, PartFilter, SessionFilter, StoreError, StoreResult,
};

#[derive(Debug, Default)]
struct Inner {
    channels: BTreeMap<String, Channel>,
    sessions: HashMap<Uuid, BroadcastSession>,
    metadata: Vec<MetadataUpdate>,
    parts: HashMap<Uuid, RecordedPart>,
    chat: HashMap<String, ChatMessage>,
}

/// Process-local store, used for ephemeral runs and tests.
#[derive(Debug, Default)]
pub struct MemoryCaptureStore {
    inner: Mutex<Inner>,
}

impl MemoryCaptureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata_updates(&self, channel_id: &str) -> Vec<MetadataUpdate> {
        self.lock()
            .metadata
            .iter()
            .filter(|update| update.channel_id == channel_id)
            .cloned()
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn not_found(kind: &'static str, id: impl ToString) -> StoreError {
    StoreError::NotFound {
        kind,
        id: id.to_string(),
    }
}

impl CaptureStore for MemoryCaptureStore {
    fn get_channel(&self, id: &str) -> StoreResult<Option<Channel>> {
        Ok(self.lock().channels.get(id).cloned())
    }

    fn list_channels(&self, filter: &ChannelFilter) -> StoreResult<Vec<Channel>> {
        Ok(self
            .lock()
            .channels
            .values()
            .filter(|channel| !filter.active_only || channel.active)
            .cloned()
            .collect())
    }

    fn save_channel(&self, channel: &Channel) -> StoreResult<()> {
        self.lock()
            .channels
            .insert(channel.id.clone(), channel.clone());
        Ok(())
    }

    fn delete_channel(&self, id: &str) -> StoreResult<bool> {
        let mut inner = self.lock();
        let removed = inner.channels.remove(id).is_some();
        if removed {
            inner.sessions.retain(|_, session| session.channel_id != id);
            inner.parts.retain(|_, part| part.channel_id != id);
            inner.metadata.retain(|update| update.channel_id != id);
        }
        Ok(removed)
    }

    fn create_session(&self, session: &BroadcastSession) -> StoreResult<()> {
        let mut inner = self.lock();
        if !inner.channels.contains_key(&session.channel_id) {
            return Err(not_found("channel", &session.channel_id));
        }
        inner.sessions.insert(session.id, session.clone());
        Ok(())
    }

    fn get_session(&self, id: Uuid) -> StoreResult<Option<BroadcastSession>> {
        Ok(self.lock().sessions.get(&id).cloned())
    }

    fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<BroadcastSession>> {
        let inner = self.lock();
        let mut sessions: Vec<BroadcastSession> = inner
            .sessions
            .values()
            .filter(|session| {
                filter
                    .channel_id
                    .as_deref()
                    .map_or(true, |id| session.channel_id == id)
                    && (!filter.open_only || !session.is_ended())
            })
            .cloned()
            .collect();
        sessions.sort_by_key(|session| session.started_at);
        if let Some(limit) = filter.limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    fn update_session_metadata(
        &self,
        id: Uuid,
        title: Option<&str>,
        category: Option<&Category>,
    ) -> StoreResult<()> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or_else(|| not_found("session", id))?;
        if session.is_ended() {
            return Err(LifecycleError::SessionAlreadyEnded(id).into());
        }
        if let Some(title) = title {
            session.title = Some(title.to_string());
        }
        if let Some(category) = category {
            session.category = Some(category.clone());
        }
        Ok(())
    }

    fn end_session(&self, id: Uuid, ended_at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.lock();
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or_else(|| not_found("session", id))?;
        session.end(ended_at)?;
        Ok(())
    }

    fn record_metadata_update(&self, update: &MetadataUpdate) -> StoreResult<()> {
        self.lock().metadata.push(update.clone());
        Ok(())
    }

    fn create_part(&self, part: &RecordedPart) -> StoreResult<()> {
        let mut inner = self.lock();
        if !inner.sessions.contains_key(&part.session_id) {
            return Err(not_found("session", part.session_id));
        }
        inner.parts.insert(part.id, part.clone());
        Ok(())
    }

    fn get_part(&self, id: Uuid) -> StoreResult<Option<RecordedPart>> {
        Ok(self.lock().parts.get(&id).cloned())
    }

    fn list_parts(&self, filter: &PartFilter) -> StoreResult<Vec<RecordedPart>> {
        let inner = self.lock();
        let mut parts: Vec<RecordedPart> = inner
            .parts
            .values()
            .filter(|part| filter.matches(part))
            .cloned()
            .collect();
        parts.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.part_number.cmp(&b.part_number))
        });
        if let Some(limit) = filter.limit {
            parts.truncate(limit);
        }
        Ok(parts)
    }

    fn end_part(&self, id: Uuid, ended_at: DateTime<Utc>) -> StoreResult<()> {
        let mut inner = self.lock();
        let part = inner
            .parts
            .get_mut(&id)
            .ok_or_else(|| not_found("part", id))?;
        part.end(ended_at)?;
        Ok(())
    }

    fn set_part_output(&self, id: Uuid, output: &Path) -> StoreResult<()> {
        let mut inner = self.lock();
        let part = inner
            .parts
            .get_mut(&id)
            .ok_or_else(|| not_found("part", id))?;
        part.output_path = Some(output.to_path_buf());
        Ok(())
    }

    fn delete_part(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.lock().parts.remove(&id).is_some())
    }

    fn save_chat_message(&self, message: &ChatMessage) -> StoreResult<bool> {
        let mut inner = self.lock();
        if inner.chat.contains_key(&message.id) {
            return Ok(false);
        }
        inner.chat.insert(message.id.clone(), message.clone());
        Ok(true)
    }

    fn chat_messages_between(
        &self,
        channel_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<ChatMessage>> {
        let inner = self.lock();
        let mut messages: Vec<ChatMessage> = inner
            .chat
            .values()
            .filter(|message| {
                message.channel_id == channel_id
                    && message.timestamp >= start
                    && message.timestamp <= end
            })
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(messages)
    }
}
