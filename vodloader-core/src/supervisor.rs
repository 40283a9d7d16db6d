//! Inbound notifications from the platform event source, fanned out to
//! per-channel capture sessions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::capture::{CaptureContext, CaptureHandle, CaptureReport, CaptureSession};
use crate::error::{Classify, FailureClass};
use crate::models::{Category, MetadataUpdate};
use crate::store::{SessionFilter, StoreResult};

#[derive(Debug, Clone, PartialEq)]
pub enum NotificationOutcome {
    Started,
    AlreadyRecording,
    Stopped(Option<CaptureReport>),
    NotRecording,
    MetadataRecorded { session_id: Option<Uuid> },
    UnknownChannel,
    InactiveChannel,
}

/// Keeps at most one running capture per channel.
#[derive(Debug)]
pub struct ChannelSupervisor {
    ctx: Arc<CaptureContext>,
    sessions: Mutex<HashMap<String, CaptureHandle>>,
}

impl ChannelSupervisor {
    pub fn new(ctx: Arc<CaptureContext>) -> Self {
        Self {
            ctx,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &Arc<CaptureContext> {
        &self.ctx
    }

    pub async fn on_online(&self, channel_id: &str) -> StoreResult<NotificationOutcome> {
        let Some(channel) = self.ctx.store.get_channel(channel_id)? else {
            warn!(channel_id, class = %FailureClass::DataInconsistency, "online notification for unknown channel");
            return Ok(NotificationOutcome::UnknownChannel);
        };
        if !channel.active {
            info!(channel = %channel.login, "ignoring online notification for inactive channel");
            return Ok(NotificationOutcome::InactiveChannel);
        }

        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.remove(channel_id) {
            if !handle.is_finished() {
                sessions.insert(channel_id.to_string(), handle);
                info!(channel = %channel.login, "channel already recording");
                return Ok(NotificationOutcome::AlreadyRecording);
            }
            log_report(channel_id, handle.join().await);
        }
        info!(channel = %channel.login, "channel went online; starting capture");
        let handle = CaptureSession::start(self.ctx.clone(), channel, None);
        sessions.insert(channel_id.to_string(), handle);
        Ok(NotificationOutcome::Started)
    }

    /// Stops the channel's capture and waits for its in-progress part to be
    /// finalized.
    pub async fn on_offline(&self, channel_id: &str) -> NotificationOutcome {
        let handle = self.sessions.lock().await.remove(channel_id);
        let Some(handle) = handle else {
            warn!(channel_id, "offline notification for a channel that is not recording");
            return NotificationOutcome::NotRecording;
        };
        info!(channel_id, state = %handle.state(), "channel went offline; stopping capture");
        handle.stop();
        NotificationOutcome::Stopped(log_report(channel_id, handle.join().await))
    }

    /// Persists a title/category change and applies it to the channel's open
    /// session, if any.
    pub async fn on_metadata_update(
        &self,
        channel_id: &str,
        title: Option<String>,
        category: Option<Category>,
    ) -> StoreResult<NotificationOutcome> {
        if self.ctx.store.get_channel(channel_id)?.is_none() {
            warn!(channel_id, class = %FailureClass::DataInconsistency, "metadata update for unknown channel");
            return Ok(NotificationOutcome::UnknownChannel);
        }
        let update = MetadataUpdate {
            id: Uuid::new_v4(),
            channel_id: channel_id.to_string(),
            title,
            category,
            recorded_at: Utc::now(),
        };
        self.ctx.store.record_metadata_update(&update)?;

        let open = self.ctx.store.list_sessions(&SessionFilter {
            channel_id: Some(channel_id.to_string()),
            open_only: true,
            limit: None,
        })?;
        let session_id = open.last().map(|session| session.id);
        if let Some(id) = session_id {
            self.ctx
                .store
                .update_session_metadata(id, update.title.as_deref(), update.category.as_ref())?;
        }
        info!(
            channel_id,
            title = update.title.as_deref().unwrap_or(""),
            category = update.category.as_ref().map(|c| c.name.as_str()).unwrap_or(""),
            session_id = ?session_id,
            "metadata updated"
        );
        Ok(NotificationOutcome::MetadataRecorded { session_id })
    }

    pub async fn is_recording(&self, channel_id: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(channel_id)
            .map_or(false, |handle| !handle.is_finished())
    }

    pub async fn active_channels(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        let mut ids: Vec<String> = sessions
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Stops every running session and waits for all of them.
    pub async fn shutdown(&self) -> Vec<CaptureReport> {
        let handles: Vec<(String, CaptureHandle)> = self.sessions.lock().await.drain().collect();
        for (_, handle) in &handles {
            handle.stop();
        }
        let mut reports = Vec::new();
        for (channel_id, handle) in handles {
            if let Some(report) = log_report(&channel_id, handle.join().await) {
                reports.push(report);
            }
        }
        info!(sessions = reports.len(), "capture supervisor stopped");
        reports
    }
}

fn log_report(
    channel_id: &str,
    result: crate::capture::CaptureResult<CaptureReport>,
) -> Option<CaptureReport> {
    match result {
        Ok(report) => {
            info!(
                channel_id,
                state = %report.final_state,
                parts = report.parts.len(),
                bytes = report.total_bytes(),
                "capture finished"
            );
            Some(report)
        }
        Err(err) => {
            error!(channel_id, class = %err.class(), error = %err, "capture failed");
            None
        }
    }
}
