//! Per-conversation synchronization.
//!
//! [`ChatSyncController`] owns the authoritative timeline for one
//! conversation and reconciles REST history, the push stream and optimistic
//! sends into it. Every mutation goes through [`MessageTimeline::upsert`],
//! which keeps the list ordered and the ids unique no matter how often the
//! same message is delivered.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{ChatBackend, PushChannel, PushEvent, PushIdentity, UploadContext};
use crate::error::{ChatError, ChatResult};
use crate::grouping::{group, GroupItem};
use crate::image_cache::ImageCache;
use crate::image_processing::ImageProcessingError;
use crate::model::{
    Attachment, ConversationId, DeliveryState, Message, MessageId, ValidationError,
    MAX_CONTENT_LENGTH,
};
use crate::retry::{RetryEngine, RetryPolicy};

const PREFETCH_CONCURRENCY: usize = 4;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub read_receipt_debounce_ms: u64,
    pub history_retry: RetryPolicy,
    pub send_retry: RetryPolicy,
    pub upload_retry: RetryPolicy,
    pub push_connect_retry: RetryPolicy,
    pub prefetch_attachments: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            read_receipt_debounce_ms: 500,
            history_retry: RetryPolicy::standard(),
            send_retry: RetryPolicy::standard(),
            upload_retry: RetryPolicy::standard(),
            push_connect_retry: RetryPolicy::persistent(),
            prefetch_attachments: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    Unchanged,
}

// Untimestamped messages sort after every timestamped one.
fn order_key(message: &Message) -> (bool, u64) {
    match message.created_at {
        Some(ts) => (false, ts.0),
        None => (true, 0),
    }
}

/// Ordered, id-unique message list.
#[derive(Clone, Debug, Default)]
pub struct MessageTimeline {
    messages: Vec<Message>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert in timestamp order (after equal keys) or replace the entry with
    /// the same id. A replacement whose timestamp changed is moved.
    pub fn upsert(&mut self, message: Message) -> MergeOutcome {
        match self.position(&message.id) {
            Some(index) if self.messages[index] == message => MergeOutcome::Unchanged,
            Some(index) => {
                if order_key(&self.messages[index]) == order_key(&message) {
                    self.messages[index] = message;
                } else {
                    self.messages.remove(index);
                    self.insert_ordered(message);
                }
                MergeOutcome::Replaced
            }
            None => {
                self.insert_ordered(message);
                MergeOutcome::Inserted
            }
        }
    }

    pub fn remove(&mut self, id: &MessageId) -> Option<Message> {
        self.position(id).map(|index| self.messages.remove(index))
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn set_delivery_state(&mut self, id: &MessageId, state: DeliveryState) -> bool {
        match self.messages.iter_mut().find(|m| &m.id == id) {
            Some(message) => {
                message.delivery_state = state;
                true
            }
            None => false,
        }
    }

    /// Newest message the server knows about.
    pub fn latest_confirmed_id(&self) -> Option<&MessageId> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.delivery_state == DeliveryState::Sent)
            .map(|m| &m.id)
    }

    pub fn image_urls(&self) -> Vec<String> {
        self.messages
            .iter()
            .flat_map(|m| m.image_urls())
            .map(str::to_owned)
            .collect()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    fn insert_ordered(&mut self, message: Message) {
        let key = order_key(&message);
        let at = self.messages.partition_point(|m| order_key(m) <= key);
        self.messages.insert(at, message);
    }
}

/// A send that did not go through. `restored_text` goes back into the
/// composer so the user can resend.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("message not sent: {error}")]
pub struct SendFailure {
    /// Id of the timeline entry now marked failed, if one was created.
    pub message_id: Option<MessageId>,
    pub restored_text: String,
    pub error: ChatError,
}

pub type TimelineSnapshot = Arc<[Message]>;

/// A debounced receipt. `claimed` flips once, either when the timer fires
/// or when a newer receipt supersedes this one, whichever happens first.
struct PendingReceipt {
    handle: JoinHandle<()>,
    claimed: Arc<AtomicBool>,
}

#[derive(Default)]
struct BackgroundTasks {
    mark_read: Option<PendingReceipt>,
    push_pump: Option<JoinHandle<()>>,
    last_marked: Option<MessageId>,
}

struct SyncInner {
    conversation: ConversationId,
    identity: PushIdentity,
    backend: Arc<dyn ChatBackend>,
    retry: RetryEngine,
    images: ImageCache,
    config: SyncConfig,
    timeline: RwLock<MessageTimeline>,
    snapshots: watch::Sender<TimelineSnapshot>,
    cancel: CancellationToken,
    tasks: Mutex<BackgroundTasks>,
}

impl SyncInner {
    fn tasks(&self) -> MutexGuard<'_, BackgroundTasks> {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn mark_read_latest(&self) {
        let latest = self.timeline.read().await.latest_confirmed_id().cloned();
        let Some(latest) = latest else {
            return;
        };
        if self.tasks().last_marked.as_ref() == Some(&latest) {
            debug!(upto = %latest, "already marked read");
            return;
        }

        match self.backend.mark_read(&self.conversation, &latest).await {
            Ok(()) => {
                counter!("chat_sync.mark_read_calls").increment(1);
                debug!(upto = %latest, "conversation marked read");
                self.tasks().last_marked = Some(latest);
            }
            Err(e) => warn!(error = %e, "mark read failed"),
        }
    }
}

/// One per open conversation. Cheap to clone; clones drive the same timeline.
#[derive(Clone)]
pub struct ChatSyncController {
    inner: Arc<SyncInner>,
}

impl ChatSyncController {
    pub fn new(
        conversation: ConversationId,
        identity: PushIdentity,
        backend: Arc<dyn ChatBackend>,
        retry: RetryEngine,
        images: ImageCache,
        config: SyncConfig,
    ) -> Self {
        let (snapshots, _) = watch::channel(TimelineSnapshot::from(Vec::new()));
        Self {
            inner: Arc::new(SyncInner {
                conversation,
                identity,
                backend,
                retry,
                images,
                config,
                timeline: RwLock::new(MessageTimeline::new()),
                snapshots,
                cancel: CancellationToken::new(),
                tasks: Mutex::new(BackgroundTasks::default()),
            }),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.inner.conversation
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Receives a fresh snapshot after every timeline change.
    pub fn subscribe(&self) -> watch::Receiver<TimelineSnapshot> {
        self.inner.snapshots.subscribe()
    }

    pub async fn messages(&self) -> Vec<Message> {
        self.inner.timeline.read().await.messages().to_vec()
    }

    pub async fn groups(&self) -> Vec<GroupItem> {
        let timeline = self.inner.timeline.read().await;
        group(timeline.messages(), &self.inner.identity.user_id)
    }

    /// Fetch history and merge it. Returns how many messages were new.
    #[instrument(skip(self), fields(conversation = %self.inner.conversation))]
    pub async fn load_history(&self) -> ChatResult<usize> {
        let inner = &self.inner;
        let messages = inner
            .retry
            .execute(&inner.config.history_retry, &inner.cancel, || {
                inner.backend.fetch_messages(&inner.conversation)
            })
            .await?;

        counter!("chat_sync.history_loads").increment(1);
        let fetched = messages.len();
        let inserted = self.ingest(messages).await;
        info!(fetched, inserted, "history merged");
        Ok(inserted)
    }

    /// Subscribe, connect and start pumping push events into the timeline.
    #[instrument(skip(self, channel, token), fields(conversation = %self.inner.conversation))]
    pub async fn run_push(&self, channel: Arc<dyn PushChannel>, token: &str) -> ChatResult<()> {
        let events = channel.subscribe();
        let inner = &self.inner;
        inner
            .retry
            .execute(&inner.config.push_connect_retry, &inner.cancel, || {
                channel.connect(token, &inner.identity)
            })
            .await?;

        self.spawn_pump(events);
        info!("push pump started");
        Ok(())
    }

    pub async fn handle_push_event(&self, event: PushEvent) {
        match event {
            PushEvent::Message(message) => {
                let from_other =
                    !message.is_system() && !message.is_from(&self.inner.identity.user_id);
                self.ingest(vec![message]).await;
                if from_other {
                    self.schedule_mark_read();
                }
            }
            PushEvent::Connected => debug!("push channel connected"),
            PushEvent::Reconnected => {
                info!("push channel reconnected, refetching history");
                if let Err(e) = self.load_history().await {
                    warn!(error = %e, "history refetch after reconnect failed");
                }
            }
            PushEvent::Disconnected { reason } => {
                info!(reason = reason.as_deref().unwrap_or("none"), "push channel disconnected");
            }
        }
    }

    /// Optimistically append a text message and deliver it.
    #[instrument(skip_all, fields(conversation = %self.inner.conversation))]
    pub async fn send_text(&self, text: impl Into<String>) -> Result<Message, SendFailure> {
        let text = text.into();
        let message = Message::outgoing(
            self.inner.identity.user_id.clone(),
            self.inner.identity.display_name.clone(),
            Some(text.clone()),
            Vec::new(),
        )
        .map_err(|e| SendFailure {
            message_id: None,
            restored_text: text.clone(),
            error: e.into(),
        })?;

        self.deliver(message, text).await
    }

    /// Resend a message previously marked failed.
    #[instrument(skip(self), fields(conversation = %self.inner.conversation))]
    pub async fn retry_send(&self, id: &MessageId) -> Result<Message, SendFailure> {
        let existing = self.inner.timeline.read().await.get(id).cloned();
        let Some(message) = existing else {
            return Err(SendFailure {
                message_id: Some(id.clone()),
                restored_text: String::new(),
                error: ChatError::unknown_message(id),
            });
        };

        let restored = message.content.clone().unwrap_or_default();
        if message.delivery_state != DeliveryState::Failed {
            return Err(SendFailure {
                message_id: Some(id.clone()),
                restored_text: restored,
                error: ChatError::invalid_state("only failed messages can be resent"),
            });
        }

        self.deliver(message.with_delivery_state(DeliveryState::Sending), restored)
            .await
    }

    /// Upload `bytes`, seed the image cache, then send a message carrying the
    /// uploaded URL and optional caption.
    #[instrument(skip(self, bytes, caption), fields(size = bytes.len()))]
    pub async fn send_image(
        &self,
        bytes: Bytes,
        filename: &str,
        caption: Option<String>,
    ) -> Result<Message, SendFailure> {
        let restored = caption.clone().unwrap_or_default();
        let fail = |error: ChatError| SendFailure {
            message_id: None,
            restored_text: restored.clone(),
            error,
        };

        if restored.len() > MAX_CONTENT_LENGTH {
            return Err(fail(
                ValidationError::ContentTooLong {
                    len: restored.len(),
                    max: MAX_CONTENT_LENGTH,
                }
                .into(),
            ));
        }

        let format = image::guess_format(&bytes)
            .map_err(|_| fail(ImageProcessingError::UnsupportedFormat.into()))?;
        let context = UploadContext {
            conversation_id: self.inner.conversation.clone(),
            content_type: format.to_mime_type().to_string(),
        };

        let inner = &self.inner;
        let url = inner
            .retry
            .execute(&inner.config.upload_retry, &inner.cancel, || {
                inner.backend.upload_image(bytes.clone(), filename, &context)
            })
            .await
            .map_err(|e| fail(e.into()))?;
        debug!("image uploaded");

        inner.images.insert_bytes(&url, bytes.to_vec()).await;

        let caption = caption.filter(|c| !c.trim().is_empty());
        let message = Message::outgoing(
            inner.identity.user_id.clone(),
            inner.identity.display_name.clone(),
            caption,
            vec![Attachment::image(url)],
        )
        .map_err(|e| fail(e.into()))?;

        self.deliver(message, restored).await
    }

    /// Debounced read receipt: replaces a pending one that has not fired
    /// yet and fires after `read_receipt_debounce_ms` for the newest message
    /// at that time. A receipt already in flight is left to complete.
    pub fn schedule_mark_read(&self) {
        let delay = Duration::from_millis(self.inner.config.read_receipt_debounce_ms);
        let inner = self.inner.clone();
        let claimed = Arc::new(AtomicBool::new(false));
        let fire = claimed.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if fire.swap(true, AtomicOrdering::AcqRel) {
                return;
            }
            inner.mark_read_latest().await;
        });

        let pending = PendingReceipt { handle, claimed };
        if let Some(previous) = self.inner.tasks().mark_read.replace(pending) {
            if !previous.claimed.swap(true, AtomicOrdering::AcqRel) {
                previous.handle.abort();
            }
        }
    }

    /// Cancel pending retries, the debounced receipt and the push pump.
    pub fn close(&self) {
        self.inner.cancel.cancel();
        let mut tasks = self.inner.tasks();
        if let Some(pending) = tasks.mark_read.take() {
            pending.handle.abort();
        }
        if let Some(handle) = tasks.push_pump.take() {
            handle.abort();
        }
        info!(conversation = %self.inner.conversation, "chat sync closed");
    }

    /// Close and drop every cached image attached to this conversation.
    pub async fn finalize(&self) -> usize {
        self.close();
        let urls = self.inner.timeline.read().await.image_urls();
        match self.inner.images.remove_urls(&urls).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "failed to invalidate conversation images");
                0
            }
        }
    }

    async fn deliver(&self, message: Message, restored_text: String) -> Result<Message, SendFailure> {
        let id = message.id.clone();
        self.apply(|timeline| {
            timeline.upsert(message.clone());
        })
        .await;

        let inner = &self.inner;
        let result = inner
            .retry
            .execute(&inner.config.send_retry, &inner.cancel, || {
                inner.backend.send_message(&inner.conversation, &message)
            })
            .await;

        match result {
            Ok(confirmed) => {
                let confirmed = confirmed.with_delivery_state(DeliveryState::Sent);
                self.apply(|timeline| {
                    if confirmed.id != id {
                        timeline.remove(&id);
                    }
                    timeline.upsert(confirmed.clone());
                })
                .await;
                counter!("chat_sync.messages_sent").increment(1);
                Ok(confirmed)
            }
            Err(e) => {
                let error = ChatError::from(e);
                self.apply(|timeline| {
                    // A push echo may already have confirmed it.
                    if timeline.get(&id).is_some_and(|m| m.delivery_state.is_pending()) {
                        timeline.set_delivery_state(&id, DeliveryState::Failed);
                    }
                })
                .await;
                counter!("chat_sync.send_failures").increment(1);
                warn!(message_id = %id, error = %error, "send failed, restoring text");
                Err(SendFailure {
                    message_id: Some(id),
                    restored_text,
                    error,
                })
            }
        }
    }

    async fn ingest(&self, messages: Vec<Message>) -> usize {
        let mut urls = Vec::new();
        if self.inner.config.prefetch_attachments {
            for message in &messages {
                urls.extend(message.image_urls().map(str::to_owned));
                urls.extend(message.sender_avatar.clone());
            }
        }

        let mut inserted = 0;
        let mut duplicates = 0;
        self.apply(|timeline| {
            for message in messages {
                match timeline.upsert(message) {
                    MergeOutcome::Inserted => inserted += 1,
                    MergeOutcome::Replaced | MergeOutcome::Unchanged => duplicates += 1,
                }
            }
        })
        .await;

        counter!("chat_sync.messages_merged").increment(inserted as u64);
        if duplicates > 0 {
            counter!("chat_sync.duplicates_absorbed").increment(duplicates as u64);
            debug!(duplicates, "duplicate deliveries absorbed");
        }

        self.prefetch(urls);
        inserted
    }

    /// Mutate the timeline and publish the result under the same lock.
    async fn apply(&self, mutate: impl FnOnce(&mut MessageTimeline)) {
        let mut timeline = self.inner.timeline.write().await;
        mutate(&mut timeline);
        self.inner
            .snapshots
            .send_replace(TimelineSnapshot::from(timeline.messages()));
    }

    fn prefetch(&self, mut urls: Vec<String>) {
        urls.sort();
        urls.dedup();
        urls.retain(|url| !self.inner.images.contains_in_memory(url));
        if urls.is_empty() {
            return;
        }

        let images = self.inner.images.clone();
        let cancel = self.inner.cancel.clone();
        tokio::spawn(async move {
            let count = urls.len();
            let work = stream::iter(urls).for_each_concurrent(PREFETCH_CONCURRENCY, |url| {
                let images = images.clone();
                async move {
                    if images.resolve(&url).await.is_none() {
                        debug!("attachment prefetch missed");
                    }
                }
            });
            tokio::select! {
                _ = cancel.cancelled() => debug!("attachment prefetch cancelled"),
                _ = work => debug!(count, "attachment prefetch finished"),
            }
        });
    }

    fn spawn_pump(&self, mut events: BoxStream<'static, PushEvent>) {
        let controller = self.clone();
        let cancel = self.inner.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.next() => event,
                };
                match event {
                    Some(event) => controller.handle_push_event(event).await,
                    None => {
                        debug!("push stream ended");
                        break;
                    }
                }
            }
        });

        if let Some(previous) = self.inner.tasks().push_pump.replace(handle) {
            previous.abort();
        }
    }
}

impl std::fmt::Debug for ChatSyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSyncController")
            .field("conversation", &self.inner.conversation)
            .field("closed", &self.is_closed())
            .finish()
    }
}
