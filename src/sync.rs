// src/sync.rs
//! Client-side chat synchronization: reconciles the optimistically
//! rendered question, the "assistant is thinking" indicator, and the
//! incrementally arriving answer with the durable message store.
//!
//! One submission is one round trip through the phases
//! `Idle -> Submitting -> Streaming -> Settled`. Placeholder entries are
//! tagged variants keyed by a per-submission token, so two concurrent
//! streams (say, two tabs) touch disjoint entries, and rollback removes
//! exactly what a submission synthesized. Settling always re-fetches from
//! the store — the source of truth — so the local view can never stay
//! diverged from the server's record.

use crate::models::message::{MessagePageResponse, MessageResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;
use uuid::Uuid;

/// Page size the client keeps cached for the chat view.
pub const FIRST_PAGE_LIMIT: i64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubmissionToken(Uuid);

impl SubmissionToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Submitting,
    Streaming,
    Settled,
}

/// A rendered chat entry. `Persisted` rows come from the store; the other
/// two exist only inside one submission's round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEntry {
    Persisted(MessageResponse),
    /// The optimistically inserted user question.
    Pending {
        token: SubmissionToken,
        text: String,
        created_at: DateTime<Utc>,
    },
    /// The answer as streamed so far.
    Streaming {
        token: SubmissionToken,
        text: String,
        created_at: DateTime<Utc>,
    },
}

impl ChatEntry {
    pub fn text(&self) -> &str {
        match self {
            ChatEntry::Persisted(m) => &m.text,
            ChatEntry::Pending { text, .. } => text,
            ChatEntry::Streaming { text, .. } => text,
        }
    }

    pub fn is_user_message(&self) -> bool {
        match self {
            ChatEntry::Persisted(m) => m.is_user_message,
            ChatEntry::Pending { .. } => true,
            ChatEntry::Streaming { .. } => false,
        }
    }

    fn belongs_to(&self, token: SubmissionToken) -> bool {
        match self {
            ChatEntry::Persisted(_) => false,
            ChatEntry::Pending { token: t, .. } | ChatEntry::Streaming { token: t, .. } => {
                *t == token
            }
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum SyncError {
    #[error("a submission is already in flight")]
    SubmissionInFlight,
    #[error("token does not name the active submission")]
    UnknownSubmission,
}

/// Undo-log entry: what a submission synthesized, and the draft to bring
/// back if it fails.
#[derive(Debug, Clone)]
struct UndoRecord {
    token: SubmissionToken,
    draft: String,
}

pub struct ChatSync {
    phase: Phase,
    draft: String,
    thinking: bool,
    /// Cached first page, newest first.
    entries: Vec<ChatEntry>,
    next_cursor: Option<String>,
    /// Bumped on submit so refreshes started earlier land stale and are
    /// discarded instead of clobbering the optimistic insert.
    refresh_epoch: u64,
    undo: Option<UndoRecord>,
    active: Option<SubmissionToken>,
    /// Running concatenation of the streamed answer. Each chunk rewrites
    /// the streaming entry to this total, so applying a chunk sequence is
    /// idempotent in its effect on the rendered text.
    accumulated: String,
}

impl Default for ChatSync {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatSync {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            draft: String::new(),
            thinking: false,
            entries: Vec::new(),
            next_cursor: None,
            refresh_epoch: 0,
            undo: None,
            active: None,
            accumulated: String::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, text: impl Into<String>) {
        self.draft = text.into();
    }

    pub fn thinking(&self) -> bool {
        self.thinking
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn next_cursor(&self) -> Option<&str> {
        self.next_cursor.as_deref()
    }

    /// Submission is locked from submit until settlement.
    pub fn is_locked(&self) -> bool {
        matches!(self.phase, Phase::Submitting | Phase::Streaming)
    }

    /// Idle -> Submitting. Snapshots the draft for rollback, clears the
    /// input, invalidates in-flight refreshes, prepends the optimistic
    /// user entry and raises the thinking flag. The caller opens the
    /// streaming request with the returned token.
    pub fn submit(&mut self) -> Result<SubmissionToken, SyncError> {
        if self.is_locked() {
            return Err(SyncError::SubmissionInFlight);
        }

        let token = SubmissionToken::new();
        self.undo = Some(UndoRecord {
            token,
            draft: self.draft.clone(),
        });

        let text = std::mem::take(&mut self.draft);
        self.refresh_epoch += 1;
        self.entries.insert(
            0,
            ChatEntry::Pending {
                token,
                text,
                created_at: Utc::now(),
            },
        );

        self.thinking = true;
        self.accumulated.clear();
        self.active = Some(token);
        self.phase = Phase::Submitting;

        Ok(token)
    }

    /// Feeds one received chunk. The first chunk moves Submitting ->
    /// Streaming and retires the thinking indicator; every chunk rewrites
    /// the streaming entry to the accumulated total.
    pub fn apply_chunk(&mut self, token: SubmissionToken, chunk: &str) -> Result<(), SyncError> {
        if self.active != Some(token) {
            return Err(SyncError::UnknownSubmission);
        }

        if self.phase == Phase::Submitting {
            self.phase = Phase::Streaming;
            self.thinking = false;
        }

        self.accumulated.push_str(chunk);

        let total = self.accumulated.clone();
        match self
            .entries
            .iter_mut()
            .find(|e| matches!(e, ChatEntry::Streaming { token: t, .. } if *t == token))
        {
            Some(ChatEntry::Streaming { text, .. }) => *text = total,
            _ => self.entries.insert(
                0,
                ChatEntry::Streaming {
                    token,
                    text: total,
                    created_at: Utc::now(),
                },
            ),
        }

        Ok(())
    }

    /// Streaming -> Settled on stream end. The placeholders stay rendered
    /// until the follow-up refresh replaces them with persisted rows.
    pub fn complete(&mut self, token: SubmissionToken) -> Result<(), SyncError> {
        if self.active != Some(token) {
            return Err(SyncError::UnknownSubmission);
        }

        self.phase = Phase::Settled;
        self.thinking = false;
        self.active = None;
        self.undo = None;
        self.accumulated.clear();
        Ok(())
    }

    /// -> Settled on transport error. Restores the draft, removes exactly
    /// the entries this submission synthesized and drops any partial
    /// answer. The caller still refreshes: if the question did persist
    /// server-side before the failure, it reappears from the store.
    pub fn fail(&mut self, token: SubmissionToken) -> Result<(), SyncError> {
        if self.active != Some(token) {
            return Err(SyncError::UnknownSubmission);
        }

        if let Some(undo) = self.undo.take() {
            if undo.token == token {
                self.draft = undo.draft;
            }
        }

        self.entries.retain(|e| !e.belongs_to(token));
        self.phase = Phase::Settled;
        self.thinking = false;
        self.active = None;
        self.accumulated.clear();
        Ok(())
    }

    /// Marks the start of a refresh; the returned epoch must accompany the
    /// fetched page to [`ChatSync::apply_refresh`].
    pub fn begin_refresh(&self) -> u64 {
        self.refresh_epoch
    }

    /// Replaces the cache with a freshly fetched first page. Stale epochs
    /// (a submit happened since the fetch started) and refreshes landing
    /// mid-stream are discarded; returns whether the page was applied.
    pub fn apply_refresh(&mut self, epoch: u64, page: MessagePageResponse) -> bool {
        if epoch != self.refresh_epoch || self.is_locked() {
            return false;
        }

        self.entries = page
            .messages
            .into_iter()
            .map(ChatEntry::Persisted)
            .collect();
        self.next_cursor = page.next_cursor;

        if self.phase == Phase::Settled {
            self.phase = Phase::Idle;
        }
        true
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct TransportError(pub String);

/// The wire seam the protocol drives: a streaming send and a first-page
/// fetch. The binary client implements this over HTTP; tests script it.
#[async_trait]
pub trait ChatTransport {
    async fn send_message(
        &self,
        file_id: &str,
        message: &str,
    ) -> Result<BoxStream<'static, Result<String, TransportError>>, TransportError>;

    async fn fetch_first_page(
        &self,
        file_id: &str,
        limit: i64,
    ) -> Result<MessagePageResponse, TransportError>;
}

/// Drives one full round trip: submit, stream, settle (success or
/// rollback), then the unconditional re-sync from the store. Each
/// received delta is handed to `on_delta` for rendering. Transport
/// failures are absorbed into the state machine; the only error out of
/// here is submitting while locked.
pub async fn run_submission<T: ChatTransport, F: FnMut(&str)>(
    sync: &mut ChatSync,
    transport: &T,
    file_id: &str,
    mut on_delta: F,
) -> Result<(), SyncError> {
    let message = sync.draft().to_string();
    let token = sync.submit()?;

    let mut failed = false;
    match transport.send_message(file_id, &message).await {
        Ok(mut stream) => {
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(text) => {
                        let _ = sync.apply_chunk(token, &text);
                        on_delta(&text);
                    }
                    Err(e) => {
                        tracing::warn!("Answer stream failed: {}", e);
                        failed = true;
                        break;
                    }
                }
            }
        }
        Err(e) => {
            tracing::warn!("Failed to open answer stream: {}", e);
            failed = true;
        }
    }

    if failed {
        let _ = sync.fail(token);
    } else {
        // A stream that ended without an explicit terminator is complete
        // as received.
        let _ = sync.complete(token);
    }

    let epoch = sync.begin_refresh();
    match transport.fetch_first_page(file_id, FIRST_PAGE_LIMIT).await {
        Ok(page) => {
            sync.apply_refresh(epoch, page);
        }
        Err(e) => {
            // The next view's refresh is idempotent and will self-correct.
            tracing::warn!("Refresh after settlement failed: {}", e);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn persisted(id: &str, text: &str, is_user: bool) -> MessageResponse {
        MessageResponse {
            id: id.to_string(),
            text: text.to_string(),
            is_user_message: is_user,
            created_at: Utc::now(),
        }
    }

    fn page(messages: Vec<MessageResponse>) -> MessagePageResponse {
        MessagePageResponse {
            messages,
            next_cursor: None,
        }
    }

    #[test]
    fn submit_inserts_optimistic_entry_and_raises_thinking() {
        let mut sync = ChatSync::new();
        sync.set_draft("What is the total?");

        let token = sync.submit().unwrap();

        assert_eq!(sync.phase(), Phase::Submitting);
        assert!(sync.thinking());
        assert!(sync.draft().is_empty());
        assert_eq!(sync.entries().len(), 1);
        assert!(sync.entries()[0].belongs_to(token));
        assert!(sync.entries()[0].is_user_message());
        assert_eq!(sync.entries()[0].text(), "What is the total?");
    }

    #[test]
    fn chunk_accumulation_is_idempotent_by_construction() {
        let mut split = ChatSync::new();
        split.set_draft("q");
        let token = split.submit().unwrap();
        split.apply_chunk(token, "Hel").unwrap();
        split.apply_chunk(token, "lo").unwrap();

        let mut whole = ChatSync::new();
        whole.set_draft("q");
        let token2 = whole.submit().unwrap();
        whole.apply_chunk(token2, "Hello").unwrap();

        assert_eq!(split.entries()[0].text(), "Hello");
        assert_eq!(split.entries()[0].text(), whole.entries()[0].text());
    }

    #[test]
    fn first_chunk_retires_thinking_and_enters_streaming() {
        let mut sync = ChatSync::new();
        sync.set_draft("q");
        let token = sync.submit().unwrap();
        assert!(sync.thinking());

        sync.apply_chunk(token, "A").unwrap();

        assert_eq!(sync.phase(), Phase::Streaming);
        assert!(!sync.thinking());
        // Streaming answer ahead of the pending question, newest first.
        assert!(!sync.entries()[0].is_user_message());
        assert!(sync.entries()[1].is_user_message());
    }

    #[test]
    fn failure_restores_draft_and_removes_only_synthesized_entries() {
        let mut sync = ChatSync::new();
        let pre_existing = page(vec![persisted("m1", "older turn", true)]);
        let epoch = sync.begin_refresh();
        assert!(sync.apply_refresh(epoch, pre_existing));

        sync.set_draft("What is the total?");
        let token = sync.submit().unwrap();
        sync.apply_chunk(token, "partial ans").unwrap();

        sync.fail(token).unwrap();

        assert_eq!(sync.phase(), Phase::Settled);
        assert!(!sync.thinking());
        assert_eq!(sync.draft(), "What is the total?");
        assert_eq!(sync.entries().len(), 1);
        assert_eq!(sync.entries()[0].text(), "older turn");
        assert!(sync
            .entries()
            .iter()
            .all(|e| matches!(e, ChatEntry::Persisted(_))));
    }

    #[test]
    fn submissions_are_locked_until_settled() {
        let mut sync = ChatSync::new();
        sync.set_draft("first");
        let token = sync.submit().unwrap();

        sync.set_draft("second");
        assert_eq!(sync.submit(), Err(SyncError::SubmissionInFlight));

        sync.apply_chunk(token, "x").unwrap();
        assert_eq!(sync.submit(), Err(SyncError::SubmissionInFlight));

        sync.complete(token).unwrap();
        assert!(sync.submit().is_ok());
    }

    #[test]
    fn stale_refresh_cannot_clobber_an_optimistic_insert() {
        let mut sync = ChatSync::new();

        // Refresh starts, then the user submits before it lands.
        let epoch = sync.begin_refresh();
        sync.set_draft("q");
        let token = sync.submit().unwrap();
        sync.apply_chunk(token, "answer").unwrap();
        sync.complete(token).unwrap();

        let applied = sync.apply_refresh(epoch, page(vec![]));

        assert!(!applied);
        assert_eq!(sync.entries().len(), 2);
    }

    #[test]
    fn refresh_is_discarded_while_a_stream_is_in_flight() {
        let mut sync = ChatSync::new();
        sync.set_draft("q");
        let token = sync.submit().unwrap();
        sync.apply_chunk(token, "partial").unwrap();

        let epoch = sync.begin_refresh();
        assert!(!sync.apply_refresh(epoch, page(vec![])));
        assert_eq!(sync.entries().len(), 2);
    }

    #[test]
    fn settled_refresh_replaces_placeholders_with_persisted_rows() {
        let mut sync = ChatSync::new();
        sync.set_draft("What is the total?");
        let token = sync.submit().unwrap();
        sync.apply_chunk(token, "42").unwrap();
        sync.complete(token).unwrap();

        let epoch = sync.begin_refresh();
        let applied = sync.apply_refresh(
            epoch,
            page(vec![
                persisted("a2", "42", false),
                persisted("a1", "What is the total?", true),
            ]),
        );

        assert!(applied);
        assert_eq!(sync.phase(), Phase::Idle);
        assert!(sync
            .entries()
            .iter()
            .all(|e| matches!(e, ChatEntry::Persisted(_))));
        assert_eq!(sync.entries()[0].text(), "42");
    }

    #[test]
    fn chunks_for_a_foreign_token_are_rejected() {
        let mut sync = ChatSync::new();
        sync.set_draft("q");
        let _token = sync.submit().unwrap();

        let foreign = SubmissionToken::new();
        assert_eq!(
            sync.apply_chunk(foreign, "x"),
            Err(SyncError::UnknownSubmission)
        );
    }

    /// Scripted transport: a fixed chunk sequence (or an opening error)
    /// and a canned first page for the settlement refresh.
    struct ScriptedTransport {
        chunks: Vec<Result<String, TransportError>>,
        refetch: MessagePageResponse,
        fail_open: bool,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatTransport for ScriptedTransport {
        async fn send_message(
            &self,
            _file_id: &str,
            message: &str,
        ) -> Result<BoxStream<'static, Result<String, TransportError>>, TransportError> {
            self.sent.lock().unwrap().push(message.to_string());
            if self.fail_open {
                return Err(TransportError("connection refused".to_string()));
            }
            Ok(futures::stream::iter(self.chunks.clone()).boxed())
        }

        async fn fetch_first_page(
            &self,
            _file_id: &str,
            _limit: i64,
        ) -> Result<MessagePageResponse, TransportError> {
            Ok(MessagePageResponse {
                messages: self.refetch.messages.clone(),
                next_cursor: self.refetch.next_cursor.clone(),
            })
        }
    }

    #[tokio::test]
    async fn full_round_trip_settles_against_the_store() {
        let transport = ScriptedTransport {
            chunks: vec![Ok("The total ".to_string()), Ok("is 42.".to_string())],
            refetch: page(vec![
                persisted("a2", "The total is 42.", false),
                persisted("a1", "What is the total?", true),
            ]),
            fail_open: false,
            sent: Mutex::new(Vec::new()),
        };

        let mut sync = ChatSync::new();
        sync.set_draft("What is the total?");
        run_submission(&mut sync, &transport, "f1", |_| {}).await.unwrap();

        assert_eq!(sync.phase(), Phase::Idle);
        assert!(!sync.thinking());
        assert_eq!(sync.entries().len(), 2);
        assert_eq!(sync.entries()[0].text(), "The total is 42.");
        assert_eq!(
            transport.sent.lock().unwrap().as_slice(),
            &["What is the total?".to_string()]
        );
    }

    #[tokio::test]
    async fn mid_stream_failure_rolls_back_then_resyncs() {
        // The question persisted server-side before the stream died, so
        // the settlement refresh brings it back from the store.
        let transport = ScriptedTransport {
            chunks: vec![
                Ok("part".to_string()),
                Err(TransportError("reset by peer".to_string())),
            ],
            refetch: page(vec![persisted("a1", "What is the total?", true)]),
            fail_open: false,
            sent: Mutex::new(Vec::new()),
        };

        let mut sync = ChatSync::new();
        sync.set_draft("What is the total?");
        run_submission(&mut sync, &transport, "f1", |_| {}).await.unwrap();

        assert_eq!(sync.phase(), Phase::Idle);
        // Draft came back at rollback; the refetch does not clear it.
        assert_eq!(sync.draft(), "What is the total?");
        assert_eq!(sync.entries().len(), 1);
        assert!(matches!(sync.entries()[0], ChatEntry::Persisted(_)));
    }

    #[tokio::test]
    async fn failure_to_open_the_stream_rolls_back_the_insert() {
        let transport = ScriptedTransport {
            chunks: vec![],
            refetch: page(vec![]),
            fail_open: true,
            sent: Mutex::new(Vec::new()),
        };

        let mut sync = ChatSync::new();
        sync.set_draft("hello?");
        run_submission(&mut sync, &transport, "f1", |_| {}).await.unwrap();

        assert_eq!(sync.draft(), "hello?");
        assert!(sync.entries().is_empty());
        assert!(!sync.thinking());
    }
}
