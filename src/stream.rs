//! Streaming session controller.
//!
//! A turn moves `Idle -> Submitting -> Streaming` and always settles in
//! `Completed`, `Aborted` or `Failed`, which holds until the outcome is
//! acknowledged or the next turn begins and the session returns to `Idle`.
//! Fragments accumulate in the session's
//! live buffer; committed history only changes when the turn settles, and the
//! live buffer is committed at most once per turn.

use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::conversation::Conversation;
use crate::models::ModelProfile;
use crate::providers::{ChatMessage, ChatRequest, LlmProvider, ProviderError};
use crate::reduce::{
    self, DEFAULT_TRUNCATE_TARGET, HistoryOptimizer, PlaceholderOptimizer, ReductionWindow,
};
use crate::sanitize::sanitize_input;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("a response is still streaming for this conversation")]
    Busy,
    #[error("nothing to send after sanitizing input")]
    EmptyInput,
    #[error("no conversation is active")]
    NoActiveConversation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamStatus {
    #[default]
    Idle,
    Submitting,
    Streaming,
    Completed,
    Aborted,
    Failed,
}

impl StreamStatus {
    pub fn is_active(self) -> bool {
        matches!(self, StreamStatus::Submitting | StreamStatus::Streaming)
    }

    pub fn is_settled(self) -> bool {
        matches!(self, StreamStatus::Completed | StreamStatus::Aborted | StreamStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StreamStatus::Idle => "idle",
            StreamStatus::Submitting => "submitting",
            StreamStatus::Streaming => "streaming",
            StreamStatus::Completed => "completed",
            StreamStatus::Aborted => "aborted",
            StreamStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Authorization,
    Quota,
    RateLimit,
    ContextLength,
    Other,
}

const CONTEXT_PATTERNS: &[&str] = &[
    "context_length_exceeded",
    "context length",
    "maximum context",
    "context window",
    "prompt is too long",
    "too many tokens",
    "reduce the length",
];
const AUTH_PATTERNS: &[&str] = &[
    "status 401",
    "status 403",
    "unauthorized",
    "invalid api key",
    "invalid_api_key",
    "incorrect api key",
    "authentication",
    "permission_error",
];
const QUOTA_PATTERNS: &[&str] = &["insufficient_quota", "quota", "billing", "credit balance"];
const RATE_PATTERNS: &[&str] = &[
    "status 429",
    "rate limit",
    "rate_limit",
    "too many requests",
    "overloaded",
];

impl FailureKind {
    /// Pattern-matches rendered error text. Length problems win over
    /// everything else, and quota wins over rate limiting since some providers
    /// report exhausted quota as a 429.
    pub fn classify(error: &str) -> Self {
        let e = error.to_lowercase();
        let any = |patterns: &[&str]| patterns.iter().any(|p| e.contains(p));
        if any(CONTEXT_PATTERNS) {
            FailureKind::ContextLength
        } else if any(AUTH_PATTERNS) {
            FailureKind::Authorization
        } else if any(QUOTA_PATTERNS) {
            FailureKind::Quota
        } else if any(RATE_PATTERNS) {
            FailureKind::RateLimit
        } else {
            FailureKind::Other
        }
    }

    /// The synthetic assistant message recorded for a failed turn.
    pub fn message(self, detail: &str) -> String {
        let lead = match self {
            FailureKind::Authorization => {
                "Authentication with the provider failed. Check the configured API key."
            }
            FailureKind::Quota => "The provider reports that the account quota or billing limit is exhausted.",
            FailureKind::RateLimit => "The provider is rate limiting requests. Wait a moment before retrying.",
            FailureKind::ContextLength => {
                "The conversation exceeded the model's context length. Older messages will be trimmed on the next attempt."
            }
            FailureKind::Other => "The request failed.",
        };
        format!("{lead}\n\nError: {detail}")
    }
}

/// Per-conversation streaming state: status, cancel handle, live buffer.
#[derive(Debug, Default)]
pub struct StreamSession {
    status: StreamStatus,
    cancel: Option<CancellationToken>,
    live: String,
}

impl StreamSession {
    pub fn status(&self) -> StreamStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Text received so far for the in-flight turn.
    pub fn live_buffer(&self) -> &str {
        &self.live
    }

    /// Signals cancellation of the in-flight turn. Idempotent; no-op when idle.
    pub fn cancel(&self) {
        if let Some(token) = &self.cancel {
            token.cancel();
        }
    }

    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.cancel.clone()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    /// Settles an active turn as aborted, committing any partial text.
    /// Returns the committed text; later calls return `None`.
    pub fn abort(&mut self, history: &mut Vec<ChatMessage>) -> Option<String> {
        self.cancel();
        self.settle(history, StreamStatus::Aborted)
    }

    /// Returns a settled session to `Idle`, yielding the status it settled in.
    pub fn acknowledge(&mut self) -> Option<StreamStatus> {
        if !self.status.is_settled() {
            return None;
        }
        Some(std::mem::replace(&mut self.status, StreamStatus::Idle))
    }

    fn begin(&mut self) -> CancellationToken {
        self.acknowledge();
        let token = CancellationToken::new();
        self.status = StreamStatus::Submitting;
        self.cancel = Some(token.clone());
        self.live.clear();
        token
    }

    fn mark_streaming(&mut self) {
        if self.status == StreamStatus::Submitting {
            self.status = StreamStatus::Streaming;
        }
    }

    fn push(&mut self, fragment: &str) {
        self.live.push_str(fragment);
    }

    fn settle(&mut self, history: &mut Vec<ChatMessage>, status: StreamStatus) -> Option<String> {
        if !self.is_active() {
            return None;
        }
        self.status = status;
        self.cancel = None;
        let text = std::mem::take(&mut self.live);
        if text.is_empty() {
            return None;
        }
        history.push(ChatMessage::assistant(text.clone()));
        Some(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { text: String },
    Aborted { partial: Option<String> },
    Failed { kind: FailureKind, message: String },
}

impl TurnOutcome {
    pub fn status(&self) -> StreamStatus {
        match self {
            TurnOutcome::Completed { .. } => StreamStatus::Completed,
            TurnOutcome::Aborted { .. } => StreamStatus::Aborted,
            TurnOutcome::Failed { .. } => StreamStatus::Failed,
        }
    }
}

/// A submitted turn waiting to be streamed. Dropping it unstreamed cancels
/// the turn so the conversation can accept the next submission.
#[derive(Debug)]
pub struct PendingTurn {
    request: ChatRequest,
    cancel: CancellationToken,
    model: ModelProfile,
    elided: usize,
    started: bool,
}

impl PendingTurn {
    pub fn request(&self) -> &ChatRequest {
        &self.request
    }

    /// History messages left out of the request by reduction.
    pub fn elided(&self) -> usize {
        self.elided
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl Drop for PendingTurn {
    fn drop(&mut self) {
        if !self.started {
            self.cancel.cancel();
        }
    }
}

// Holds the conversation for the duration of a stream. If the stream future is
// dropped mid-flight, the turn still settles as aborted.
struct ActiveTurn<'a> {
    conv: &'a mut Conversation,
    cancel: CancellationToken,
}

impl ActiveTurn<'_> {
    fn abort(&mut self) -> TurnOutcome {
        let conv = &mut *self.conv;
        let partial = conv.session.settle(&mut conv.messages, StreamStatus::Aborted);
        tracing::info!(
            conversation = %conv.id,
            partial_chars = partial.as_ref().map_or(0, String::len),
            "turn aborted"
        );
        TurnOutcome::Aborted { partial }
    }

    fn complete(&mut self) -> TurnOutcome {
        let conv = &mut *self.conv;
        let text = conv
            .session
            .settle(&mut conv.messages, StreamStatus::Completed)
            .unwrap_or_default();
        conv.reduction = None;
        tracing::info!(conversation = %conv.id, chars = text.len(), "turn completed");
        TurnOutcome::Completed { text }
    }

    fn fail(&mut self, err: &ProviderError, system: &str, model: &ModelProfile, target: f64) -> TurnOutcome {
        let detail = err.to_string();
        let kind = FailureKind::classify(&detail);
        let conv = &mut *self.conv;
        conv.session.settle(&mut conv.messages, StreamStatus::Failed);

        let retained = (kind == FailureKind::ContextLength).then(|| {
            let sent = conv.effective_history();
            reduce::truncate_to_target(&sent, system, model, target)
        });

        let message = kind.message(&detail);
        conv.messages.push(ChatMessage::assistant(message.clone()));
        if let Some(r) = retained {
            tracing::info!(
                conversation = %conv.id,
                kept = r.messages.len(),
                elided = r.elided,
                "retaining truncated window after length rejection"
            );
            conv.reduction = Some(ReductionWindow {
                messages: r.messages,
                covered: conv.messages.len(),
            });
        }
        tracing::warn!(conversation = %conv.id, kind = ?kind, error = %detail, "turn failed");
        TurnOutcome::Failed { kind, message }
    }
}

impl Drop for ActiveTurn<'_> {
    fn drop(&mut self) {
        if self.conv.session.is_active() {
            self.cancel.cancel();
            let conv = &mut *self.conv;
            conv.session.settle(&mut conv.messages, StreamStatus::Aborted);
        }
    }
}

pub struct StreamController {
    provider: Arc<dyn LlmProvider>,
    optimizer: Box<dyn HistoryOptimizer>,
    system: String,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    truncate_target: f64,
}

impl StreamController {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            optimizer: Box::new(PlaceholderOptimizer::default()),
            system: String::new(),
            temperature: None,
            max_tokens: None,
            truncate_target: DEFAULT_TRUNCATE_TARGET,
        }
    }

    pub fn with_optimizer(mut self, optimizer: Box<dyn HistoryOptimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_truncate_target(mut self, target: f64) -> Self {
        self.truncate_target = target;
        self
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    /// Submitting phase: sanitize, append the user message, reduce history and
    /// build the request. Nothing is sent until [`stream`](Self::stream).
    pub async fn submit(
        &self,
        conv: &mut Conversation,
        raw_input: &str,
        model: &ModelProfile,
    ) -> Result<PendingTurn, StreamError> {
        if conv.session.is_active() {
            if !conv.session.is_cancel_requested() {
                return Err(StreamError::Busy);
            }
            conv.session.abort(&mut conv.messages);
        }
        let text = sanitize_input(raw_input);
        if text.is_empty() {
            return Err(StreamError::EmptyInput);
        }

        let cancel = conv.session.begin();
        let prior = conv.effective_history();
        let user = ChatMessage::user(text);
        conv.messages.push(user.clone());
        conv.draft.clear();

        let reduced = reduce::reduce_history(
            self.optimizer.as_ref(),
            &prior,
            &self.system,
            model,
            self.truncate_target,
        )
        .await;
        let elided = reduced.elided;
        let mut messages = reduced.messages;
        messages.push(user);
        tracing::debug!(
            conversation = %conv.id,
            model = %model.id,
            turns = messages.len(),
            elided,
            "turn submitted"
        );

        let request = ChatRequest {
            model: model.id.clone(),
            system: (!self.system.is_empty()).then(|| self.system.clone()),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };
        Ok(PendingTurn {
            request,
            cancel,
            model: model.clone(),
            elided,
            started: false,
        })
    }

    /// Streaming phase. `on_fragment` sees each fragment in arrival order after
    /// it has been appended to the live buffer.
    pub async fn stream<F>(&self, conv: &mut Conversation, mut turn: PendingTurn, mut on_fragment: F) -> TurnOutcome
    where
        F: FnMut(&str),
    {
        turn.started = true;
        let request = std::mem::take(&mut turn.request);
        let cancel = turn.cancel.clone();
        let model = turn.model.clone();
        drop(turn);

        let mut active = ActiveTurn { conv, cancel: cancel.clone() };
        if cancel.is_cancelled() || !active.conv.session.is_active() {
            return active.abort();
        }

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            res = self.provider.chat_stream(request, cancel.clone()) => Some(res),
        };
        let mut fragments = match opened {
            None => return active.abort(),
            Some(Err(e)) => return active.fail(&e, &self.system, &model, self.truncate_target),
            Some(Ok(s)) => s,
        };
        active.conv.session.mark_streaming();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = fragments.next() => Some(next),
            };
            let Some(next) = next else {
                // Fragments the provider had already yielded still belong to the turn.
                while let Some(Some(Ok(fragment))) = fragments.next().now_or_never() {
                    active.conv.session.push(&fragment);
                    on_fragment(&fragment);
                }
                return active.abort();
            };
            match next {
                Some(Ok(fragment)) => {
                    active.conv.session.push(&fragment);
                    on_fragment(&fragment);
                }
                Some(Err(e)) => return active.fail(&e, &self.system, &model, self.truncate_target),
                None => break,
            }
        }

        // Providers end their stream quietly when cancelled.
        if cancel.is_cancelled() {
            return active.abort();
        }
        active.complete()
    }

    /// Submit and stream in one call.
    pub async fn send<F>(
        &self,
        conv: &mut Conversation,
        raw_input: &str,
        model: &ModelProfile,
        on_fragment: F,
    ) -> Result<TurnOutcome, StreamError>
    where
        F: FnMut(&str),
    {
        let turn = self.submit(conv, raw_input, model).await?;
        Ok(self.stream(conv, turn, on_fragment).await)
    }
}
