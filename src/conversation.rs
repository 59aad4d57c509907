//! Conversations and the registry that owns per-conversation state.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::UsageSnapshot;
use crate::models::ModelProfile;
use crate::providers::ChatMessage;
use crate::reduce::ReductionWindow;
use crate::session::{KeyValueStore, StoreError};
use crate::stream::{PendingTurn, StreamController, StreamError, StreamSession};
use crate::task::BudgetMonitor;
use crate::window::{ChatView, WindowConfig};

/// Store key holding the saved conversation list.
pub const CONVERSATIONS_KEY: &str = "conversations";

const TITLE_CHARS: usize = 48;

#[derive(Debug)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub draft: String,
    pub session: StreamSession,
    /// Set after a length rejection; cleared by the next completed turn.
    pub reduction: Option<ReductionWindow>,
}

impl Conversation {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: String::new(),
            messages: Vec::new(),
            draft: String::new(),
            session: StreamSession::default(),
            reduction: None,
        }
    }

    /// History as the next request would see it, before budget reduction.
    pub fn effective_history(&self) -> Vec<ChatMessage> {
        match &self.reduction {
            Some(window) => window.apply(&self.messages),
            None => self.messages.clone(),
        }
    }

    /// Committed messages plus the live buffer while a turn is in flight.
    pub fn item_count(&self) -> usize {
        self.messages.len() + usize::from(self.session.is_active())
    }

    /// Text of each renderable item, live buffer last.
    pub fn items(&self) -> Vec<&str> {
        let mut items: Vec<&str> = self.messages.iter().map(|m| m.content.as_str()).collect();
        if self.session.is_active() {
            items.push(self.session.live_buffer());
        }
        items
    }

    /// Title for listings: explicit title, else the first user line.
    pub fn display_title(&self) -> String {
        if !self.title.is_empty() {
            return self.title.clone();
        }
        let first = self
            .messages
            .first()
            .and_then(|m| m.content.lines().next())
            .unwrap_or("(empty)");
        let mut title: String = first.chars().take(TITLE_CHARS).collect();
        if first.chars().count() > TITLE_CHARS {
            title.push('…');
        }
        title
    }

    pub fn to_stored(&self) -> StoredConversation {
        StoredConversation {
            id: self.id.clone(),
            title: self.display_title(),
            messages: self.messages.clone(),
        }
    }
}

impl From<StoredConversation> for Conversation {
    fn from(stored: StoredConversation) -> Self {
        let mut conv = Conversation::new(stored.id);
        conv.title = stored.title;
        conv.messages = stored.messages;
        conv
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredConversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

pub fn load_conversations(store: &dyn KeyValueStore) -> Result<Vec<StoredConversation>, StoreError> {
    match store.get(CONVERSATIONS_KEY)? {
        Some(v) => Ok(serde_json::from_value(v)?),
        None => Ok(Vec::new()),
    }
}

pub fn save_conversations(
    store: &dyn KeyValueStore,
    conversations: &[StoredConversation],
) -> Result<(), StoreError> {
    store.put(CONVERSATIONS_KEY, serde_json::to_value(conversations)?)
}

/// Conversations keyed by id. Owns the one windowed view and the one budget
/// monitor; both are rebound whenever the active conversation changes.
#[derive(Debug)]
pub struct ConversationRegistry {
    conversations: BTreeMap<String, Conversation>,
    active: Option<String>,
    view: ChatView,
    monitor: BudgetMonitor,
}

impl ConversationRegistry {
    pub fn new(view: WindowConfig, debounce: Duration) -> Self {
        Self {
            conversations: BTreeMap::new(),
            active: None,
            view: ChatView::new(view),
            monitor: BudgetMonitor::new(debounce),
        }
    }

    pub fn insert(&mut self, conv: Conversation) {
        self.conversations.insert(conv.id.clone(), conv);
    }

    pub fn get(&self, id: &str) -> Option<&Conversation> {
        self.conversations.get(id)
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active(&self) -> Option<&Conversation> {
        self.active.as_deref().and_then(|id| self.conversations.get(id))
    }

    pub fn active_mut(&mut self) -> Option<&mut Conversation> {
        let id = self.active.as_deref()?;
        self.conversations.get_mut(id)
    }

    /// Makes `id` active, creating it if unknown. A change of conversation
    /// discards learned heights and pending budget work.
    pub fn switch_to(&mut self, id: &str) -> &mut Conversation {
        if self.active.as_deref() != Some(id) {
            tracing::debug!(from = ?self.active, to = id, "switching conversation");
            self.view.bind(id);
            self.monitor.reset();
            self.active = Some(id.to_string());
        }
        self.conversations
            .entry(id.to_string())
            .or_insert_with(|| Conversation::new(id))
    }

    /// Removes a conversation, aborting any turn still in flight.
    pub fn remove(&mut self, id: &str) -> Option<Conversation> {
        let mut conv = self.conversations.remove(id)?;
        if conv.session.is_active() {
            let Conversation { session, messages, .. } = &mut conv;
            session.abort(messages);
        }
        if self.active.as_deref() == Some(id) {
            self.active = None;
            self.monitor.reset();
        }
        Some(conv)
    }

    pub fn view(&self) -> &ChatView {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut ChatView {
        &mut self.view
    }

    pub fn monitor(&self) -> &BudgetMonitor {
        &self.monitor
    }

    /// Updates the active draft and schedules a debounced budget recomputation.
    pub fn set_draft(&mut self, draft: &str, system: &str, model: &ModelProfile) {
        let Some(id) = self.active.clone() else {
            return;
        };
        let Some(conv) = self.conversations.get_mut(&id) else {
            return;
        };
        conv.draft = draft.to_string();
        let history = conv.effective_history();
        let draft = (!conv.draft.trim().is_empty()).then(|| conv.draft.clone());
        self.monitor.schedule(history, system.to_string(), draft, model.clone());
    }

    /// Submits on the active conversation. The draft is spent, so a pending
    /// budget run still counting it is replaced by an immediate recomputation.
    pub async fn submit_active(
        &mut self,
        controller: &StreamController,
        raw_input: &str,
        model: &ModelProfile,
    ) -> Result<PendingTurn, StreamError> {
        let id = self.active.clone().ok_or(StreamError::NoActiveConversation)?;
        let conv = self
            .conversations
            .get_mut(&id)
            .ok_or(StreamError::NoActiveConversation)?;
        let turn = controller.submit(conv, raw_input, model).await?;
        let history = conv.effective_history();
        self.monitor.recompute_now(&history, controller.system(), None, model);
        Ok(turn)
    }

    /// Recomputes the active conversation's usage without waiting.
    pub fn usage_now(&mut self, system: &str, model: &ModelProfile) -> Option<UsageSnapshot> {
        let id = self.active.clone()?;
        let conv = self.conversations.get(&id)?;
        let history = conv.effective_history();
        let draft = (!conv.draft.trim().is_empty()).then_some(conv.draft.as_str());
        Some(self.monitor.recompute_now(&history, system, draft, model))
    }

    pub fn stored(&self) -> Vec<StoredConversation> {
        self.conversations.values().map(Conversation::to_stored).collect()
    }
}
