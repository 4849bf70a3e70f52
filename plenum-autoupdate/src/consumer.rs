//! Per-connection consumer: catch-up, push and projector subscriptions.
//!
//! A consumer holds one client's session state:
//! ```text
//! CONNECTING ──auth──► AUTHENTICATED ──baseline──► LISTENING ──► CLOSED
//!      └────────────────── auth failure ─────────────────────────┘
//! ```
//! While listening, every fan-out notice turns into this user's restricted
//! diff. The consumer tracks `last_change_id` monotonically; a baseline that
//! fell below the retention floor triggers a full resync flagged
//! `all_data: true` so the client discards local state.

use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::cache::element::{AutoupdatePayload, Element, ElementId};
use crate::cache::element_cache::{AutoupdateError, ElementCache, RestrictedOutcome};
use crate::fanout::{ChangeNotice, NotifyEnvelope, NotifyRelay};
use crate::protocol::{ClientRequest, ServerMessage, ERROR_CHANGE_ID_TOO_HIGH};
use crate::registry::UserContext;

/// Collection whose elements can be subscribed to unrestricted via
/// `listenToProjectors`.
pub const PROJECTOR_COLLECTION: &str = "core/projector";

/// Session authentication seam.
///
/// Resolves a connection token to a user. Returning `None` refuses the
/// connection unless the server allows anonymous access.
pub trait SessionAuth: Send + Sync {
    fn authenticate(&self, token: Option<&str>) -> Option<UserContext>;
}

/// Static token table, for tests and single-tenant deployments.
pub struct TokenAuth {
    tokens: std::collections::HashMap<String, u64>,
}

impl TokenAuth {
    pub fn new(tokens: std::collections::HashMap<String, u64>) -> Self {
        Self { tokens }
    }
}

impl SessionAuth for TokenAuth {
    fn authenticate(&self, token: Option<&str>) -> Option<UserContext> {
        let token = token?;
        self.tokens
            .get(token)
            .map(|&user_id| UserContext::authenticated(user_id))
    }
}

/// Consumer lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Connecting,
    Authenticated,
    Listening,
    Closed,
}

/// One client session.
pub struct Consumer {
    id: Uuid,
    user: UserContext,
    state: ConsumerState,
    autoupdate_on: bool,
    last_change_id: u64,
    projector_ids: HashSet<u64>,
}

impl Consumer {
    /// Build an authenticated consumer. Authentication itself happens in the
    /// connection handler before construction.
    pub fn new(user: UserContext) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            state: ConsumerState::Authenticated,
            autoupdate_on: false,
            last_change_id: 0,
            projector_ids: HashSet::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user(&self) -> &UserContext {
        &self.user
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn last_change_id(&self) -> u64 {
        self.last_change_id
    }

    pub fn autoupdate_on(&self) -> bool {
        self.autoupdate_on
    }

    /// Enter the listening state with a push baseline (normally the current
    /// change id at connect time).
    pub fn start_listening(&mut self, baseline: u64) {
        self.last_change_id = baseline;
        self.state = ConsumerState::Listening;
    }

    pub fn close(&mut self) {
        self.state = ConsumerState::Closed;
    }

    /// Handle a validated client request, producing the replies to send.
    ///
    /// A `notify` request goes out on the relay for the other connections;
    /// the sender gets no reply.
    pub async fn handle_request(
        &mut self,
        cache: &ElementCache,
        notify: &NotifyRelay,
        request: ClientRequest,
    ) -> Result<Vec<ServerMessage>, AutoupdateError> {
        match request {
            ClientRequest::GetElements { change_id } => {
                self.get_elements(cache, change_id).await
            }
            ClientRequest::Autoupdate(on) => {
                self.autoupdate_on = on;
                Ok(Vec::new())
            }
            ClientRequest::ListenToProjectors { projector_ids } => {
                self.projector_ids = projector_ids.into_iter().collect();
                self.projector_snapshot(cache).await
            }
            ClientRequest::Ping { latency } => Ok(vec![ServerMessage::Pong { latency }]),
            ClientRequest::Notify(content) => {
                notify.publish(self.id, content);
                Ok(Vec::new())
            }
        }
    }

    /// Initial projector state on subscription: only the subscribed elements
    /// are fetched, never the whole snapshot.
    async fn projector_snapshot(
        &self,
        cache: &ElementCache,
    ) -> Result<Vec<ServerMessage>, AutoupdateError> {
        let current = cache.get_current_change_id().await?;
        let mut data = BTreeMap::new();
        for &id in &self.projector_ids {
            let element_id = ElementId::new(PROJECTOR_COLLECTION, id);
            if let Some(full) = cache.get_full_data(&element_id).await? {
                data.insert(id, full);
            }
        }
        if data.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(vec![ServerMessage::Projector {
                change_id: current,
                data,
            }])
        }
    }

    async fn get_elements(
        &mut self,
        cache: &ElementCache,
        change_id: Option<u64>,
    ) -> Result<Vec<ServerMessage>, AutoupdateError> {
        let current = cache.get_current_change_id().await?;

        let Some(from) = change_id else {
            return Ok(vec![self.full_snapshot(cache, current).await?]);
        };

        if from > current {
            return Ok(vec![ServerMessage::error(
                ERROR_CHANGE_ID_TOO_HIGH,
                format!("Requested change id {from} is higher than the current {current}"),
            )]);
        }

        match cache.get_restricted_data(&self.user, from, None).await? {
            RestrictedOutcome::TooOld => Ok(vec![self.full_snapshot(cache, current).await?]),
            RestrictedOutcome::Diff {
                changed,
                deleted,
                to_change_id,
            } => {
                self.advance(to_change_id);
                Ok(vec![ServerMessage::Autoupdate(
                    AutoupdatePayload::from_diff(changed, deleted, from, to_change_id, false),
                )])
            }
        }
    }

    /// Handle a fan-out notice while listening.
    pub async fn handle_notice(
        &mut self,
        cache: &ElementCache,
        notice: ChangeNotice,
    ) -> Result<Vec<ServerMessage>, AutoupdateError> {
        if self.state != ConsumerState::Listening || notice.change_id <= self.last_change_id {
            return Ok(Vec::new());
        }

        let mut messages = Vec::new();
        let from = self.last_change_id;

        if self.autoupdate_on {
            match cache
                .get_restricted_data(&self.user, from, Some(notice.change_id))
                .await?
            {
                RestrictedOutcome::TooOld => {
                    let current = cache.get_current_change_id().await?;
                    messages.push(self.full_snapshot(cache, current).await?);
                }
                RestrictedOutcome::Diff {
                    changed,
                    deleted,
                    to_change_id,
                } => {
                    let payload = AutoupdatePayload::from_diff(
                        changed,
                        deleted,
                        from,
                        to_change_id,
                        false,
                    );
                    if !payload.is_empty() {
                        messages.push(ServerMessage::Autoupdate(payload));
                    }
                    self.advance(to_change_id);
                }
            }
        }

        if !self.projector_ids.is_empty() {
            if let crate::cache::provider::SinceOutcome::Diff { changed, .. } =
                cache.get_data_since(from, Some(notice.change_id)).await?
            {
                if let Some(msg) = self.projector_diff_message(notice.change_id, &changed) {
                    messages.push(msg);
                }
            }
        }

        self.advance(notice.change_id);
        Ok(messages)
    }

    /// Relay a notify from another connection; own messages are skipped.
    pub fn handle_notify(&self, envelope: &NotifyEnvelope) -> Option<ServerMessage> {
        if self.state != ConsumerState::Listening || envelope.from == self.id {
            return None;
        }
        Some(ServerMessage::Notify(envelope.content.clone()))
    }

    async fn full_snapshot(
        &mut self,
        cache: &ElementCache,
        current: u64,
    ) -> Result<ServerMessage, AutoupdateError> {
        let all = cache.get_all_restricted_data(&self.user).await?;
        self.advance(current);
        Ok(ServerMessage::Autoupdate(AutoupdatePayload::from_diff(
            all,
            Vec::new(),
            0,
            current,
            true,
        )))
    }

    /// Projector full-data push for the current subscription, from a set of
    /// changed elements. Projector data is deliberately unrestricted: the
    /// projector is a public broadcast surface.
    fn projector_diff_message(
        &self,
        change_id: u64,
        changed: &[Element],
    ) -> Option<ServerMessage> {
        let data: BTreeMap<u64, _> = changed
            .iter()
            .filter(|e| {
                e.id.collection == PROJECTOR_COLLECTION && self.projector_ids.contains(&e.id.id)
            })
            .map(|e| (e.id.id, e.data.clone()))
            .collect();
        if data.is_empty() {
            None
        } else {
            Some(ServerMessage::Projector { change_id, data })
        }
    }

    fn advance(&mut self, change_id: u64) {
        // Monotonic: a slow diff can finish after a newer one advanced us.
        self.last_change_id = self.last_change_id.max(change_id);
    }

    /// Whether this consumer currently cares about fan-out notices.
    pub fn wants_notices(&self) -> bool {
        self.state == ConsumerState::Listening
            && (self.autoupdate_on || !self.projector_ids.is_empty())
    }
}
