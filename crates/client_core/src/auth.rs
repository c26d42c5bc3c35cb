//! Auth session controller.
//!
//! A single state-owner task holds [`AuthState`]. Two producers feed it over
//! one channel: the listener forwarding the session store's change events, and
//! the imperative `login`/`logout` calls reporting start and completion. The
//! listener is the authority for `user`; the imperative calls only drive
//! `is_loading` and `error`, and wait for the owner to apply each of their
//! updates before continuing. Consumers observe the state through a watch
//! channel.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use shared::{
    error::AuthError,
    domain::UserId,
    protocol::{AuthChangeEvent, AuthChangeKind, AuthUser, Profile},
};
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::session_store::{SessionStore, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Initializing,
    Unauthenticated,
    Authenticated,
    TransitionPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub user: Option<AuthUser>,
    pub profile: Option<Profile>,
    pub is_loading: bool,
    pub error: Option<AuthError>,
    initialized: bool,
}

impl AuthState {
    fn initializing() -> Self {
        Self {
            user: None,
            profile: None,
            is_loading: true,
            error: None,
            initialized: false,
        }
    }

    pub fn phase(&self) -> AuthPhase {
        if !self.initialized {
            AuthPhase::Initializing
        } else if self.is_loading {
            AuthPhase::TransitionPending
        } else if self.user.is_some() {
            AuthPhase::Authenticated
        } else {
            AuthPhase::Unauthenticated
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOperation {
    Login,
    Logout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedUser {
    user: AuthUser,
    profile: Option<Profile>,
}

#[derive(Debug)]
enum AuthUpdate {
    StartupResolved(Result<Option<ResolvedUser>, AuthError>),
    OperationStarted {
        op: u64,
        kind: AuthOperation,
    },
    OperationFinished {
        op: u64,
        kind: AuthOperation,
        result: Result<(), AuthError>,
    },
    SessionChanged(AuthChangeEvent),
}

#[derive(Debug)]
enum OwnerMessage {
    Update {
        update: AuthUpdate,
        applied: Option<oneshot::Sender<()>>,
    },
    Shutdown,
}

impl From<AuthUpdate> for OwnerMessage {
    fn from(update: AuthUpdate) -> Self {
        Self::Update {
            update,
            applied: None,
        }
    }
}

#[derive(Debug)]
struct StateOwner {
    state: AuthState,
    in_flight: BTreeSet<u64>,
    identity_changed: bool,
    refreshed_user: Option<UserId>,
}

impl StateOwner {
    fn new() -> Self {
        Self {
            state: AuthState::initializing(),
            in_flight: BTreeSet::new(),
            identity_changed: false,
            refreshed_user: None,
        }
    }

    fn apply(&mut self, update: AuthUpdate) {
        match update {
            AuthUpdate::StartupResolved(outcome) => self.apply_startup(outcome),
            AuthUpdate::OperationStarted { op, kind } => {
                debug!(op, ?kind, "auth: operation started");
                self.in_flight.insert(op);
                self.state.is_loading = true;
                self.state.error = None;
            }
            AuthUpdate::OperationFinished { op, kind, result } => {
                self.in_flight.remove(&op);
                // only the most recently started operation clears the flag
                let newer_pending = self.in_flight.range(op + 1..).next().is_some();
                if !newer_pending {
                    self.state.is_loading = false;
                }
                if let Err(err) = result {
                    debug!(op, ?kind, error = %err, "auth: operation failed");
                    self.state.error = Some(err);
                }
            }
            AuthUpdate::SessionChanged(event) => {
                debug!(kind = ?event.kind, "auth: applying session change");
                match (&event.kind, &event.session) {
                    (AuthChangeKind::TokenRefreshed, Some(session)) => {
                        self.refreshed_user = Some(session.user.id);
                    }
                    _ => self.identity_changed = true,
                }
                match event.session {
                    Some(session) => {
                        self.state.user = Some(session.user);
                        self.state.profile = None;
                    }
                    None => {
                        self.state.user = None;
                        self.state.profile = None;
                    }
                }
                self.state.is_loading = false;
            }
        }

        if self.state.user.is_none() {
            self.state.profile = None;
        }
    }

    fn apply_startup(&mut self, outcome: Result<Option<ResolvedUser>, AuthError>) {
        self.state.initialized = true;
        if self.in_flight.is_empty() {
            self.state.is_loading = false;
        }
        // an applied session event is newer than the startup check, unless it
        // only refreshed the tokens of the user the check resolved
        let superseded = self.identity_changed
            || match (&outcome, self.refreshed_user) {
                (_, None) => false,
                (Ok(Some(resolved)), Some(refreshed)) => resolved.user.id != refreshed,
                (_, Some(_)) => true,
            };
        match outcome {
            Ok(Some(resolved)) if !superseded => {
                self.state.user = Some(resolved.user);
                self.state.profile = resolved.profile;
            }
            Ok(None) if !superseded => {
                self.state.user = None;
                self.state.profile = None;
            }
            Ok(_) => {}
            Err(err) => {
                if !superseded {
                    self.state.user = None;
                    self.state.profile = None;
                }
                self.state.error = Some(err);
            }
        }
    }
}

async fn run_state_owner(
    mut messages: mpsc::UnboundedReceiver<OwnerMessage>,
    published: watch::Sender<AuthState>,
) {
    let mut owner = StateOwner::new();
    while let Some(message) = messages.recv().await {
        let OwnerMessage::Update { update, applied } = message else {
            break;
        };
        owner.apply(update);
        published.send_if_modified(|current| {
            if *current == owner.state {
                false
            } else {
                *current = owner.state.clone();
                true
            }
        });
        if let Some(applied) = applied {
            let _ = applied.send(());
        }
    }
    debug!("auth: state owner stopped");
}

async fn forward_auth_changes(
    mut subscription: Subscription,
    updates: mpsc::UnboundedSender<OwnerMessage>,
) {
    while let Some(event) = subscription.next_event().await {
        if updates
            .send(AuthUpdate::SessionChanged(event).into())
            .is_err()
        {
            break;
        }
    }
    subscription.unsubscribe();
}

async fn check_current_user(
    store: Arc<dyn SessionStore>,
    updates: mpsc::UnboundedSender<OwnerMessage>,
) {
    let outcome = match store.current_session().await {
        Ok(Some(session)) => {
            let user = session.user;
            let profile = match store.fetch_profile(user.id).await {
                Ok(Some(profile)) if profile.id == user.id => Some(profile),
                Ok(Some(profile)) => {
                    warn!(user_id = %user.id, profile_id = %profile.id, "auth: ignoring profile for another user");
                    None
                }
                Ok(None) => None,
                Err(err) => {
                    warn!(user_id = %user.id, error = %err, "auth: profile lookup failed");
                    None
                }
            };
            info!(user_id = %user.id, has_profile = profile.is_some(), "auth: existing session found");
            Ok(Some(ResolvedUser { user, profile }))
        }
        Ok(None) => {
            info!("auth: no existing session");
            Ok(None)
        }
        Err(err) => {
            warn!(error = %err, "auth: session check failed");
            Err(err)
        }
    };
    let _ = updates.send(AuthUpdate::StartupResolved(outcome).into());
}

/// Cloneable access to the running controller.
#[derive(Clone)]
pub struct AuthHandle {
    store: Arc<dyn SessionStore>,
    updates: mpsc::UnboundedSender<OwnerMessage>,
    state: watch::Receiver<AuthState>,
    next_op: Arc<AtomicU64>,
}

impl AuthHandle {
    /// Snapshot of `{user, profile, is_loading, error}`.
    pub fn state(&self) -> AuthState {
        self.state.borrow().clone()
    }

    /// Receiver that is notified on every published state change.
    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.state.clone()
    }

    /// Waits until the published state satisfies `predicate`.
    ///
    /// `login`/`logout` return before the event stream has converged `user`;
    /// callers that need the converged state wait for it here.
    pub async fn wait_until(
        &self,
        mut predicate: impl FnMut(&AuthState) -> bool,
    ) -> Result<AuthState, AuthError> {
        let mut receiver = self.state.clone();
        let state = receiver
            .wait_for(|state| predicate(state))
            .await
            .map_err(|_| AuthError::ControllerClosed)?;
        Ok(state.clone())
    }

    /// Waits for the startup check to resolve.
    pub async fn ready(&self) -> Result<AuthState, AuthError> {
        self.wait_until(|state| state.phase() != AuthPhase::Initializing)
            .await
    }

    /// Exchanges credentials. By the time this returns, `is_loading` and
    /// `error` in [`AuthHandle::state`] reflect the outcome; `user` follows
    /// once the event stream delivers the new session.
    pub async fn login(&self, email: &str, password: &str) -> Result<(), AuthError> {
        let op = self.begin(AuthOperation::Login).await?;
        let result = self
            .store
            .sign_in_with_credentials(email, password)
            .await
            .map(|session| {
                debug!(user_id = %session.user.id, "auth: credential exchange accepted");
            });
        self.finish(op, AuthOperation::Login, &result).await;
        result
    }

    pub async fn logout(&self) -> Result<(), AuthError> {
        let op = self.begin(AuthOperation::Logout).await?;
        let result = self.store.sign_out().await;
        self.finish(op, AuthOperation::Logout, &result).await;
        result
    }

    /// Hands `update` to the state owner and waits until it is published.
    async fn submit(&self, update: AuthUpdate) -> Result<(), AuthError> {
        let (applied, ack) = oneshot::channel();
        self.updates
            .send(OwnerMessage::Update {
                update,
                applied: Some(applied),
            })
            .map_err(|_| AuthError::ControllerClosed)?;
        ack.await.map_err(|_| AuthError::ControllerClosed)
    }

    async fn begin(&self, kind: AuthOperation) -> Result<u64, AuthError> {
        let op = self.next_op.fetch_add(1, Ordering::Relaxed);
        self.submit(AuthUpdate::OperationStarted { op, kind }).await?;
        Ok(op)
    }

    async fn finish(&self, op: u64, kind: AuthOperation, result: &Result<(), AuthError>) {
        if let Err(err) = result {
            warn!(?kind, error = %err, "auth: operation failed");
        }
        let finished = AuthUpdate::OperationFinished {
            op,
            kind,
            result: result.clone(),
        };
        if self.submit(finished).await.is_err() {
            debug!(?kind, "auth: controller stopped before operation completed");
        }
    }
}

/// Owns the controller's background tasks for the application's lifetime.
///
/// Constructed once at startup; consumers receive [`AuthHandle`]s. Dropping
/// the provider or calling [`AuthProvider::shutdown`] releases the session
/// subscription.
pub struct AuthProvider {
    handle: AuthHandle,
    listener: Option<JoinHandle<()>>,
    startup: Option<JoinHandle<()>>,
    state_owner: Option<JoinHandle<()>>,
}

impl AuthProvider {
    /// Starts the controller: subscribes to session changes, then runs the
    /// startup check. Must be called inside a Tokio runtime.
    pub fn start(store: Arc<dyn SessionStore>) -> Self {
        let (published, state) = watch::channel(AuthState::initializing());
        let (updates, updates_rx) = mpsc::unbounded_channel();
        let state_owner = tokio::spawn(run_state_owner(updates_rx, published));

        // subscribe before checking so no transition between the two is lost
        let subscription = store.subscribe();
        let listener = tokio::spawn(forward_auth_changes(subscription, updates.clone()));
        let startup = tokio::spawn(check_current_user(Arc::clone(&store), updates.clone()));

        Self {
            handle: AuthHandle {
                store,
                updates,
                state,
                next_op: Arc::new(AtomicU64::new(1)),
            },
            listener: Some(listener),
            startup: Some(startup),
            state_owner: Some(state_owner),
        }
    }

    pub fn handle(&self) -> AuthHandle {
        self.handle.clone()
    }

    fn release(&mut self) -> Option<JoinHandle<()>> {
        if let Some(startup) = self.startup.take() {
            startup.abort();
        }
        let listener = self.listener.take()?;
        listener.abort();
        info!("auth: released session subscription");
        Some(listener)
    }

    /// Releases the subscription and stops the state owner. Handles keep
    /// returning the last published state; `login`/`logout` on them fail with
    /// [`AuthError::ControllerClosed`].
    pub async fn shutdown(mut self) {
        if let Some(listener) = self.release() {
            // the subscription is dropped once the aborted task is reaped
            let _ = listener.await;
        }
        let _ = self.handle.updates.send(OwnerMessage::Shutdown);
        if let Some(state_owner) = self.state_owner.take() {
            let _ = state_owner.await;
        }
    }
}

impl Drop for AuthProvider {
    fn drop(&mut self) {
        self.release();
        if self.state_owner.take().is_some() {
            let _ = self.handle.updates.send(OwnerMessage::Shutdown);
        }
    }
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
