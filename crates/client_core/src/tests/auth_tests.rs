use super::*;

use std::{collections::HashMap, sync::Mutex, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use shared::{
    domain::{Role, UserId},
    protocol::{AuthChangeKind, Session},
};
use tokio::sync::{broadcast, Notify};

const WAIT: Duration = Duration::from_secs(2);

fn session_for(user: &AuthUser) -> Session {
    Session {
        access_token: format!("access-{}", user.id),
        refresh_token: format!("refresh-{}", user.id),
        expires_at: Utc::now() + chrono::Duration::hours(1),
        user: user.clone(),
    }
}

fn user(email: &str) -> AuthUser {
    AuthUser {
        id: UserId::new_random(),
        email: Some(email.to_string()),
    }
}

fn admin_profile(user: &AuthUser) -> Profile {
    Profile {
        id: user.id,
        role: Role::Admin,
        full_name: Some("Platform Operator".into()),
        avatar_url: None,
        company_id: None,
    }
}

struct FakeSessionStore {
    events: broadcast::Sender<AuthChangeEvent>,
    accounts: HashMap<String, (String, AuthUser)>,
    current: Mutex<Option<Session>>,
    current_error: Option<AuthError>,
    profiles: HashMap<UserId, Profile>,
    profile_error: Option<AuthError>,
    sign_out_error: Option<AuthError>,
    emit_on_change: bool,
    sign_in_gate: Option<Arc<Notify>>,
}

impl FakeSessionStore {
    fn new() -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            events,
            accounts: HashMap::new(),
            current: Mutex::new(None),
            current_error: None,
            profiles: HashMap::new(),
            profile_error: None,
            sign_out_error: None,
            emit_on_change: true,
            sign_in_gate: None,
        }
    }

    fn with_account(mut self, user: &AuthUser, password: &str) -> Self {
        let email = user.email.clone().expect("email");
        self.accounts
            .insert(email, (password.to_string(), user.clone()));
        self
    }

    fn with_current(self, user: &AuthUser) -> Self {
        *self.current.lock().expect("lock") = Some(session_for(user));
        self
    }

    fn with_profile(mut self, profile: Profile) -> Self {
        self.profiles.insert(profile.id, profile);
        self
    }

    fn emit(&self, event: AuthChangeEvent) {
        let _ = self.events.send(event);
    }

    fn subscriber_count(&self) -> usize {
        self.events.receiver_count()
    }
}

#[async_trait]
impl SessionStore for FakeSessionStore {
    async fn sign_in_with_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        if let Some(gate) = &self.sign_in_gate {
            gate.notified().await;
        }
        let Some((expected, user)) = self.accounts.get(email) else {
            return Err(AuthError::InvalidCredentials);
        };
        if expected != password {
            return Err(AuthError::InvalidCredentials);
        }
        let session = session_for(user);
        *self.current.lock().expect("lock") = Some(session.clone());
        if self.emit_on_change {
            self.emit(AuthChangeEvent::signed_in(session.clone()));
        }
        Ok(session)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        if let Some(err) = &self.sign_out_error {
            return Err(err.clone());
        }
        *self.current.lock().expect("lock") = None;
        if self.emit_on_change {
            self.emit(AuthChangeEvent::signed_out());
        }
        Ok(())
    }

    async fn current_session(&self) -> Result<Option<Session>, AuthError> {
        if let Some(err) = &self.current_error {
            return Err(err.clone());
        }
        Ok(self.current.lock().expect("lock").clone())
    }

    async fn fetch_profile(&self, user_id: UserId) -> Result<Option<Profile>, AuthError> {
        if let Some(err) = &self.profile_error {
            return Err(err.clone());
        }
        Ok(self.profiles.get(&user_id).cloned())
    }

    fn subscribe(&self) -> Subscription {
        Subscription::new(self.events.subscribe())
    }
}

async fn settle(handle: &AuthHandle, predicate: impl FnMut(&AuthState) -> bool) -> AuthState {
    tokio::time::timeout(WAIT, handle.wait_until(predicate))
        .await
        .expect("state did not converge in time")
        .expect("controller alive")
}

async fn ready(handle: &AuthHandle) -> AuthState {
    tokio::time::timeout(WAIT, handle.ready())
        .await
        .expect("startup check did not resolve")
        .expect("controller alive")
}

fn start(store: &Arc<FakeSessionStore>) -> AuthProvider {
    AuthProvider::start(Arc::clone(store) as Arc<dyn SessionStore>)
}

#[tokio::test]
async fn starts_initializing_and_loading() {
    let store = Arc::new(FakeSessionStore::new());
    let state = AuthState::initializing();
    assert_eq!(state.phase(), AuthPhase::Initializing);
    assert!(state.is_loading);

    let provider = start(&store);
    let state = ready(&provider.handle()).await;
    assert_eq!(state.phase(), AuthPhase::Unauthenticated);
    assert!(!state.is_loading);
    assert!(state.user.is_none());
    assert!(state.error.is_none());
}

#[tokio::test]
async fn startup_resolves_existing_session_with_profile() {
    let operator = user("ops@example.com");
    let store = Arc::new(
        FakeSessionStore::new()
            .with_current(&operator)
            .with_profile(admin_profile(&operator)),
    );
    let provider = start(&store);

    let state = ready(&provider.handle()).await;
    assert_eq!(state.phase(), AuthPhase::Authenticated);
    assert_eq!(state.user.as_ref(), Some(&operator));
    assert_eq!(state.profile.map(|p| p.role), Some(Role::Admin));
}

#[tokio::test]
async fn startup_profile_failure_is_not_fatal() {
    let operator = user("ops@example.com");
    let mut store = FakeSessionStore::new().with_current(&operator);
    store.profile_error = Some(AuthError::Transport("profiles offline".into()));
    let store = Arc::new(store);
    let provider = start(&store);

    let state = ready(&provider.handle()).await;
    assert_eq!(state.user.as_ref(), Some(&operator));
    assert!(state.profile.is_none());
    assert!(state.error.is_none());
}

#[tokio::test]
async fn startup_ignores_profile_of_another_user() {
    let operator = user("ops@example.com");
    let stranger = user("other@example.com");
    let mut store = FakeSessionStore::new().with_current(&operator);
    store
        .profiles
        .insert(operator.id, admin_profile(&stranger));
    let store = Arc::new(store);
    let provider = start(&store);

    let state = ready(&provider.handle()).await;
    assert!(state.user.is_some());
    assert!(state.profile.is_none());
}

#[tokio::test]
async fn startup_failure_records_error_and_stays_signed_out() {
    let mut store = FakeSessionStore::new();
    store.current_error = Some(AuthError::Transport("connection refused".into()));
    let store = Arc::new(store);
    let provider = start(&store);

    let state = ready(&provider.handle()).await;
    assert_eq!(state.phase(), AuthPhase::Unauthenticated);
    assert!(state.user.is_none());
    assert!(!state.is_loading);
    assert_eq!(
        state.error,
        Some(AuthError::Transport("connection refused".into()))
    );
}

#[tokio::test]
async fn login_converges_through_event_stream() {
    let operator = user("ops@example.com");
    let store = Arc::new(FakeSessionStore::new().with_account(&operator, "hunter2"));
    let provider = start(&store);
    let handle = provider.handle();
    ready(&handle).await;

    handle
        .login("ops@example.com", "hunter2")
        .await
        .expect("login");

    let state = settle(&handle, |s| s.user.is_some() && !s.is_loading).await;
    assert_eq!(
        state.user.and_then(|u| u.email).as_deref(),
        Some("ops@example.com")
    );
    assert!(state.error.is_none());
    assert!(state.profile.is_none());
}

#[tokio::test]
async fn login_returns_before_user_is_populated() {
    let operator = user("ops@example.com");
    let mut store = FakeSessionStore::new().with_account(&operator, "hunter2");
    store.emit_on_change = false;
    let store = Arc::new(store);
    let provider = start(&store);
    let handle = provider.handle();
    ready(&handle).await;

    handle
        .login("ops@example.com", "hunter2")
        .await
        .expect("login");
    let state = settle(&handle, |s| !s.is_loading).await;
    assert!(state.user.is_none(), "login must not set user itself");
    assert_eq!(state.phase(), AuthPhase::Unauthenticated);

    store.emit(AuthChangeEvent::signed_in(session_for(&operator)));
    let state = settle(&handle, |s| s.user.is_some()).await;
    assert_eq!(state.phase(), AuthPhase::Authenticated);
}

#[tokio::test]
async fn invalid_login_records_and_returns_error() {
    let operator = user("ops@example.com");
    let store = Arc::new(FakeSessionStore::new().with_account(&operator, "hunter2"));
    let provider = start(&store);
    let handle = provider.handle();
    ready(&handle).await;

    let err = handle
        .login("ops@example.com", "wrong")
        .await
        .expect_err("rejected");
    assert_eq!(err, AuthError::InvalidCredentials);

    let state = settle(&handle, |s| s.error.is_some()).await;
    assert!(state.user.is_none());
    assert!(state.profile.is_none());
    assert!(!state.is_loading);
    assert_eq!(state.phase(), AuthPhase::Unauthenticated);
}

#[tokio::test]
async fn new_login_clears_previous_error() {
    let operator = user("ops@example.com");
    let store = Arc::new(FakeSessionStore::new().with_account(&operator, "hunter2"));
    let provider = start(&store);
    let handle = provider.handle();
    ready(&handle).await;

    let _ = handle.login("ops@example.com", "wrong").await;
    settle(&handle, |s| s.error.is_some()).await;

    handle
        .login("ops@example.com", "hunter2")
        .await
        .expect("login");
    let state = settle(&handle, |s| s.user.is_some() && !s.is_loading).await;
    assert!(state.error.is_none());
}

#[tokio::test]
async fn logout_converges_to_signed_out() {
    let operator = user("ops@example.com");
    let store = Arc::new(
        FakeSessionStore::new()
            .with_current(&operator)
            .with_profile(admin_profile(&operator)),
    );
    let provider = start(&store);
    let handle = provider.handle();
    let state = ready(&handle).await;
    assert!(state.profile.is_some());

    handle.logout().await.expect("logout");

    let state = settle(&handle, |s| s.user.is_none() && !s.is_loading).await;
    assert!(state.profile.is_none());
    assert!(state.error.is_none());
    assert_eq!(state.phase(), AuthPhase::Unauthenticated);
}

#[tokio::test]
async fn failed_logout_propagates_and_keeps_user() {
    let operator = user("ops@example.com");
    let mut store = FakeSessionStore::new().with_current(&operator);
    store.sign_out_error = Some(AuthError::Transport("timed out".into()));
    let store = Arc::new(store);
    let provider = start(&store);
    let handle = provider.handle();
    ready(&handle).await;

    let err = handle.logout().await.expect_err("logout fails");
    assert!(matches!(err, AuthError::Transport(_)));

    let state = settle(&handle, |s| s.error.is_some()).await;
    assert!(!state.is_loading);
    assert_eq!(state.user.as_ref(), Some(&operator));
    assert_eq!(state.phase(), AuthPhase::Authenticated);
}

#[tokio::test]
async fn loading_is_set_while_login_is_in_flight() {
    let operator = user("ops@example.com");
    let gate = Arc::new(Notify::new());
    let mut store = FakeSessionStore::new().with_account(&operator, "hunter2");
    store.sign_in_gate = Some(Arc::clone(&gate));
    let store = Arc::new(store);
    let provider = start(&store);
    let handle = provider.handle();
    ready(&handle).await;

    let login = tokio::spawn({
        let handle = handle.clone();
        async move { handle.login("ops@example.com", "hunter2").await }
    });

    let state = settle(&handle, |s| s.is_loading).await;
    assert_eq!(state.phase(), AuthPhase::TransitionPending);

    gate.notify_one();
    login.await.expect("join").expect("login");
    let state = settle(&handle, |s| !s.is_loading && s.user.is_some()).await;
    assert_eq!(state.phase(), AuthPhase::Authenticated);
}

#[tokio::test]
async fn session_event_clears_profile_but_keeps_user() {
    let operator = user("ops@example.com");
    let store = Arc::new(
        FakeSessionStore::new()
            .with_current(&operator)
            .with_profile(admin_profile(&operator)),
    );
    let provider = start(&store);
    let handle = provider.handle();
    assert!(ready(&handle).await.profile.is_some());

    store.emit(AuthChangeEvent {
        kind: AuthChangeKind::TokenRefreshed,
        session: Some(session_for(&operator)),
    });

    let state = settle(&handle, |s| s.profile.is_none()).await;
    assert_eq!(state.user.as_ref(), Some(&operator));
}

#[tokio::test]
async fn events_apply_in_emission_order() {
    let first = user("first@example.com");
    let second = user("second@example.com");
    let store = Arc::new(FakeSessionStore::new());
    let provider = start(&store);
    let handle = provider.handle();
    ready(&handle).await;

    store.emit(AuthChangeEvent::signed_in(session_for(&first)));
    store.emit(AuthChangeEvent::signed_out());
    store.emit(AuthChangeEvent::signed_in(session_for(&second)));

    let state = settle(&handle, |s| s.user.as_ref().map(|u| u.id) == Some(second.id)).await;
    assert_eq!(state.phase(), AuthPhase::Authenticated);
}

#[tokio::test]
async fn shutdown_releases_subscription_and_freezes_state() {
    let operator = user("ops@example.com");
    let store = Arc::new(FakeSessionStore::new().with_account(&operator, "hunter2"));
    let provider = start(&store);
    let handle = provider.handle();
    let before = ready(&handle).await;
    assert_eq!(store.subscriber_count(), 1);

    provider.shutdown().await;
    assert_eq!(store.subscriber_count(), 0);

    store.emit(AuthChangeEvent::signed_in(session_for(&operator)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handle.state(), before);

    let err = handle
        .login("ops@example.com", "hunter2")
        .await
        .expect_err("closed");
    assert_eq!(err, AuthError::ControllerClosed);
}

#[tokio::test]
async fn dropping_provider_releases_subscription() {
    let store = Arc::new(FakeSessionStore::new());
    let provider = start(&store);
    ready(&provider.handle()).await;
    assert_eq!(store.subscriber_count(), 1);

    drop(provider);

    tokio::time::timeout(WAIT, async {
        while store.subscriber_count() != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscription released after drop");
}

fn signed_in(user: &AuthUser) -> AuthUpdate {
    AuthUpdate::SessionChanged(AuthChangeEvent::signed_in(session_for(user)))
}

#[test]
fn only_most_recent_operation_clears_loading() {
    let mut owner = StateOwner::new();
    owner.apply(AuthUpdate::StartupResolved(Ok(None)));
    owner.apply(AuthUpdate::OperationStarted {
        op: 1,
        kind: AuthOperation::Login,
    });
    owner.apply(AuthUpdate::OperationStarted {
        op: 2,
        kind: AuthOperation::Login,
    });
    owner.apply(AuthUpdate::OperationFinished {
        op: 1,
        kind: AuthOperation::Login,
        result: Err(AuthError::InvalidCredentials),
    });
    assert!(owner.state.is_loading);
    assert_eq!(owner.state.error, Some(AuthError::InvalidCredentials));

    owner.apply(AuthUpdate::OperationFinished {
        op: 2,
        kind: AuthOperation::Login,
        result: Ok(()),
    });
    assert!(!owner.state.is_loading);
}

#[test]
fn late_start_of_older_operation_still_settles() {
    let mut owner = StateOwner::new();
    owner.apply(AuthUpdate::StartupResolved(Ok(None)));
    owner.apply(AuthUpdate::OperationStarted {
        op: 2,
        kind: AuthOperation::Logout,
    });
    owner.apply(AuthUpdate::OperationFinished {
        op: 2,
        kind: AuthOperation::Logout,
        result: Ok(()),
    });
    owner.apply(AuthUpdate::OperationStarted {
        op: 1,
        kind: AuthOperation::Login,
    });
    assert!(owner.state.is_loading);
    owner.apply(AuthUpdate::OperationFinished {
        op: 1,
        kind: AuthOperation::Login,
        result: Ok(()),
    });
    assert!(!owner.state.is_loading);
}

#[test]
fn startup_result_does_not_override_newer_session_event() {
    let stale = user("stale@example.com");
    let fresh = user("fresh@example.com");
    let mut owner = StateOwner::new();
    owner.apply(signed_in(&fresh));
    owner.apply(AuthUpdate::StartupResolved(Ok(Some(ResolvedUser {
        user: stale.clone(),
        profile: Some(admin_profile(&stale)),
    }))));
    assert_eq!(owner.state.user.as_ref(), Some(&fresh));
    assert!(owner.state.profile.is_none());
    assert_eq!(owner.state.phase(), AuthPhase::Authenticated);
}

#[test]
fn signed_out_user_never_keeps_profile() {
    let operator = user("ops@example.com");
    let mut owner = StateOwner::new();
    owner.apply(AuthUpdate::StartupResolved(Ok(Some(ResolvedUser {
        user: operator.clone(),
        profile: Some(admin_profile(&operator)),
    }))));
    assert!(owner.state.profile.is_some());

    owner.apply(AuthUpdate::SessionChanged(AuthChangeEvent::signed_out()));
    assert!(owner.state.user.is_none());
    assert!(owner.state.profile.is_none());

    owner.apply(AuthUpdate::StartupResolved(Err(AuthError::Transport("offline".into()))));
    assert!(owner.state.user.is_none());
    assert!(owner.state.profile.is_none());
    assert_eq!(owner.state.error, Some(AuthError::Transport("offline".into())));
}

#[test]
fn session_event_during_login_clears_loading() {
    let operator = user("ops@example.com");
    let mut owner = StateOwner::new();
    owner.apply(AuthUpdate::StartupResolved(Ok(None)));
    owner.apply(AuthUpdate::OperationStarted {
        op: 1,
        kind: AuthOperation::Login,
    });
    owner.apply(signed_in(&operator));
    assert!(!owner.state.is_loading);
    assert_eq!(owner.state.phase(), AuthPhase::Authenticated);

    owner.apply(AuthUpdate::OperationFinished {
        op: 1,
        kind: AuthOperation::Login,
        result: Ok(()),
    });
    assert!(!owner.state.is_loading);
    assert!(owner.state.error.is_none());
}

#[tokio::test]
async fn failed_login_is_recorded_before_it_returns() {
    let operator = user("ops@example.com");
    let store = Arc::new(FakeSessionStore::new().with_account(&operator, "hunter2"));
    let provider = start(&store);
    let handle = provider.handle();
    ready(&handle).await;

    let err = handle
        .login("ops@example.com", "wrong")
        .await
        .expect_err("rejected");

    let state = handle.state();
    assert!(!state.is_loading);
    assert_eq!(state.error, Some(err));
    assert!(state.user.is_none());
}

#[tokio::test]
async fn failed_logout_is_recorded_before_it_returns() {
    let operator = user("ops@example.com");
    let mut store = FakeSessionStore::new().with_current(&operator);
    store.sign_out_error = Some(AuthError::Transport("timed out".into()));
    let store = Arc::new(store);
    let provider = start(&store);
    let handle = provider.handle();
    ready(&handle).await;

    let err = handle.logout().await.expect_err("logout fails");

    let state = handle.state();
    assert!(!state.is_loading);
    assert_eq!(state.error, Some(err));
    assert_eq!(state.user.as_ref(), Some(&operator));
}

#[tokio::test]
async fn in_flight_login_is_visible_as_loading() {
    let operator = user("ops@example.com");
    let gate = Arc::new(Notify::new());
    let mut store = FakeSessionStore::new().with_account(&operator, "hunter2");
    store.sign_in_gate = Some(Arc::clone(&gate));
    let store = Arc::new(store);
    let provider = start(&store);
    let handle = provider.handle();
    ready(&handle).await;

    let login = tokio::spawn({
        let handle = handle.clone();
        async move { handle.login("ops@example.com", "hunter2").await }
    });
    settle(&handle, |s| s.is_loading).await;

    gate.notify_one();
    login.await.expect("join").expect("login");
    let state = handle.state();
    assert!(!state.is_loading);
    assert!(state.error.is_none());
}

#[test]
fn token_refresh_before_startup_keeps_resolved_profile() {
    let operator = user("ops@example.com");
    let mut owner = StateOwner::new();
    owner.apply(AuthUpdate::SessionChanged(AuthChangeEvent::token_refreshed(
        session_for(&operator),
    )));
    owner.apply(AuthUpdate::StartupResolved(Ok(Some(ResolvedUser {
        user: operator.clone(),
        profile: Some(admin_profile(&operator)),
    }))));

    assert_eq!(owner.state.user.as_ref(), Some(&operator));
    assert_eq!(owner.state.profile.as_ref().map(|p| p.id), Some(operator.id));
}

#[test]
fn token_refresh_for_another_user_still_supersedes_startup() {
    let refreshed = user("fresh@example.com");
    let stale = user("stale@example.com");
    let mut owner = StateOwner::new();
    owner.apply(AuthUpdate::SessionChanged(AuthChangeEvent::token_refreshed(
        session_for(&refreshed),
    )));
    owner.apply(AuthUpdate::StartupResolved(Ok(Some(ResolvedUser {
        user: stale.clone(),
        profile: Some(admin_profile(&stale)),
    }))));

    assert_eq!(owner.state.user.as_ref(), Some(&refreshed));
    assert!(owner.state.profile.is_none());
}
