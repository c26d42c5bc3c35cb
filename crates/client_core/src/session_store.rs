//! Contract the auth layer expects from the hosted backend's session handle.

use async_trait::async_trait;
use shared::{
    domain::UserId,
    error::AuthError,
    protocol::{AuthChangeEvent, Profile, Session},
};
use tokio::sync::broadcast;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tracing::warn;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn sign_in_with_credentials(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError>;
    async fn sign_out(&self) -> Result<(), AuthError>;
    async fn current_session(&self) -> Result<Option<Session>, AuthError>;
    /// Secondary lookup of the enrichment record for a signed-in user.
    async fn fetch_profile(&self, user_id: UserId) -> Result<Option<Profile>, AuthError>;
    fn subscribe(&self) -> Subscription;
}

/// Handle on the session store's auth-state event stream.
///
/// Events arrive in emission order. Dropping the subscription releases it;
/// [`Subscription::unsubscribe`] does the same explicitly.
pub struct Subscription {
    stream: Option<BroadcastStream<AuthChangeEvent>>,
}

impl Subscription {
    pub fn new(receiver: broadcast::Receiver<AuthChangeEvent>) -> Self {
        Self {
            stream: Some(BroadcastStream::new(receiver)),
        }
    }

    /// Releases the underlying receiver. Returns `false` if it was already released.
    pub fn unsubscribe(&mut self) -> bool {
        self.stream.take().is_some()
    }

    /// Waits for the next event. `None` once unsubscribed or once the store is gone.
    pub async fn next_event(&mut self) -> Option<AuthChangeEvent> {
        let stream = self.stream.as_mut()?;
        loop {
            match stream.next().await {
                Some(Ok(event)) => return Some(event),
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(skipped, "auth: subscription lagged behind session events");
                }
                None => {
                    self.stream = None;
                    return None;
                }
            }
        }
    }
}
