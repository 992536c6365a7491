use std::sync::Arc;

use shared::{
    domain::User,
    rest::{LoginRequest, RegisterRequest},
};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::{
    api::{ApiError, ChatApi},
    connection::ConnectionManager,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub user: Option<User>,
    pub is_authenticated: bool,
    /// True until the first session validation has finished.
    pub is_loading: bool,
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            user: None,
            is_authenticated: false,
            is_loading: true,
        }
    }
}

pub struct SessionGate {
    api: Arc<dyn ChatApi>,
    connection: Arc<ConnectionManager>,
    auth: watch::Sender<AuthState>,
}

impl SessionGate {
    pub fn new(api: Arc<dyn ChatApi>, connection: Arc<ConnectionManager>) -> Self {
        let (auth, _) = watch::channel(AuthState::default());
        Self {
            api,
            connection,
            auth,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.auth.subscribe()
    }

    pub fn current_user(&self) -> Option<User> {
        self.auth.borrow().user.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.borrow().is_authenticated
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub async fn validate_session(&self) -> bool {
        match self.api.me().await {
            Ok(user) => {
                info!(user_id = %user.id, "session validated");
                self.authenticate(user);
                true
            }
            Err(err) => {
                info!(error = %err, "no valid session");
                self.invalidate();
                false
            }
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User, ApiError> {
        let user = self
            .api
            .login(LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            })
            .await?;
        info!(user_id = %user.id, "logged in");
        self.authenticate(user.clone());
        Ok(user)
    }

    pub async fn register(
        &self,
        email: &str,
        username: &str,
        password: &str,
    ) -> Result<User, ApiError> {
        let user = self
            .api
            .register(RegisterRequest {
                email: email.to_string(),
                username: username.to_string(),
                password: password.to_string(),
            })
            .await?;
        info!(user_id = %user.id, "registered");
        self.authenticate(user.clone());
        Ok(user)
    }

    pub async fn logout(&self) {
        if let Err(err) = self.api.logout().await {
            warn!(error = %err, "server logout failed, clearing local session anyway");
        }
        self.invalidate();
    }

    /// Marks the gate authenticated as `user`; connects on the false to true
    /// transition only.
    pub fn authenticate(&self, user: User) {
        let mut became_authenticated = false;
        self.auth.send_modify(|state| {
            became_authenticated = !state.is_authenticated;
            state.user = Some(user);
            state.is_authenticated = true;
            state.is_loading = false;
        });
        if became_authenticated {
            self.connection.connect();
        }
    }

    /// Drops the session and its credentials; disconnects on the true to
    /// false transition only.
    pub fn invalidate(&self) {
        self.api.clear_credentials();
        let mut lost_authentication = false;
        self.auth.send_modify(|state| {
            lost_authentication = state.is_authenticated;
            state.user = None;
            state.is_authenticated = false;
            state.is_loading = false;
        });
        if lost_authentication {
            self.connection.disconnect();
        }
    }

    pub fn shutdown(&self) {
        self.connection.disconnect();
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
