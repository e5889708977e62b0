//! Sign up, sign in and the signed-in user's profile.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;

use crate::backend::{AuthEvent, AuthUser, Backend, Query};
use crate::recetario::error::{OperationOutcome, RecetarioError, Result};
use crate::recetario::schema::USERS_TABLE;
use crate::recetario::subscription::{Gate, Subscription};

/// How long sign up waits for the platform to create the profile row.
pub const DEFAULT_PROFILE_CHECK_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Chef,
    #[default]
    Usuario,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Chef => "chef",
            Role::Usuario => "usuario",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = RecetarioError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "chef" => Ok(Role::Chef),
            "usuario" => Ok(Role::Usuario),
            other => Err(RecetarioError::Configuration(format!(
                "unknown role: {}",
                other
            ))),
        }
    }
}

/// Row of the profile collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    #[serde(rename = "rol", default)]
    pub role: Role,
}

impl UserProfile {
    pub fn is_chef(&self) -> bool {
        self.role == Role::Chef
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SignUpOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub user: Option<AuthUser>,
    /// The account exists but has to be confirmed by email before signing in.
    pub needs_email_confirmation: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SignInOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub user: Option<AuthUser>,
}

/// Resolves the user behind the active session.
///
/// A session that cannot be read counts as no session.
pub(crate) async fn require_actor(backend: &dyn Backend) -> Result<AuthUser> {
    match backend.current_user().await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(RecetarioError::Unauthenticated),
        Err(e) => {
            tracing::warn!(
                target: "recetario::auth",
                "Could not read session: {}",
                e
            );
            Err(RecetarioError::Unauthenticated)
        }
    }
}

async fn load_profile(backend: &dyn Backend, user_id: &str) -> Result<Option<UserProfile>> {
    let query = Query::new(USERS_TABLE).eq("id", user_id).limit(1);
    let row = backend.select(&query).await?.into_iter().next();
    Ok(row.map(serde_json::from_value).transpose()?)
}

#[derive(Clone)]
pub struct AuthService {
    backend: Arc<dyn Backend>,
    profile_check_delay: Duration,
}

impl AuthService {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            profile_check_delay: DEFAULT_PROFILE_CHECK_DELAY,
        }
    }

    pub fn with_profile_check_delay(mut self, delay: Duration) -> Self {
        self.profile_check_delay = delay;
        self
    }

    /// Creates an account with `role` recorded in the user metadata.
    ///
    /// The profile row is written by the platform; after a short wait its presence is
    /// checked and logged, but a missing row does not fail the sign up.
    pub async fn sign_up(&self, email: &str, password: &str, role: Role) -> SignUpOutcome {
        tracing::info!(
            target: "recetario::auth",
            "Signing up {} as {}",
            email,
            role
        );
        let user = match self
            .backend
            .sign_up(email, password, json!({ "rol": role }))
            .await
        {
            Ok(user) => user,
            Err(e) => {
                tracing::error!(target: "recetario::auth", "Sign up failed: {}", e);
                return SignUpOutcome {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let needs_email_confirmation = user
            .identities
            .as_ref()
            .is_some_and(|identities| identities.is_empty());

        tokio::time::sleep(self.profile_check_delay).await;
        match load_profile(self.backend.as_ref(), &user.id).await {
            Ok(Some(profile)) => tracing::debug!(
                target: "recetario::auth",
                "Profile created for {} with role {}",
                profile.email,
                profile.role
            ),
            Ok(None) => tracing::warn!(
                target: "recetario::auth",
                "No profile row found for {}",
                user.id
            ),
            Err(e) => tracing::warn!(
                target: "recetario::auth",
                "Could not check profile row: {}",
                e
            ),
        }

        SignUpOutcome {
            success: true,
            error: None,
            user: Some(user),
            needs_email_confirmation,
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> SignInOutcome {
        match self.backend.sign_in_with_password(email, password).await {
            Ok(user) => {
                tracing::info!(target: "recetario::auth", "Signed in {}", user.id);
                SignInOutcome {
                    success: true,
                    error: None,
                    user: Some(user),
                }
            }
            Err(e) => {
                tracing::error!(target: "recetario::auth", "Sign in failed: {}", e);
                SignInOutcome {
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    pub async fn sign_out(&self) -> OperationOutcome {
        let result: Result<()> = self.backend.sign_out().await.map_err(Into::into);
        if let Err(e) = &result {
            tracing::error!(target: "recetario::auth", "Sign out failed: {}", e);
        }
        result.into()
    }

    /// Profile of the signed-in user, or `None` without a session or profile row.
    pub async fn current_user(&self) -> Option<UserProfile> {
        let user = require_actor(self.backend.as_ref()).await.ok()?;
        match load_profile(self.backend.as_ref(), &user.id).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::error!(
                    target: "recetario::auth",
                    "Failed to load profile: {}",
                    e
                );
                None
            }
        }
    }

    /// Calls `on_change` with the new profile on every sign in, and with `None` on
    /// sign out.
    pub fn watch_auth_state<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(Option<UserProfile>) + Send + Sync + 'static,
    {
        let mut events = self.backend.auth_events();
        let gate = Gate::new();
        let task_gate = gate.clone();
        let backend = self.backend.clone();
        let task = tokio::spawn(async move {
            loop {
                let profile = match events.recv().await {
                    Ok(AuthEvent::SignedIn(user)) => load_profile(backend.as_ref(), &user.id)
                        .await
                        .unwrap_or_else(|e| {
                            tracing::error!(
                                target: "recetario::auth",
                                "Failed to load profile: {}",
                                e
                            );
                            None
                        }),
                    Ok(AuthEvent::SignedOut) => None,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(
                            target: "recetario::auth",
                            "Missed {} auth events",
                            skipped
                        );
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if task_gate.run(|| on_change(profile)).is_none() {
                    break;
                }
            }
        });
        Subscription::new("auth-state", gate, task, futures::future::ready(()).boxed())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::backend::{MemoryBackend, Operation};
    use crate::recetario::test_utils::*;

    fn auth_for(backend: &Arc<MemoryBackend>) -> AuthService {
        AuthService::new(backend.clone()).with_profile_check_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn sign_up_records_role_and_profile() {
        let (backend, _, _) = create_test_backend();
        let outcome = auth_for(&backend)
            .sign_up("carla@example.com", "secreto", Role::Chef)
            .await;

        assert!(outcome.success);
        assert!(!outcome.needs_email_confirmation);
        let user = outcome.user.unwrap();
        assert_eq!(user.user_metadata["rol"], "chef");

        let profile = auth_for(&backend).current_user().await.unwrap();
        assert_eq!(profile.email, "carla@example.com");
        assert!(profile.is_chef());
    }

    #[tokio::test]
    async fn sign_up_flags_pending_confirmation() {
        let backend = Arc::new(
            MemoryBackend::new()
                .with_profile_table(USERS_TABLE)
                .with_email_confirmation(),
        );
        let outcome = auth_for(&backend)
            .sign_up("dani@example.com", "secreto", Role::Usuario)
            .await;

        assert!(outcome.success);
        assert!(outcome.needs_email_confirmation);
        assert!(auth_for(&backend).current_user().await.is_none());
    }

    #[tokio::test]
    async fn sign_up_without_profile_row_still_succeeds() {
        let backend = Arc::new(MemoryBackend::new());
        let outcome = auth_for(&backend)
            .sign_up("eva@example.com", "secreto", Role::Usuario)
            .await;
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn duplicate_sign_up_fails() {
        let (backend, _, _) = create_test_backend();
        let outcome = auth_for(&backend)
            .sign_up(ALICE_EMAIL, "otra", Role::Usuario)
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("User already registered"));
    }

    #[tokio::test]
    async fn sign_in_and_out() {
        let (backend, _, _) = create_test_backend();
        let auth = auth_for(&backend);

        let bad = auth.sign_in(BOB_EMAIL, "wrong").await;
        assert!(!bad.success);
        assert!(bad.error.is_some());

        let good = auth.sign_in(BOB_EMAIL, TEST_PASSWORD).await;
        assert!(good.success);
        let profile = auth.current_user().await.unwrap();
        assert_eq!(profile.email, BOB_EMAIL);
        assert!(!profile.is_chef());

        assert!(auth.sign_out().await.success);
        assert!(auth.current_user().await.is_none());
    }

    #[tokio::test]
    async fn current_user_is_none_when_profile_read_fails() {
        let (backend, _, _) = create_test_backend();
        backend.inject_failure(Operation::Select, USERS_TABLE);
        assert!(auth_for(&backend).current_user().await.is_none());
    }

    #[tokio::test]
    async fn auth_state_changes_are_reported() {
        let (backend, _, bob) = create_test_backend();
        let auth = auth_for(&backend);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let subscription = auth.watch_auth_state(move |profile| {
            let _ = tx.send(profile);
        });

        backend.sign_in_as(&bob);
        let profile = recv_within(&mut rx).await.unwrap();
        assert_eq!(profile.id, bob.id);

        auth.sign_out().await;
        assert!(recv_within(&mut rx).await.is_none());

        subscription.close().await;
    }

    #[test]
    fn role_parses_wire_names() {
        assert_eq!("chef".parse::<Role>().unwrap(), Role::Chef);
        assert_eq!("usuario".parse::<Role>().unwrap(), Role::Usuario);
        assert!("admin".parse::<Role>().is_err());
        assert_eq!(serde_json::to_value(Role::Chef).unwrap(), "chef");
    }
}
