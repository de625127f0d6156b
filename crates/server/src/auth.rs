// Identity verification seam.
//
// Credential validation is owned by an external identity service; the
// server only consumes a `verify` contract. The dev implementation here
// keeps the binary runnable standalone.

use std::collections::HashMap;

use async_trait::async_trait;
use atelier_common::types::{Identity, Role};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential was rejected")]
    InvalidCredential,
    #[error("identity service unavailable")]
    Unavailable,
}

/// External identity collaborator: validates an externally-issued credential
/// and yields the identity bound to it.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError>;
}

/// Development verifier backed by a static token table.
///
/// Tokens come from `ATELIER_AUTH_TOKENS` (`token=user:role` pairs,
/// comma-separated). When no table is configured, any credential of the form
/// `dev-<user>` authenticates as a collaborator named `<user>`.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn from_spec(spec: Option<&str>) -> Self {
        let mut tokens = HashMap::new();
        if let Some(spec) = spec {
            for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
                let Some((token, principal)) = entry.split_once('=') else {
                    tracing::warn!(entry, "skipping malformed auth token entry");
                    continue;
                };
                let (user_id, role) = match principal.split_once(':') {
                    Some((user, role_str)) => match parse_role(role_str) {
                        Some(role) => (user, role),
                        None => {
                            tracing::warn!(entry, "skipping auth token entry with unknown role");
                            continue;
                        }
                    },
                    None => (principal, Role::Collaborator),
                };
                tokens.insert(
                    token.to_string(),
                    Identity {
                        user_id: user_id.to_string(),
                        role,
                        permissions: role.default_permissions(),
                    },
                );
            }
        }
        Self { tokens }
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, credential: &str) -> Result<Identity, AuthError> {
        if let Some(identity) = self.tokens.get(credential) {
            return Ok(identity.clone());
        }
        // Fallback dev scheme when no token table is configured.
        if self.tokens.is_empty() {
            if let Some(user) = credential.strip_prefix("dev-") {
                if !user.is_empty() {
                    return Ok(Identity {
                        user_id: user.to_string(),
                        role: Role::Collaborator,
                        permissions: Role::Collaborator.default_permissions(),
                    });
                }
            }
        }
        Err(AuthError::InvalidCredential)
    }
}

fn parse_role(raw: &str) -> Option<Role> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "owner" => Some(Role::Owner),
        "admin" => Some(Role::Admin),
        "collaborator" => Some(Role::Collaborator),
        "viewer" => Some(Role::Viewer),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atelier_common::types::Permission;

    #[tokio::test]
    async fn token_table_maps_credentials_to_identities() {
        let verifier = StaticTokenVerifier::from_spec(Some("s3cret=alice:owner,t0ken=bob:viewer"));

        let alice = verifier.verify("s3cret").await.unwrap();
        assert_eq!(alice.user_id, "alice");
        assert_eq!(alice.role, Role::Owner);
        assert!(alice.has_permission(Permission::ManageMembers));

        let bob = verifier.verify("t0ken").await.unwrap();
        assert_eq!(bob.role, Role::Viewer);
        assert!(!bob.has_permission(Permission::Write));
    }

    #[tokio::test]
    async fn unknown_credential_is_rejected() {
        let verifier = StaticTokenVerifier::from_spec(Some("s3cret=alice:owner"));
        assert_eq!(verifier.verify("wrong").await, Err(AuthError::InvalidCredential));
        // The dev fallback is disabled once a table is configured.
        assert_eq!(verifier.verify("dev-mallory").await, Err(AuthError::InvalidCredential));
    }

    #[tokio::test]
    async fn dev_fallback_without_table() {
        let verifier = StaticTokenVerifier::from_spec(None);
        let identity = verifier.verify("dev-carol").await.unwrap();
        assert_eq!(identity.user_id, "carol");
        assert_eq!(identity.role, Role::Collaborator);

        assert_eq!(verifier.verify("dev-").await, Err(AuthError::InvalidCredential));
        assert_eq!(verifier.verify("carol").await, Err(AuthError::InvalidCredential));
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let verifier =
            StaticTokenVerifier::from_spec(Some("good=alice:admin,no-separator,bad=eve:wizard"));
        assert!(verifier.verify("good").await.is_ok());
        assert_eq!(verifier.verify("bad").await, Err(AuthError::InvalidCredential));
    }

    #[tokio::test]
    async fn role_defaults_to_collaborator_without_suffix() {
        let verifier = StaticTokenVerifier::from_spec(Some("tok=dana"));
        let identity = verifier.verify("tok").await.unwrap();
        assert_eq!(identity.role, Role::Collaborator);
    }
}
