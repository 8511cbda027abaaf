use std::sync::RwLock;

/// Supplies the signed-in user, standing in for the hosted auth client.
/// Every engine and advisor operation resolves the user first and fails
/// closed when none is present.
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<String>;
}

/// Holds or clears a signed-in user id behind a lock.
#[derive(Debug, Default)]
pub struct StaticIdentity {
    user_id: RwLock<Option<String>>,
}

impl StaticIdentity {
    pub fn signed_in(user_id: impl Into<String>) -> Self {
        Self {
            user_id: RwLock::new(Some(user_id.into())),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        *self.user_id.write().unwrap() = Some(user_id.into());
    }

    pub fn sign_out(&self) {
        *self.user_id.write().unwrap() = None;
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user(&self) -> Option<String> {
        self.user_id.read().unwrap().clone()
    }
}
