use async_trait::async_trait;

use crate::entry::Entry;
use crate::error::DirectoryError;

pub mod cache;
pub mod mapping;
pub mod passthrough;
pub mod utils;

pub use passthrough::{AuthenticationOutcome, PassThroughPolicy, PassThroughPolicyFactory, PassThroughState};

/// An authentication policy as seen by the directory server.
#[async_trait]
pub trait AuthenticationPolicy: Send + Sync {
    /// Per-bind state for the local entry being authenticated.
    fn create_authentication_policy_state(&self, entry: Entry) -> Box<dyn AuthenticationPolicyState>;

    /// Stop background work and close every connection.
    async fn finalize_authentication_policy(&self);
}

#[async_trait]
pub trait AuthenticationPolicyState: Send {
    /// Returns Ok(true) if the password is valid, Ok(false) if it is not, or
    /// Err if no remote server could decide.
    async fn password_matches(&mut self, password: &str) -> Result<bool, DirectoryError>;

    /// Persist whatever a successful bind left to write back.
    async fn finalize_state_after_bind(&mut self);

    fn entry(&self) -> &Entry;
}
