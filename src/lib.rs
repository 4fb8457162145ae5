pub mod auth;
pub mod config;
pub mod connection;
pub mod entry;
pub mod error;
pub mod monitor;
pub mod provider;

pub use auth::{AuthenticationPolicy, AuthenticationPolicyState, PassThroughPolicy, PassThroughPolicyFactory};
pub use config::{Config, PolicyConfig};
pub use entry::{Entry, EntryStore, Schema, StaticSchema};
pub use error::{DirectoryError, PtaError, ResultCode};
pub use provider::{LdapProvider, Provider};
