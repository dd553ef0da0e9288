//! Shared model types for the netcore services.
//!
//! DHCP and DNS share one canonical store, so they also share one model:
//! MAC addresses, the layered configuration scopes that produce an effective
//! binding, and the naming scheme that maps DNS names onto store keys.

pub mod binding;
pub mod error;
pub mod identity;
pub mod mac;
pub mod names;

pub use binding::{
    Assignment, AssignmentMode, AttrKey, AttrOverride, Binding, BindingPatch, ServerConfig,
    ServerPatch,
};
pub use error::ConfigError;
pub use identity::Identity;
pub use mac::MacAddr;
