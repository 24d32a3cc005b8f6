#![forbid(unsafe_code)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod stash;
pub mod store;

pub use config::Settings;
pub use error::StashError;
pub use stash::Stash;
pub use store::StashStore;
