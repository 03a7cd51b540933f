pub mod acquire;
pub mod cert;
pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod host;
pub mod inspect;
pub mod io;
pub mod lock;
pub mod paths;
pub mod pipeline;
pub mod probe;
pub mod provision;
pub mod reset;
pub mod runlog;
pub mod service;
pub mod settings;
pub mod template;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{HostforgeError, Result};
