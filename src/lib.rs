//! ContainAI host trust boundary.
//!
//! Keeps agent, proxy and log-forwarder containers confined by current
//! kernel sandbox policy. Profiles are rendered per channel from templates,
//! installed and loaded by the enforcer, and re-checked by the launch gate
//! before every container start. The installer crate builds on this one to
//! admit only verified releases.
//!
//! See `DESIGN.md` for the architecture.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod channel;
pub mod config;
pub mod error;
pub mod logging;

pub mod integrity;
pub mod lock;

pub mod enforcer;
pub mod gate;
pub mod kernel;
pub mod profiles;

pub use channel::Channel;
pub use config::{ContainaiConfig, Context};
pub use error::{SecurityError, SecurityResult};
