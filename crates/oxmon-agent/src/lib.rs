//! Host metrics agent.
//!
//! The agent runs the built-in checks in lockstep batches
//! ([`runner::CheckRunner`]), runs custom commands and exporter scrapes on
//! their own schedules ([`scheduler::Handler`]), merges everything into a
//! snapshot and publishes it to the local webserver and an optional push
//! endpoint ([`publish::Publication`]). [`instance::AgentInstance`] ties the
//! pieces together and handles reloads and shutdown.

pub mod aggregate;
pub mod config;
pub mod error;
pub mod instance;
pub mod items;
pub mod logging;
pub mod publish;
pub mod runner;
pub mod scheduler;

pub use error::{AgentError, ConfigError, Result};
pub use instance::{AgentInstance, InstanceOptions, InstanceStatus};
