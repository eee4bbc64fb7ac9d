//! Adjutant: a personal AI-employee runtime.
//!
//! The core pipeline is Perception → Plan → Approval → Action → Logging:
//! watchers turn external events into intake wrappers in a filesystem
//! vault, plans propose side-effecting actions, approval happens only by
//! a human moving plan files between vault folders, the executor runs
//! approved plans through channel adapters with a mandatory dry-run, and
//! everything lands in an append-only, PII-redacted audit log. A
//! scheduled orchestrator drives the whole loop.

pub mod adapters;
pub mod audit;
pub mod config;
pub mod credentials;
pub mod executor;
pub mod intake;
pub mod logging;
pub mod orchestrator;
pub mod plan;
pub mod vault;
pub mod watchers;
