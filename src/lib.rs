//! campclerk — registration execution coordinator.
//!
//! Watches for capacity-limited session registrations to open, dispatches an
//! automated attempt at the right instant, hands control to a human through a
//! short-lived magic link when a bot-challenge interrupts the attempt, and
//! settles the pre-authorized charge exactly once on the terminal outcome.
//!
//! The catalog/search UI, account CRUD, page-extraction rules, and the
//! browser worker that drives provider signup flows are external
//! collaborators behind the seams in [`executor`], [`notify`], and
//! [`settlement`].

pub mod challenge;
pub mod checkpoint;
pub mod classifier;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod executor;
pub mod inbound;
pub mod notify;
pub mod plan;
pub mod poller;
pub mod settlement;
pub mod web;
pub mod window;

pub use error::{Error, Result};
