//! Fermata - remote compute instance lifecycle with activity tracking and
//! idle auto-stop.
//!
//! The core pieces: a [`provider`] abstraction over compute backends, a
//! SQLite [`store`] tracking activity and runtime intervals, a throttled
//! activity [`probe`] fed by channel traffic, and a [`reaper`] that stops
//! instances idle past a configured threshold.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod app;
pub mod channel;
pub mod cli;
pub mod command_runner;
pub mod commands;
pub mod config;
pub mod error;
pub mod install;
pub mod orchestrator;
pub mod output;
pub mod probe;
pub mod provider;
pub mod reaper;
pub mod store;
