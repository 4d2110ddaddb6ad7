//! Process-level wiring: config, store, output, and backend selection.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::command_runner::TokioCommandRunner;
use crate::config::Config;
use crate::error::ConfigError;
use crate::output::OutputContext;
use crate::provider::{Backend, ec2::Ec2Provider, local::LocalProvider};
use crate::store::Store;

/// Timeout for individual `aws` CLI requests. Waits use their own, longer
/// bounds.
const AWS_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Everything a command needs, built once at startup.
pub struct AppContext {
    pub config: Config,
    pub store: Store,
    pub output: OutputContext,
    non_interactive: bool,
}

impl AppContext {
    /// Load configuration and open the store.
    ///
    /// The config path comes from `FERMATA_CONFIG` (default `fermata.yaml`);
    /// the store path from `FERMATA_DB`, falling back to the config's `db`
    /// entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be loaded or the store cannot
    /// be opened.
    pub fn load(no_color: bool, quiet: bool) -> Result<Self> {
        let config_path = Config::locate();
        let config = Config::load(&config_path)?;
        let db_path = std::env::var_os("FERMATA_DB")
            .map_or_else(|| config.db.clone(), PathBuf::from);
        let store = Store::open(&db_path)
            .with_context(|| format!("opening store {}", db_path.display()))?;
        let non_interactive = std::env::var_os("CI").is_some()
            || std::env::var_os("FERMATA_YES").is_some();
        Ok(Self {
            config,
            store,
            output: OutputContext::new(no_color, quiet),
            non_interactive,
        })
    }

    /// Select the compute backend from config. An `aws` section wins over
    /// `local` hostnames.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoBackend`] when the config declares neither.
    pub fn backend(&self) -> Result<Backend<'_>> {
        if self.config.aws.is_some() {
            return Ok(Backend::Ec2(Ec2Provider::new(
                TokioCommandRunner::new(AWS_REQUEST_TIMEOUT),
                &self.config,
            )));
        }
        if !self.config.local.is_empty() {
            return Ok(Backend::Local(LocalProvider::new(&self.config)));
        }
        Err(ConfigError::NoBackend.into())
    }

    /// Ask the user before a destructive action. Auto-confirms when `yes`
    /// was passed or the process runs non-interactively (`CI`/`FERMATA_YES`).
    ///
    /// # Errors
    ///
    /// Returns an error if the prompt cannot be shown.
    pub fn confirm(&self, prompt: &str, yes: bool) -> Result<bool> {
        if yes || self.non_interactive {
            return Ok(true);
        }
        dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("reading confirmation")
    }
}
