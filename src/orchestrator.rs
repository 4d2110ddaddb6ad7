//! Lifecycle orchestration: ties the provider, the store, and the remote
//! channel together so every transition is recorded and every remote touch
//! counts as activity.
//!
//! Ordering rules live here. A start transition is recorded before the
//! provider request (billing starts when the provider starts work); a stop
//! transition is recorded only after the provider confirms the instance
//! stopped (billing runs until it actually stops).

use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::channel::{Channel, KnownHosts, SshChannel};
use crate::config::{Config, InstanceProfile};
use crate::install;
use crate::output::Reporter;
use crate::probe::ActivityPinger;
use crate::provider::{Filter, Instance, Provider};
use crate::store::{Store, Transition};

/// Spacing between connection attempts while a fresh instance boots.
const BRING_UP_INTERVAL: Duration = Duration::from_secs(2);

pub struct Orchestrator<'a, P: Provider> {
    pub provider: P,
    store: &'a Store,
    config: &'a Config,
    reporter: &'a dyn Reporter,
}

impl<'a, P: Provider> Orchestrator<'a, P> {
    pub fn new(
        provider: P,
        store: &'a Store,
        config: &'a Config,
        reporter: &'a dyn Reporter,
    ) -> Self {
        Self { provider, store, config, reporter }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        self.config
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        self.store
    }

    #[must_use]
    pub fn reporter(&self) -> &dyn Reporter {
        self.reporter
    }

    /// Look up a live (non-terminated) instance by name. A miss is
    /// reported, not an error.
    ///
    /// # Errors
    ///
    /// Propagates provider request failures.
    pub async fn resolve(&self, name: &str) -> Result<Option<Instance>> {
        let instance = self.provider.get_instance(name, &[Filter::active()]).await?;
        if instance.is_none() {
            self.reporter.warn(&format!("no instance named {name}"));
        }
        Ok(instance)
    }

    /// Create and fully provision a new instance. Refuses (with a report,
    /// not an error) when one with the name already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if creation or any provisioning step fails.
    pub async fn create(&self, name: &str) -> Result<Option<Instance>> {
        let profile = self.config.profile(name)?;
        if self
            .provider
            .get_instance(name, &[Filter::active()])
            .await?
            .is_some()
        {
            self.reporter.warn(&format!("instance {name} already exists"));
            return Ok(None);
        }

        self.reporter.step(&format!("creating {name}"));
        let instance = self.provider.create_instance(name).await?;
        self.store.record_transition(&instance.id, Transition::Start)?;
        self.provider.wait_until_running(&instance.id).await?;
        // Refresh: addresses are only assigned once the instance runs.
        let instance = self.provider.get_instance_by_id(&instance.id).await?;

        let chan = self.channel(&instance, profile)?;
        self.reporter.step("waiting for the connection to come up");
        loop {
            if chan.run_ok("true").await.unwrap_or(false) {
                break;
            }
            tokio::time::sleep(BRING_UP_INTERVAL).await;
        }
        chan.run(&format!("sudo hostname {name}")).await?;
        if let Some(host) = instance.private_ip.as_deref().or(instance.public_ip.as_deref()) {
            KnownHosts::new()?.register(host, &crate::command_runner::TokioCommandRunner::new(
                Duration::from_secs(30),
            ))
            .await?;
        }

        self.reporter.step("installing essentials");
        install::install_essential(&chan, profile).await?;
        install::attach_volumes(&self.provider, &chan, self.config.aws.as_ref(), &instance.id, profile)
            .await?;
        install::install_base(&chan, profile).await?;
        install::install_crontab(&chan, profile).await?;
        self.reporter.success(&format!("{name} is ready"));
        Ok(Some(instance))
    }

    /// # Errors
    ///
    /// Propagates provider or store failures.
    pub async fn start(&self, name: &str) -> Result<()> {
        let Some(instance) = self.resolve(name).await? else {
            return Ok(());
        };
        self.store.record_transition(&instance.id, Transition::Start)?;
        self.provider.start(&instance.id).await?;
        self.provider.wait_until_running(&instance.id).await?;
        self.reporter.success(&format!("{name} is running"));
        Ok(())
    }

    /// # Errors
    ///
    /// Propagates provider or store failures.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let Some(instance) = self.resolve(name).await? else {
            return Ok(());
        };
        self.stop_instance(&instance).await?;
        self.reporter.success(&format!("{name} is stopped"));
        Ok(())
    }

    /// Stop an already-resolved instance. The stop transition lands only
    /// after the provider confirms the stopped state.
    ///
    /// # Errors
    ///
    /// Propagates provider or store failures.
    pub async fn stop_instance(&self, instance: &Instance) -> Result<()> {
        self.provider.stop(&instance.id).await?;
        self.provider.wait_until_stopped(&instance.id).await?;
        self.store.record_transition(&instance.id, Transition::Stop)?;
        Ok(())
    }

    /// Terminate an instance. Protected profiles are refused outright;
    /// no provider call is made for them.
    ///
    /// # Errors
    ///
    /// Propagates provider or store failures.
    pub async fn terminate(&self, name: &str) -> Result<()> {
        if self.config.profile_opt(name).is_some_and(|p| p.protected) {
            self.reporter.warn(&format!("{name} is protected; refusing to terminate"));
            return Ok(());
        }
        let Some(instance) = self.resolve(name).await? else {
            return Ok(());
        };
        self.provider.terminate(&instance.id).await?;
        self.provider.wait_until_terminated(&instance.id).await?;
        self.store.record_transition(&instance.id, Transition::Stop)?;
        self.reporter.success(&format!("{name} is terminated"));
        Ok(())
    }

    /// # Errors
    ///
    /// Propagates provider failures.
    pub async fn snapshot(&self, name: &str, image_name: &str) -> Result<Option<String>> {
        let Some(instance) = self.resolve(name).await? else {
            return Ok(None);
        };
        self.reporter.step(&format!("imaging {name} as {image_name}"));
        let image_id = self.provider.snapshot(&instance.id, image_name).await?;
        self.reporter.success(&format!("image {image_id} available"));
        Ok(Some(image_id))
    }

    /// Run one remote command in the foreground with the profile's vars
    /// set. Marks activity up front; channel traffic keeps marking it.
    ///
    /// # Errors
    ///
    /// Propagates connection or store failures.
    pub async fn run(&self, name: &str, command: &str) -> Result<Option<ExitStatus>> {
        let Some((_, chan)) = self.interactive_channel(name).await? else {
            return Ok(None);
        };
        Ok(Some(chan.shell(Some(command)).await?))
    }

    /// Interactive shell (or one command) inside the profile's activated
    /// virtualenv.
    ///
    /// # Errors
    ///
    /// Propagates connection or store failures.
    pub async fn ssh(&self, name: &str, command: Option<&str>) -> Result<Option<ExitStatus>> {
        let profile = self.config.profile(name)?;
        let wrapped = format!(
            "source {}/bin/activate; {}",
            profile.env,
            command.unwrap_or("bash")
        );
        let Some((_, chan)) = self.interactive_channel(name).await? else {
            return Ok(None);
        };
        Ok(Some(chan.shell(Some(&wrapped)).await?))
    }

    /// Install the profile's base package set on a live instance.
    ///
    /// # Errors
    ///
    /// Propagates connection or remote failures.
    pub async fn install(&self, name: &str) -> Result<()> {
        let profile = self.config.profile(name)?;
        let Some((_, chan)) = self.interactive_channel(name).await? else {
            return Ok(());
        };
        install::install_base(&chan, profile).await?;
        self.reporter.success("base packages installed");
        Ok(())
    }

    /// Ship the app package set and run the profile's entrypoint if it has
    /// one.
    ///
    /// # Errors
    ///
    /// Propagates connection or remote failures.
    pub async fn deploy(&self, name: &str, no_deps: bool) -> Result<()> {
        let profile = self.config.profile(name)?;
        let Some((_, chan)) = self.interactive_channel(name).await? else {
            return Ok(());
        };
        install::deploy_packages(&chan, profile, no_deps).await?;
        if let Some(entrypoint) = &profile.entrypoint {
            let wrapped = format!("source {}/bin/activate; {entrypoint}", profile.env);
            chan.shell(Some(&wrapped)).await?;
        }
        self.reporter.success(&format!("{name} deployed"));
        Ok(())
    }

    async fn interactive_channel(&self, name: &str) -> Result<Option<(Instance, SshChannel)>> {
        let profile = self.config.profile(name)?;
        let Some(instance) = self.resolve(name).await? else {
            return Ok(None);
        };
        self.store.record_activity(&instance.id)?;
        let chan = self.channel(&instance, profile)?;
        Ok(Some((instance, chan)))
    }

    /// Build the remote channel for an instance, wired to the activity
    /// probe. Prefers the private address.
    fn channel(&self, instance: &Instance, profile: &InstanceProfile) -> Result<SshChannel> {
        let host = instance
            .private_ip
            .as_deref()
            .or(instance.public_ip.as_deref())
            .with_context(|| format!("{} has no reachable address", instance.name))?;
        let known_hosts = KnownHosts::new()?;
        let pinger = Arc::new(ActivityPinger::new(&self.config.db, &instance.id));
        Ok(
            SshChannel::new(host, &profile.user, &profile.key_file, known_hosts.path().to_path_buf())
                .with_env(profile.vars.clone())
                .with_pinger(pinger),
        )
    }
}
