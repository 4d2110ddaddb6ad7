//! Idle reaper: stops running instances whose last activity is older than
//! the configured idle threshold.
//!
//! The store's idle query is state-blind; every candidate is re-checked
//! against the provider with a running-state filter at decision time, so a
//! manual stop or terminate between query and action is harmless.

use anyhow::Result;

use crate::orchestrator::Orchestrator;
use crate::provider::{Filter, Provider};

/// One reaper sweep. Intended to run from cron or a timer; a sweep with no
/// idle candidates is a cheap no-op.
///
/// # Errors
///
/// Propagates store and provider failures. A per-instance stop failure
/// aborts the sweep so it surfaces in the cron log.
pub async fn run<P: Provider>(orch: &Orchestrator<'_, P>) -> Result<()> {
    let Some(idle_timeout) = orch.config().idle_timeout else {
        orch.reporter().warn("auto-stop disabled (no idle_timeout_minutes configured)");
        return Ok(());
    };

    for id in orch.store().idle_ids(idle_timeout)? {
        let running = orch
            .provider
            .get_instances(&[Filter::id(&id), Filter::state(&["running"])])
            .await?;
        for instance in running {
            let Some(profile) = orch.config().profile_opt(&instance.name) else {
                tracing::debug!(id = %instance.id, name = %instance.name, "no profile; skipping");
                continue;
            };
            if profile.protected || !profile.auto_stop {
                tracing::debug!(id = %instance.id, name = %instance.name, "auto-stop opted out");
                continue;
            }
            tracing::info!(
                id = %instance.id,
                name = %instance.name,
                idle_secs = idle_timeout.as_secs(),
                "stopping idle instance"
            );
            orch.stop_instance(&instance).await?;
            tracing::info!(id = %instance.id, name = %instance.name, "stopped");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::config::Config;
    use crate::output::test_support::RecordingReporter;
    use crate::provider::InstanceState;
    use crate::provider::test_support::{FakeProvider, instance};
    use crate::store::{Store, Transition};

    struct Fixture {
        _dir: TempDir,
        store: Store,
        config: Config,
        reporter: RecordingReporter,
    }

    impl Fixture {
        fn new(yaml: &str) -> Self {
            let dir = TempDir::new().expect("tempdir");
            let store = Store::open(&dir.path().join("state.db")).expect("open store");
            let config = Config::parse(yaml).expect("parse config");
            Self { _dir: dir, store, config, reporter: RecordingReporter::default() }
        }

        fn idle(&self, id: &str) {
            self.store.record_transition(id, Transition::Start).expect("start");
            self.store.record_activity(id).expect("activity");
            // Push the activity timestamp well past any configured timeout.
            self.store.backdate_activity(id, 7200);
        }

        fn orchestrator(&self, provider: FakeProvider) -> Orchestrator<'_, FakeProvider> {
            Orchestrator::new(provider, &self.store, &self.config, &self.reporter)
        }
    }

    const TIMED: &str =
        "idle_timeout_minutes: 30\ninstances:\n  web:\n    user: u\n    env: /e\n    key_file: /k\n";

    #[tokio::test]
    async fn stops_an_idle_running_instance() {
        let fx = Fixture::new(TIMED);
        fx.idle("i-1");
        let provider =
            FakeProvider::with_instances(vec![instance("i-1", "web", InstanceState::Running)]);
        let orch = fx.orchestrator(provider);
        run(&orch).await.expect("sweep");
        assert_eq!(orch.provider.stop_calls.borrow().as_slice(), ["i-1"]);
        assert_eq!(fx.store.open_interval_count("i-1"), 0);
    }

    #[tokio::test]
    async fn recent_activity_is_left_alone() {
        let fx = Fixture::new(TIMED);
        fx.store.record_transition("i-1", Transition::Start).expect("start");
        fx.store.record_activity("i-1").expect("activity");
        let provider =
            FakeProvider::with_instances(vec![instance("i-1", "web", InstanceState::Running)]);
        let orch = fx.orchestrator(provider);
        run(&orch).await.expect("sweep");
        assert!(orch.provider.stop_calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn idle_but_stopped_instances_are_skipped() {
        let fx = Fixture::new(TIMED);
        fx.idle("i-1");
        let provider =
            FakeProvider::with_instances(vec![instance("i-1", "web", InstanceState::Stopped)]);
        let orch = fx.orchestrator(provider);
        run(&orch).await.expect("sweep");
        assert!(orch.provider.stop_calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn protected_instances_survive_the_sweep() {
        let fx = Fixture::new(
            "idle_timeout_minutes: 30\ninstances:\n  db:\n    user: u\n    env: /e\n    key_file: /k\n    protected: true\n",
        );
        fx.idle("i-1");
        let provider =
            FakeProvider::with_instances(vec![instance("i-1", "db", InstanceState::Running)]);
        let orch = fx.orchestrator(provider);
        run(&orch).await.expect("sweep");
        assert!(orch.provider.stop_calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn auto_stop_opt_out_is_honored() {
        let fx = Fixture::new(
            "idle_timeout_minutes: 30\ninstances:\n  web:\n    user: u\n    env: /e\n    key_file: /k\n    auto_stop: false\n",
        );
        fx.idle("i-1");
        let provider =
            FakeProvider::with_instances(vec![instance("i-1", "web", InstanceState::Running)]);
        let orch = fx.orchestrator(provider);
        run(&orch).await.expect("sweep");
        assert!(orch.provider.stop_calls.borrow().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_timeout_disables_the_sweep() {
        let fx = Fixture::new("instances: {}\n");
        fx.idle("i-1");
        let provider =
            FakeProvider::with_instances(vec![instance("i-1", "web", InstanceState::Running)]);
        let orch = fx.orchestrator(provider);
        run(&orch).await.expect("sweep");
        assert!(orch.provider.stop_calls.borrow().is_empty());
        assert!(fx.reporter.contains("auto-stop disabled"));
    }

    #[tokio::test]
    async fn instances_without_a_profile_are_skipped() {
        let fx = Fixture::new(TIMED);
        fx.idle("i-9");
        let provider =
            FakeProvider::with_instances(vec![instance("i-9", "stranger", InstanceState::Running)]);
        let orch = fx.orchestrator(provider);
        run(&orch).await.expect("sweep");
        assert!(orch.provider.stop_calls.borrow().is_empty());
    }
}
