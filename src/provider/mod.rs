//! Provider capability — the backend abstraction over compute APIs.
//!
//! The orchestrator and reaper drive any backend through the [`Provider`]
//! trait; concrete backends (EC2, local) translate its primitives into
//! provider requests. Instance state is provider-reported and never invented
//! here: readiness barriers only poll until the provider says the target
//! state is reached.

pub mod ec2;
pub mod local;

use std::time::Duration;

use anyhow::Result;

use crate::config::VolumeProfile;

/// Fixed polling interval for readiness barriers.
pub const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Provider-reported lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Unknown,
}

impl InstanceState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::ShuttingDown => "shutting-down",
            Self::Terminated => "terminated",
            Self::Unknown => "unknown",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "shutting-down" => Self::ShuttingDown,
            "terminated" => Self::Terminated,
            _ => Self::Unknown,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote compute resource, materialized on demand. The provider is
/// authoritative; the core never caches this across calls.
#[derive(Debug, Clone)]
pub struct Instance {
    /// Provider-native stable identifier.
    pub id: String,
    /// Logical name (name tag), matching a config profile.
    pub name: String,
    pub state: InstanceState,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
    pub instance_type: String,
    /// Non-name tag values.
    pub tags: Vec<String>,
}

/// Opaque name/values filter predicate, provider-interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    #[must_use]
    pub fn new(name: &str, values: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            values: values.iter().map(ToString::to_string).collect(),
        }
    }

    #[must_use]
    pub fn id(id: &str) -> Self {
        Self::new("instance-id", &[id])
    }

    #[must_use]
    pub fn state(states: &[&str]) -> Self {
        Self::new("instance-state-name", states)
    }

    #[must_use]
    pub fn name_tag(name: &str) -> Self {
        Self::new("tag:Name", &[name])
    }

    /// Every state short of terminated.
    #[must_use]
    pub fn active() -> Self {
        Self::state(&["pending", "running", "stopping", "stopped"])
    }

    #[must_use]
    pub fn all_states() -> Self {
        Self::state(&["*"])
    }
}

/// In-process filter evaluation for backends without server-side filtering.
pub(crate) fn matches(instance: &Instance, filters: &[Filter]) -> bool {
    filters.iter().all(|filter| match filter.name.as_str() {
        "instance-id" => filter.values.iter().any(|v| v == &instance.id),
        "instance-state-name" => filter
            .values
            .iter()
            .any(|v| v == "*" || v == instance.state.as_str()),
        "tag:Name" => filter.values.iter().any(|v| v == &instance.name),
        _ => true,
    })
}

/// Capability contract implemented per backend.
#[allow(async_fn_in_trait)]
pub trait Provider {
    /// Backend label for reporting (e.g. in unsupported-operation errors).
    fn backend_name(&self) -> &'static str;

    /// Allocate a new resource per the name's config profile.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if required profile fields are missing,
    /// or propagates the provider failure.
    async fn create_instance(&self, name: &str) -> Result<Instance>;

    /// # Errors
    ///
    /// Returns an error if the id does not resolve to an instance.
    async fn get_instance_by_id(&self, id: &str) -> Result<Instance>;

    /// # Errors
    ///
    /// Propagates provider request failures.
    async fn get_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>>;

    /// Fire-and-forget start request.
    ///
    /// # Errors
    ///
    /// Propagates the provider failure.
    async fn start(&self, id: &str) -> Result<()>;

    /// Fire-and-forget stop request. Idempotent at the provider level.
    ///
    /// # Errors
    ///
    /// Propagates the provider failure.
    async fn stop(&self, id: &str) -> Result<()>;

    /// Fire-and-forget terminate request.
    ///
    /// # Errors
    ///
    /// Propagates the provider failure.
    async fn terminate(&self, id: &str) -> Result<()>;

    /// Attach a named block volume.
    ///
    /// # Errors
    ///
    /// Propagates the provider failure.
    async fn attach_volume(&self, id: &str, volume: &VolumeProfile) -> Result<()>;

    /// Ids of block volumes currently attached to the instance.
    ///
    /// # Errors
    ///
    /// Propagates the provider failure.
    async fn attached_volume_ids(&self, id: &str) -> Result<Vec<String>>;

    /// Create a machine image and return its opaque id.
    ///
    /// # Errors
    ///
    /// Propagates the provider failure.
    async fn snapshot(&self, id: &str, image_name: &str) -> Result<String>;

    /// Convenience lookup by logical name plus extra filters. More than one
    /// match is a warning (first match wins); zero matches is `None`, not an
    /// error.
    ///
    /// # Errors
    ///
    /// Propagates provider request failures.
    async fn get_instance(&self, name: &str, extra: &[Filter]) -> Result<Option<Instance>>
    where
        Self: Sized,
    {
        let mut filters = extra.to_vec();
        filters.push(Filter::name_tag(name));
        let found = self.get_instances(&filters).await?;
        if found.len() > 1 {
            tracing::warn!(name, matches = found.len(), "multiple instances match name; using the first");
        }
        Ok(found.into_iter().next())
    }

    /// Blocking readiness barrier: poll until the provider reports running.
    /// Fixed interval, no timeout; ends only on the provider reaching the
    /// state or process exit.
    ///
    /// # Errors
    ///
    /// Propagates provider request failures while polling.
    async fn wait_until_running(&self, id: &str) -> Result<()>
    where
        Self: Sized,
    {
        wait_for_state(self, id, InstanceState::Running).await
    }

    /// Blocking readiness barrier for the stopped state.
    ///
    /// # Errors
    ///
    /// Propagates provider request failures while polling.
    async fn wait_until_stopped(&self, id: &str) -> Result<()>
    where
        Self: Sized,
    {
        wait_for_state(self, id, InstanceState::Stopped).await
    }

    /// Blocking readiness barrier for the terminated state.
    ///
    /// # Errors
    ///
    /// Propagates provider request failures while polling.
    async fn wait_until_terminated(&self, id: &str) -> Result<()>
    where
        Self: Sized,
    {
        wait_for_state(self, id, InstanceState::Terminated).await
    }
}

async fn wait_for_state(
    provider: &impl Provider,
    id: &str,
    target: InstanceState,
) -> Result<()> {
    loop {
        let instance = provider.get_instance_by_id(id).await?;
        if instance.state == target {
            return Ok(());
        }
        tracing::debug!(id, state = %instance.state, waiting_for = %target, "waiting for state");
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Backend selected from config at startup.
#[derive(Debug)]
pub enum Backend<'a> {
    Ec2(ec2::Ec2Provider<'a, crate::command_runner::TokioCommandRunner>),
    Local(local::LocalProvider<'a>),
}

impl Provider for Backend<'_> {
    fn backend_name(&self) -> &'static str {
        match self {
            Self::Ec2(p) => p.backend_name(),
            Self::Local(p) => p.backend_name(),
        }
    }

    async fn create_instance(&self, name: &str) -> Result<Instance> {
        match self {
            Self::Ec2(p) => p.create_instance(name).await,
            Self::Local(p) => p.create_instance(name).await,
        }
    }

    async fn get_instance_by_id(&self, id: &str) -> Result<Instance> {
        match self {
            Self::Ec2(p) => p.get_instance_by_id(id).await,
            Self::Local(p) => p.get_instance_by_id(id).await,
        }
    }

    async fn get_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>> {
        match self {
            Self::Ec2(p) => p.get_instances(filters).await,
            Self::Local(p) => p.get_instances(filters).await,
        }
    }

    async fn start(&self, id: &str) -> Result<()> {
        match self {
            Self::Ec2(p) => p.start(id).await,
            Self::Local(p) => p.start(id).await,
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        match self {
            Self::Ec2(p) => p.stop(id).await,
            Self::Local(p) => p.stop(id).await,
        }
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        match self {
            Self::Ec2(p) => p.terminate(id).await,
            Self::Local(p) => p.terminate(id).await,
        }
    }

    async fn attach_volume(&self, id: &str, volume: &VolumeProfile) -> Result<()> {
        match self {
            Self::Ec2(p) => p.attach_volume(id, volume).await,
            Self::Local(p) => p.attach_volume(id, volume).await,
        }
    }

    async fn attached_volume_ids(&self, id: &str) -> Result<Vec<String>> {
        match self {
            Self::Ec2(p) => p.attached_volume_ids(id).await,
            Self::Local(p) => p.attached_volume_ids(id).await,
        }
    }

    async fn snapshot(&self, id: &str, image_name: &str) -> Result<String> {
        match self {
            Self::Ec2(p) => p.snapshot(id, image_name).await,
            Self::Local(p) => p.snapshot(id, image_name).await,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::cell::RefCell;

    use anyhow::Result;

    use super::{Filter, Instance, InstanceState, Provider, matches};
    use crate::config::VolumeProfile;

    pub(crate) fn instance(id: &str, name: &str, state: InstanceState) -> Instance {
        Instance {
            id: id.to_string(),
            name: name.to_string(),
            state,
            public_ip: Some("198.51.100.7".to_string()),
            private_ip: Some("10.0.0.7".to_string()),
            instance_type: "t3.small".to_string(),
            tags: Vec::new(),
        }
    }

    /// In-memory provider double recording lifecycle calls.
    #[derive(Default)]
    pub(crate) struct FakeProvider {
        pub instances: RefCell<Vec<Instance>>,
        pub start_calls: RefCell<Vec<String>>,
        pub stop_calls: RefCell<Vec<String>>,
        pub terminate_calls: RefCell<Vec<String>>,
    }

    impl FakeProvider {
        pub(crate) fn with_instances(instances: Vec<Instance>) -> Self {
            Self { instances: RefCell::new(instances), ..Self::default() }
        }

        fn set_state(&self, id: &str, state: InstanceState) {
            for instance in self.instances.borrow_mut().iter_mut() {
                if instance.id == id {
                    instance.state = state;
                }
            }
        }
    }

    impl Provider for FakeProvider {
        fn backend_name(&self) -> &'static str {
            "fake"
        }

        async fn create_instance(&self, name: &str) -> Result<Instance> {
            anyhow::bail!("create_instance not expected for {name}")
        }

        async fn get_instance_by_id(&self, id: &str) -> Result<Instance> {
            self.instances
                .borrow()
                .iter()
                .find(|i| i.id == id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("instance {id} not found"))
        }

        async fn get_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>> {
            Ok(self
                .instances
                .borrow()
                .iter()
                .filter(|i| matches(i, filters))
                .cloned()
                .collect())
        }

        async fn start(&self, id: &str) -> Result<()> {
            self.start_calls.borrow_mut().push(id.to_string());
            self.set_state(id, InstanceState::Running);
            Ok(())
        }

        async fn stop(&self, id: &str) -> Result<()> {
            self.stop_calls.borrow_mut().push(id.to_string());
            self.set_state(id, InstanceState::Stopped);
            Ok(())
        }

        async fn terminate(&self, id: &str) -> Result<()> {
            self.terminate_calls.borrow_mut().push(id.to_string());
            self.set_state(id, InstanceState::Terminated);
            Ok(())
        }

        async fn attach_volume(&self, _id: &str, _volume: &VolumeProfile) -> Result<()> {
            anyhow::bail!("attach_volume not expected")
        }

        async fn attached_volume_ids(&self, _id: &str) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn snapshot(&self, _id: &str, _image_name: &str) -> Result<String> {
            anyhow::bail!("snapshot not expected")
        }
    }
}
