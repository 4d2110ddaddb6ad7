//! Local backend — config-listed hostnames treated as always-running
//! instances. Lifecycle operations have no meaning here and report
//! [`ProviderError::Unsupported`] instead of pretending to succeed.

use std::net::ToSocketAddrs;

use anyhow::Result;

use crate::config::{Config, VolumeProfile};
use crate::error::ProviderError;
use crate::provider::{Filter, Instance, InstanceState, Provider, matches};

#[derive(Debug)]
pub struct LocalProvider<'a> {
    config: &'a Config,
}

impl<'a> LocalProvider<'a> {
    #[must_use]
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    /// Materialize a host entry. The hostname doubles as the native id; the
    /// address comes from a plain DNS lookup.
    fn instance(&self, host: &str) -> Instance {
        let ip = (host, 22u16)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip().to_string());
        Instance {
            id: host.to_string(),
            name: host.to_string(),
            state: InstanceState::Running,
            public_ip: ip.clone(),
            private_ip: ip,
            instance_type: "local".to_string(),
            tags: Vec::new(),
        }
    }

    fn unsupported(&self, op: &'static str) -> anyhow::Error {
        ProviderError::Unsupported { backend: self.backend_name(), op }.into()
    }
}

impl Provider for LocalProvider<'_> {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    async fn create_instance(&self, _name: &str) -> Result<Instance> {
        Err(self.unsupported("create"))
    }

    async fn get_instance_by_id(&self, id: &str) -> Result<Instance> {
        self.config
            .local
            .iter()
            .find(|host| host.as_str() == id)
            .map(|host| self.instance(host))
            .ok_or_else(|| anyhow::anyhow!("no local host named {id}"))
    }

    async fn get_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>> {
        Ok(self
            .config
            .local
            .iter()
            .map(|host| self.instance(host))
            .filter(|instance| matches(instance, filters))
            .collect())
    }

    async fn start(&self, _id: &str) -> Result<()> {
        Err(self.unsupported("start"))
    }

    async fn stop(&self, _id: &str) -> Result<()> {
        Err(self.unsupported("stop"))
    }

    async fn terminate(&self, _id: &str) -> Result<()> {
        Err(self.unsupported("terminate"))
    }

    async fn attach_volume(&self, _id: &str, _volume: &VolumeProfile) -> Result<()> {
        Err(self.unsupported("attach_volume"))
    }

    async fn attached_volume_ids(&self, _id: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn snapshot(&self, _id: &str, _image_name: &str) -> Result<String> {
        Err(self.unsupported("snapshot"))
    }
}
