//! Typed configuration loaded from `fermata.yaml`.
//!
//! Profiles are validated once at load time: a missing required field
//! produces a [`ConfigError::MissingField`] naming the profile and field,
//! instead of surfacing later at some arbitrary use site.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Config file read when `FERMATA_CONFIG` is unset.
pub const DEFAULT_CONFIG_PATH: &str = "fermata.yaml";

/// Store location used when neither `FERMATA_DB` nor `db:` is set.
pub const DEFAULT_DB_PATH: &str = ".fermata.db";

/// AWS backend settings. Credentials for the `aws` CLI come from its own
/// standard chain; `access_key`/`secret_key` are only needed for volume
/// handlers that write a credential file on the instance (s3fs).
#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    pub region: Option<String>,
    pub profile: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchTemplate {
    pub id: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeProfile {
    /// Storage handler tag: `native`, `swap`, `aws:s3`, or `aws:ebs`.
    #[serde(default = "default_volume_provider")]
    pub provider: String,
    pub dev: Option<String>,
    pub mount: Option<String>,
    #[serde(default)]
    pub options: Vec<String>,
    pub id: Option<String>,
    /// Size in GiB for volumes created at launch and for swap files.
    pub size: Option<u64>,
    #[serde(rename = "type")]
    pub volume_type: Option<String>,
    /// Keep the volume when the instance is terminated.
    #[serde(default)]
    pub persist: bool,
}

fn default_volume_provider() -> String {
    "native".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Packages {
    /// Extra entries installed alongside the essential baseline.
    #[serde(default)]
    pub essential: Vec<String>,
    #[serde(default)]
    pub base: Vec<String>,
    #[serde(default)]
    pub app: Vec<String>,
}

/// Raw profile shape as it appears in YAML — everything optional so that
/// validation can name exactly what is missing.
#[derive(Debug, Deserialize)]
struct RawProfile {
    user: Option<String>,
    group: Option<String>,
    env: Option<String>,
    key_file: Option<PathBuf>,
    key_name: Option<String>,
    instance_type: Option<String>,
    ami: Option<String>,
    launch_template: Option<LaunchTemplate>,
    #[serde(default)]
    security_groups: Vec<String>,
    subnet: Option<String>,
    hourly_cost: Option<f64>,
    #[serde(default)]
    protected: bool,
    auto_stop: Option<bool>,
    #[serde(default)]
    vars: BTreeMap<String, String>,
    #[serde(default)]
    volumes: BTreeMap<String, VolumeProfile>,
    #[serde(default)]
    packages: Packages,
    #[serde(default)]
    crontab: Vec<String>,
    entrypoint: Option<String>,
    apt_cache: Option<String>,
    wheel_cache: Option<String>,
    #[serde(default)]
    apt_sources: Vec<String>,
    dist_release: Option<String>,
}

/// Validated per-instance profile. Read-only input to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceProfile {
    /// Profile key in the config file, also the instance's name tag.
    pub name: String,
    pub user: String,
    pub group: Option<String>,
    /// Remote virtualenv path; also the default shell activation target.
    pub env: String,
    /// Local private key used for the remote-execution channel.
    pub key_file: PathBuf,
    /// Provider-side key pair name (required for AMI launches).
    pub key_name: Option<String>,
    pub instance_type: Option<String>,
    pub ami: Option<String>,
    pub launch_template: Option<LaunchTemplate>,
    pub security_groups: Vec<String>,
    pub subnet: Option<String>,
    pub hourly_cost: Option<f64>,
    /// Never auto-stopped and refused by `terminate`.
    pub protected: bool,
    /// Opt-out for the idle reaper; defaults to on.
    pub auto_stop: bool,
    pub vars: BTreeMap<String, String>,
    pub volumes: BTreeMap<String, VolumeProfile>,
    pub packages: Packages,
    pub crontab: Vec<String>,
    pub entrypoint: Option<String>,
    pub apt_cache: Option<String>,
    pub wheel_cache: Option<String>,
    pub apt_sources: Vec<String>,
    pub dist_release: Option<String>,
}

impl InstanceProfile {
    fn from_raw(name: &str, raw: RawProfile) -> Result<Self, ConfigError> {
        let user = raw.user.ok_or_else(|| ConfigError::missing(name, "user"))?;
        let env = raw.env.ok_or_else(|| ConfigError::missing(name, "env"))?;
        let key_file = raw
            .key_file
            .ok_or_else(|| ConfigError::missing(name, "key_file"))?;
        Ok(Self {
            name: name.to_string(),
            user,
            group: raw.group,
            env,
            key_file,
            key_name: raw.key_name,
            instance_type: raw.instance_type,
            ami: raw.ami,
            launch_template: raw.launch_template,
            security_groups: raw.security_groups,
            subnet: raw.subnet,
            hourly_cost: raw.hourly_cost,
            protected: raw.protected,
            auto_stop: raw.auto_stop.unwrap_or(true),
            vars: raw.vars,
            volumes: raw.volumes,
            packages: raw.packages,
            crontab: raw.crontab,
            entrypoint: raw.entrypoint,
            apt_cache: raw.apt_cache,
            wheel_cache: raw.wheel_cache,
            apt_sources: raw.apt_sources,
            dist_release: raw.dist_release,
        })
    }

    /// Remote group for chown; falls back to the user.
    #[must_use]
    pub fn group(&self) -> &str {
        self.group.as_deref().unwrap_or(&self.user)
    }

    /// Remote home directory derived from the user name.
    #[must_use]
    pub fn home(&self) -> String {
        format!("/home/{}", self.user)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    db: Option<PathBuf>,
    idle_timeout_minutes: Option<u64>,
    aws: Option<AwsConfig>,
    #[serde(default)]
    local: Vec<String>,
    #[serde(default)]
    instances: BTreeMap<String, RawProfile>,
}

/// Whole-process configuration, validated at load.
#[derive(Debug)]
pub struct Config {
    pub db: PathBuf,
    /// Idle threshold for the reaper. `None` disables auto-stop entirely.
    pub idle_timeout: Option<Duration>,
    pub aws: Option<AwsConfig>,
    pub local: Vec<String>,
    pub instances: BTreeMap<String, InstanceProfile>,
}

impl Config {
    /// Load and validate a config file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid YAML, or a
    /// profile fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate config from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid YAML or a failed profile validation.
    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(content).context("invalid YAML")?;
        let mut instances = BTreeMap::new();
        for (name, profile) in raw.instances {
            let profile = InstanceProfile::from_raw(&name, profile)?;
            instances.insert(name, profile);
        }
        Ok(Self {
            db: raw.db.unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            idle_timeout: raw
                .idle_timeout_minutes
                .map(|m| Duration::from_secs(m * 60)),
            aws: raw.aws,
            local: raw.local,
            instances,
        })
    }

    /// Path of the config file: `FERMATA_CONFIG` or `fermata.yaml`.
    #[must_use]
    pub fn locate() -> PathBuf {
        std::env::var_os("FERMATA_CONFIG")
            .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from)
    }

    /// Profile for an instance name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownProfile`] if the name has no profile.
    pub fn profile(&self, name: &str) -> Result<&InstanceProfile, ConfigError> {
        self.instances
            .get(name)
            .ok_or_else(|| ConfigError::UnknownProfile(name.to_string()))
    }

    #[must_use]
    pub fn profile_opt(&self, name: &str) -> Option<&InstanceProfile> {
        self.instances.get(name)
    }
}
