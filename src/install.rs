//! Remote provisioning: package installers, volume attachment, crontab.
//!
//! Package entries are `source:name` strings (`apt:htop`, `pip:numpy`,
//! `github:user/repo`, `local:dir`, `sh:cmd`). Volume handlers are selected
//! by the profile's `provider` tag. Everything runs through the [`Channel`]
//! trait so tests can script the remote side.

use std::path::Path;

use anyhow::{Context, Result};

use crate::channel::Channel;
use crate::config::{AwsConfig, InstanceProfile, VolumeProfile};
use crate::error::ConfigError;
use crate::provider::Provider;

/// Patterns never shipped by `local:` installs.
pub const LOCAL_SYNC_EXCLUDE: &[&str] = &[".env", ".git", ".github"];

fn pip_bin(profile: &InstanceProfile) -> String {
    format!("{}/bin/pip", profile.env)
}

/// Bring a fresh instance to a usable baseline: apt sources, system
/// upgrade, transfer tooling, and a Python virtualenv at the profile's
/// `env` path.
///
/// # Errors
///
/// Returns an error if any remote step fails.
pub async fn install_essential(chan: &impl Channel, profile: &InstanceProfile) -> Result<()> {
    add_apt_sources(chan, profile).await?;
    chan.run("sudo apt-get update && sudo apt-get upgrade -y").await?;
    chan.run("sudo apt-get install -y linux-headers-$(uname -r)").await?;
    install_apt(chan, profile, "rsync s3fs git-core python3 python3-pip python3-venv").await?;
    if !chan.exists(&profile.env).await? {
        chan.run(&format!("python3 -m venv {}", profile.env)).await?;
    }
    install_pip(chan, profile, "setuptools wheel").await?;
    for entry in &profile.packages.essential {
        install_one(chan, profile, entry).await?;
    }
    Ok(())
}

/// Write the profile's extra apt components as a deb822 sources entry.
/// No-op when the profile lists none.
async fn add_apt_sources(chan: &impl Channel, profile: &InstanceProfile) -> Result<()> {
    if profile.apt_sources.is_empty() {
        return Ok(());
    }
    let release = profile
        .dist_release
        .as_deref()
        .ok_or_else(|| ConfigError::missing(profile.name.as_str(), "dist_release"))?;
    let entry = format!(
        "Types: deb deb-src\nURIs: mirror+file:///etc/apt/mirrors/debian.list\nSuites: {release}\nComponents: {}",
        profile.apt_sources.join(" ")
    );
    chan.run(&format!(
        "echo '{entry}' | sudo tee /etc/apt/sources.list.d/user.sources"
    ))
    .await?;
    Ok(())
}

/// Apt install, using the profile's package cache when it exists on the
/// instance.
async fn install_apt(chan: &impl Channel, profile: &InstanceProfile, name: &str) -> Result<()> {
    if let Some(cache) = &profile.apt_cache {
        if chan.exists(cache).await? {
            chan.run(&format!(
                "sudo apt-get install -y -o Dir::Cache::Archives={cache} {name}"
            ))
            .await?;
            return Ok(());
        }
    }
    chan.run(&format!("sudo apt-get install -y {name}")).await?;
    Ok(())
}

/// Pip install into the profile's virtualenv, going through the wheel
/// cache when it exists on the instance.
async fn install_pip(chan: &impl Channel, profile: &InstanceProfile, name: &str) -> Result<()> {
    let pip = pip_bin(profile);
    if let Some(cache) = &profile.wheel_cache {
        if chan.exists(cache).await? {
            chan.run(&format!("{pip} wheel --wheel-dir={cache} {name}")).await?;
            chan.run(&format!(
                "{pip} install --no-index --find-links={cache} {name}"
            ))
            .await?;
            return Ok(());
        }
    }
    chan.run(&format!("{pip} install --upgrade {name}")).await?;
    Ok(())
}

/// Shallow-clone (or pull) a GitHub repo and pip-install it.
async fn install_github(
    chan: &impl Channel,
    profile: &InstanceProfile,
    user_repo: &str,
) -> Result<()> {
    let (user, repo) = user_repo
        .split_once('/')
        .with_context(|| format!("github package \"{user_repo}\" must be user/repo"))?;
    chan.run(&format!(
        "git -C {repo} pull || git clone --depth=1 https://github.com/{user}/{repo}.git {repo}"
    ))
    .await?;
    chan.run(&format!("{} install {repo}", pip_bin(profile))).await?;
    Ok(())
}

/// Ship a local project directory and install it editable.
async fn install_local(chan: &impl Channel, profile: &InstanceProfile, name: &str) -> Result<()> {
    chan.sync(Path::new(name), "", LOCAL_SYNC_EXCLUDE).await?;
    chan.run(&format!("{} install -e {name}", pip_bin(profile))).await?;
    Ok(())
}

async fn install_sh(chan: &impl Channel, command: &str) -> Result<()> {
    chan.run(&format!("sudo sh -c '{command}'")).await?;
    Ok(())
}

/// Install one `source:name` package entry.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownSource`] for an unrecognized source tag,
/// or the remote failure.
pub async fn install_one(
    chan: &impl Channel,
    profile: &InstanceProfile,
    entry: &str,
) -> Result<()> {
    let (source, name) = entry
        .split_once(':')
        .ok_or_else(|| ConfigError::UnknownSource(entry.to_string()))?;
    match source {
        "apt" => install_apt(chan, profile, name).await,
        "pip" => install_pip(chan, profile, name).await,
        "github" => install_github(chan, profile, name).await,
        "local" => install_local(chan, profile, name).await,
        "sh" => install_sh(chan, name).await,
        _ => Err(ConfigError::UnknownSource(source.to_string()).into()),
    }
}

/// Install the profile's base package set.
///
/// # Errors
///
/// Returns the first package failure.
pub async fn install_base(chan: &impl Channel, profile: &InstanceProfile) -> Result<()> {
    for entry in &profile.packages.base {
        install_one(chan, profile, entry).await?;
    }
    Ok(())
}

/// Install the profile's app package set. With `no_deps`, only `local:`
/// entries are installed (fast redeploy of working-copy changes).
///
/// # Errors
///
/// Returns the first package failure.
pub async fn deploy_packages(
    chan: &impl Channel,
    profile: &InstanceProfile,
    no_deps: bool,
) -> Result<()> {
    for entry in &profile.packages.app {
        if no_deps && !entry.starts_with("local:") {
            continue;
        }
        install_one(chan, profile, entry).await?;
    }
    Ok(())
}

/// Register the profile's crontab lines, skipping entries whose command
/// already appears in the remote crontab. The last whitespace-separated
/// word of the line is the identity key.
///
/// # Errors
///
/// Returns the first remote failure.
pub async fn install_crontab(chan: &impl Channel, profile: &InstanceProfile) -> Result<()> {
    for line in &profile.crontab {
        let key = line.split_whitespace().last().unwrap_or(line);
        if chan.run_ok(&format!("crontab -l | grep {key}")).await? {
            continue;
        }
        chan.run(&format!("(crontab -l; echo '{line}') | crontab -")).await?;
    }
    Ok(())
}

/// Attach and mount every volume in the profile, dispatching on the
/// volume's `provider` tag.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownVolumeProvider`] for an unrecognized tag,
/// a missing-field error for incomplete volume profiles, or the remote
/// failure.
pub async fn attach_volumes<P: Provider>(
    provider: &P,
    chan: &impl Channel,
    aws: Option<&AwsConfig>,
    instance_id: &str,
    profile: &InstanceProfile,
) -> Result<()> {
    for (name, volume) in &profile.volumes {
        match volume.provider.as_str() {
            "native" => mount(chan, profile, name, volume).await?,
            "swap" => enable_swap(chan, name, volume).await?,
            "aws:s3" => attach_bucket(chan, aws, profile, name, volume).await?,
            "aws:ebs" => {
                attach_block_volume(provider, chan, instance_id, profile, name, volume).await?;
            }
            other => return Err(ConfigError::UnknownVolumeProvider(other.to_string()).into()),
        }
    }
    Ok(())
}

/// Mount a device that is already visible on the instance. Skips the mount
/// when the path is already mounted; mkdir/chown run regardless.
async fn mount(
    chan: &impl Channel,
    profile: &InstanceProfile,
    name: &str,
    volume: &VolumeProfile,
) -> Result<()> {
    let dev = volume
        .dev
        .as_deref()
        .with_context(|| format!("volume \"{name}\" needs \"dev\""))?;
    let mount_point = volume
        .mount
        .as_deref()
        .with_context(|| format!("volume \"{name}\" needs \"mount\""))?;
    chan.run(&format!("sudo mkdir -p {mount_point}")).await?;
    chan.run(&format!(
        "sudo chown {}:{} {mount_point}",
        profile.user,
        profile.group()
    ))
    .await?;
    if chan.run_ok(&format!("mount | grep {mount_point}")).await? {
        return Ok(());
    }
    let options = if volume.options.is_empty() {
        String::new()
    } else {
        format!(" -o {}", volume.options.join(","))
    };
    chan.run(&format!("sudo mount{options} {dev} {mount_point}")).await?;
    Ok(())
}

/// Create and enable a swap file. Skips when the file is already active.
async fn enable_swap(chan: &impl Channel, name: &str, volume: &VolumeProfile) -> Result<()> {
    let size = volume
        .size
        .with_context(|| format!("volume \"{name}\" needs \"size\""))?;
    let file = volume.dev.as_deref().unwrap_or("/swapfile");
    if chan.run_ok(&format!("swapon --show | grep {file}")).await? {
        return Ok(());
    }
    chan.run(&format!("sudo fallocate -l {size}G {file}")).await?;
    chan.run(&format!("sudo chmod 600 {file}")).await?;
    chan.run(&format!("sudo mkswap {file}")).await?;
    chan.run(&format!("sudo swapon {file}")).await?;
    Ok(())
}

/// Mount an S3 bucket via s3fs, writing a credential file on the instance.
async fn attach_bucket(
    chan: &impl Channel,
    aws: Option<&AwsConfig>,
    profile: &InstanceProfile,
    name: &str,
    volume: &VolumeProfile,
) -> Result<()> {
    let aws = aws.ok_or_else(|| ConfigError::missing("aws", "access_key"))?;
    let access_key = aws
        .access_key
        .as_deref()
        .ok_or_else(|| ConfigError::missing("aws", "access_key"))?;
    let secret_key = aws
        .secret_key
        .as_deref()
        .ok_or_else(|| ConfigError::missing("aws", "secret_key"))?;
    let bucket = volume
        .id
        .as_deref()
        .with_context(|| format!("volume \"{name}\" needs \"id\""))?;
    let mount_point = volume
        .mount
        .as_deref()
        .with_context(|| format!("volume \"{name}\" needs \"mount\""))?;
    let passwd = format!("{}/.aws/passwd", profile.home());

    chan.run(&format!("mkdir -p {}/.aws", profile.home())).await?;
    chan.run(&format!("echo '{access_key}:{secret_key}' > {passwd}")).await?;
    chan.run(&format!("chmod 600 {passwd}")).await?;
    chan.run(&format!("sudo mkdir -p {mount_point}")).await?;
    chan.run_ok(&format!("sudo umount {mount_point}")).await?;
    let options = if volume.options.is_empty() {
        "allow_other,ensure_diskfree=1024,umask=0000".to_string()
    } else {
        volume.options.join(",")
    };
    chan.run(&format!(
        "sudo s3fs {bucket} {mount_point} -o {options},passwd_file={passwd}"
    ))
    .await?;
    Ok(())
}

/// Attach a block volume through the provider, then mount it. Volumes
/// without an id were created at launch and need no attach; ones already
/// attached are only re-mounted.
async fn attach_block_volume<P: Provider>(
    provider: &P,
    chan: &impl Channel,
    instance_id: &str,
    profile: &InstanceProfile,
    name: &str,
    volume: &VolumeProfile,
) -> Result<()> {
    if let Some(id) = &volume.id {
        let attached = provider.attached_volume_ids(instance_id).await?;
        if !attached.contains(id) {
            provider.attach_volume(instance_id, volume).await?;
        }
    }
    mount(chan, profile, name, volume).await
}
