//! EC2 backend — shells out to the `aws` CLI and parses its JSON output.
//!
//! Every request goes through the [`CommandRunner`] port so tests can feed
//! canned responses; nothing here links an SDK. Launch parameters are
//! assembled into a single `--cli-input-json` document from the instance
//! profile.

use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};

use crate::command_runner::CommandRunner;
use crate::config::{Config, InstanceProfile, VolumeProfile};
use crate::error::ConfigError;
use crate::provider::{Filter, Instance, InstanceState, Provider};

/// Device the attach operation falls back to when a volume profile names
/// no `dev`.
const DEFAULT_ATTACH_DEV: &str = "/dev/sdg";

/// Upper bound for `aws ec2 wait image-available`, which routinely takes
/// many minutes on large root volumes.
const IMAGE_WAIT_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Debug)]
pub struct Ec2Provider<'a, R: CommandRunner> {
    runner: R,
    config: &'a Config,
}

impl<'a, R: CommandRunner> Ec2Provider<'a, R> {
    #[must_use]
    pub fn new(runner: R, config: &'a Config) -> Self {
        Self { runner, config }
    }

    /// Shared trailing arguments: JSON output plus region/profile from the
    /// `aws` config section.
    fn global_args(&self) -> Vec<String> {
        let mut args = vec!["--output".to_string(), "json".to_string()];
        if let Some(aws) = &self.config.aws {
            if let Some(region) = &aws.region {
                args.push("--region".to_string());
                args.push(region.clone());
            }
            if let Some(profile) = &aws.profile {
                args.push("--profile".to_string());
                args.push(profile.clone());
            }
        }
        args
    }

    async fn ec2_raw(&self, args: Vec<String>, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut full: Vec<String> = vec!["ec2".to_string()];
        full.extend(args);
        full.extend(self.global_args());
        let arg_refs: Vec<&str> = full.iter().map(String::as_str).collect();
        let output = match timeout {
            Some(t) => self.runner.run_with_timeout("aws", &arg_refs, t).await?,
            None => self.runner.run("aws", &arg_refs).await?,
        };
        if !output.status.success() {
            anyhow::bail!(
                "aws ec2 {} failed: {}",
                full.get(1).map_or("", String::as_str),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }

    /// Run an `aws ec2` subcommand and parse its JSON response.
    async fn ec2_json(&self, args: Vec<String>) -> Result<Value> {
        let stdout = self.ec2_raw(args, None).await?;
        serde_json::from_slice(&stdout).context("unparseable aws response")
    }

    /// Run an `aws ec2` subcommand where only success matters.
    async fn ec2_ok(&self, args: Vec<String>) -> Result<()> {
        self.ec2_raw(args, None).await.map(|_| ())
    }

    fn profile(&self, name: &str) -> Result<&InstanceProfile, ConfigError> {
        self.config.profile(name)
    }
}

/// Launch document for `run-instances --cli-input-json`. A profile must
/// carry either an AMI (with key pair, security groups, and subnet) or a
/// launch template.
pub(crate) fn launch_request(name: &str, profile: &InstanceProfile) -> Result<Value> {
    let instance_type = profile
        .instance_type
        .as_deref()
        .ok_or_else(|| ConfigError::missing(name, "instance_type"))?;

    let mut request = json!({
        "InstanceType": instance_type,
        "MinCount": 1,
        "MaxCount": 1,
        "TagSpecifications": [{
            "ResourceType": "instance",
            "Tags": [{"Key": "Name", "Value": name}],
        }],
    });

    if let Some(ami) = &profile.ami {
        let key_name = profile
            .key_name
            .as_deref()
            .ok_or_else(|| ConfigError::missing(name, "key_name"))?;
        if profile.security_groups.is_empty() {
            return Err(ConfigError::missing(name, "security_groups").into());
        }
        let subnet = profile
            .subnet
            .as_deref()
            .ok_or_else(|| ConfigError::missing(name, "subnet"))?;
        request["ImageId"] = json!(ami);
        request["KeyName"] = json!(key_name);
        request["SecurityGroupIds"] = json!(profile.security_groups);
        request["SubnetId"] = json!(subnet);
    } else if let Some(template) = &profile.launch_template {
        request["LaunchTemplate"] = json!({
            "LaunchTemplateId": template.id,
            "Version": template.version,
        });
    } else {
        return Err(ConfigError::LaunchSource(name.to_string()).into());
    }

    // Block volumes declared without an id are created at launch; ones with
    // an id already exist and get attached later instead.
    let mappings: Vec<Value> = profile
        .volumes
        .values()
        .filter(|v| v.provider == "aws:ebs" && v.id.is_none())
        .filter_map(|v| {
            let dev = v.dev.as_deref()?;
            let size = v.size?;
            Some(json!({
                "DeviceName": dev,
                "Ebs": {
                    "VolumeSize": size,
                    "VolumeType": v.volume_type.as_deref().unwrap_or("gp3"),
                    "DeleteOnTermination": !v.persist,
                },
            }))
        })
        .collect();
    if !mappings.is_empty() {
        request["BlockDeviceMappings"] = json!(mappings);
    }

    Ok(request)
}

/// `--filters` arguments in the CLI's `Name=...,Values=...` shorthand.
pub(crate) fn filter_args(filters: &[Filter]) -> Vec<String> {
    if filters.is_empty() {
        return Vec::new();
    }
    let mut args = vec!["--filters".to_string()];
    for filter in filters {
        args.push(format!("Name={},Values={}", filter.name, filter.values.join(",")));
    }
    args
}

/// Decode one instance document from a describe response.
pub(crate) fn parse_instance(value: &Value) -> Result<Instance> {
    let id = value["InstanceId"]
        .as_str()
        .context("instance document missing InstanceId")?
        .to_string();
    let state = value["State"]["Name"]
        .as_str()
        .map_or(InstanceState::Unknown, InstanceState::parse);
    let mut name = String::new();
    let mut tags = Vec::new();
    if let Some(entries) = value["Tags"].as_array() {
        for entry in entries {
            let value = entry["Value"].as_str().unwrap_or_default();
            if entry["Key"].as_str() == Some("Name") {
                name = value.to_string();
            } else {
                tags.push(value.to_string());
            }
        }
    }
    Ok(Instance {
        id,
        name,
        state,
        public_ip: value["PublicIpAddress"].as_str().map(ToString::to_string),
        private_ip: value["PrivateIpAddress"].as_str().map(ToString::to_string),
        instance_type: value["InstanceType"].as_str().unwrap_or_default().to_string(),
        tags,
    })
}

fn reservation_instances(response: &Value) -> Result<Vec<Instance>> {
    let mut instances = Vec::new();
    if let Some(reservations) = response["Reservations"].as_array() {
        for reservation in reservations {
            if let Some(docs) = reservation["Instances"].as_array() {
                for doc in docs {
                    instances.push(parse_instance(doc)?);
                }
            }
        }
    }
    Ok(instances)
}

impl<R: CommandRunner> Provider for Ec2Provider<'_, R> {
    fn backend_name(&self) -> &'static str {
        "ec2"
    }

    async fn create_instance(&self, name: &str) -> Result<Instance> {
        let profile = self.profile(name)?;
        let request = launch_request(name, profile)?;
        let response = self
            .ec2_json(vec![
                "run-instances".to_string(),
                "--cli-input-json".to_string(),
                request.to_string(),
            ])
            .await?;
        let doc = response["Instances"]
            .as_array()
            .and_then(|a| a.first())
            .with_context(|| format!("run-instances returned no instance for {name}"))?;
        parse_instance(doc)
    }

    async fn get_instance_by_id(&self, id: &str) -> Result<Instance> {
        let response = self
            .ec2_json(vec![
                "describe-instances".to_string(),
                "--instance-ids".to_string(),
                id.to_string(),
            ])
            .await?;
        reservation_instances(&response)?
            .into_iter()
            .next()
            .with_context(|| format!("instance {id} not found"))
    }

    async fn get_instances(&self, filters: &[Filter]) -> Result<Vec<Instance>> {
        let mut args = vec!["describe-instances".to_string()];
        args.extend(filter_args(filters));
        let response = self.ec2_json(args).await?;
        reservation_instances(&response)
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.ec2_ok(vec![
            "start-instances".to_string(),
            "--instance-ids".to_string(),
            id.to_string(),
        ])
        .await
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.ec2_ok(vec![
            "stop-instances".to_string(),
            "--instance-ids".to_string(),
            id.to_string(),
        ])
        .await
    }

    async fn terminate(&self, id: &str) -> Result<()> {
        self.ec2_ok(vec![
            "terminate-instances".to_string(),
            "--instance-ids".to_string(),
            id.to_string(),
        ])
        .await
    }

    async fn attach_volume(&self, id: &str, volume: &VolumeProfile) -> Result<()> {
        let volume_id = volume
            .id
            .as_deref()
            .context("attach_volume needs a volume id")?;
        self.ec2_ok(vec![
            "attach-volume".to_string(),
            "--volume-id".to_string(),
            volume_id.to_string(),
            "--instance-id".to_string(),
            id.to_string(),
            "--device".to_string(),
            volume.dev.clone().unwrap_or_else(|| DEFAULT_ATTACH_DEV.to_string()),
        ])
        .await
    }

    async fn attached_volume_ids(&self, id: &str) -> Result<Vec<String>> {
        let response = self
            .ec2_json(vec![
                "describe-instances".to_string(),
                "--instance-ids".to_string(),
                id.to_string(),
            ])
            .await?;
        let mut ids = Vec::new();
        if let Some(reservations) = response["Reservations"].as_array() {
            for reservation in reservations {
                for doc in reservation["Instances"].as_array().into_iter().flatten() {
                    for mapping in doc["BlockDeviceMappings"].as_array().into_iter().flatten() {
                        if let Some(volume_id) = mapping["Ebs"]["VolumeId"].as_str() {
                            ids.push(volume_id.to_string());
                        }
                    }
                }
            }
        }
        Ok(ids)
    }

    async fn snapshot(&self, id: &str, image_name: &str) -> Result<String> {
        let response = self
            .ec2_json(vec![
                "create-image".to_string(),
                "--instance-id".to_string(),
                id.to_string(),
                "--name".to_string(),
                image_name.to_string(),
            ])
            .await?;
        let image_id = response["ImageId"]
            .as_str()
            .context("create-image returned no ImageId")?
            .to_string();
        self.ec2_raw(
            vec![
                "wait".to_string(),
                "image-available".to_string(),
                "--image-ids".to_string(),
                image_id.clone(),
            ],
            Some(IMAGE_WAIT_TIMEOUT),
        )
        .await?;
        Ok(image_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::ConfigError;

    fn config(yaml: &str) -> Config {
        Config::parse(yaml).expect("parse config")
    }

    const AMI_PROFILE: &str = r#"
instances:
  web:
    user: ubuntu
    env: /home/ubuntu/venv
    key_file: /k.pem
    key_name: web-key
    instance_type: t3.small
    ami: ami-0abc
    security_groups: [sg-1, sg-2]
    subnet: subnet-1
    volumes:
      data:
        provider: aws:ebs
        dev: /dev/sdg
        size: 100
        persist: true
      existing:
        provider: aws:ebs
        id: vol-1
        dev: /dev/sdh
"#;

    #[test]
    fn launch_request_from_ami_profile() {
        let config = config(AMI_PROFILE);
        let profile = config.profile("web").expect("profile");
        let request = launch_request("web", profile).expect("request");
        assert_eq!(request["ImageId"], "ami-0abc");
        assert_eq!(request["KeyName"], "web-key");
        assert_eq!(request["SubnetId"], "subnet-1");
        assert_eq!(request["MinCount"], 1);
        assert_eq!(
            request["TagSpecifications"][0]["Tags"][0]["Value"],
            "web"
        );
        // Only the id-less volume becomes a launch mapping.
        let mappings = request["BlockDeviceMappings"].as_array().expect("mappings");
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0]["DeviceName"], "/dev/sdg");
        assert_eq!(mappings[0]["Ebs"]["VolumeSize"], 100);
        assert_eq!(mappings[0]["Ebs"]["DeleteOnTermination"], false);
    }

    #[test]
    fn launch_request_from_template_profile() {
        let config = config(
            "instances:\n  web:\n    user: u\n    env: /e\n    key_file: /k\n    instance_type: t3.small\n    launch_template:\n      id: lt-1\n      version: \"3\"\n",
        );
        let request =
            launch_request("web", config.profile("web").expect("profile")).expect("request");
        assert_eq!(request["LaunchTemplate"]["LaunchTemplateId"], "lt-1");
        assert_eq!(request["LaunchTemplate"]["Version"], "3");
        assert!(request.get("ImageId").is_none());
    }

    #[test]
    fn launch_request_requires_a_source() {
        let config = config(
            "instances:\n  web:\n    user: u\n    env: /e\n    key_file: /k\n    instance_type: t3.small\n",
        );
        let err = launch_request("web", config.profile("web").expect("profile"))
            .expect_err("no ami or template");
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::LaunchSource(_))
        ));
    }

    #[test]
    fn launch_request_requires_instance_type() {
        let config = config(
            "instances:\n  web:\n    user: u\n    env: /e\n    key_file: /k\n    ami: ami-0abc\n",
        );
        let err = launch_request("web", config.profile("web").expect("profile"))
            .expect_err("no instance type");
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn filter_args_use_cli_shorthand() {
        let args = filter_args(&[
            Filter::name_tag("web"),
            Filter::state(&["running", "stopped"]),
        ]);
        assert_eq!(
            args,
            vec![
                "--filters".to_string(),
                "Name=tag:Name,Values=web".to_string(),
                "Name=instance-state-name,Values=running,stopped".to_string(),
            ]
        );
        assert!(filter_args(&[]).is_empty());
    }

    #[test]
    fn parse_instance_from_describe_document() {
        let doc = serde_json::json!({
            "InstanceId": "i-0abc",
            "InstanceType": "t3.small",
            "State": {"Name": "running"},
            "PublicIpAddress": "198.51.100.7",
            "PrivateIpAddress": "10.0.0.7",
            "Tags": [
                {"Key": "Name", "Value": "web"},
                {"Key": "team", "Value": "infra"},
            ],
        });
        let instance = parse_instance(&doc).expect("parse");
        assert_eq!(instance.id, "i-0abc");
        assert_eq!(instance.name, "web");
        assert_eq!(instance.state, InstanceState::Running);
        assert_eq!(instance.public_ip.as_deref(), Some("198.51.100.7"));
        assert_eq!(instance.tags, vec!["infra".to_string()]);
    }

    #[test]
    fn parse_instance_tolerates_missing_optionals() {
        let doc = serde_json::json!({
            "InstanceId": "i-0abc",
            "State": {"Name": "stopped"},
        });
        let instance = parse_instance(&doc).expect("parse");
        assert_eq!(instance.name, "");
        assert!(instance.public_ip.is_none());
        assert_eq!(instance.state, InstanceState::Stopped);
    }
}
