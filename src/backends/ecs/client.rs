//! ECS/EC2/ELB client surface
//!
//! The backend logic talks to [`EcsApi`]; the production implementation
//! shells out to the `aws` CLI with `--output json` and parses the
//! responses. ECS responses are camelCase, EC2/ELB responses PascalCase.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Error, Result};

/// A live ECS task, reduced to the fields the orchestrator reads.
#[derive(Debug, Clone)]
pub struct EcsTask {
    pub task_arn: String,
    pub last_status: String,
    pub tags: BTreeMap<String, String>,
    /// Attached ENI, when the task runs in awsvpc networking
    pub eni_id: Option<String>,
}

impl EcsTask {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Network placement read off an existing ENI.
#[derive(Debug, Clone)]
pub struct NetworkInterfaceInfo {
    pub subnet_id: String,
    pub security_groups: Vec<String>,
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RunTaskRequest {
    pub task_definition: String,
    pub launch_type: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

/// Target group summary used to clone ALB wiring for a dev service.
#[derive(Debug, Clone)]
pub struct TargetGroupInfo {
    pub arn: String,
    pub port: i64,
    pub protocol: String,
    pub vpc_id: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EcsApi: Send + Sync {
    /// All tasks of the cluster, with tags and ENI attachment resolved.
    async fn list_tasks(&self, cluster: &str) -> Result<Vec<EcsTask>>;
    async fn run_task(&self, cluster: &str, request: RunTaskRequest) -> Result<EcsTask>;
    async fn stop_task(&self, cluster: &str, task_arn: &str) -> Result<()>;
    async fn describe_network_interface(&self, eni_id: &str) -> Result<NetworkInterfaceInfo>;

    async fn describe_target_group(&self, name: &str) -> Result<TargetGroupInfo>;
    /// Create a target group shaped like `reference`; returns the new ARN.
    async fn create_target_group(&self, name: &str, reference: &TargetGroupInfo) -> Result<String>;
    async fn create_listener_rule(
        &self,
        listener_arn: &str,
        priority: i64,
        path_pattern: &str,
        target_group_arn: &str,
    ) -> Result<()>;
}

/// `aws` CLI-backed client.
#[derive(Debug, Clone, Default)]
pub struct AwsCliClient {
    region: Option<String>,
    profile: Option<String>,
}

impl AwsCliClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    async fn run(&self, args: Vec<String>) -> Result<Value> {
        let mut full_args = args;
        full_args.push("--output".into());
        full_args.push("json".into());
        if let Some(region) = &self.region {
            full_args.push("--region".into());
            full_args.push(region.clone());
        }
        if let Some(profile) = &self.profile {
            full_args.push("--profile".into());
            full_args.push(profile.clone());
        }

        let op = full_args
            .first()
            .cloned()
            .unwrap_or_else(|| "aws".into());
        let output = tokio::task::spawn_blocking(move || {
            duct::cmd("aws", &full_args)
                .stdout_capture()
                .stderr_capture()
                .unchecked()
                .run()
        })
        .await
        .map_err(|e| Error::provider("aws", e))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::provider(&format!("aws {}", op), stderr.trim()));
        }
        if output.stdout.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }
}

fn parse_task(value: &Value) -> Option<EcsTask> {
    let task_arn = value["taskArn"].as_str()?.to_string();
    let last_status = value["lastStatus"].as_str().unwrap_or("UNKNOWN").to_string();

    let mut tags = BTreeMap::new();
    for tag in value["tags"].as_array().unwrap_or(&Vec::new()) {
        if let (Some(key), Some(val)) = (tag["key"].as_str(), tag["value"].as_str()) {
            tags.insert(key.to_string(), val.to_string());
        }
    }

    let eni_id = value["attachments"]
        .as_array()
        .unwrap_or(&Vec::new())
        .iter()
        .find(|a| a["type"].as_str() == Some("ElasticNetworkInterface"))
        .and_then(|a| a["details"].as_array())
        .and_then(|details| {
            details
                .iter()
                .find(|d| d["name"].as_str() == Some("networkInterfaceId"))
        })
        .and_then(|d| d["value"].as_str())
        .map(String::from);

    Some(EcsTask {
        task_arn,
        last_status,
        tags,
        eni_id,
    })
}

#[async_trait]
impl EcsApi for AwsCliClient {
    async fn list_tasks(&self, cluster: &str) -> Result<Vec<EcsTask>> {
        let listed = self
            .run(vec![
                "ecs".into(),
                "list-tasks".into(),
                "--cluster".into(),
                cluster.into(),
            ])
            .await?;
        let arns: Vec<String> = listed["taskArns"]
            .as_array()
            .unwrap_or(&Vec::new())
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();
        if arns.is_empty() {
            return Ok(Vec::new());
        }

        let mut args = vec![
            "ecs".into(),
            "describe-tasks".into(),
            "--cluster".into(),
            cluster.into(),
            "--include".into(),
            "TAGS".into(),
            "--tasks".into(),
        ];
        args.extend(arns);
        let described = self.run(args).await?;

        Ok(described["tasks"]
            .as_array()
            .unwrap_or(&Vec::new())
            .iter()
            .filter_map(parse_task)
            .collect())
    }

    async fn run_task(&self, cluster: &str, request: RunTaskRequest) -> Result<EcsTask> {
        let network = serde_json::json!({
            "awsvpcConfiguration": {
                "subnets": request.subnets,
                "securityGroups": request.security_groups,
                "assignPublicIp": "ENABLED",
            }
        });
        let tags: Vec<String> = request
            .tags
            .iter()
            .map(|(k, v)| format!("key={},value={}", k, v))
            .collect();

        let mut args = vec![
            "ecs".into(),
            "run-task".into(),
            "--cluster".into(),
            cluster.into(),
            "--task-definition".into(),
            request.task_definition.clone(),
            "--launch-type".into(),
            request.launch_type.clone(),
            "--network-configuration".into(),
            network.to_string(),
            "--tags".into(),
        ];
        args.extend(tags);

        let response = self.run(args).await?;
        response["tasks"]
            .as_array()
            .and_then(|tasks| tasks.first())
            .and_then(parse_task)
            .ok_or_else(|| {
                let failures = response["failures"].to_string();
                Error::provider("ecs run-task", format!("no task started: {}", failures))
            })
    }

    async fn stop_task(&self, cluster: &str, task_arn: &str) -> Result<()> {
        self.run(vec![
            "ecs".into(),
            "stop-task".into(),
            "--cluster".into(),
            cluster.into(),
            "--task".into(),
            task_arn.into(),
        ])
        .await?;
        Ok(())
    }

    async fn describe_network_interface(&self, eni_id: &str) -> Result<NetworkInterfaceInfo> {
        let response = self
            .run(vec![
                "ec2".into(),
                "describe-network-interfaces".into(),
                "--network-interface-ids".into(),
                eni_id.into(),
            ])
            .await?;
        let interface = response["NetworkInterfaces"]
            .as_array()
            .and_then(|interfaces| interfaces.first())
            .ok_or_else(|| Error::provider("ec2 describe-network-interfaces", eni_id))?;

        Ok(NetworkInterfaceInfo {
            subnet_id: interface["SubnetId"].as_str().unwrap_or_default().to_string(),
            security_groups: interface["Groups"]
                .as_array()
                .unwrap_or(&Vec::new())
                .iter()
                .filter_map(|g| g["GroupId"].as_str().map(String::from))
                .collect(),
            public_ip: interface["Association"]["PublicIp"]
                .as_str()
                .map(String::from),
        })
    }

    async fn describe_target_group(&self, name: &str) -> Result<TargetGroupInfo> {
        let response = self
            .run(vec![
                "elbv2".into(),
                "describe-target-groups".into(),
                "--names".into(),
                name.into(),
            ])
            .await?;
        let group = response["TargetGroups"]
            .as_array()
            .and_then(|groups| groups.first())
            .ok_or_else(|| Error::provider("elbv2 describe-target-groups", name))?;

        Ok(TargetGroupInfo {
            arn: group["TargetGroupArn"].as_str().unwrap_or_default().to_string(),
            port: group["Port"].as_i64().unwrap_or(80),
            protocol: group["Protocol"].as_str().unwrap_or("HTTP").to_string(),
            vpc_id: group["VpcId"].as_str().unwrap_or_default().to_string(),
        })
    }

    async fn create_target_group(&self, name: &str, reference: &TargetGroupInfo) -> Result<String> {
        let response = self
            .run(vec![
                "elbv2".into(),
                "create-target-group".into(),
                "--name".into(),
                name.into(),
                "--port".into(),
                reference.port.to_string(),
                "--protocol".into(),
                reference.protocol.clone(),
                "--vpc-id".into(),
                reference.vpc_id.clone(),
                "--target-type".into(),
                "ip".into(),
            ])
            .await?;
        response["TargetGroups"]
            .as_array()
            .and_then(|groups| groups.first())
            .and_then(|g| g["TargetGroupArn"].as_str())
            .map(String::from)
            .ok_or_else(|| Error::provider("elbv2 create-target-group", name))
    }

    async fn create_listener_rule(
        &self,
        listener_arn: &str,
        priority: i64,
        path_pattern: &str,
        target_group_arn: &str,
    ) -> Result<()> {
        self.run(vec![
            "elbv2".into(),
            "create-rule".into(),
            "--listener-arn".into(),
            listener_arn.into(),
            "--priority".into(),
            priority.to_string(),
            "--conditions".into(),
            format!("Field=path-pattern,Values={}", path_pattern),
            "--actions".into(),
            format!("Type=forward,TargetGroupArn={}", target_group_arn),
        ])
        .await?;
        Ok(())
    }
}
