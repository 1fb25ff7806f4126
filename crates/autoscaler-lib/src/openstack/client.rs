//! HTTP client for the Magnum, Heat and Nova APIs

use super::auth::KeystoneAuth;
use super::{error_for_status, transport_error};
use crate::cloudprovider::api::{
    Cluster, ComputeApi, ContainerInfraApi, Flavor, NodeGroupDetail, OrchestrationApi,
    ResizeRequest, Stack, StackRef, StackResource,
};
use crate::error::{ProviderError, ProviderResult};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

const CONTAINER_INFRA: &str = "container-infra";
const ORCHESTRATION: &str = "orchestration";
const COMPUTE: &str = "compute";

/// Node groups and resize need a recent container-infra microversion.
const CONTAINER_INFRA_VERSION: &str = "container-infra latest";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Builds the underlying HTTP client, trusting `ca_file` in addition to the
/// built-in roots when given.
pub fn http_client(ca_file: Option<&std::path::Path>) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
    if let Some(path) = ca_file {
        let pem = std::fs::read(path).with_context(|| format!("Failed to read CA file {:?}", path))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .with_context(|| format!("Invalid CA certificate in {:?}", path))?;
        builder = builder.add_root_certificate(cert);
    }
    builder.build().context("Failed to build HTTP client")
}

fn user_agent(cluster: &str) -> String {
    format!("node-autoscaler/{} cluster/{}", env!("CARGO_PKG_VERSION"), cluster)
}

/// Appends path segments to a service endpoint, percent-encoding each.
fn service_url(base: &str, segments: &[&str]) -> ProviderResult<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| ProviderError::Rejected(format!("invalid endpoint {:?}: {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| ProviderError::Rejected(format!("endpoint {:?} cannot have a path", base)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[derive(Deserialize)]
struct NodeGroupList {
    nodegroups: Vec<NodeGroupDetail>,
}

#[derive(Deserialize)]
struct StackBody {
    stack: Stack,
}

#[derive(Deserialize)]
struct ResourceBody {
    resource: StackResource,
}

#[derive(Deserialize)]
struct ResourceList {
    resources: Vec<StackResource>,
}

#[derive(Deserialize)]
struct FlavorBody {
    flavor: Flavor,
}

/// Authenticated client for the cloud APIs
pub struct OpenStackClient {
    http: reqwest::Client,
    auth: Arc<KeystoneAuth>,
    user_agent: RwLock<String>,
}

impl OpenStackClient {
    pub fn new(http: reqwest::Client, auth: Arc<KeystoneAuth>, cluster: &str) -> Self {
        Self {
            http,
            auth,
            user_agent: RwLock::new(user_agent(cluster)),
        }
    }

    /// Switches the user agent to the resolved cluster id.
    pub fn set_cluster(&self, cluster_id: &str) {
        if let Ok(mut agent) = self.user_agent.write() {
            *agent = user_agent(cluster_id);
            debug!(user_agent = %agent, "Updated user agent");
        }
    }

    pub fn user_agent(&self) -> String {
        match self.user_agent.read() {
            Ok(agent) => agent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    async fn send(
        &self,
        method: Method,
        service: &str,
        segments: &[&str],
        body: Option<&Value>,
        context: &str,
    ) -> ProviderResult<reqwest::Response> {
        let url = service_url(&self.auth.endpoint(service).await?, segments)?;

        // One retry with a fresh token when the cached one was revoked.
        for attempt in 0..2 {
            let token = self.auth.token().await?;
            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .header("X-Auth-Token", token)
                .header(reqwest::header::USER_AGENT, self.user_agent())
                .header(reqwest::header::ACCEPT, "application/json");
            if service == CONTAINER_INFRA {
                request = request.header("OpenStack-API-Version", CONTAINER_INFRA_VERSION);
            }
            if let Some(body) = body {
                request = request.json(body);
            }

            trace!(method = %method, url = %url, "Sending request");
            let response = request.send().await.map_err(|e| transport_error(context, e))?;
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && attempt == 0 {
                debug!(context = %context, "Token rejected, re-authenticating");
                self.auth.invalidate().await;
                continue;
            }
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(error_for_status(status, context, &text));
            }
            return Ok(response);
        }
        Err(ProviderError::Rejected(format!("{}: unauthorized", context)))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        service: &str,
        segments: &[&str],
        context: &str,
    ) -> ProviderResult<T> {
        self.send(Method::GET, service, segments, None, context)
            .await?
            .json()
            .await
            .map_err(|e| transport_error(context, e))
    }
}

#[async_trait]
impl ContainerInfraApi for OpenStackClient {
    async fn get_cluster(&self, cluster: &str) -> ProviderResult<Cluster> {
        self.get_json(CONTAINER_INFRA, &["clusters", cluster], "get cluster")
            .await
    }

    async fn update_cluster_node_count(&self, cluster: &str, count: i64) -> ProviderResult<()> {
        let patch = json!([{ "op": "replace", "path": "/node_count", "value": count }]);
        self.send(
            Method::PATCH,
            CONTAINER_INFRA,
            &["clusters", cluster],
            Some(&patch),
            "update cluster node count",
        )
        .await?;
        Ok(())
    }

    async fn resize_cluster(&self, cluster: &str, request: &ResizeRequest) -> ProviderResult<()> {
        let body = serde_json::to_value(request)
            .map_err(|e| ProviderError::Rejected(format!("resize body: {}", e)))?;
        self.send(
            Method::POST,
            CONTAINER_INFRA,
            &["clusters", cluster, "actions", "resize"],
            Some(&body),
            "resize cluster",
        )
        .await?;
        Ok(())
    }

    async fn list_node_groups(&self, cluster: &str) -> ProviderResult<Vec<NodeGroupDetail>> {
        let list: NodeGroupList = self
            .get_json(
                CONTAINER_INFRA,
                &["clusters", cluster, "nodegroups"],
                "list node groups",
            )
            .await?;
        Ok(list.nodegroups)
    }

    async fn get_node_group(&self, cluster: &str, node_group: &str) -> ProviderResult<NodeGroupDetail> {
        self.get_json(
            CONTAINER_INFRA,
            &["clusters", cluster, "nodegroups", node_group],
            "get node group",
        )
        .await
    }
}

#[async_trait]
impl OrchestrationApi for OpenStackClient {
    async fn find_stack(&self, name_or_id: &str) -> ProviderResult<Stack> {
        let body: StackBody = self
            .get_json(ORCHESTRATION, &["stacks", name_or_id], "find stack")
            .await?;
        Ok(body.stack)
    }

    async fn get_stack(&self, stack: &StackRef) -> ProviderResult<Stack> {
        let body: StackBody = self
            .get_json(ORCHESTRATION, &["stacks", &stack.name, &stack.id], "get stack")
            .await?;
        Ok(body.stack)
    }

    async fn get_stack_resource(&self, stack: &StackRef, resource: &str) -> ProviderResult<StackResource> {
        let body: ResourceBody = self
            .get_json(
                ORCHESTRATION,
                &["stacks", &stack.name, &stack.id, "resources", resource],
                "get stack resource",
            )
            .await?;
        Ok(body.resource)
    }

    async fn list_stack_resources(&self, stack: &StackRef) -> ProviderResult<Vec<StackResource>> {
        let body: ResourceList = self
            .get_json(
                ORCHESTRATION,
                &["stacks", &stack.name, &stack.id, "resources"],
                "list stack resources",
            )
            .await?;
        Ok(body.resources)
    }

    async fn find_stack_resources(&self, stack_id: &str) -> ProviderResult<Vec<StackResource>> {
        let body: ResourceList = self
            .get_json(
                ORCHESTRATION,
                &["stacks", stack_id, "resources"],
                "find stack resources",
            )
            .await?;
        Ok(body.resources)
    }

    async fn patch_stack_parameters(
        &self,
        stack: &StackRef,
        parameters: serde_json::Map<String, Value>,
    ) -> ProviderResult<()> {
        let body = json!({ "parameters": parameters });
        self.send(
            Method::PATCH,
            ORCHESTRATION,
            &["stacks", &stack.name, &stack.id],
            Some(&body),
            "patch stack",
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ComputeApi for OpenStackClient {
    async fn get_flavor(&self, flavor_id: &str) -> ProviderResult<Flavor> {
        let body: FlavorBody = self
            .get_json(COMPUTE, &["flavors", flavor_id], "get flavor")
            .await?;
        Ok(body.flavor)
    }
}
