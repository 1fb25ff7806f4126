//! Integration tests for the autoscaler API endpoints

use async_trait::async_trait;
use autoscaler_lib::{
    api::{create_router, AppState},
    cloudprovider::{
        AutoDiscoveryConfig, CloudProvider, DiscoveryMode, EngineSettings, ProviderAdapter,
        StaticGroupSpec,
    },
    health::{components, HealthRegistry},
    models::{DiscoveredGroup, Instance, NodeHandle, NodeRef, NodeTemplate},
    ProviderError, ProviderResult,
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use std::sync::Arc;
use tokio::time::Instant;
use tower::ServiceExt;

/// Adapter for a fixed set of groups whose size never changes
struct FixedAdapter;

#[async_trait]
impl ProviderAdapter for FixedAdapter {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn size(&self, _group_id: &str) -> ProviderResult<i64> {
        Ok(2)
    }

    async fn update_size(&self, _group_id: &str, _count: i64) -> ProviderResult<()> {
        Ok(())
    }

    async fn list_instances(&self, _group_id: &str) -> ProviderResult<Vec<Instance>> {
        Ok(Vec::new())
    }

    async fn delete_instances(
        &self,
        _group_id: &str,
        _nodes: &[NodeRef],
        _new_count: i64,
        _deadline: Instant,
    ) -> ProviderResult<()> {
        Ok(())
    }

    async fn discover_groups(
        &self,
        _configs: &[AutoDiscoveryConfig],
    ) -> ProviderResult<Vec<DiscoveredGroup>> {
        Err(ProviderError::NotImplemented("discovery"))
    }

    async fn identify(&self, group: &str) -> ProviderResult<(String, String)> {
        Ok((format!("{}-0a1b2c3d", group), format!("0a1b2c3d-{}", group)))
    }

    async fn owner_of(&self, _node: &NodeHandle) -> ProviderResult<String> {
        Err(ProviderError::NotFound("node".into()))
    }

    async fn can_mutate(&self) -> ProviderResult<(bool, String)> {
        Ok((true, "CREATE_COMPLETE".into()))
    }

    async fn template_node_info(&self, _group: &DiscoveredGroup) -> ProviderResult<NodeTemplate> {
        Err(ProviderError::NotImplemented("templates"))
    }
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::default();
    health_registry.register(components::PROVIDER).await;
    health_registry.register(components::DISCOVERY).await;

    let state = Arc::new(AppState::new(health_registry));
    let router = create_router(state.clone());
    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let (status, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["components"]["provider"]["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, state) = setup_test_app().await;
    state
        .health_registry
        .set_degraded(components::DISCOVERY, "cluster API unavailable")
        .await;

    let (status, health) = get_json(app, "/healthz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;
    state
        .health_registry
        .set_unhealthy(components::PROVIDER, "authentication rejected")
        .await;

    let (status, health) = get_json(app, "/healthz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_when_not_ready() {
    let (app, _state) = setup_test_app().await;

    let (status, readiness) = get_json(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;

    let (status, readiness) = get_json(app, "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_returns_prometheus_text() {
    let (app, state) = setup_test_app().await;
    let provider = CloudProvider::initialize(
        Arc::new(FixedAdapter),
        DiscoveryMode::Static(vec![StaticGroupSpec {
            min_size: 1,
            max_size: 4,
            name: "metrics".into(),
        }]),
        EngineSettings::default(),
    )
    .await
    .unwrap();
    state.set_provider(Arc::new(provider));

    let (status, body) = get(app, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("node_autoscaler_node_group_max_size{node_group=\"metrics-0a1b2c3d\"} 4"));
}

#[tokio::test]
async fn test_nodegroups_unavailable_before_registration() {
    let (app, _state) = setup_test_app().await;

    let (status, _) = get(app, "/nodegroups").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_nodegroups_lists_registered_groups() {
    let (app, state) = setup_test_app().await;
    let provider = CloudProvider::initialize(
        Arc::new(FixedAdapter),
        DiscoveryMode::Static(vec![StaticGroupSpec {
            min_size: 1,
            max_size: 5,
            name: "default-worker".into(),
        }]),
        EngineSettings::default(),
    )
    .await
    .unwrap();
    state.set_provider(Arc::new(provider));

    let (status, groups) = get_json(app, "/nodegroups").await;
    assert_eq!(status, StatusCode::OK);
    let groups = groups.as_array().unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0]["id"], "default-worker-0a1b2c3d");
    assert_eq!(groups[0]["min_size"], 1);
    assert_eq!(groups[0]["max_size"], 5);
    assert_eq!(groups[0]["target_size"], 2);
}
