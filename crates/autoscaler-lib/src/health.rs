//! Health tracking for liveness and readiness probes
//!
//! Components report their own status; the tick driver feeds a watchdog
//! so that a stalled loop turns liveness unhealthy even when every
//! component last reported success.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Operational, but the last operation failed transiently
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
    /// Seconds since the reconcile loop last completed a tick
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_secs: Option<u64>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;
        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }
        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const PROVIDER: &str = "provider";
    pub const DISCOVERY: &str = "discovery";
    pub const RECOMMENDER: &str = "recommender";
    pub const CHECKPOINTS: &str = "checkpoints";
}

#[derive(Debug)]
struct Watchdog {
    last_activity: Instant,
    max_inactivity: Duration,
}

/// Shared registry of component health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
    watchdog: Arc<RwLock<Watchdog>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl HealthRegistry {
    /// Creates a registry whose liveness fails after `max_inactivity`
    /// without a completed tick.
    pub fn new(max_inactivity: Duration) -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
            watchdog: Arc::new(RwLock::new(Watchdog {
                last_activity: Instant::now(),
                max_inactivity,
            })),
        }
    }

    pub async fn register(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        self.components.write().await.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Advances the watchdog.
    pub async fn touch(&self) {
        self.watchdog.write().await.last_activity = Instant::now();
    }

    pub async fn is_stalled(&self) -> bool {
        let watchdog = self.watchdog.read().await;
        watchdog.last_activity.elapsed() > watchdog.max_inactivity
    }

    /// Liveness view: component statuses plus the watchdog.
    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let mut status = HealthResponse::compute_status(&components);
        let (elapsed, stalled) = {
            let watchdog = self.watchdog.read().await;
            let elapsed = watchdog.last_activity.elapsed();
            (elapsed, elapsed > watchdog.max_inactivity)
        };
        if stalled {
            status = ComponentStatus::Unhealthy;
        }
        HealthResponse {
            status,
            components,
            last_activity_secs: Some(elapsed.as_secs()),
        }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        if !ready {
            ReadinessResponse {
                ready: false,
                reason: Some("Node groups not yet registered".to_string()),
            }
        } else if health.status == ComponentStatus::Unhealthy {
            ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            }
        } else {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        }
    }
}
