//! Autoscaler configuration
//!
//! Settings come from an optional file, then `AUTOSCALER_*` environment
//! variables (nested keys use `__`, lists use `;`), then command-line
//! overrides.

use anyhow::{bail, Context, Result};
use autoscaler_lib::cloudprovider::{DiscoveryMode, EngineSettings, HeatSettings};
use autoscaler_lib::recommender::RecommenderConfig;
use clap::{Parser, ValueEnum};
use config::{Config, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Magnum node groups, resized through the cluster API
    Native,
    /// Single node group backed by the cluster's kube-minions stack
    Heat,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Native => write!(f, "native"),
            ProviderKind::Heat => write!(f, "heat"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "node-autoscaler", version, about = "Node-group autoscaler for Magnum clusters")]
pub struct Args {
    /// Autoscaler settings file
    #[arg(long, env = "AUTOSCALER_CONFIG")]
    pub config: Option<PathBuf>,

    /// OpenStack cloud-config (INI)
    #[arg(long)]
    pub cloud_config: Option<PathBuf>,

    /// Cluster name or UUID
    #[arg(long)]
    pub cluster_name: Option<String>,

    #[arg(long, value_enum)]
    pub provider: Option<ProviderKind>,

    #[arg(long)]
    pub api_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoscalerConfig {
    pub cluster_name: String,
    pub provider: ProviderKind,
    pub cloud_config: PathBuf,

    /// `magnum:role=<role>[,<role>...]` selectors
    pub node_group_auto_discovery: Vec<String>,
    /// `min:max:name` static node groups
    pub nodes: Vec<String>,
    /// Allow node groups with a minimum size of zero
    pub scale_to_zero: bool,

    pub scan_interval_secs: u64,
    pub api_port: u16,
    /// Liveness fails when no tick completes for this long
    pub max_inactivity_secs: u64,

    pub operation_timeout_secs: u64,
    pub batch_window_secs: u64,
    pub stack_in_progress_timeout_secs: u64,
    pub stack_complete_timeout_secs: u64,
    pub stack_poll_interval_secs: u64,

    pub recommender_enabled: bool,
    /// JSON snapshot of scalers, pods and usage
    pub recommender_snapshot: Option<PathBuf>,
    /// Where recommendations are written, one file per scaler
    pub recommendations_dir: Option<PathBuf>,
    pub recommender: RecommenderConfig,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        let engine = EngineSettings::default();
        let heat = HeatSettings::default();
        Self {
            cluster_name: String::new(),
            provider: ProviderKind::Native,
            cloud_config: PathBuf::from("/etc/kubernetes/cloud-config"),
            node_group_auto_discovery: Vec::new(),
            nodes: Vec::new(),
            scale_to_zero: false,
            scan_interval_secs: 10,
            api_port: 8080,
            max_inactivity_secs: 600,
            operation_timeout_secs: engine.operation_timeout.as_secs(),
            batch_window_secs: engine.batch_window.as_secs(),
            stack_in_progress_timeout_secs: heat.in_progress_timeout.as_secs(),
            stack_complete_timeout_secs: heat.complete_timeout.as_secs(),
            stack_poll_interval_secs: heat.poll_interval.as_secs(),
            recommender_enabled: false,
            recommender_snapshot: None,
            recommendations_dir: None,
            recommender: RecommenderConfig::default(),
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix("AUTOSCALER")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .list_separator(";")
        .with_list_parse_key("node_group_auto_discovery")
        .with_list_parse_key("nodes")
}

impl AutoscalerConfig {
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = &args.config {
            builder = builder.add_source(File::from(path.as_path()));
        }
        let mut config = Self::from_builder(builder.add_source(environment()))?;
        config.apply_args(args);
        config.validate()?;
        Ok(config)
    }

    fn from_builder(
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self> {
        builder
            .build()
            .context("Failed to read autoscaler settings")?
            .try_deserialize()
            .context("Invalid autoscaler settings")
    }

    fn apply_args(&mut self, args: &Args) {
        if let Some(path) = &args.cloud_config {
            self.cloud_config = path.clone();
        }
        if let Some(name) = &args.cluster_name {
            self.cluster_name = name.clone();
        }
        if let Some(provider) = args.provider {
            self.provider = provider;
        }
        if let Some(port) = args.api_port {
            self.api_port = port;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.trim().is_empty() {
            bail!("cluster_name must be set");
        }
        if self.scan_interval_secs == 0 {
            bail!("scan_interval_secs must be positive");
        }
        let mode = self.discovery_mode()?;
        if self.provider == ProviderKind::Heat && matches!(mode, DiscoveryMode::Auto(_)) {
            bail!("the heat provider does not support node group auto-discovery");
        }
        if self.recommender_enabled {
            if self.recommender_snapshot.is_none() {
                bail!("recommender_snapshot must be set when the recommender is enabled");
            }
            self.recommender.validate()?;
        }
        Ok(())
    }

    pub fn discovery_mode(&self) -> Result<DiscoveryMode> {
        DiscoveryMode::from_specs(&self.nodes, &self.node_group_auto_discovery, self.scale_to_zero)
            .context("Invalid node group configuration")
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            batch_window: Duration::from_secs(self.batch_window_secs),
            cluster_name: self.cluster_name.clone(),
            ..EngineSettings::default()
        }
    }

    pub fn heat_settings(&self) -> HeatSettings {
        HeatSettings {
            in_progress_timeout: Duration::from_secs(self.stack_in_progress_timeout_secs),
            complete_timeout: Duration::from_secs(self.stack_complete_timeout_secs),
            poll_interval: Duration::from_secs(self.stack_poll_interval_secs),
        }
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_secs)
    }

    pub fn max_inactivity(&self) -> Duration {
        Duration::from_secs(self.max_inactivity_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn parse(toml: &str) -> Result<AutoscalerConfig> {
        AutoscalerConfig::from_builder(
            Config::builder().add_source(File::from_str(toml, FileFormat::Toml)),
        )
    }

    #[test]
    fn test_defaults() {
        let config = parse("cluster_name = \"k8s\"\nnodes = [\"1:5:default-worker\"]").unwrap();
        assert_eq!(config.provider, ProviderKind::Native);
        assert_eq!(config.scan_interval(), Duration::from_secs(10));
        assert_eq!(config.engine_settings().cluster_name, "k8s");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nested_recommender_settings() {
        let config = parse(
            "cluster_name = \"k8s\"\n\
             node_group_auto_discovery = [\"magnum:role=worker\"]\n\
             recommender_enabled = true\n\
             recommender_snapshot = \"/var/run/snapshot.json\"\n\
             [recommender]\n\
             memory_saver = true\n",
        )
        .unwrap();
        assert!(config.recommender.memory_saver);
        assert_eq!(config.recommender.safety_margin_fraction, 0.15);
        assert!(matches!(config.discovery_mode().unwrap(), DiscoveryMode::Auto(_)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let no_cluster = parse("nodes = [\"1:5:ng\"]").unwrap();
        assert!(no_cluster.validate().is_err());

        let both = parse(
            "cluster_name = \"k8s\"\nnodes = [\"1:5:ng\"]\nnode_group_auto_discovery = [\"magnum:role=worker\"]",
        )
        .unwrap();
        assert!(both.validate().is_err());

        let heat_discovery = parse(
            "cluster_name = \"k8s\"\nprovider = \"heat\"\nnode_group_auto_discovery = [\"magnum:role=worker\"]",
        )
        .unwrap();
        assert!(heat_discovery.validate().is_err());

        let zero_min = parse("cluster_name = \"k8s\"\nnodes = [\"0:5:ng\"]").unwrap();
        assert!(zero_min.validate().is_err());
        let zero_allowed =
            parse("cluster_name = \"k8s\"\nnodes = [\"0:5:ng\"]\nscale_to_zero = true").unwrap();
        assert!(zero_allowed.validate().is_ok());

        let no_snapshot = parse(
            "cluster_name = \"k8s\"\nnodes = [\"1:5:ng\"]\nrecommender_enabled = true",
        )
        .unwrap();
        assert!(no_snapshot.validate().is_err());
    }

    #[test]
    fn test_args_override_settings() {
        let mut config = parse("cluster_name = \"from-file\"").unwrap();
        let args = Args::parse_from([
            "node-autoscaler",
            "--cluster-name",
            "from-flag",
            "--provider",
            "heat",
            "--api-port",
            "9090",
        ]);
        config.apply_args(&args);
        assert_eq!(config.cluster_name, "from-flag");
        assert_eq!(config.provider, ProviderKind::Heat);
        assert_eq!(config.api_port, 9090);
    }
}
