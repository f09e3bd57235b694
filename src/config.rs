//! Runtime configuration for the resolver.
//!
//! Configuration is loaded with precedence: programmatic overrides > env
//! vars > config file > defaults.
//!
//! # Example config file (kindred.toml)
//! ```toml
//! strategy = "full-consolidation"
//! capture = true
//! run_id = "2026-08-nightly"
//!
//! [candidates]
//! sorted = true
//! min_filter_size = 8
//! ```

use crate::engine::Strategy;
use crate::error::ResolveError;
use crate::repository::CandidateOptions;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Environment variable prefix; nested keys use a double underscore
/// (`KINDRED_CANDIDATES__MIN_FILTER_SIZE`).
const ENV_PREFIX: &str = "KINDRED_";

/// Main resolver configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Consolidation strategy.
    pub strategy: Strategy,
    /// Persist unmatched references as new identities.
    pub capture: bool,
    /// Identifier recorded in traces for this run.
    pub run_id: String,
    /// The match-result label treated as exact for the candidate pre-filter.
    pub exact_label: String,
    /// Candidate retrieval tuning.
    pub candidates: CandidateOptions,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            capture: true,
            run_id: "local".to_string(),
            exact_label: crate::compare::RESULT_EXACT.to_string(),
            candidates: CandidateOptions::default(),
        }
    }
}

impl ResolverConfig {
    /// Load configuration with precedence: overrides > env > file > defaults.
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ResolveError> {
        let mut figment = Figment::new().merge(Serialized::defaults(ResolverConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));
        figment = figment.merge(Serialized::defaults(overrides));

        figment
            .extract()
            .map_err(|error| ResolveError::Configuration(error.to_string()))
    }

    /// Load from environment and optional config file only.
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ResolveError> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// Programmatic overrides applied on top of every other layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    /// Override the strategy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<Strategy>,
    /// Override the capture flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<bool>,
    /// Override the run id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}
