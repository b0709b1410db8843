use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::FromConfig;
use crate::RateLimiter;
use crate::Tags;
use crate::config::RateLimiterConfig;
use crate::error::ConfigError;

/// Name of the configuration used when none is given.
pub const DEFAULT_CONFIG: &str = "default";

/// In-memory store of named limiters.
///
/// A limiter is created on first use from the default config, a named config,
/// or an explicit one, and handed out as an `Arc` from then on. Registry tags
/// are added to the tags of every limiter it creates.
#[derive(Debug)]
pub struct RateLimiterRegistry<L> {
    configurations: RwLock<HashMap<String, RateLimiterConfig>>,
    limiters: RwLock<HashMap<String, Arc<L>>>,
    tags: Tags,
}

impl<L> Default for RateLimiterRegistry<L> {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl<L> RateLimiterRegistry<L> {
    pub fn builder() -> RateLimiterRegistryBuilder {
        RateLimiterRegistryBuilder::default()
    }

    pub fn of_defaults() -> Self {
        Self::default()
    }

    pub fn with_config(default_config: RateLimiterConfig) -> Self {
        Self::builder().default_config(default_config).build()
    }

    pub fn default_config(&self) -> RateLimiterConfig {
        self.configurations
            .read()
            .get(DEFAULT_CONFIG)
            .cloned()
            .unwrap_or_default()
    }

    /// Register a config that limiters can later be created from by name.
    ///
    /// Registering under [`DEFAULT_CONFIG`] replaces the default.
    pub fn add_configuration(&self, name: impl Into<String>, config: RateLimiterConfig) {
        self.configurations.write().insert(name.into(), config);
    }

    pub fn configuration(&self, name: &str) -> Option<RateLimiterConfig> {
        self.configurations.read().get(name).cloned()
    }

    pub fn find(&self, name: &str) -> Option<Arc<L>> {
        self.limiters.read().get(name).cloned()
    }

    /// Swap the limiter stored under `name`, returning the previous one.
    ///
    /// Nothing is stored if there was no limiter under that name.
    pub fn replace(&self, name: &str, limiter: Arc<L>) -> Option<Arc<L>> {
        let mut limiters = self.limiters.write();
        let slot = limiters.get_mut(name)?;
        debug!(name, "replacing rate limiter");
        Some(std::mem::replace(slot, limiter))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<L>> {
        let removed = self.limiters.write().remove(name);
        if removed.is_some() {
            debug!(name, "removed rate limiter");
        }
        removed
    }

    /// Names of the stored limiters, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tags(&self) -> &Tags {
        &self.tags
    }
}

impl<L: RateLimiter + FromConfig> RateLimiterRegistry<L> {
    /// The limiter named `name`, created from the default config if needed.
    pub fn rate_limiter(&self, name: &str) -> Result<Arc<L>, ConfigError> {
        self.rate_limiter_with_tags(name, self.default_config(), Tags::new())
    }

    /// The limiter named `name`, created from `config` if needed. An existing
    /// limiter keeps its own config.
    pub fn rate_limiter_with_config(
        &self,
        name: &str,
        config: RateLimiterConfig,
    ) -> Result<Arc<L>, ConfigError> {
        self.rate_limiter_with_tags(name, config, Tags::new())
    }

    /// The limiter named `name`, created from the registered config
    /// `config_name` if needed.
    ///
    /// # Errors
    ///
    /// [`ConfigError::UnknownConfiguration`] if no such config was added.
    pub fn rate_limiter_with_config_name(
        &self,
        name: &str,
        config_name: &str,
    ) -> Result<Arc<L>, ConfigError> {
        let config = self
            .configuration(config_name)
            .ok_or_else(|| ConfigError::UnknownConfiguration(config_name.to_string()))?;
        self.rate_limiter_with_tags(name, config, Tags::new())
    }

    /// Get or create a limiter. `tags` are merged over the registry's tags.
    pub fn rate_limiter_with_tags(
        &self,
        name: &str,
        config: RateLimiterConfig,
        tags: Tags,
    ) -> Result<Arc<L>, ConfigError> {
        if let Some(limiter) = self.find(name) {
            return Ok(limiter);
        }

        let mut limiters = self.limiters.write();
        // another thread may have won the race while we upgraded
        if let Some(limiter) = limiters.get(name) {
            return Ok(Arc::clone(limiter));
        }
        let mut all_tags = self.tags.clone();
        all_tags.extend(tags);
        let limiter = Arc::new(L::from_config(name.to_string(), config, all_tags)?);
        limiters.insert(name.to_string(), Arc::clone(&limiter));
        debug!(name, "registered rate limiter");
        Ok(limiter)
    }
}

#[derive(Debug, Default)]
pub struct RateLimiterRegistryBuilder {
    default_config: Option<RateLimiterConfig>,
    configurations: HashMap<String, RateLimiterConfig>,
    tags: Tags,
}

impl RateLimiterRegistryBuilder {
    pub fn default_config(mut self, config: RateLimiterConfig) -> Self {
        self.default_config = Some(config);
        self
    }

    pub fn add_configuration(mut self, name: impl Into<String>, config: RateLimiterConfig) -> Self {
        self.configurations.insert(name.into(), config);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn tags(mut self, tags: Tags) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn build<L>(self) -> RateLimiterRegistry<L> {
        let mut configurations = self.configurations;
        if let Some(config) = self.default_config {
            configurations.insert(DEFAULT_CONFIG.to_string(), config);
        }
        configurations.entry(DEFAULT_CONFIG.to_string()).or_default();
        RateLimiterRegistry {
            configurations: RwLock::new(configurations),
            limiters: RwLock::new(HashMap::new()),
            tags: self.tags,
        }
    }
}
