// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The manager's configuration document.
//!
//! ```yaml
//! components_manager:
//!   event_thread_pool:
//!     threads: 2
//!   task_frame_pool:
//!     max_frames: 4096
//!     idle_limit: 256
//!   task_processors:
//!     - name: main-task-processor
//!       worker_threads: 4
//!     - name: fs-task-processor
//!       worker_threads: 2
//!       blocking: true
//!   default_task_processor: main-task-processor
//!   components:
//!     dns-resolver:
//!       nameserver: 127.0.0.1:53
//! ```

use crate::error::Error;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskProcessorConfig {
    pub name: String,
    pub worker_threads: usize,
    /// Processors carrying blocking workloads; regular tasks must not be
    /// spawned here and blocking bridges must not land anywhere else.
    #[serde(default)]
    pub blocking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventThreadPoolConfig {
    pub threads: usize,
}

impl Default for EventThreadPoolConfig {
    fn default() -> Self {
        Self { threads: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskFramePoolConfig {
    pub max_frames: usize,
    pub idle_limit: usize,
}

impl Default for TaskFramePoolConfig {
    fn default() -> Self {
        let defaults = crate::task::FramePoolConfig::default();
        Self {
            max_frames: defaults.max_frames,
            idle_limit: defaults.idle_limit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LoggingConfig {
    /// Log file path; stderr when absent.
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// An `EnvFilter` directive, e.g. `info` or `plinth=debug,info`.
    #[serde(default)]
    pub level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagerConfig {
    pub task_processors: Vec<TaskProcessorConfig>,
    pub default_task_processor: String,
    #[serde(default)]
    pub event_thread_pool: EventThreadPoolConfig,
    #[serde(default)]
    pub task_frame_pool: TaskFramePoolConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Milliseconds granted to drain tasks at shutdown before outstanding
    /// work is cancelled.
    #[serde(default = "default_shutdown_deadline_ms")]
    pub shutdown_deadline_ms: u64,
    #[serde(default)]
    pub components: BTreeMap<String, serde_yaml::Value>,
}

fn default_shutdown_deadline_ms() -> u64 {
    3000
}

/// The full config document: the manager subtree under its well-known key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct ConfigDocument {
    components_manager: ManagerConfig,
}

/// Config text passed in memory, distinguished by type from a config path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMemoryConfig(pub String);

/// Where the manager reads its configuration from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    Path(PathBuf),
    InMemory(InMemoryConfig),
}

impl From<&Path> for ConfigSource {
    fn from(path: &Path) -> Self {
        ConfigSource::Path(path.to_owned())
    }
}

impl From<InMemoryConfig> for ConfigSource {
    fn from(config: InMemoryConfig) -> Self {
        ConfigSource::InMemory(config)
    }
}

impl ManagerConfig {
    pub fn load(source: &ConfigSource) -> Result<Self, Error> {
        let text = match source {
            ConfigSource::Path(path) => std::fs::read_to_string(path)
                .map_err(Error::NetworkFailure)?,
            ConfigSource::InMemory(InMemoryConfig(text)) => text.clone(),
        };
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, Error> {
        let document: ConfigDocument = serde_yaml::from_str(text).map_err(Error::user)?;
        document.components_manager.validate()?;
        Ok(document.components_manager)
    }

    pub fn to_yaml(&self) -> Result<String, Error> {
        let document = ConfigDocument {
            components_manager: self.clone(),
        };
        serde_yaml::to_string(&document).map_err(Error::user)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.task_processors.is_empty() {
            return Err(Error::Invariant("at least one task processor is required"));
        }
        if !self
            .task_processors
            .iter()
            .any(|p| p.name == self.default_task_processor)
        {
            return Err(Error::Invariant(
                "default_task_processor does not name a configured processor",
            ));
        }
        Ok(())
    }

    pub fn component_configs(&self) -> impl Iterator<Item = ComponentConfig> + '_ {
        self.components.iter().map(|(name, value)| ComponentConfig {
            name: name.clone(),
            value: value.clone(),
        })
    }
}

/// One component's configuration subtree.
#[derive(Debug, Clone)]
pub struct ComponentConfig {
    name: String,
    value: serde_yaml::Value,
}

impl ComponentConfig {
    pub fn empty(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            value: serde_yaml::Value::Null,
        }
    }

    pub fn new(name: &str, value: serde_yaml::Value) -> Self {
        Self {
            name: name.to_owned(),
            value,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raw(&self) -> &serde_yaml::Value {
        &self.value
    }

    /// Deserialize the whole subtree into a typed struct.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_yaml::from_value(self.value.clone()).map_err(Error::user)
    }

    /// Deserialize a single key of the subtree.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, Error> {
        let value = self
            .value
            .get(key)
            .cloned()
            .ok_or_else(|| Error::DependencyMissing(format!("{}.{key}", self.name)))?;
        serde_yaml::from_value(value).map_err(Error::user)
    }

    /// Like [`Self::get`], but `None` when the key is absent.
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, Error> {
        match self.value.get(key) {
            Some(value) => serde_yaml::from_value(value.clone())
                .map(Some)
                .map_err(Error::user),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
components_manager:
  event_thread_pool:
    threads: 2
  task_processors:
    - name: main-task-processor
      worker_threads: 4
    - name: fs-task-processor
      worker_threads: 2
      blocking: true
  default_task_processor: main-task-processor
  components:
    dns-resolver:
      nameserver: "127.0.0.1:5353"
      max_attempts: 3
"#;

    #[test]
    fn parses_the_sample_document() {
        let config = ManagerConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.task_processors.len(), 2);
        assert_eq!(config.default_task_processor, "main-task-processor");
        assert_eq!(config.event_thread_pool.threads, 2);
        assert!(config.task_processors[1].blocking);
        assert_eq!(config.shutdown_deadline_ms, 3000);

        let dns = config.component_configs().next().unwrap();
        assert_eq!(dns.name(), "dns-resolver");
        assert_eq!(dns.get::<String>("nameserver").unwrap(), "127.0.0.1:5353");
        assert_eq!(dns.get::<u32>("max_attempts").unwrap(), 3);
        assert!(dns.get_opt::<u32>("absent").unwrap().is_none());
    }

    #[test]
    fn round_trips_structurally() {
        let config = ManagerConfig::parse(SAMPLE).unwrap();
        let yaml = config.to_yaml().unwrap();
        let reparsed = ManagerConfig::parse(&yaml).unwrap();
        assert_eq!(config, reparsed);
    }

    #[test]
    fn missing_default_processor_is_rejected() {
        let text = r#"
components_manager:
  task_processors:
    - name: main
      worker_threads: 1
  default_task_processor: nope
"#;
        assert!(matches!(
            ManagerConfig::parse(text),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn in_memory_config_loads() {
        let source = ConfigSource::from(InMemoryConfig(SAMPLE.to_owned()));
        let config = ManagerConfig::load(&source).unwrap();
        assert_eq!(config.task_processors[0].name, "main-task-processor");
    }
}
