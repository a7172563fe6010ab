// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Plugin Loader
//!
//! Service plugins are compiled into the daemon and published through a
//! [`PluginCatalog`]. The plugin directory holds one YAML manifest per
//! enabled plugin, selecting a catalog entry and passing it configuration:
//!
//! ```yaml
//! apiVersion: middleware/v1
//! kind: PluginManifest
//! metadata:
//!   name: sharing-smb
//!   version: "1.0.0"
//! spec:
//!   plugin: sharing.smb
//!   order: 20
//!   config:
//!     workgroup: WORKGROUP
//! ```
//!
//! Loading has two phases. [`Plugin::register`] runs against a [`Registrar`]
//! and contributes services, schemas, events, roles and hooks; once every
//! plugin has registered, the middleware resolves the schema registry (an
//! unresolved reference is fatal) and then calls [`Plugin::setup`] on each
//! plugin with the built middleware. Only after that are transports opened.

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::application::hooks::{EtcGenerator, Hook, HookRegistry, ServiceController};
use crate::application::middleware::Middleware;
use crate::application::schema_registry::{SchemaError, SchemaId, SchemaRegistry};
use crate::application::service_registry::{RegistryError, ServiceDefinition, ServiceRegistry};
use crate::domain::config::{ManifestMetadata, PluginsConfig};
use crate::domain::credential::{RoleDef, RoleTable};
use crate::domain::events::EventType;
use crate::domain::schema::Schema;
use crate::infrastructure::event_bus::{EventAccess, EventBusBuilder};

pub const PLUGIN_API_VERSION: &str = "middleware/v1";
pub const PLUGIN_KIND: &str = "PluginManifest";

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Failed to read plugin manifest {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid plugin manifest {path:?}: {reason}")]
    Manifest { path: PathBuf, reason: String },

    #[error("Manifest {manifest} names unknown plugin {plugin}")]
    UnknownPlugin { manifest: String, plugin: String },

    #[error("Plugin {plugin} could not be created: {reason}")]
    Factory { plugin: String, reason: String },

    #[error("Plugin {plugin} failed to register: {source}")]
    Registration {
        plugin: String,
        #[source]
        source: RegistryError,
    },

    #[error("Plugin {plugin} registered an invalid schema: {source}")]
    Schema {
        plugin: String,
        #[source]
        source: SchemaError,
    },
}

/// A service plugin.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Contribute services, schemas, events, roles and hooks.
    fn register(&self, registrar: &mut Registrar<'_>) -> Result<(), PluginError>;

    /// Runs once after schema resolution, before transports open.
    async fn setup(&self, middleware: &Middleware) -> anyhow::Result<()> {
        let _ = middleware;
        Ok(())
    }
}

/// Registration surface handed to [`Plugin::register`].
pub struct Registrar<'a> {
    plugin: String,
    schemas: &'a mut SchemaRegistry,
    services: &'a mut ServiceRegistry,
    events: &'a mut EventBusBuilder,
    roles: &'a mut RoleTable,
    hooks: &'a mut HookRegistry,
}

impl<'a> Registrar<'a> {
    pub(crate) fn new(
        plugin: impl Into<String>,
        schemas: &'a mut SchemaRegistry,
        services: &'a mut ServiceRegistry,
        events: &'a mut EventBusBuilder,
        roles: &'a mut RoleTable,
        hooks: &'a mut HookRegistry,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            schemas,
            services,
            events,
            roles,
            hooks,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn service(&mut self, definition: ServiceDefinition) -> Result<(), PluginError> {
        self.services
            .register_service(definition, self.schemas)
            .map_err(|source| PluginError::Registration {
                plugin: self.plugin.clone(),
                source,
            })
    }

    /// Register a named schema other plugins may reference or patch.
    pub fn schema(&mut self, schema: Schema) -> Result<SchemaId, PluginError> {
        self.schemas.register(schema).map_err(|source| PluginError::Schema {
            plugin: self.plugin.clone(),
            source,
        })
    }

    pub fn event(&mut self, event: EventType) -> Result<(), PluginError> {
        let schema = match &event.payload {
            Some(payload) => Some(self.schemas.compile(payload).map_err(|source| PluginError::Schema {
                plugin: self.plugin.clone(),
                source,
            })?),
            None => None,
        };
        self.events.register(&event, schema);
        Ok(())
    }

    /// Per-subscriber visibility check for an event this plugin registered.
    pub fn event_access(&mut self, name: &str, access: EventAccess) {
        self.events.restrict(name, access);
    }

    pub fn role(&mut self, role: RoleDef) {
        self.roles.add(role);
    }

    pub fn hook(&mut self, name: &str, hook: Arc<dyn Hook>, order: i32) {
        self.hooks.register_hook(name, hook, order);
    }

    pub fn etc_generator(&mut self, group: &str, generator: Arc<dyn EtcGenerator>) {
        self.hooks.register_generator(group, generator);
    }

    pub fn service_controller(&mut self, service: &str, controller: Arc<dyn ServiceController>) {
        self.hooks.register_controller(service, controller);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ManifestMetadata,
    pub spec: PluginSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSpec {
    /// Catalog entry to instantiate
    pub plugin: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Lower loads first
    #[serde(default)]
    pub order: i32,

    #[serde(default)]
    pub config: Value,
}

fn default_enabled() -> bool {
    true
}

impl PluginManifest {
    pub fn from_yaml_str(yaml: &str, path: &Path) -> Result<Self, PluginError> {
        let manifest: Self = serde_yaml::from_str(yaml).map_err(|e| PluginError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        manifest.validate(path)?;
        Ok(manifest)
    }

    fn validate(&self, path: &Path) -> Result<(), PluginError> {
        let invalid = |reason: String| PluginError::Manifest {
            path: path.to_path_buf(),
            reason,
        };
        if self.api_version != PLUGIN_API_VERSION {
            return Err(invalid(format!(
                "apiVersion must be {}, got {}",
                PLUGIN_API_VERSION, self.api_version
            )));
        }
        if self.kind != PLUGIN_KIND {
            return Err(invalid(format!("kind must be {}, got {}", PLUGIN_KIND, self.kind)));
        }
        if self.metadata.name.is_empty() {
            return Err(invalid("metadata.name must not be empty".to_string()));
        }
        Ok(())
    }
}

pub type PluginFactory = Arc<dyn Fn(&Value) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync>;

/// Plugins compiled into this build, by catalog name.
#[derive(Default, Clone)]
pub struct PluginCatalog {
    factories: IndexMap<String, PluginFactory>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&Value) -> anyhow::Result<Arc<dyn Plugin>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Register a plugin that takes no configuration.
    pub fn with_plugin(mut self, plugin: Arc<dyn Plugin>) -> Self {
        let name = plugin.name().to_string();
        self.register(name, move |_| Ok(Arc::clone(&plugin)));
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    fn instantiate(&self, name: &str, config: &Value, manifest: &str) -> Result<Arc<dyn Plugin>, PluginError> {
        let factory = self.factories.get(name).ok_or_else(|| PluginError::UnknownPlugin {
            manifest: manifest.to_string(),
            plugin: name.to_string(),
        })?;
        factory(config).map_err(|e| PluginError::Factory {
            plugin: name.to_string(),
            reason: format!("{:#}", e),
        })
    }
}

pub struct PluginLoader<'a> {
    catalog: &'a PluginCatalog,
}

impl<'a> PluginLoader<'a> {
    pub fn new(catalog: &'a PluginCatalog) -> Self {
        Self { catalog }
    }

    /// Plugins to load, in load order. Without a plugin directory every
    /// catalog entry is loaded with empty configuration.
    pub fn load(&self, config: &PluginsConfig) -> Result<Vec<Arc<dyn Plugin>>, PluginError> {
        let selected: Vec<(String, Value, String)> = match &config.directory {
            Some(directory) => Self::scan(directory)?
                .into_iter()
                .map(|m| (m.spec.plugin, m.spec.config, m.metadata.name))
                .collect(),
            None => self
                .catalog
                .names()
                .map(|name| (name.to_string(), Value::Null, name.to_string()))
                .collect(),
        };

        let mut plugins = Vec::with_capacity(selected.len());
        for (name, plugin_config, manifest) in selected {
            if config.disabled.iter().any(|d| d == &name || d == &manifest) {
                info!("Plugin {} is disabled", name);
                continue;
            }
            plugins.push(self.catalog.instantiate(&name, &plugin_config, &manifest)?);
        }
        info!("Selected {} plugins", plugins.len());
        Ok(plugins)
    }

    /// Enabled manifests of a directory, sorted by `(order, file name)`.
    pub fn scan(directory: &Path) -> Result<Vec<PluginManifest>, PluginError> {
        let io_error = |source| PluginError::Io {
            path: directory.to_path_buf(),
            source,
        };
        let mut paths: Vec<PathBuf> = std::fs::read_dir(directory)
            .map_err(io_error)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        let mut manifests = Vec::new();
        for path in paths {
            let yaml = std::fs::read_to_string(&path).map_err(|source| PluginError::Io {
                path: path.clone(),
                source,
            })?;
            let manifest = PluginManifest::from_yaml_str(&yaml, &path)?;
            if !manifest.spec.enabled {
                debug!("Skipping disabled manifest {:?}", path);
                continue;
            }
            manifests.push(manifest);
        }
        manifests.sort_by_key(|m| m.spec.order);
        Ok(manifests)
    }
}
