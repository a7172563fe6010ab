// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Service Registry
//!
//! Services are collected from plugins as [`ServiceDefinition`]s during load.
//! [`ServiceRegistry::register_service`] compiles every method's argument and
//! result schemas into the schema arena and stores the method as an
//! [`MethodEntry`] keyed by its full dotted name. After plugin load the
//! registry is frozen behind an `Arc` and only read.
//!
//! Config and CRUD services get their canonical methods generated from the
//! entry schema (see [`crate::application::shapes`]).

use indexmap::IndexMap;
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::application::context::ServiceMethod;
use crate::application::schema_registry::{SchemaError, SchemaId, SchemaRegistry};
use crate::application::shapes::{self, ConfigBackend, CrudBackend};
use crate::domain::schema::Schema;
use crate::domain::service::{ExecutionMode, MethodDescriptor, ServiceMeta, ServiceShape};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Service {0} is already registered")]
    DuplicateService(String),

    #[error("Method {0} is already registered")]
    DuplicateMethod(String),

    #[error("Service {service} has an invalid namespace")]
    InvalidNamespace { service: String },

    #[error("Schema error in {method}: {source}")]
    Schema {
        method: String,
        #[source]
        source: SchemaError,
    },
}

/// A service as contributed by a plugin, before registration.
pub struct ServiceDefinition {
    pub meta: ServiceMeta,
    /// Named schemas the service publishes for `Ref`s.
    pub schemas: Vec<Schema>,
    pub methods: Vec<(MethodDescriptor, Arc<dyn ServiceMethod>)>,
}

impl ServiceDefinition {
    pub fn plain(meta: ServiceMeta) -> Self {
        Self {
            meta: ServiceMeta {
                shape: ServiceShape::Plain,
                ..meta
            },
            schemas: Vec::new(),
            methods: Vec::new(),
        }
    }

    /// Singleton configuration service exposing `config` and `update`.
    pub fn config(meta: ServiceMeta, entry: Schema, backend: Arc<dyn ConfigBackend>) -> Self {
        let meta = ServiceMeta {
            shape: ServiceShape::Config,
            entry_schema: Some(entry.clone()),
            ..meta
        };
        let (schemas, methods) = shapes::config_methods(&meta, entry, backend);
        Self { meta, schemas, methods }
    }

    /// CRUD service exposing `query`, `get_instance`, `create`, `update` and
    /// `delete`. `create` is the schema of a new row; the update schema is
    /// derived as `Patch(Ref(create), [update])`.
    pub fn crud(meta: ServiceMeta, create: Schema, backend: Arc<dyn CrudBackend>) -> Self {
        let meta = ServiceMeta {
            shape: ServiceShape::Crud,
            entry_schema: Some(create.clone()),
            ..meta
        };
        let (schemas, methods) = shapes::crud_methods(&meta, create, backend);
        Self { meta, schemas, methods }
    }

    pub fn method(mut self, descriptor: MethodDescriptor, handler: Arc<dyn ServiceMethod>) -> Self {
        self.methods.push((descriptor, handler));
        self
    }

    pub fn schema(mut self, schema: Schema) -> Self {
        self.schemas.push(schema);
        self
    }
}

/// A registered, schema-compiled method.
pub struct MethodEntry {
    /// `<namespace>.<method>`
    pub name: String,
    pub namespace: String,
    pub descriptor: MethodDescriptor,
    pub handler: Arc<dyn ServiceMethod>,
    pub accepts: Vec<SchemaId>,
    pub returns: Option<SchemaId>,
    /// Service-level private flag folded in.
    pub private: bool,
    /// Method class, falling back to the service default.
    pub rate_limit: Option<String>,
}

impl MethodEntry {
    pub fn is_job(&self) -> bool {
        self.descriptor.mode == ExecutionMode::Job
    }

    pub fn is_streaming(&self) -> bool {
        self.descriptor.mode == ExecutionMode::Streaming
    }

    /// Introspection row for `core.get_methods`.
    pub fn describe(&self, schemas: &SchemaRegistry) -> Value {
        let descriptor = &self.descriptor;
        json!({
            "name": self.name,
            "service": self.namespace,
            "description": descriptor.description,
            "accepts": self.accepts.iter().map(|id| schemas.to_json(*id)).collect::<Vec<_>>(),
            "returns": self.returns.map(|id| schemas.to_json(id)),
            "roles": descriptor.roles,
            "job": self.is_job(),
            "streaming": self.is_streaming(),
            "public": descriptor.public,
            "private": self.private,
            "audit": descriptor.audit.is_some(),
            "pass_sender": descriptor.pass_sender,
            "rate_limit": self.rate_limit,
            "job_options": self.is_job().then(|| json!({
                "lock": descriptor.job.lock.is_some(),
                "queue_limit": descriptor.job.queue_limit,
                "abandon_on_disconnect": descriptor.job.abandon_on_disconnect,
                "durable": descriptor.job.durable,
                "transient": descriptor.job.transient,
                "abortable": descriptor.job.abortable,
                "logs": descriptor.job.logs,
            })),
        })
    }
}

pub struct ServiceEntry {
    pub meta: ServiceMeta,
    pub methods: Vec<String>,
}

#[derive(Default)]
pub struct ServiceRegistry {
    services: IndexMap<String, ServiceEntry>,
    methods: IndexMap<String, Arc<MethodEntry>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service and compile its schemas. Must run before
    /// [`SchemaRegistry::resolve`].
    pub fn register_service(&mut self, definition: ServiceDefinition, schemas: &mut SchemaRegistry) -> Result<(), RegistryError> {
        let ServiceDefinition {
            meta,
            schemas: named,
            methods,
        } = definition;
        let namespace = meta.namespace.clone();
        if namespace.is_empty() || namespace.split('.').any(str::is_empty) {
            return Err(RegistryError::InvalidNamespace { service: namespace });
        }
        if self.services.contains_key(&namespace) {
            return Err(RegistryError::DuplicateService(namespace));
        }

        for schema in named {
            let name = schema.name.clone();
            schemas
                .register(schema)
                .map_err(|source| RegistryError::Schema { method: name, source })?;
        }

        let mut method_names = Vec::with_capacity(methods.len());
        for (descriptor, handler) in methods {
            let full_name = meta.method_name(&descriptor.name);
            if self.methods.contains_key(&full_name) || method_names.contains(&full_name) {
                return Err(RegistryError::DuplicateMethod(full_name));
            }
            let schema_err = |source| RegistryError::Schema {
                method: full_name.clone(),
                source,
            };
            let accepts = descriptor
                .accepts
                .iter()
                .map(|schema| schemas.compile(schema))
                .collect::<Result<Vec<_>, _>>()
                .map_err(schema_err)?;
            let returns = descriptor
                .returns
                .as_ref()
                .map(|schema| schemas.compile(schema))
                .transpose()
                .map_err(schema_err)?;

            let entry = MethodEntry {
                name: full_name.clone(),
                namespace: namespace.clone(),
                private: meta.private || descriptor.private,
                rate_limit: descriptor.rate_limit.clone().or_else(|| meta.rate_limit.clone()),
                descriptor,
                handler,
                accepts,
                returns,
            };
            debug!("Registered method {}", full_name);
            method_names.push(full_name.clone());
            self.methods.insert(full_name, Arc::new(entry));
        }

        self.services.insert(
            namespace,
            ServiceEntry {
                meta,
                methods: method_names,
            },
        );
        Ok(())
    }

    pub fn get_method(&self, name: &str) -> Option<&Arc<MethodEntry>> {
        self.methods.get(name)
    }

    pub fn get_service(&self, namespace: &str) -> Option<&ServiceEntry> {
        self.services.get(namespace)
    }

    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodEntry>> {
        self.methods.values()
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceEntry> {
        self.services.values()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }

    /// `core.get_services` rows. Private services are listed only when
    /// `include_private` is set.
    pub fn describe_services(&self, include_private: bool) -> Value {
        let rows: Vec<Value> = self
            .services
            .values()
            .filter(|s| include_private || !s.meta.private)
            .map(|s| {
                json!({
                    "name": s.meta.namespace,
                    "config": {
                        "namespace": s.meta.namespace,
                        "shape": s.meta.shape,
                        "private": s.meta.private,
                        "rate_limit": s.meta.rate_limit,
                        "audit_category": s.meta.audit_category,
                        "methods": s.methods.len(),
                    },
                })
            })
            .collect();
        Value::Array(rows)
    }

    /// `core.get_methods` rows, optionally restricted to one service.
    pub fn describe_methods(&self, schemas: &SchemaRegistry, service: Option<&str>, include_private: bool) -> Value {
        let rows: Vec<Value> = self
            .methods
            .values()
            .filter(|m| include_private || !m.private)
            .filter(|m| service.map(|s| m.namespace == s).unwrap_or(true))
            .map(|m| m.describe(schemas))
            .collect();
        Value::Array(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::context::handler;
    use crate::application::shapes::StoreCrudBackend;
    use crate::domain::service::JobOptions;

    fn echo() -> Arc<dyn ServiceMethod> {
        handler(|_ctx, args| async move { Ok(Value::Array(args)) })
    }

    #[test]
    fn test_register_and_lookup() {
        let mut schemas = SchemaRegistry::new();
        let mut registry = ServiceRegistry::new();
        let definition = ServiceDefinition::plain(ServiceMeta::new("pool.snapshot"))
            .method(
                MethodDescriptor::new("clone")
                    .accepts(Schema::dict("snapshot_clone").required())
                    .job(JobOptions::default().lock("clone")),
                echo(),
            )
            .method(MethodDescriptor::new("hold").private(), echo());
        registry.register_service(definition, &mut schemas).unwrap();
        schemas.resolve().unwrap();

        let clone = registry.get_method("pool.snapshot.clone").unwrap();
        assert!(clone.is_job());
        assert_eq!(clone.accepts.len(), 1);
        assert!(registry.get_method("pool.snapshot.hold").unwrap().private);
        assert!(registry.get_method("pool.clone").is_none());

        let listed = registry.describe_methods(&schemas, Some("pool.snapshot"), false);
        assert_eq!(listed.as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_duplicate_service_and_method_rejected() {
        let mut schemas = SchemaRegistry::new();
        let mut registry = ServiceRegistry::new();
        registry
            .register_service(ServiceDefinition::plain(ServiceMeta::new("a")), &mut schemas)
            .unwrap();
        assert!(matches!(
            registry.register_service(ServiceDefinition::plain(ServiceMeta::new("a")), &mut schemas),
            Err(RegistryError::DuplicateService(_))
        ));

        let twice = ServiceDefinition::plain(ServiceMeta::new("b"))
            .method(MethodDescriptor::new("m"), echo())
            .method(MethodDescriptor::new("m"), echo());
        assert!(matches!(
            registry.register_service(twice, &mut schemas),
            Err(RegistryError::DuplicateMethod(name)) if name == "b.m"
        ));
    }

    #[test]
    fn test_crud_shape_generates_canonical_methods() {
        let mut schemas = SchemaRegistry::new();
        let mut registry = ServiceRegistry::new();
        let create = Schema::dict("user_create")
            .attr(Schema::string("username").required())
            .attr(Schema::string("full_name").required());
        registry
            .register_service(
                ServiceDefinition::crud(
                    ServiceMeta::new("user"),
                    create,
                    Arc::new(StoreCrudBackend::new("account.user")),
                ),
                &mut schemas,
            )
            .unwrap();
        schemas.resolve().unwrap();

        for method in ["query", "get_instance", "create", "update", "delete"] {
            assert!(registry.get_method(&format!("user.{}", method)).is_some(), "{}", method);
        }
        assert!(schemas.get("user_create").is_some());
        assert!(schemas.get("user_update").is_some());

        let update = registry.get_method("user.update").unwrap();
        let args = schemas
            .validate_args(&update.accepts, vec![json!(1), json!({})])
            .unwrap();
        assert_eq!(args, vec![json!(1), json!({})]);

        let create = registry.get_method("user.create").unwrap();
        assert!(schemas.validate_args(&create.accepts, vec![json!({})]).is_err());
    }

    #[test]
    fn test_invalid_namespace() {
        let mut schemas = SchemaRegistry::new();
        let mut registry = ServiceRegistry::new();
        assert!(matches!(
            registry.register_service(ServiceDefinition::plain(ServiceMeta::new("pool..x")), &mut schemas),
            Err(RegistryError::InvalidNamespace { .. })
        ));
    }
}
