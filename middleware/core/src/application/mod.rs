// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0

pub mod authentication;
pub mod authorization;
pub mod context;
pub mod core_service;
pub mod dispatcher;
pub mod hooks;
pub mod job_manager;
pub mod middleware;
pub(crate) mod panics;
pub mod plugin_loader;
pub mod schema_registry;
pub mod service_registry;
pub mod shapes;

// Re-export the plugin-facing surface for convenience
pub use context::{arg, blocking, handler, CallContext, ServiceMethod, SessionState};
pub use dispatcher::{CallRequest, CallResponse};
pub use job_manager::{JobHandle, JobManager};
pub use middleware::{BuildError, Middleware, MiddlewareBuilder};
pub use plugin_loader::{Plugin, PluginCatalog, PluginError, Registrar};
pub use schema_registry::{SchemaId, SchemaRegistry};
pub use service_registry::{ServiceDefinition, ServiceRegistry};
pub use shapes::{ConfigBackend, CrudBackend, StoreConfigBackend, StoreCrudBackend};
