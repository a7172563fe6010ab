// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Hooks, Configuration Generators and Service Control
//!
//! Plugins extend each other through named hook points instead of direct
//! calls. The core fires two of them itself:
//!
//! | Hook | Data |
//! |------|------|
//! | `core.on_connect` | `core.sessions` row of the new session |
//! | `core.on_disconnect` | `{ "id": <session uuid> }` |
//!
//! Two further extension points have their own registries and RPC surface:
//!
//! - **etc generators** render configuration files for a group
//!   (`etc.generate("smb")`). Files are written atomically under
//!   `plugins.etc_root` through a temporary file and a rename.
//! - **service controllers** start/stop/reload a system service
//!   (`service.control("RELOAD", "cifs")`). The core only delegates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::application::context::{arg, handler};
use crate::application::middleware::Middleware;
use crate::application::service_registry::ServiceDefinition;
use crate::domain::credential::FULL_ADMIN;
use crate::domain::error::CallError;
use crate::domain::schema::Schema;
use crate::domain::service::{MethodDescriptor, ServiceMeta};

pub const ON_CONNECT: &str = "core.on_connect";
pub const ON_DISCONNECT: &str = "core.on_disconnect";

#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, middleware: &Middleware, data: &Value) -> anyhow::Result<()>;
}

struct FnHook<F>(F);

#[async_trait]
impl<F> Hook for FnHook<F>
where
    F: Fn(&Middleware, &Value) -> anyhow::Result<()> + Send + Sync,
{
    async fn run(&self, middleware: &Middleware, data: &Value) -> anyhow::Result<()> {
        (self.0)(middleware, data)
    }
}

/// Synchronous hook from a closure.
pub fn hook_fn<F>(f: F) -> Arc<dyn Hook>
where
    F: Fn(&Middleware, &Value) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(FnHook(f))
}

/// One rendered file, relative to the etc root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcFile {
    pub path: PathBuf,
    pub contents: String,
    pub mode: Option<u32>,
}

impl EtcFile {
    pub fn new(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            contents: contents.into(),
            mode: None,
        }
    }

    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }
}

#[async_trait]
pub trait EtcGenerator: Send + Sync {
    async fn render(&self, middleware: &Middleware) -> anyhow::Result<Vec<EtcFile>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceVerb {
    Start,
    Stop,
    Restart,
    Reload,
    Status,
}

#[async_trait]
pub trait ServiceController: Send + Sync {
    /// `Ok(true)` when the service ends up in the requested state (or is
    /// running, for `STATUS`).
    async fn control(&self, verb: ServiceVerb, middleware: &Middleware) -> anyhow::Result<bool>;
}

struct RegisteredHook {
    order: i32,
    hook: Arc<dyn Hook>,
}

/// Filled while plugins register; read-only once the middleware is built.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Vec<RegisteredHook>>,
    generators: HashMap<String, Vec<Arc<dyn EtcGenerator>>>,
    controllers: HashMap<String, Arc<dyn ServiceController>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lower `order` runs first; equal orders keep registration order.
    pub fn register_hook(&mut self, name: impl Into<String>, hook: Arc<dyn Hook>, order: i32) {
        let hooks = self.hooks.entry(name.into()).or_default();
        hooks.push(RegisteredHook { order, hook });
        hooks.sort_by_key(|h| h.order);
    }

    pub fn register_generator(&mut self, group: impl Into<String>, generator: Arc<dyn EtcGenerator>) {
        self.generators.entry(group.into()).or_default().push(generator);
    }

    pub fn register_controller(&mut self, service: impl Into<String>, controller: Arc<dyn ServiceController>) {
        let service = service.into();
        if self.controllers.insert(service.clone(), controller).is_some() {
            warn!("Service controller for {} replaced", service);
        }
    }

    pub fn hook_count(&self, name: &str) -> usize {
        self.hooks.get(name).map(Vec::len).unwrap_or(0)
    }

    pub fn generator_groups(&self) -> Vec<&str> {
        let mut groups: Vec<&str> = self.generators.keys().map(String::as_str).collect();
        groups.sort_unstable();
        groups
    }

    /// Run every hook registered under `name` in order. Stops at the first
    /// failure. Returns how many hooks ran.
    pub async fn call_hook(&self, middleware: &Middleware, name: &str, data: &Value) -> Result<usize, CallError> {
        let Some(hooks) = self.hooks.get(name) else {
            return Ok(0);
        };
        for registered in hooks {
            registered
                .hook
                .run(middleware, data)
                .await
                .map_err(|e| CallError::internal(format!("Hook {} failed: {:#}", name, e)))?;
        }
        debug!("Ran {} {} hooks", hooks.len(), name);
        Ok(hooks.len())
    }

    /// Render a group and write its files under `root`.
    pub async fn generate(&self, middleware: &Middleware, group: &str, root: &Path) -> Result<Vec<PathBuf>, CallError> {
        let generators = self
            .generators
            .get(group)
            .ok_or_else(|| CallError::MatchNotFound(format!("No configuration generators for {}", group)))?;
        let mut written = Vec::new();
        for generator in generators {
            let files = generator
                .render(middleware)
                .await
                .map_err(|e| CallError::internal(format!("Rendering {} failed: {:#}", group, e)))?;
            for file in files {
                written.push(write_atomic(root, &file).await?);
            }
        }
        info!("Generated {} files for {}", written.len(), group);
        Ok(written)
    }

    pub async fn control(&self, middleware: &Middleware, verb: ServiceVerb, service: &str) -> Result<bool, CallError> {
        let controller = self
            .controllers
            .get(service)
            .ok_or_else(|| CallError::MatchNotFound(format!("Service {} is not managed", service)))?;
        controller
            .control(verb, middleware)
            .await
            .map_err(|e| CallError::new(libc::EIO, format!("{:?} {} failed: {:#}", verb, service, e)))
    }
}

/// Resolve `relative` under `root`, refusing absolute paths and `..`.
fn confined(root: &Path, relative: &Path) -> Result<PathBuf, CallError> {
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || relative.as_os_str().is_empty() {
        return Err(CallError::invalid(format!(
            "Generated path {} leaves the configuration root",
            relative.display()
        )));
    }
    Ok(root.join(relative))
}

async fn write_atomic(root: &Path, file: &EtcFile) -> Result<PathBuf, CallError> {
    let target = confined(root, &file.path)?;
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(CallError::internal)?;
    }
    let mut temp = target.clone().into_os_string();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    tokio::fs::write(&temp, file.contents.as_bytes())
        .await
        .map_err(CallError::internal)?;
    if let Some(mode) = file.mode {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(&temp, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(CallError::internal)?;
    }
    tokio::fs::rename(&temp, &target).await.map_err(CallError::internal)?;
    Ok(target)
}

/// `etc.generate` and `service.control`.
pub(crate) fn service_definitions() -> Vec<ServiceDefinition> {
    let etc = ServiceDefinition::plain(ServiceMeta::new("etc")).method(
        MethodDescriptor::new("generate")
            .accepts(Schema::string("group").required().non_empty())
            .returns(Schema::list("files", vec![Schema::string("path")]))
            .roles(&[FULL_ADMIN])
            .audit_with("Generate configuration", |args: &[Value]| {
                args.first()
                    .and_then(Value::as_str)
                    .map(|group| format!("Generate {} configuration", group))
            })
            .describe("Render and atomically write the configuration files of a group"),
        handler(|ctx, args| async move {
            let group = arg(&args, 0);
            let group = group.as_str().unwrap_or_default();
            let root = ctx.middleware.config().plugins.etc_root.clone();
            let files = ctx.middleware.hooks().generate(&ctx.middleware, group, &root).await?;
            Ok(json!(files))
        }),
    );

    let service = ServiceDefinition::plain(ServiceMeta::new("service")).method(
        MethodDescriptor::new("control")
            .accepts(Schema::enumeration(
                "verb",
                vec![json!("START"), json!("STOP"), json!("RESTART"), json!("RELOAD"), json!("STATUS")],
            )
            .required())
            .accepts(Schema::string("service").required().non_empty())
            .returns(Schema::boolean("success"))
            .roles(&[FULL_ADMIN])
            .audit_with("Control service", |args: &[Value]| {
                match (args.first().and_then(Value::as_str), args.get(1).and_then(Value::as_str)) {
                    (Some(verb), Some(service)) => Some(format!("{} {}", verb, service)),
                    _ => None,
                }
            })
            .describe("Start, stop, restart, reload or query a managed system service"),
        handler(|ctx, args| async move {
            let verb: ServiceVerb = serde_json::from_value(arg(&args, 0)).map_err(|e| CallError::invalid(e.to_string()))?;
            let name = arg(&args, 1);
            let name = name.as_str().unwrap_or_default();
            let ok = ctx.middleware.hooks().control(&ctx.middleware, verb, name).await?;
            Ok(Value::Bool(ok))
        }),
    );

    vec![etc, service]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confined_paths() {
        let root = Path::new("/tmp/etc");
        assert_eq!(confined(root, Path::new("samba/smb.conf")).unwrap(), root.join("samba/smb.conf"));
        assert!(confined(root, Path::new("../passwd")).is_err());
        assert!(confined(root, Path::new("/etc/passwd")).is_err());
        assert!(confined(root, Path::new("")).is_err());
    }

    #[tokio::test]
    async fn test_write_atomic_sets_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let file = EtcFile::new("ssh/sshd_config", "Port 22\n").mode(0o600);
        let path = write_atomic(dir.path(), &file).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Port 22\n");
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(!dir.path().join("ssh/sshd_config.tmp").exists());
    }

    #[test]
    fn test_hooks_sorted_by_order() {
        let mut registry = HookRegistry::new();
        registry.register_hook(ON_CONNECT, hook_fn(|_, _| Ok(())), 10);
        registry.register_hook(ON_CONNECT, hook_fn(|_, _| Ok(())), -5);
        let orders: Vec<i32> = registry.hooks[ON_CONNECT].iter().map(|h| h.order).collect();
        assert_eq!(orders, vec![-5, 10]);
        assert_eq!(registry.hook_count(ON_DISCONNECT), 0);
    }

    #[test]
    fn test_service_verb_wire_names() {
        assert_eq!(serde_json::to_value(ServiceVerb::Reload).unwrap(), json!("RELOAD"));
    }
}
