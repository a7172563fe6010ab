// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Config and CRUD Service Shapes
//!
//! Generates the canonical methods of the two structured service shapes.
//! Plugins supply only the entry schema and a backend; filtering, ordering
//! and pagination of `query` run once here over whatever rows the backend
//! returns.
//!
//! | Shape | Methods | Schemas registered |
//! |-------|---------|--------------------|
//! | Config | `config()`, `update(data)` | `<ns>_entry`, `<ns>_update` |
//! | CRUD | `query(filters, options)`, `get_instance(id, options)`, `create(data)`, `update(id, data)`, `delete(id, options)` | `<ns>_create`, `<ns>_update` |
//!
//! `<ns>` is the namespace with dots replaced by underscores. Both update
//! schemas are `Patch(Ref(source), [update])`.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::application::context::{arg, handler, CallContext, ServiceMethod};
use crate::domain::error::CallError;
use crate::domain::filter::{filter_list, Filter, Operator, QueryOptions};
use crate::domain::schema::{PatchEdit, Schema};
use crate::domain::service::{MethodDescriptor, ServiceMeta};

const CONFIG_ROW_ID: i64 = 1;

type Methods = Vec<(MethodDescriptor, Arc<dyn ServiceMethod>)>;

/// Storage behind a config service.
#[async_trait]
pub trait ConfigBackend: Send + Sync {
    /// The stored singleton, or `None` before the first update.
    async fn load(&self, ctx: &CallContext) -> Result<Option<Value>, CallError>;

    /// Persist the complete, validated new config and return what was stored.
    async fn save(&self, ctx: &CallContext, config: Value) -> Result<Value, CallError>;
}

/// Storage behind a CRUD service.
#[async_trait]
pub trait CrudBackend: Send + Sync {
    /// Every row; `query` filters them.
    async fn rows(&self, ctx: &CallContext) -> Result<Vec<Value>, CallError>;

    /// `data` is validated against the create schema. Returns the new row.
    async fn create(&self, ctx: &CallContext, data: Value) -> Result<Value, CallError>;

    /// `data` is a validated partial update. Returns the updated row.
    async fn update(&self, ctx: &CallContext, id: i64, data: Value) -> Result<Value, CallError>;

    async fn delete(&self, ctx: &CallContext, id: i64, options: Value) -> Result<Value, CallError>;
}

/// Config singleton kept as row 1 of a config store table.
pub struct StoreConfigBackend {
    table: String,
}

impl StoreConfigBackend {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into() }
    }
}

#[async_trait]
impl ConfigBackend for StoreConfigBackend {
    async fn load(&self, ctx: &CallContext) -> Result<Option<Value>, CallError> {
        Ok(ctx.store().get(&self.table, CONFIG_ROW_ID).await?)
    }

    async fn save(&self, ctx: &CallContext, config: Value) -> Result<Value, CallError> {
        ctx.store().upsert(&self.table, CONFIG_ROW_ID, config).await?;
        self.load(ctx)
            .await?
            .ok_or_else(|| CallError::internal(format!("{} row vanished after update", self.table)))
    }
}

/// CRUD rows kept in a config store table.
pub struct StoreCrudBackend {
    table: String,
}

impl StoreCrudBackend {
    pub fn new(table: impl Into<String>) -> Self {
        Self { table: table.into() }
    }
}

#[async_trait]
impl CrudBackend for StoreCrudBackend {
    async fn rows(&self, ctx: &CallContext) -> Result<Vec<Value>, CallError> {
        Ok(ctx.store().list(&self.table).await?)
    }

    async fn create(&self, ctx: &CallContext, data: Value) -> Result<Value, CallError> {
        let store = ctx.store();
        let id = store.insert(&self.table, data).await?;
        store
            .get(&self.table, id)
            .await?
            .ok_or_else(|| CallError::internal(format!("{} row {} vanished after insert", self.table, id)))
    }

    async fn update(&self, ctx: &CallContext, id: i64, data: Value) -> Result<Value, CallError> {
        Ok(ctx.store().update(&self.table, id, data).await?)
    }

    async fn delete(&self, ctx: &CallContext, id: i64, _options: Value) -> Result<Value, CallError> {
        ctx.store().delete(&self.table, id).await?;
        Ok(Value::Bool(true))
    }
}

pub(crate) fn schema_prefix(namespace: &str) -> String {
    namespace.replace('.', "_")
}

fn audit_subject(meta: &ServiceMeta) -> String {
    meta.audit_category.clone().unwrap_or_else(|| meta.namespace.clone())
}

fn with_roles(descriptor: MethodDescriptor, roles: &[String]) -> MethodDescriptor {
    MethodDescriptor {
        roles: roles.to_vec(),
        ..descriptor
    }
}

fn expect_id(args: &[Value]) -> Result<i64, CallError> {
    arg(args, 0)
        .as_i64()
        .ok_or_else(|| CallError::validation("id", "Not an integer"))
}

fn id_describer(verb: &'static str, subject: String) -> impl Fn(&[Value]) -> Option<String> + Send + Sync + 'static {
    move |args: &[Value]| {
        args.first()
            .and_then(Value::as_i64)
            .map(|id| format!("{} {} {}", verb, subject, id))
    }
}

pub(crate) fn query_params() -> (Schema, Schema) {
    (
        Schema::list("query-filters", vec![Schema::any("filter")]).default_value(json!([])),
        Schema::dict("query-options")
            .additional_attrs(true)
            .default_value(json!({})),
    )
}

pub(crate) fn config_methods(meta: &ServiceMeta, entry: Schema, backend: Arc<dyn ConfigBackend>) -> (Vec<Schema>, Methods) {
    let prefix = schema_prefix(&meta.namespace);
    let entry_name = format!("{}_entry", prefix);
    let update_name = format!("{}_update", prefix);
    let entry = entry.named(entry_name.clone());
    let update = Schema::patch(update_name.clone(), Schema::reference(entry_name.clone()), vec![PatchEdit::update()]);

    let config = {
        let backend = Arc::clone(&backend);
        let entry_name = entry_name.clone();
        handler(move |ctx, _args| {
            let backend = Arc::clone(&backend);
            let entry_name = entry_name.clone();
            async move { current_config(&ctx, backend.as_ref(), &entry_name).await }
        })
    };

    let update_handler = {
        let entry_name = entry_name.clone();
        handler(move |ctx, args| {
            let backend = Arc::clone(&backend);
            let entry_name = entry_name.clone();
            async move {
                let mut merged = current_config(&ctx, backend.as_ref(), &entry_name).await?;
                if let (Some(target), Value::Object(changes)) = (merged.as_object_mut(), arg(&args, 0)) {
                    for (key, value) in changes {
                        target.insert(key, value);
                    }
                }
                if let Some(object) = merged.as_object_mut() {
                    object.remove("id");
                }
                let schemas = ctx.middleware.schemas();
                let entry_id = schemas
                    .get(&entry_name)
                    .ok_or_else(|| CallError::internal(format!("schema {} is not registered", entry_name)))?;
                let validated = schemas.validate(merged, entry_id)?;
                backend.save(&ctx, validated).await
            }
        })
    };

    let methods: Methods = vec![
        (
            with_roles(
                MethodDescriptor::new("config")
                    .returns(Schema::reference(entry_name.clone()))
                    .describe(format!("Current {} configuration", meta.namespace)),
                &meta.read_roles,
            ),
            config,
        ),
        (
            with_roles(
                MethodDescriptor::new("update")
                    .accepts(Schema::reference(update_name))
                    .returns(Schema::reference(entry_name))
                    .audit(format!("Update {} configuration", audit_subject(meta)))
                    .describe(format!("Update {} configuration", meta.namespace)),
                &meta.write_roles,
            ),
            update_handler,
        ),
    ];
    (vec![entry, update], methods)
}

/// Stored config, or the schema defaults before the first update.
async fn current_config(ctx: &CallContext, backend: &dyn ConfigBackend, entry_name: &str) -> Result<Value, CallError> {
    if let Some(row) = backend.load(ctx).await? {
        return Ok(row);
    }
    let schemas = ctx.middleware.schemas();
    let entry_id = schemas
        .get(entry_name)
        .ok_or_else(|| CallError::internal(format!("schema {} is not registered", entry_name)))?;
    // Defaults only; required attributes without defaults are simply absent.
    Ok(schemas
        .validate(Value::Object(Map::new()), entry_id)
        .unwrap_or_else(|_| Value::Object(Map::new())))
}

pub(crate) fn crud_methods(meta: &ServiceMeta, create: Schema, backend: Arc<dyn CrudBackend>) -> (Vec<Schema>, Methods) {
    let prefix = schema_prefix(&meta.namespace);
    let create_name = format!("{}_create", prefix);
    let update_name = format!("{}_update", prefix);
    let create = create.named(create_name.clone());
    let update = Schema::patch(update_name.clone(), Schema::reference(create_name.clone()), vec![PatchEdit::update()]);
    let subject = audit_subject(meta);

    let query = {
        let backend = Arc::clone(&backend);
        handler(move |ctx, args| {
            let backend = Arc::clone(&backend);
            async move {
                let filters = Filter::parse_list(&arg(&args, 0))?;
                let options = QueryOptions::from_value(&arg(&args, 1))?;
                let rows = backend.rows(&ctx).await?;
                filter_list(rows, &filters, &options)
            }
        })
    };

    let get_instance = {
        let backend = Arc::clone(&backend);
        let namespace = meta.namespace.clone();
        handler(move |ctx, args| {
            let backend = Arc::clone(&backend);
            let namespace = namespace.clone();
            async move {
                let id = expect_id(&args)?;
                let mut options = QueryOptions::from_value(&arg(&args, 1))?;
                options.get = true;
                let rows = backend.rows(&ctx).await?;
                let filters = [Filter::Compare {
                    field: "id".to_string(),
                    op: Operator::Eq,
                    value: json!(id),
                    regex: None,
                }];
                filter_list(rows, &filters, &options).map_err(|e| match e {
                    CallError::MatchNotFound(_) => CallError::MatchNotFound(format!("{} {} does not exist", namespace, id)),
                    other => other,
                })
            }
        })
    };

    let create_handler = {
        let backend = Arc::clone(&backend);
        handler(move |ctx, args| {
            let backend = Arc::clone(&backend);
            async move { backend.create(&ctx, arg(&args, 0)).await }
        })
    };

    let update_handler = {
        let backend = Arc::clone(&backend);
        handler(move |ctx, args| {
            let backend = Arc::clone(&backend);
            async move {
                let id = expect_id(&args)?;
                backend.update(&ctx, id, arg(&args, 1)).await
            }
        })
    };

    let delete_handler = handler(move |ctx, args| {
        let backend = Arc::clone(&backend);
        async move {
            let id = expect_id(&args)?;
            backend.delete(&ctx, id, arg(&args, 1)).await
        }
    });

    let (filters, options) = query_params();
    let id_param = || Schema::integer("id").required();

    let methods: Methods = vec![
        (
            with_roles(
                MethodDescriptor::new("query")
                    .accepts(filters)
                    .accepts(options)
                    .returns(Schema::any("query_result"))
                    .describe(format!("Query {} rows", meta.namespace)),
                &meta.read_roles,
            ),
            query,
        ),
        (
            with_roles(
                MethodDescriptor::new("get_instance")
                    .accepts(id_param())
                    .accepts(Schema::dict("options").additional_attrs(true).default_value(json!({})))
                    .returns(Schema::reference(create_name.clone()).named(format!("{}_entry", prefix)))
                    .describe(format!("Return the {} row with the given id", meta.namespace)),
                &meta.read_roles,
            ),
            get_instance,
        ),
        (
            with_roles(
                MethodDescriptor::new("create")
                    .accepts(Schema::reference(create_name.clone()).required())
                    .audit(format!("Create {}", subject))
                    .describe(format!("Create a {} row", meta.namespace)),
                &meta.write_roles,
            ),
            create_handler,
        ),
        (
            with_roles(
                MethodDescriptor::new("update")
                    .accepts(id_param())
                    .accepts(Schema::reference(update_name))
                    .audit_with(format!("Update {}", subject), id_describer("Update", subject.clone()))
                    .describe(format!("Update a {} row", meta.namespace)),
                &meta.write_roles,
            ),
            update_handler,
        ),
        (
            with_roles(
                MethodDescriptor::new("delete")
                    .accepts(id_param())
                    .accepts(Schema::any("options"))
                    .audit_with(format!("Delete {}", subject), id_describer("Delete", subject.clone()))
                    .describe(format!("Delete a {} row", meta.namespace)),
                &meta.write_roles,
            ),
            delete_handler,
        ),
    ];
    (vec![create, update], methods)
}
