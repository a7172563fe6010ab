// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Schema Registry
//!
//! Owns every schema in the process. Declarations ([`Schema`]) are compiled
//! into an arena of nodes addressed by [`SchemaId`] handles; `Ref` nodes hold
//! a handle to their target, which is what lets schemas refer to each other
//! cyclically (a filter grammar that contains itself) without infinite
//! expansion.
//!
//! ## Lifecycle
//!
//! ```text
//! register(schema) / compile(schema)     ← plugin load, &mut self
//!   └─ resolve()                         ← once, fixed-point over Ref + Patch
//!         └─ validate(value, id)         ← hot path, &self, no locking
//!         └─ to_json(id) / redact(value, id)
//! ```
//!
//! ## Invariants
//!
//! - Registered names are unique (`DuplicateName`).
//! - After `resolve()` no `Ref` or `Patch` node is pending.
//! - A chain of `Ref` nodes that loops without passing through a Dict or List
//!   is rejected (`CyclicReference`); cycles behind a container are fine
//!   because validation only follows them as deep as the value goes.

use indexmap::IndexMap;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::net::IpAddr;
use thiserror::Error;

use crate::domain::error::ValidationErrors;
use crate::domain::schema::{ParamKind, PatchEdit, Schema, SchemaKind};

/// Placeholder written in place of secret values.
pub const REDACTED: &str = "********";

/// Handle into the schema arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaId(u32);

impl SchemaId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Schema {0} is already registered")]
    DuplicateName(String),

    #[error("Schema {name} references unknown schema {target}")]
    UnresolvedReference { name: String, target: String },

    #[error("Schema {0} is part of a reference cycle with no container boundary")]
    CyclicReference(String),

    #[error("Cannot patch schema {name}: {reason}")]
    InvalidPatch { name: String, reason: String },

    #[error("Invalid pattern for schema {name}: {reason}")]
    InvalidPattern { name: String, reason: String },

    #[error("Schema registry is already resolved")]
    AlreadyResolved,
}

#[derive(Debug, Clone)]
enum LinkTarget {
    Unresolved(String),
    Resolved(SchemaId),
}

#[derive(Debug, Clone)]
enum NodeKind {
    String {
        min_length: Option<usize>,
        max_length: Option<usize>,
        pattern: Option<Regex>,
        empty: bool,
    },
    Integer {
        min: Option<i64>,
        max: Option<i64>,
    },
    Float {
        min: Option<f64>,
        max: Option<f64>,
    },
    Boolean,
    Any,
    List {
        items: Vec<SchemaId>,
        min_items: Option<usize>,
        max_items: Option<usize>,
        unique: bool,
    },
    Dict {
        attrs: Vec<SchemaId>,
        additional_attrs: bool,
        update: bool,
    },
    Link(LinkTarget),
    Patch {
        source: SchemaId,
        edits: Vec<PatchEdit>,
    },
    Enum(Vec<Value>),
    Cron,
    IpAddr {
        cidr: bool,
        v4: bool,
        v6: bool,
    },
    UnixPerm,
    Path {
        absolute: bool,
    },
}

#[derive(Debug, Clone)]
struct Node {
    name: String,
    kind: NodeKind,
    required: bool,
    nullable: bool,
    default: Option<Value>,
    enum_values: Option<Vec<Value>>,
    secret: bool,
    description: Option<String>,
    param: ParamKind,
}

/// Presence-related facts about a parameter, used by argument normalization.
#[derive(Debug, Clone)]
pub struct ParamInfo {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<Value>,
}

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    nodes: Vec<Node>,
    named: IndexMap<String, SchemaId>,
    resolved: bool,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a named, globally addressable schema.
    pub fn register(&mut self, schema: Schema) -> Result<SchemaId, SchemaError> {
        if self.named.contains_key(&schema.name) {
            return Err(SchemaError::DuplicateName(schema.name));
        }
        let id = self.compile(&schema)?;
        self.named.insert(schema.name, id);
        Ok(id)
    }

    /// Compile an anonymous declaration (method parameters, results, event
    /// payloads). Its `Ref`s are resolved together with everything else.
    pub fn compile(&mut self, schema: &Schema) -> Result<SchemaId, SchemaError> {
        let kind = match &schema.kind {
            SchemaKind::String {
                min_length,
                max_length,
                pattern,
                empty,
            } => {
                let pattern = match pattern {
                    Some(src) => Some(Regex::new(src).map_err(|e| SchemaError::InvalidPattern {
                        name: schema.name.clone(),
                        reason: e.to_string(),
                    })?),
                    None => None,
                };
                NodeKind::String {
                    min_length: *min_length,
                    max_length: *max_length,
                    pattern,
                    empty: *empty,
                }
            }
            SchemaKind::Integer { min, max } => NodeKind::Integer {
                min: *min,
                max: *max,
            },
            SchemaKind::Float { min, max } => NodeKind::Float {
                min: *min,
                max: *max,
            },
            SchemaKind::Boolean => NodeKind::Boolean,
            SchemaKind::Any => NodeKind::Any,
            SchemaKind::List {
                items,
                min_items,
                max_items,
                unique,
            } => {
                let items = items
                    .iter()
                    .map(|item| self.compile(item))
                    .collect::<Result<Vec<_>, _>>()?;
                NodeKind::List {
                    items,
                    min_items: *min_items,
                    max_items: *max_items,
                    unique: *unique,
                }
            }
            SchemaKind::Dict {
                attrs,
                additional_attrs,
                update,
            } => {
                let attrs = attrs
                    .iter()
                    .map(|attr| self.compile(attr))
                    .collect::<Result<Vec<_>, _>>()?;
                NodeKind::Dict {
                    attrs,
                    additional_attrs: *additional_attrs,
                    update: *update,
                }
            }
            SchemaKind::Ref { target } => NodeKind::Link(LinkTarget::Unresolved(target.clone())),
            SchemaKind::Patch { source, edits } => {
                let source = self.compile(source)?;
                NodeKind::Patch {
                    source,
                    edits: edits.clone(),
                }
            }
            SchemaKind::Enum { values } => NodeKind::Enum(values.clone()),
            SchemaKind::Cron => NodeKind::Cron,
            SchemaKind::IpAddr { cidr, v4, v6 } => NodeKind::IpAddr {
                cidr: *cidr,
                v4: *v4,
                v6: *v6,
            },
            SchemaKind::UnixPerm => NodeKind::UnixPerm,
            SchemaKind::Path { absolute } => NodeKind::Path {
                absolute: *absolute,
            },
        };

        let id = SchemaId(self.nodes.len() as u32);
        self.nodes.push(Node {
            name: schema.name.clone(),
            kind,
            required: schema.required,
            nullable: schema.nullable,
            default: schema.default.clone(),
            enum_values: schema.enum_values.clone(),
            secret: schema.secret,
            description: schema.description.clone(),
            param: schema.param,
        });
        Ok(id)
    }

    pub fn get(&self, name: &str) -> Option<SchemaId> {
        self.named.get(name).copied()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.named.keys().map(String::as_str)
    }

    pub fn name_of(&self, id: SchemaId) -> &str {
        &self.nodes[id.index()].name
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved
    }

    /// Resolve every `Ref` to a handle and materialize every `Patch` into a
    /// concrete Dict. Runs to a fixed point because patches may be stacked
    /// on patches and `Add` edits may introduce new references.
    pub fn resolve(&mut self) -> Result<(), SchemaError> {
        loop {
            let mut progress = false;
            let mut pending = false;
            let mut index = 0;
            // `nodes` grows while patches compile their `Add` edits.
            while index < self.nodes.len() {
                let id = SchemaId(index as u32);
                match self.nodes[index].kind.clone() {
                    NodeKind::Link(LinkTarget::Unresolved(target)) => {
                        if let Some(target_id) = self.named.get(&target).copied() {
                            self.nodes[index].kind = NodeKind::Link(LinkTarget::Resolved(target_id));
                            progress = true;
                        } else {
                            pending = true;
                        }
                    }
                    NodeKind::Patch { source, edits } => match self.concrete(source) {
                        Some(source_id) => {
                            self.materialize_patch(id, source_id, &edits)?;
                            progress = true;
                        }
                        None => pending = true,
                    },
                    _ => {}
                }
                index += 1;
            }
            if !pending {
                break;
            }
            if !progress {
                return Err(self.first_unresolved_error());
            }
        }

        self.check_link_cycles()?;
        self.resolved = true;
        Ok(())
    }

    /// Follow resolved links to a concrete node. `None` while a link in the
    /// chain is unresolved, lands on a pending patch, or loops.
    fn concrete(&self, mut id: SchemaId) -> Option<SchemaId> {
        for _ in 0..=self.nodes.len() {
            match &self.nodes[id.index()].kind {
                NodeKind::Link(LinkTarget::Resolved(next)) => id = *next,
                NodeKind::Link(LinkTarget::Unresolved(_)) | NodeKind::Patch { .. } => return None,
                _ => return Some(id),
            }
        }
        None
    }

    fn materialize_patch(
        &mut self,
        id: SchemaId,
        source_id: SchemaId,
        edits: &[PatchEdit],
    ) -> Result<(), SchemaError> {
        let patch_name = self.nodes[id.index()].name.clone();
        let (mut attrs, mut additional_attrs, mut update) = match &self.nodes[source_id.index()].kind {
            NodeKind::Dict {
                attrs,
                additional_attrs,
                update,
            } => (attrs.clone(), *additional_attrs, *update),
            _ => {
                return Err(SchemaError::InvalidPatch {
                    name: patch_name,
                    reason: format!("source {} is not a dict", self.nodes[source_id.index()].name),
                })
            }
        };

        for edit in edits {
            match edit {
                PatchEdit::Add { attr } => {
                    let attr_id = self.compile(attr)?;
                    match attrs.iter().position(|a| self.nodes[a.index()].name == attr.name) {
                        Some(pos) => attrs[pos] = attr_id,
                        None => attrs.push(attr_id),
                    }
                }
                PatchEdit::Rm { name } => {
                    let before = attrs.len();
                    attrs.retain(|a| &self.nodes[a.index()].name != name);
                    if attrs.len() == before {
                        return Err(SchemaError::InvalidPatch {
                            name: patch_name,
                            reason: format!("attribute {} does not exist", name),
                        });
                    }
                }
                PatchEdit::Attr {
                    update: set_update,
                    additional_attrs: set_additional,
                    required,
                    nullable,
                } => {
                    if let Some(value) = set_update {
                        update = *value;
                    }
                    if let Some(value) = set_additional {
                        additional_attrs = *value;
                    }
                    let node = &mut self.nodes[id.index()];
                    if let Some(value) = required {
                        node.required = *value;
                    }
                    if let Some(value) = nullable {
                        node.nullable = *value;
                    }
                }
            }
        }

        self.nodes[id.index()].kind = NodeKind::Dict {
            attrs,
            additional_attrs,
            update,
        };
        Ok(())
    }

    fn first_unresolved_error(&self) -> SchemaError {
        for node in &self.nodes {
            match &node.kind {
                NodeKind::Link(LinkTarget::Unresolved(target)) => {
                    return SchemaError::UnresolvedReference {
                        name: node.name.clone(),
                        target: target.clone(),
                    }
                }
                NodeKind::Patch { .. } => {
                    return SchemaError::InvalidPatch {
                        name: node.name.clone(),
                        reason: "source never resolves to a dict".to_string(),
                    }
                }
                _ => {}
            }
        }
        SchemaError::AlreadyResolved
    }

    fn check_link_cycles(&self) -> Result<(), SchemaError> {
        for (index, node) in self.nodes.iter().enumerate() {
            if !matches!(node.kind, NodeKind::Link(_)) {
                continue;
            }
            let mut seen = HashSet::new();
            let mut current = SchemaId(index as u32);
            while let NodeKind::Link(LinkTarget::Resolved(next)) = &self.nodes[current.index()].kind {
                if !seen.insert(current) {
                    return Err(SchemaError::CyclicReference(node.name.clone()));
                }
                current = *next;
            }
        }
        Ok(())
    }

    /// Presence facts of a (parameter) schema.
    pub fn param_info(&self, id: SchemaId) -> ParamInfo {
        let node = &self.nodes[id.index()];
        ParamInfo {
            name: node.name.clone(),
            kind: node.param,
            required: node.required,
            default: node.default.clone(),
        }
    }

    /// Whether the schema (through links) is a Dict.
    pub fn is_dict(&self, id: SchemaId) -> bool {
        self.concrete(id)
            .map(|c| matches!(self.nodes[c.index()].kind, NodeKind::Dict { .. }))
            .unwrap_or(false)
    }

    /// Validate `value` against `id`, returning the coerced value or every
    /// violation found. Paths are rooted at the schema's name.
    pub fn validate(&self, value: Value, id: SchemaId) -> Result<Value, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        let path = self.nodes[id.index()].name.clone();
        let value = self.validate_node(id, value, &path, &mut errors);
        errors.check(value)
    }

    /// Validate a positional argument list against a method's parameters.
    /// Absent trailing parameters receive their default (Dict parameters
    /// receive an empty dict run through validation to populate defaults).
    pub fn validate_args(&self, params: &[SchemaId], args: Vec<Value>) -> Result<Vec<Value>, ValidationErrors> {
        let mut errors = ValidationErrors::new();
        if args.len() > params.len() {
            errors.add(
                "args",
                format!("Too many arguments (expected at most {}, got {})", params.len(), args.len()),
            );
            return Err(errors);
        }

        let mut args = args.into_iter();
        let mut out = Vec::with_capacity(params.len());
        for &param in params {
            let node = &self.nodes[param.index()];
            let path = node.name.clone();
            match args.next() {
                Some(value) => out.push(self.validate_node(param, value, &path, &mut errors)),
                None if node.required => {
                    errors.add(path, "attribute required");
                    out.push(Value::Null);
                }
                None => {
                    let value = match &node.default {
                        Some(default) => default.clone(),
                        None if self.is_dict(param) => {
                            self.validate_node(param, Value::Object(Map::new()), &path, &mut errors)
                        }
                        None => Value::Null,
                    };
                    out.push(value);
                }
            }
        }
        errors.check(out)
    }

    fn validate_node(&self, id: SchemaId, value: Value, path: &str, errors: &mut ValidationErrors) -> Value {
        let node = &self.nodes[id.index()];
        let Some(target_id) = self.concrete(id) else {
            errors.add(path, "schema is not resolved");
            return value;
        };
        let target = &self.nodes[target_id.index()];

        if value.is_null() {
            if node.nullable || target.nullable {
                return value;
            }
            errors.add(path, "null not allowed");
            return value;
        }

        let before = errors.len();
        let value = match &target.kind {
            NodeKind::String {
                min_length,
                max_length,
                pattern,
                empty,
            } => match value {
                Value::String(s) => {
                    let len = s.chars().count();
                    if !empty && s.is_empty() {
                        errors.add(path, "Empty value not allowed");
                    }
                    if let Some(min) = min_length {
                        if len < *min {
                            errors.add(path, format!("The value must be at least {} characters long", min));
                        }
                    }
                    if let Some(max) = max_length {
                        if len > *max {
                            errors.add(path, format!("The value may not be longer than {} characters", max));
                        }
                    }
                    if let Some(re) = pattern {
                        if !re.is_match(&s) {
                            errors.add(path, format!("Value does not match pattern {}", re.as_str()));
                        }
                    }
                    Value::String(s)
                }
                other => {
                    errors.add(path, "Not a string");
                    other
                }
            },
            NodeKind::Integer { min, max } => {
                let parsed = match &value {
                    Value::Number(n) => n.as_i64(),
                    Value::String(s) => s.trim().parse::<i64>().ok(),
                    _ => None,
                };
                match parsed {
                    Some(n) => {
                        if let Some(lo) = min {
                            if n < *lo {
                                errors.add(path, format!("Should be greater or equal than {}", lo));
                            }
                        }
                        if let Some(hi) = max {
                            if n > *hi {
                                errors.add(path, format!("Should be lower or equal than {}", hi));
                            }
                        }
                        json!(n)
                    }
                    None => {
                        errors.add(path, "Not an integer");
                        value
                    }
                }
            }
            NodeKind::Float { min, max } => match value.as_f64() {
                Some(n) if value.is_number() => {
                    if let Some(lo) = min {
                        if n < *lo {
                            errors.add(path, format!("Should be greater or equal than {}", lo));
                        }
                    }
                    if let Some(hi) = max {
                        if n > *hi {
                            errors.add(path, format!("Should be lower or equal than {}", hi));
                        }
                    }
                    value
                }
                _ => {
                    errors.add(path, "Not a floating point number");
                    value
                }
            },
            NodeKind::Boolean => {
                if !value.is_boolean() {
                    errors.add(path, "Not a boolean");
                }
                value
            }
            NodeKind::Any => value,
            NodeKind::List {
                items,
                min_items,
                max_items,
                unique,
            } => self.validate_list(items, *min_items, *max_items, *unique, value, path, errors),
            NodeKind::Dict {
                attrs,
                additional_attrs,
                update,
            } => self.validate_dict(attrs, *additional_attrs, *update, value, path, errors),
            NodeKind::Enum(values) => {
                if !values.contains(&value) {
                    errors.add(path, invalid_choice(&value, values));
                }
                value
            }
            NodeKind::Cron => {
                if let Err(reason) = validate_cron(&value) {
                    errors.add(path, reason);
                }
                value
            }
            NodeKind::IpAddr { cidr, v4, v6 } => {
                match value.as_str() {
                    Some(s) => {
                        if let Err(reason) = validate_ip(s, *cidr, *v4, *v6) {
                            errors.add(path, reason);
                        }
                    }
                    None => errors.add(path, "Not an IP address"),
                }
                value
            }
            NodeKind::UnixPerm => {
                let ok = value
                    .as_str()
                    .map(|s| (3..=4).contains(&s.len()) && s.chars().all(|c| ('0'..='7').contains(&c)))
                    .unwrap_or(false);
                if !ok {
                    errors.add(path, "Not a valid octal permission mode");
                }
                value
            }
            NodeKind::Path { absolute } => {
                match value.as_str() {
                    Some(s) if s.contains('\0') => errors.add(path, "Path contains a NUL byte"),
                    Some(s) if *absolute && !s.starts_with('/') => errors.add(path, "Must be an absolute path"),
                    Some(_) => {}
                    None => errors.add(path, "Not a string"),
                }
                value
            }
            NodeKind::Link(_) | NodeKind::Patch { .. } => {
                errors.add(path, "schema is not resolved");
                value
            }
        };

        if errors.len() == before {
            if let Some(choices) = node.enum_values.as_ref().or(target.enum_values.as_ref()) {
                if !choices.contains(&value) {
                    errors.add(path, invalid_choice(&value, choices));
                }
            }
        }
        value
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_list(
        &self,
        items: &[SchemaId],
        min_items: Option<usize>,
        max_items: Option<usize>,
        unique: bool,
        value: Value,
        path: &str,
        errors: &mut ValidationErrors,
    ) -> Value {
        let elements = match value {
            Value::Array(elements) => elements,
            other => {
                errors.add(path, "Not a list");
                return other;
            }
        };
        if let Some(min) = min_items {
            if elements.len() < min {
                errors.add(path, format!("List should have at least {} item(s)", min));
            }
        }
        if let Some(max) = max_items {
            if elements.len() > max {
                errors.add(path, format!("List should have at most {} item(s)", max));
            }
        }
        if unique {
            let mut seen: Vec<&Value> = Vec::new();
            for element in &elements {
                if seen.contains(&element) {
                    errors.add(path, "List items must be unique");
                    break;
                }
                seen.push(element);
            }
        }
        if items.is_empty() {
            return Value::Array(elements);
        }

        let mut out = Vec::with_capacity(elements.len());
        for (i, element) in elements.into_iter().enumerate() {
            let element_path = format!("{}.{}", path, i);
            if let [only] = items {
                out.push(self.validate_node(*only, element, &element_path, errors));
                continue;
            }
            let mut accepted = None;
            for item in items {
                let mut scratch = ValidationErrors::new();
                let candidate = self.validate_node(*item, element.clone(), &element_path, &mut scratch);
                if scratch.is_empty() {
                    accepted = Some(candidate);
                    break;
                }
            }
            match accepted {
                Some(candidate) => out.push(candidate),
                None => {
                    let names: Vec<&str> = items.iter().map(|i| self.name_of(*i)).collect();
                    errors.add(
                        element_path,
                        format!("Item#{} is not valid per list types: {}", i, names.join(", ")),
                    );
                    out.push(element);
                }
            }
        }
        Value::Array(out)
    }

    fn validate_dict(
        &self,
        attrs: &[SchemaId],
        additional_attrs: bool,
        update: bool,
        value: Value,
        path: &str,
        errors: &mut ValidationErrors,
    ) -> Value {
        let mut input = match value {
            Value::Object(input) => input,
            other => {
                errors.add(path, "Not a dictionary");
                return other;
            }
        };

        let mut out = Map::new();
        for &attr in attrs {
            let node = &self.nodes[attr.index()];
            let attr_path = format!("{}.{}", path, node.name);
            match input.remove(&node.name) {
                Some(child) => {
                    let child = self.validate_node(attr, child, &attr_path, errors);
                    out.insert(node.name.clone(), child);
                }
                None if update => {}
                None if node.required => errors.add(attr_path, "attribute required"),
                None => {
                    if let Some(default) = &node.default {
                        out.insert(node.name.clone(), default.clone());
                    } else if matches!(node.kind, NodeKind::Dict { .. }) && !node.nullable {
                        let child = self.validate_node(attr, Value::Object(Map::new()), &attr_path, errors);
                        out.insert(node.name.clone(), child);
                    }
                }
            }
        }

        for (key, child) in input {
            if additional_attrs {
                out.insert(key, child);
            } else {
                errors.add(format!("{}.{}", path, key), "Field was not expected");
            }
        }
        Value::Object(out)
    }

    /// Replace every value validated through a `secret` schema with
    /// [`REDACTED`]. Unknown shapes pass through unchanged.
    pub fn redact(&self, value: &Value, id: SchemaId) -> Value {
        let node = &self.nodes[id.index()];
        let Some(target_id) = self.concrete(id) else {
            return value.clone();
        };
        let target = &self.nodes[target_id.index()];
        if node.secret || target.secret {
            return if value.is_null() {
                Value::Null
            } else {
                Value::String(REDACTED.to_string())
            };
        }
        match (&target.kind, value) {
            (NodeKind::Dict { attrs, .. }, Value::Object(map)) => {
                let mut out = map.clone();
                for &attr in attrs {
                    let name = &self.nodes[attr.index()].name;
                    if let Some(child) = map.get(name) {
                        out.insert(name.clone(), self.redact(child, attr));
                    }
                }
                Value::Object(out)
            }
            (NodeKind::List { items, .. }, Value::Array(elements)) if !items.is_empty() => Value::Array(
                elements
                    .iter()
                    .map(|element| self.redact_item(items, element))
                    .collect(),
            ),
            _ => value.clone(),
        }
    }

    /// Redact through the first item schema the element validates against.
    /// An element no item accepts is redacted by any item that would change it.
    fn redact_item(&self, items: &[SchemaId], element: &Value) -> Value {
        if let [only] = items {
            return self.redact(element, *only);
        }
        let accepted = items.iter().find(|item| {
            let mut scratch = ValidationErrors::new();
            self.validate_node(**item, element.clone(), "", &mut scratch);
            scratch.is_empty()
        });
        if let Some(item) = accepted {
            return self.redact(element, *item);
        }
        items
            .iter()
            .map(|item| self.redact(element, *item))
            .find(|redacted| redacted != element)
            .unwrap_or_else(|| element.clone())
    }

    /// Redact a positional argument list against a method's parameters.
    pub fn redact_args(&self, params: &[SchemaId], args: &[Value]) -> Vec<Value> {
        args.iter()
            .enumerate()
            .map(|(i, arg)| match params.get(i) {
                Some(param) => self.redact(arg, *param),
                None => arg.clone(),
            })
            .collect()
    }

    /// Introspectable JSON rendering. Links render as `{"$ref": name}` so
    /// cyclic schemas stay finite.
    pub fn to_json(&self, id: SchemaId) -> Value {
        let node = &self.nodes[id.index()];
        let mut out = Map::new();
        out.insert("title".into(), json!(node.name));
        out.insert("_required_".into(), json!(node.required));
        if node.nullable {
            out.insert("nullable".into(), json!(true));
        }
        if let Some(default) = &node.default {
            out.insert("default".into(), default.clone());
        }
        if let Some(choices) = &node.enum_values {
            out.insert("enum".into(), json!(choices));
        }
        if node.secret {
            out.insert("secret".into(), json!(true));
        }
        if let Some(description) = &node.description {
            out.insert("description".into(), json!(description));
        }

        match &node.kind {
            NodeKind::String {
                min_length,
                max_length,
                pattern,
                ..
            } => {
                out.insert("type".into(), json!("string"));
                if let Some(v) = min_length {
                    out.insert("minLength".into(), json!(v));
                }
                if let Some(v) = max_length {
                    out.insert("maxLength".into(), json!(v));
                }
                if let Some(re) = pattern {
                    out.insert("pattern".into(), json!(re.as_str()));
                }
            }
            NodeKind::Integer { min, max } => {
                out.insert("type".into(), json!("integer"));
                if let Some(v) = min {
                    out.insert("minimum".into(), json!(v));
                }
                if let Some(v) = max {
                    out.insert("maximum".into(), json!(v));
                }
            }
            NodeKind::Float { min, max } => {
                out.insert("type".into(), json!("number"));
                if let Some(v) = min {
                    out.insert("minimum".into(), json!(v));
                }
                if let Some(v) = max {
                    out.insert("maximum".into(), json!(v));
                }
            }
            NodeKind::Boolean => {
                out.insert("type".into(), json!("boolean"));
            }
            NodeKind::Any => {
                out.insert("type".into(), json!(["string", "integer", "number", "boolean", "object", "array", "null"]));
            }
            NodeKind::List { items, .. } => {
                out.insert("type".into(), json!("array"));
                out.insert(
                    "items".into(),
                    Value::Array(items.iter().map(|i| self.to_json(*i)).collect()),
                );
            }
            NodeKind::Dict {
                attrs,
                additional_attrs,
                update,
            } => {
                out.insert("type".into(), json!("object"));
                let properties: Map<String, Value> = attrs
                    .iter()
                    .map(|a| (self.name_of(*a).to_string(), self.to_json(*a)))
                    .collect();
                out.insert("properties".into(), Value::Object(properties));
                out.insert("additionalProperties".into(), json!(additional_attrs));
                if *update {
                    out.insert("_update_".into(), json!(true));
                }
            }
            NodeKind::Link(LinkTarget::Resolved(target)) => {
                out.insert("$ref".into(), json!(self.name_of(*target)));
            }
            NodeKind::Link(LinkTarget::Unresolved(target)) => {
                out.insert("$ref".into(), json!(target));
            }
            NodeKind::Patch { source, .. } => {
                out.insert("_patch_of_".into(), json!(self.name_of(*source)));
            }
            NodeKind::Enum(values) => {
                out.insert("enum".into(), json!(values));
            }
            NodeKind::Cron => {
                out.insert("type".into(), json!("string"));
                out.insert("format".into(), json!("cron"));
            }
            NodeKind::IpAddr { cidr, .. } => {
                out.insert("type".into(), json!("string"));
                out.insert("format".into(), json!(if *cidr { "ip-cidr" } else { "ip" }));
            }
            NodeKind::UnixPerm => {
                out.insert("type".into(), json!("string"));
                out.insert("format".into(), json!("unix-perm"));
            }
            NodeKind::Path { absolute } => {
                out.insert("type".into(), json!("string"));
                out.insert("format".into(), json!(if *absolute { "absolute-path" } else { "path" }));
            }
        }
        Value::Object(out)
    }
}

fn invalid_choice(value: &Value, choices: &[Value]) -> String {
    let rendered: Vec<String> = choices.iter().map(|c| c.to_string()).collect();
    format!("Invalid choice: {}. Valid choices are: [{}]", value, rendered.join(", "))
}

fn validate_ip(s: &str, cidr: bool, v4: bool, v6: bool) -> Result<(), String> {
    let (addr, prefix) = match s.split_once('/') {
        Some((addr, prefix)) if cidr => (addr, Some(prefix)),
        Some(_) => return Err("Network prefix is not allowed".to_string()),
        None => (s, None),
    };
    let ip: IpAddr = addr.parse().map_err(|_| format!("Not a valid IP address: {}", s))?;
    let max_prefix = match ip {
        IpAddr::V4(_) if !v4 => return Err("IPv4 addresses are not allowed".to_string()),
        IpAddr::V6(_) if !v6 => return Err("IPv6 addresses are not allowed".to_string()),
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if let Some(prefix) = prefix {
        let bits: u8 = prefix.parse().map_err(|_| format!("Invalid network prefix: {}", prefix))?;
        if bits > max_prefix {
            return Err(format!("Network prefix {} exceeds {}", bits, max_prefix));
        }
    }
    Ok(())
}

const CRON_FIELDS: [(&str, u32, u32); 5] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("dom", 1, 31),
    ("month", 1, 12),
    ("dow", 0, 7),
];

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAYS: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Accepts either a five-field crontab string or a dict with the keys
/// `minute`, `hour`, `dom`, `month`, `dow`.
fn validate_cron(value: &Value) -> Result<(), String> {
    let fields: Vec<String> = match value {
        Value::String(s) => {
            let parts: Vec<String> = s.split_whitespace().map(str::to_string).collect();
            if parts.len() != 5 {
                return Err("Cron expression must have 5 fields".to_string());
            }
            parts
        }
        Value::Object(map) => CRON_FIELDS
            .iter()
            .map(|(key, _, _)| {
                map.get(*key)
                    .and_then(Value::as_str)
                    .unwrap_or("*")
                    .to_string()
            })
            .collect(),
        _ => return Err("Not a cron expression".to_string()),
    };

    for (field, (name, lo, hi)) in fields.iter().zip(CRON_FIELDS.iter()) {
        for item in field.split(',') {
            validate_cron_item(item, *name, *lo, *hi)
                .map_err(|reason| format!("Invalid {} field {:?}: {}", name, field, reason))?;
        }
    }
    Ok(())
}

fn validate_cron_item(item: &str, name: &str, lo: u32, hi: u32) -> Result<(), String> {
    let (range, step) = match item.split_once('/') {
        Some((range, step)) => (range, Some(step)),
        None => (item, None),
    };
    if let Some(step) = step {
        let step: u32 = step.parse().map_err(|_| "step is not a number".to_string())?;
        if step == 0 {
            return Err("step must be positive".to_string());
        }
    }
    if range == "*" {
        return Ok(());
    }
    let parse = |token: &str| -> Result<u32, String> {
        let lower = token.to_ascii_lowercase();
        if name == "month" {
            if let Some(pos) = MONTHS.iter().position(|m| *m == lower) {
                return Ok(pos as u32 + 1);
            }
        }
        if name == "dow" {
            if let Some(pos) = WEEKDAYS.iter().position(|d| *d == lower) {
                return Ok(pos as u32);
            }
        }
        let n: u32 = token.parse().map_err(|_| format!("{} is not a number", token))?;
        if n < lo || n > hi {
            return Err(format!("{} is outside {}-{}", n, lo, hi));
        }
        Ok(n)
    };
    match range.split_once('-') {
        Some((a, b)) => {
            if parse(a)? > parse(b)? {
                return Err("range start exceeds range end".to_string());
            }
        }
        None => {
            parse(range)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_create() -> Schema {
        Schema::dict("user_create")
            .attr(Schema::string("username").required())
            .attr(Schema::string("full_name").required())
            .attr(Schema::string("password").secret())
            .attr(Schema::string("shell").default_value(json!("/usr/bin/zsh")))
            .attr(Schema::integer("uid").min(1000).max(60000))
    }

    fn resolved_with(schemas: Vec<Schema>) -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        for schema in schemas {
            registry.register(schema).unwrap();
        }
        registry.resolve().unwrap();
        registry
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = SchemaRegistry::new();
        registry.register(user_create()).unwrap();
        let err = registry.register(user_create()).unwrap_err();
        assert_eq!(err, SchemaError::DuplicateName("user_create".into()));
    }

    #[test]
    fn test_required_attributes_reported_with_dotted_paths() {
        let registry = resolved_with(vec![user_create()]);
        let id = registry.get("user_create").unwrap();
        let errors = registry.validate(json!({}), id).unwrap_err();
        let paths: Vec<_> = errors.iter().map(|e| (e.path.as_str(), e.reason.as_str())).collect();
        assert_eq!(
            paths,
            vec![
                ("user_create.username", "attribute required"),
                ("user_create.full_name", "attribute required"),
            ]
        );
    }

    #[test]
    fn test_defaults_and_integer_coercion() {
        let registry = resolved_with(vec![user_create()]);
        let id = registry.get("user_create").unwrap();
        let value = registry
            .validate(json!({"username": "bob", "full_name": "Bob", "uid": "1001"}), id)
            .unwrap();
        assert_eq!(value["shell"], "/usr/bin/zsh");
        assert_eq!(value["uid"], 1001);
    }

    #[test]
    fn test_forbidden_coercions() {
        let registry = resolved_with(vec![Schema::dict("d")
            .attr(Schema::integer("n"))
            .attr(Schema::string("s"))]);
        let id = registry.get("d").unwrap();
        let errors = registry.validate(json!({"n": true, "s": 3, "extra": 1}), id).unwrap_err();
        let reasons: Vec<_> = errors.iter().map(|e| e.reason.as_str()).collect();
        assert!(reasons.contains(&"Not an integer"));
        assert!(reasons.contains(&"Not a string"));
        assert!(reasons.contains(&"Field was not expected"));
    }

    #[test]
    fn test_null_is_distinct_from_absent() {
        let registry = resolved_with(vec![Schema::dict("d")
            .attr(Schema::string("a").default_value(json!("x")))
            .attr(Schema::string("b").nullable())]);
        let id = registry.get("d").unwrap();
        let errors = registry.validate(json!({"a": null}), id).unwrap_err();
        assert_eq!(errors.iter().next().unwrap().path, "d.a");

        let value = registry.validate(json!({"b": null}), id).unwrap();
        assert_eq!(value, json!({"a": "x", "b": null}));
    }

    #[test]
    fn test_update_mode_patch_skips_required_and_defaults() {
        let registry = resolved_with(vec![
            user_create(),
            Schema::patch("user_update", Schema::reference("user_create"), vec![PatchEdit::update()]),
        ]);
        let update = registry.get("user_update").unwrap();
        assert_eq!(registry.validate(json!({}), update).unwrap(), json!({}));

        let create = registry.get("user_create").unwrap();
        assert!(registry.validate(json!({}), create).is_err());
    }

    #[test]
    fn test_empty_patch_of_ref_behaves_like_source() {
        let registry = resolved_with(vec![
            user_create(),
            Schema::patch("user_copy", Schema::reference("user_create"), vec![]),
        ]);
        let source = registry.get("user_create").unwrap();
        let copy = registry.get("user_copy").unwrap();
        for value in [json!({}), json!({"username": "a", "full_name": "A", "uid": "2000"}), json!(5)] {
            let a = registry.validate(value.clone(), source).map_err(|e| e.len());
            let b = registry.validate(value, copy).map_err(|e| e.len());
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_patch_add_and_rm() {
        let registry = resolved_with(vec![
            user_create(),
            Schema::patch(
                "user_entry",
                Schema::reference("user_create"),
                vec![
                    PatchEdit::Rm { name: "password".into() },
                    PatchEdit::Add {
                        attr: Schema::integer("id").required(),
                    },
                ],
            ),
        ]);
        let id = registry.get("user_entry").unwrap();
        let errors = registry
            .validate(json!({"username": "a", "full_name": "A", "password": "x"}), id)
            .unwrap_err();
        let paths: Vec<_> = errors.iter().map(|e| e.path.clone()).collect();
        assert!(paths.contains(&"user_entry.id".to_string()));
        assert!(paths.contains(&"user_entry.password".to_string()));
    }

    #[test]
    fn test_unresolved_reference_is_fatal() {
        let mut registry = SchemaRegistry::new();
        registry
            .register(Schema::dict("a").attr(Schema::reference("missing")))
            .unwrap();
        let err = registry.resolve().unwrap_err();
        assert!(matches!(err, SchemaError::UnresolvedReference { .. }));
    }

    #[test]
    fn test_cycle_behind_container_is_allowed() {
        let registry = resolved_with(vec![Schema::dict("node")
            .attr(Schema::string("name").required())
            .attr(Schema::list("children", vec![Schema::reference("node")]))]);
        let id = registry.get("node").unwrap();
        let value = json!({"name": "root", "children": [{"name": "leaf", "children": []}]});
        assert!(registry.validate(value, id).is_ok());
        let bad = json!({"name": "root", "children": [{"children": []}]});
        let errors = registry.validate(bad, id).unwrap_err();
        assert_eq!(errors.iter().next().unwrap().path, "node.children.0.name");
    }

    #[test]
    fn test_top_level_ref_cycle_rejected() {
        let mut registry = SchemaRegistry::new();
        registry.register(Schema::reference("b").named("a")).unwrap();
        registry.register(Schema::reference("a").named("b")).unwrap();
        assert!(matches!(registry.resolve(), Err(SchemaError::CyclicReference(_))));
    }

    #[test]
    fn test_enum_error_lists_choices() {
        let registry = resolved_with(vec![
            Schema::string("level").one_of(vec![json!("LOW"), json!("HIGH")])
        ]);
        let id = registry.get("level").unwrap();
        let errors = registry.validate(json!("MID"), id).unwrap_err();
        let reason = &errors.iter().next().unwrap().reason;
        assert!(reason.contains("\"LOW\"") && reason.contains("\"HIGH\""));
    }

    #[test]
    fn test_validation_is_idempotent() {
        let registry = resolved_with(vec![user_create()]);
        let id = registry.get("user_create").unwrap();
        let once = registry
            .validate(json!({"username": "a", "full_name": "A", "uid": "1500"}), id)
            .unwrap();
        let twice = registry.validate(once.clone(), id).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_redaction_replaces_secret_fields() {
        let registry = resolved_with(vec![user_create()]);
        let id = registry.get("user_create").unwrap();
        let redacted = registry.redact(&json!({"username": "a", "password": "hunter2"}), id);
        assert_eq!(redacted["password"], REDACTED);
        assert_eq!(redacted["username"], "a");
    }

    #[test]
    fn test_redaction_inside_multi_item_lists() {
        let registry = resolved_with(vec![Schema::dict("credentials").attr(Schema::list(
            "entries",
            vec![
                Schema::integer("uid"),
                Schema::dict("login")
                    .attr(Schema::string("username").required())
                    .attr(Schema::string("password").secret()),
            ],
        ))]);
        let id = registry.get("credentials").unwrap();
        let redacted = registry.redact(
            &json!({"entries": [1000, {"username": "alice", "password": "hunter2"}]}),
            id,
        );
        assert_eq!(redacted["entries"][0], 1000);
        assert_eq!(redacted["entries"][1]["username"], "alice");
        assert_eq!(redacted["entries"][1]["password"], REDACTED);
    }

    #[test]
    fn test_special_string_kinds() {
        let registry = resolved_with(vec![Schema::dict("task")
            .attr(Schema::cron("schedule"))
            .attr(Schema::ip_addr("network").cidr())
            .attr(Schema::unix_perm("mode"))
            .attr(Schema::path("target").absolute())]);
        let id = registry.get("task").unwrap();
        let ok = json!({"schedule": "*/5 0-6 * jan mon", "network": "10.0.0.0/8", "mode": "0755", "target": "/mnt/tank"});
        assert!(registry.validate(ok, id).is_ok());

        let bad = json!({"schedule": "61 * * * *", "network": "10.0.0.0/33", "mode": "999", "target": "relative"});
        assert_eq!(registry.validate(bad, id).unwrap_err().len(), 4);
    }

    #[test]
    fn test_args_with_only_defaulted_params_accept_empty_list() {
        let mut registry = SchemaRegistry::new();
        let params = vec![
            registry.compile(&Schema::integer("count").default_value(json!(10))).unwrap(),
            registry
                .compile(&Schema::dict("options").attr(Schema::boolean("force").default_value(json!(false))))
                .unwrap(),
        ];
        registry.resolve().unwrap();
        let args = registry.validate_args(&params, vec![]).unwrap();
        assert_eq!(args, vec![json!(10), json!({"force": false})]);
    }

    #[test]
    fn test_to_json_renders_refs_by_name() {
        let registry = resolved_with(vec![Schema::dict("node")
            .attr(Schema::list("children", vec![Schema::reference("node")]))]);
        let rendered = registry.to_json(registry.get("node").unwrap());
        assert_eq!(rendered["type"], "object");
        assert_eq!(rendered["properties"]["children"]["items"][0]["$ref"], "node");
    }
}
