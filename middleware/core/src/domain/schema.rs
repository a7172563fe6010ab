// Copyright (c) 2026 Middleware Developers
// SPDX-License-Identifier: AGPL-3.0
//! # Schema Declarations
//!
//! Declarative, serializable description of a value's shape. Plugins build
//! these with the constructor helpers (`Schema::dict("user_create")...`) or
//! ship them as YAML in a plugin manifest; the
//! [`crate::application::schema_registry::SchemaRegistry`] compiles them into
//! an arena, resolves `Ref`/`Patch`, and validates values against the result.
//!
//! ## Variants
//!
//! ```text
//! String  Integer  Float  Boolean  Any
//! List { items, min_items, max_items }
//! Dict { attrs, additional_attrs, update }
//! Ref { target }                      ← by-name pointer, resolved after load
//! Patch { source, edits }             ← add / rm / attr edits over a Dict
//! Enum { values }  Cron  IpAddr { cidr }  UnixPerm  Path { absolute }
//! ```
//!
//! Every declaration carries `name`, `required`, `nullable`, `default`, an
//! optional enum set and the `secret` redaction flag.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a positional parameter may be supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    PositionalOnly,
    KeywordOnly,
    #[default]
    Either,
}

/// Declaration of a single schema node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    #[serde(flatten)]
    pub kind: SchemaKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, rename = "enum", skip_serializing_if = "Option::is_none")]
    pub enum_values: Option<Vec<Value>>,
    #[serde(default)]
    pub secret: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub param: ParamKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchemaKind {
    String {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_length: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_length: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
        #[serde(default = "default_true")]
        empty: bool,
    },
    Integer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<i64>,
    },
    Float {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max: Option<f64>,
    },
    Boolean,
    Any,
    List {
        #[serde(default)]
        items: Vec<Schema>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        min_items: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_items: Option<usize>,
        #[serde(default)]
        unique: bool,
    },
    Dict {
        #[serde(default)]
        attrs: Vec<Schema>,
        #[serde(default)]
        additional_attrs: bool,
        #[serde(default)]
        update: bool,
    },
    Ref {
        target: String,
    },
    Patch {
        source: Box<Schema>,
        #[serde(default)]
        edits: Vec<PatchEdit>,
    },
    Enum {
        values: Vec<Value>,
    },
    Cron,
    IpAddr {
        #[serde(default)]
        cidr: bool,
        #[serde(default = "default_true")]
        v4: bool,
        #[serde(default = "default_true")]
        v6: bool,
    },
    UnixPerm,
    Path {
        #[serde(default)]
        absolute: bool,
    },
}

impl SchemaKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String { .. } => "string",
            Self::Integer { .. } => "integer",
            Self::Float { .. } => "float",
            Self::Boolean => "boolean",
            Self::Any => "any",
            Self::List { .. } => "list",
            Self::Dict { .. } => "dict",
            Self::Ref { .. } => "ref",
            Self::Patch { .. } => "patch",
            Self::Enum { .. } => "enum",
            Self::Cron => "cron",
            Self::IpAddr { .. } => "ip_addr",
            Self::UnixPerm => "unix_perm",
            Self::Path { .. } => "path",
        }
    }
}

/// One edit applied by a `Patch` to its (Dict) source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchEdit {
    /// Add (or replace) an attribute.
    Add { attr: Schema },
    /// Remove an attribute by name.
    Rm { name: String },
    /// Change flags of the patched Dict itself.
    Attr {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        update: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        additional_attrs: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        required: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        nullable: Option<bool>,
    },
}

impl PatchEdit {
    /// The `Patch(X, update)` edit: turns a create schema into its partial
    /// update counterpart.
    pub fn update() -> Self {
        Self::Attr {
            update: Some(true),
            additional_attrs: None,
            required: None,
            nullable: None,
        }
    }
}

fn default_true() -> bool {
    true
}

impl Schema {
    fn with_kind(name: impl Into<String>, kind: SchemaKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            nullable: false,
            default: None,
            enum_values: None,
            secret: false,
            description: None,
            param: ParamKind::Either,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            SchemaKind::String {
                min_length: None,
                max_length: None,
                pattern: None,
                empty: true,
            },
        )
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::with_kind(name, SchemaKind::Integer { min: None, max: None })
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::with_kind(name, SchemaKind::Float { min: None, max: None })
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::with_kind(name, SchemaKind::Boolean)
    }

    pub fn any(name: impl Into<String>) -> Self {
        Self::with_kind(name, SchemaKind::Any)
    }

    pub fn list(name: impl Into<String>, items: Vec<Schema>) -> Self {
        Self::with_kind(
            name,
            SchemaKind::List {
                items,
                min_items: None,
                max_items: None,
                unique: false,
            },
        )
    }

    pub fn dict(name: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            SchemaKind::Dict {
                attrs: Vec::new(),
                additional_attrs: false,
                update: false,
            },
        )
    }

    /// Reference to a registered schema; the attribute keeps the target's
    /// name unless renamed with [`Schema::named`].
    pub fn reference(target: impl Into<String>) -> Self {
        let target = target.into();
        Self::with_kind(target.clone(), SchemaKind::Ref { target })
    }

    pub fn patch(name: impl Into<String>, source: Schema, edits: Vec<PatchEdit>) -> Self {
        Self::with_kind(
            name,
            SchemaKind::Patch {
                source: Box::new(source),
                edits,
            },
        )
    }

    pub fn enumeration(name: impl Into<String>, values: Vec<Value>) -> Self {
        Self::with_kind(name, SchemaKind::Enum { values })
    }

    pub fn cron(name: impl Into<String>) -> Self {
        Self::with_kind(name, SchemaKind::Cron)
    }

    pub fn ip_addr(name: impl Into<String>) -> Self {
        Self::with_kind(
            name,
            SchemaKind::IpAddr {
                cidr: false,
                v4: true,
                v6: true,
            },
        )
    }

    pub fn unix_perm(name: impl Into<String>) -> Self {
        Self::with_kind(name, SchemaKind::UnixPerm)
    }

    pub fn path(name: impl Into<String>) -> Self {
        Self::with_kind(name, SchemaKind::Path { absolute: false })
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn one_of(mut self, values: Vec<Value>) -> Self {
        self.enum_values = Some(values);
        self
    }

    pub fn secret(mut self) -> Self {
        self.secret = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn param_kind(mut self, kind: ParamKind) -> Self {
        self.param = kind;
        self
    }

    /// Append an attribute to a Dict; no-op for other kinds.
    pub fn attr(mut self, attr: Schema) -> Self {
        if let SchemaKind::Dict { attrs, .. } = &mut self.kind {
            attrs.push(attr);
        }
        self
    }

    pub fn additional_attrs(mut self, open: bool) -> Self {
        if let SchemaKind::Dict {
            additional_attrs, ..
        } = &mut self.kind
        {
            *additional_attrs = open;
        }
        self
    }

    pub fn update_mode(mut self) -> Self {
        if let SchemaKind::Dict { update, .. } = &mut self.kind {
            *update = true;
        }
        self
    }

    pub fn min(mut self, value: i64) -> Self {
        match &mut self.kind {
            SchemaKind::Integer { min, .. } => *min = Some(value),
            SchemaKind::Float { min, .. } => *min = Some(value as f64),
            _ => {}
        }
        self
    }

    pub fn max(mut self, value: i64) -> Self {
        match &mut self.kind {
            SchemaKind::Integer { max, .. } => *max = Some(value),
            SchemaKind::Float { max, .. } => *max = Some(value as f64),
            _ => {}
        }
        self
    }

    pub fn length(mut self, lo: Option<usize>, hi: Option<usize>) -> Self {
        if let SchemaKind::String {
            min_length,
            max_length,
            ..
        } = &mut self.kind
        {
            *min_length = lo;
            *max_length = hi;
        }
        self
    }

    pub fn non_empty(mut self) -> Self {
        if let SchemaKind::String { empty, .. } = &mut self.kind {
            *empty = false;
        }
        self
    }

    pub fn pattern(mut self, regex: impl Into<String>) -> Self {
        if let SchemaKind::String { pattern, .. } = &mut self.kind {
            *pattern = Some(regex.into());
        }
        self
    }

    pub fn items_bounds(mut self, lo: Option<usize>, hi: Option<usize>) -> Self {
        if let SchemaKind::List {
            min_items,
            max_items,
            ..
        } = &mut self.kind
        {
            *min_items = lo;
            *max_items = hi;
        }
        self
    }

    pub fn cidr(mut self) -> Self {
        if let SchemaKind::IpAddr { cidr, .. } = &mut self.kind {
            *cidr = true;
        }
        self
    }

    pub fn absolute(mut self) -> Self {
        if let SchemaKind::Path { absolute } = &mut self.kind {
            *absolute = true;
        }
        self
    }
}
