//! The host-side metadata the engine reads: functions, types, servers and
//! user mappings, plus the hook for running queries against local data.

mod memory;

pub use memory::MemoryCatalog;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RouteError};
use crate::types::{TypeId, TypeInfo, Value};

/// Object id of a function in the host catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Visibility marker plus physical location of a catalog row. Any change
/// means the row was rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Stamp {
    pub xmin: u32,
    pub block: u32,
    pub offset: u16,
}

impl Stamp {
    pub fn new(xmin: u32, block: u32, offset: u16) -> Self {
        Self { xmin, block, offset }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgMode {
    #[default]
    In,
    InOut,
    Out,
    Variadic,
    Table,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgDef {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub type_id: TypeId,
    #[serde(default)]
    pub mode: ArgMode,
}

impl ArgDef {
    pub fn new(name: &str, type_id: TypeId) -> Self {
        Self {
            name: Some(name.to_string()),
            type_id,
            mode: ArgMode::In,
        }
    }

    /// Whether the argument is passed by the caller.
    pub fn is_input(&self) -> bool {
        !matches!(self.mode, ArgMode::Out | ArgMode::Table)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Volatility {
    Immutable,
    Stable,
    #[default]
    Volatile,
}

/// A function definition as stored in the host catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub id: FunctionId,
    #[serde(default = "default_schema")]
    pub schema: String,
    pub name: String,
    pub body: String,
    #[serde(default)]
    pub args: Vec<ArgDef>,
    #[serde(rename = "returns")]
    pub return_type: TypeId,
    #[serde(default)]
    pub returns_set: bool,
    #[serde(default)]
    pub volatility: Volatility,
    #[serde(default)]
    pub stamp: Stamp,
}

fn default_schema() -> String {
    "public".to_string()
}

impl FunctionDef {
    /// Schema-qualified name, quoted where needed, as sent to nodes.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.name))
    }

    /// A record return type without OUT argument columns; the call site must
    /// supply the column list.
    pub fn returns_untyped_record(&self) -> bool {
        self.return_type == TypeId::RECORD
            && !self
                .args
                .iter()
                .any(|a| matches!(a.mode, ArgMode::Out | ArgMode::InOut | ArgMode::Table))
    }
}

/// A foreign server entry describing one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDef {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub options: Vec<(String, String)>,
}

/// Column of a record type supplied by the call site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// Catalog type name, quoted like an identifier when sent.
    #[serde(rename = "type")]
    pub type_name: String,
}

impl ColumnDef {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
        }
    }
}

/// Read access to host metadata. Every lookup reflects the current catalog
/// state; the engine does its own caching on top.
pub trait Catalog {
    fn function(&self, id: FunctionId) -> Result<FunctionDef>;
    fn type_info(&self, id: TypeId) -> Result<TypeInfo>;
    /// Current stamp of a type row, checked before reusing a cached type.
    fn type_stamp(&self, id: TypeId) -> Result<Stamp> {
        self.type_info(id).map(|t| t.stamp)
    }
    fn server(&self, name: &str) -> Result<Option<ServerDef>>;
    /// Options of the current user's mapping for `server`, empty if unmapped.
    fn user_mapping(&self, server: &ServerDef) -> Result<Vec<(String, String)>>;
    fn current_user(&self) -> String;
}

/// A parameter bound into a locally executed query.
#[derive(Debug, Clone, Copy)]
pub struct BoundParam<'a> {
    pub type_id: TypeId,
    pub value: Option<&'a Value>,
}

/// Runs a single-value query against the host's own data. Used by the hash
/// policy. Implementations may call back into the engine.
pub trait LocalExecutor {
    fn query_scalar(&self, sql: &str, params: &[BoundParam<'_>]) -> Result<Option<Value>>;
}

/// Executor for hosts without local query support.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLocalQueries;

impl LocalExecutor for NoLocalQueries {
    fn query_scalar(&self, sql: &str, _params: &[BoundParam<'_>]) -> Result<Option<Value>> {
        Err(RouteError::Catalog(format!(
            "local query execution is not available: {sql}"
        )))
    }
}

const RESERVED: &[&str] = &[
    "all", "and", "any", "as", "case", "cast", "check", "column", "create", "default", "desc",
    "distinct", "do", "else", "end", "false", "for", "from", "grant", "group", "having", "in",
    "into", "limit", "not", "null", "on", "or", "order", "select", "table", "then", "to", "true",
    "union", "user", "using", "when", "where", "with",
];

/// Quotes an identifier unless it is a plain lower-case, non-reserved word.
pub fn quote_ident(ident: &str) -> String {
    let plain = ident
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_')
        && ident
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !RESERVED.contains(&ident);
    if plain {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }
}
