use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{Catalog, FunctionDef, FunctionId, ServerDef, Stamp};
use crate::error::{Result, RouteError};
use crate::types::{builtin, TypeId, TypeInfo};

/// A catalog held in memory, loadable from JSON.
///
/// Knows the builtin types only. Functions and type stamps can be replaced
/// through a shared reference so that a running engine observes the change.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct MemoryCatalog {
    #[serde(default = "default_user")]
    current_user: RefCell<String>,
    #[serde(default)]
    functions: RefCell<Vec<FunctionDef>>,
    #[serde(default)]
    servers: RefCell<Vec<ServerDef>>,
    /// User mapping options keyed by server name.
    #[serde(default)]
    user_mappings: RefCell<BTreeMap<String, Vec<(String, String)>>>,
    #[serde(default)]
    type_stamps: RefCell<BTreeMap<TypeId, Stamp>>,
}

fn default_user() -> RefCell<String> {
    RefCell::new("postgres".to_string())
}

impl MemoryCatalog {
    pub fn new(current_user: &str) -> Self {
        Self {
            current_user: RefCell::new(current_user.to_string()),
            ..Self::default()
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Adds a function or replaces the one with the same id.
    pub fn put_function(&self, def: FunctionDef) {
        let mut functions = self.functions.borrow_mut();
        match functions.iter_mut().find(|f| f.id == def.id) {
            Some(slot) => *slot = def,
            None => functions.push(def),
        }
    }

    pub fn put_server(&self, server: ServerDef) {
        let mut servers = self.servers.borrow_mut();
        match servers.iter_mut().find(|s| s.name == server.name) {
            Some(slot) => *slot = server,
            None => servers.push(server),
        }
    }

    pub fn put_user_mapping(&self, server: &str, options: Vec<(String, String)>) {
        self.user_mappings
            .borrow_mut()
            .insert(server.to_string(), options);
    }

    /// Switches the session user, as `SET ROLE` would.
    pub fn set_current_user(&self, user: &str) {
        *self.current_user.borrow_mut() = user.to_string();
    }

    pub fn set_type_stamp(&self, id: TypeId, stamp: Stamp) {
        self.type_stamps.borrow_mut().insert(id, stamp);
    }

    /// Finds a function by `name` or `schema.name`.
    pub fn function_by_name(&self, name: &str) -> Option<FunctionDef> {
        let (schema, bare) = match name.split_once('.') {
            Some((schema, bare)) => (Some(schema), bare),
            None => (None, name),
        };
        self.functions
            .borrow()
            .iter()
            .find(|f| f.name == bare && schema.map_or(true, |s| f.schema == s))
            .cloned()
    }

    pub fn functions(&self) -> Vec<FunctionDef> {
        self.functions.borrow().clone()
    }

    pub fn servers(&self) -> Vec<ServerDef> {
        self.servers.borrow().clone()
    }

    pub fn user_mappings(&self) -> Vec<(String, Vec<(String, String)>)> {
        self.user_mappings
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Catalog for MemoryCatalog {
    fn function(&self, id: FunctionId) -> Result<FunctionDef> {
        self.functions
            .borrow()
            .iter()
            .find(|f| f.id == id)
            .cloned()
            .ok_or_else(|| RouteError::Catalog(format!("cache lookup failed for function {id}")))
    }

    fn type_info(&self, id: TypeId) -> Result<TypeInfo> {
        let (name, marshaler) = builtin::lookup(id)
            .ok_or_else(|| RouteError::Catalog(format!("cache lookup failed for type {id}")))?;
        Ok(TypeInfo::new(id, name, self.type_stamp(id)?, marshaler))
    }

    fn type_stamp(&self, id: TypeId) -> Result<Stamp> {
        Ok(self
            .type_stamps
            .borrow()
            .get(&id)
            .copied()
            .unwrap_or_default())
    }

    fn server(&self, name: &str) -> Result<Option<ServerDef>> {
        Ok(self
            .servers
            .borrow()
            .iter()
            .find(|s| s.name == name)
            .cloned())
    }

    fn user_mapping(&self, server: &ServerDef) -> Result<Vec<(String, String)>> {
        Ok(self
            .user_mappings
            .borrow()
            .get(&server.name)
            .cloned()
            .unwrap_or_default())
    }

    fn current_user(&self) -> String {
        self.current_user.borrow().clone()
    }
}
