//! Compiled routing functions.

use bytes::Bytes;

use crate::catalog::{quote_ident, ArgMode, Catalog, ColumnDef, FunctionDef, FunctionId, Stamp, Volatility};
use crate::compiler::{self, InputArg, Query};
use crate::error::{Result, RouteError};
use crate::routing::RoutingPolicy;
use crate::transport::RemoteQuery;
use crate::types::{TypeId, TypeInfo, Value};

/// Everything needed to route and run one function, built once per catalog
/// version of the function and its types.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFunction {
    pub id: FunctionId,
    pub name: String,
    pub cluster: String,
    pub policy: RoutingPolicy,
    pub run_query: Query,
    pub arg_names: Vec<Option<String>>,
    pub arg_types: Vec<TypeInfo>,
    pub return_type: TypeInfo,
    pub returns_set: bool,
    pub returns_untyped_record: bool,
    /// Binary transfer for parameters and results, decided at compile time.
    pub binary: bool,
    pub stamp: Stamp,
}

impl CompiledFunction {
    /// Compiles `def`, resolving argument and return types through
    /// `type_info`.
    pub fn compile(def: &FunctionDef, mut type_info: impl FnMut(TypeId) -> Result<TypeInfo>) -> Result<Self> {
        let name = def.qualified_name();

        if def.volatility != Volatility::Volatile {
            return Err(RouteError::policy(&name, "routing functions must be volatile"));
        }

        let mut arg_names = Vec::with_capacity(def.args.len());
        let mut arg_types = Vec::with_capacity(def.args.len());
        for arg in &def.args {
            if arg.mode == ArgMode::Variadic {
                return Err(RouteError::policy(&name, "variadic arguments are not supported"));
            }
            if !arg.is_input() {
                continue;
            }
            arg_names.push(arg.name.clone());
            arg_types.push(type_info(arg.type_id)?);
        }

        let inputs: Vec<InputArg<'_>> = arg_names
            .iter()
            .zip(&arg_types)
            .map(|(n, t)| InputArg {
                name: n.as_deref(),
                type_id: t.id,
            })
            .collect();
        let stmt = compiler::compile(&name, &def.body, &inputs)?;

        if stmt.policy == RoutingPolicy::AllCoalesce && def.returns_set {
            return Err(RouteError::policy(
                &name,
                "'all coalesce' cannot be used with a set-returning function",
            ));
        }

        let return_type = type_info(def.return_type)?;
        let returns_untyped_record = def.returns_untyped_record();
        let binary = !returns_untyped_record
            && return_type.supports_binary()
            && arg_types.iter().all(TypeInfo::supports_binary);
        let run_query = stmt
            .run_query
            .unwrap_or_else(|| Query::default_call(&name, arg_types.len()));

        Ok(Self {
            id: def.id,
            name,
            cluster: stmt.cluster,
            policy: stmt.policy,
            run_query,
            arg_names,
            arg_types,
            return_type,
            returns_set: def.returns_set,
            returns_untyped_record,
            binary,
            stamp: def.stamp,
        })
    }

    pub fn returns_void(&self) -> bool {
        self.return_type.id == TypeId::VOID
    }

    /// True when neither the function row nor any of its types changed.
    pub fn is_fresh(&self, def: &FunctionDef, catalog: &dyn Catalog) -> bool {
        def.stamp == self.stamp
            && self
                .arg_types
                .iter()
                .chain(std::iter::once(&self.return_type))
                .all(|t| catalog.type_stamp(t.id).is_ok_and(|s| s == t.stamp))
    }

    /// The statement sent to nodes.
    pub fn remote_sql(&self, record_columns: Option<&[ColumnDef]>) -> Result<String> {
        if !self.returns_untyped_record {
            return Ok(format!("select {}", self.run_query.sql));
        }
        let columns = record_columns.filter(|c| !c.is_empty()).ok_or_else(|| {
            RouteError::policy(
                &self.name,
                "a column definition list is required for functions returning \"record\"",
            )
        })?;
        let columns: Vec<String> = columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), quote_ident(&c.type_name)))
            .collect();
        Ok(format!(
            "select x from (select * from {} as ({})) as x",
            self.run_query.sql,
            columns.join(", ")
        ))
    }

    /// Builds the parameterized statement for `args`.
    pub fn remote_query(&self, args: &[Option<Value>], record_columns: Option<&[ColumnDef]>) -> Result<RemoteQuery> {
        self.check_arity(args)?;
        let mut param_types = Vec::with_capacity(self.run_query.arg_indexes.len());
        let mut params = Vec::with_capacity(self.run_query.arg_indexes.len());
        for &idx in &self.run_query.arg_indexes {
            let ty = &self.arg_types[idx];
            param_types.push(ty.id.0);
            params.push(ty.encode(args[idx].as_ref(), self.binary)?);
        }
        Ok(RemoteQuery {
            sql: self.remote_sql(record_columns)?,
            param_types,
            params,
            binary: self.binary,
        })
    }

    /// Decodes one result column of a node's answer.
    pub fn decode(&self, raw: Option<&Bytes>) -> Result<Option<Value>> {
        if self.returns_void() {
            return Ok(None);
        }
        self.return_type.decode(raw.map(|b| b.as_ref()), self.binary)
    }

    pub(crate) fn check_arity(&self, args: &[Option<Value>]) -> Result<()> {
        if args.len() != self.arg_types.len() {
            return Err(RouteError::Type(format!(
                "function {} takes {} arguments, {} given",
                self.name,
                self.arg_types.len(),
                args.len()
            )));
        }
        Ok(())
    }
}
