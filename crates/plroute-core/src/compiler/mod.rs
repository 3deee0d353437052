//! Compiler for routing bodies:
//!
//! ```text
//! cluster <identifier> ;
//! run [ <call-expr> ] on <target> ;
//! <target> ::= <integer> | <identifier> | any | all | all coalesce | <call-expr>
//! ```

pub mod lexer;
pub mod parser;
pub mod query;

pub use query::Query;

use crate::error::{Result, RouteError};
use crate::routing::RoutingPolicy;
use crate::types::TypeId;
use parser::Target;
use query::ArgRef;

/// Input argument as the compiler sees it.
#[derive(Debug, Clone, Copy)]
pub struct InputArg<'a> {
    pub name: Option<&'a str>,
    pub type_id: TypeId,
}

/// Result of compiling one routing body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledStatement {
    pub cluster: String,
    /// `None` means the default call of the function itself.
    pub run_query: Option<Query>,
    pub policy: RoutingPolicy,
}

pub fn compile(function: &str, body: &str, args: &[InputArg<'_>]) -> Result<CompiledStatement> {
    let syntax = |msg: String| RouteError::syntax(function, msg);

    let toks = lexer::tokenize(body).map_err(syntax)?;
    let stmt = parser::parse(&toks).map_err(syntax)?;
    let refs: Vec<ArgRef<'_>> = args.iter().map(|a| ArgRef { name: a.name }).collect();

    let run_query = stmt
        .run
        .as_ref()
        .map(|call| Query::from_call(call, false, &refs))
        .transpose()
        .map_err(syntax)?;

    let policy = match stmt.target {
        Target::Node(n) => RoutingPolicy::Node(n),
        Target::Any => RoutingPolicy::Any,
        Target::All => RoutingPolicy::All,
        Target::AllCoalesce => RoutingPolicy::AllCoalesce,
        Target::Hash(call) => RoutingPolicy::Hash(Query::from_call(&call, true, &refs).map_err(syntax)?),
        Target::Arg(name) => {
            let idx = query::resolve_arg(&name, &refs).map_err(syntax)?;
            if !args[idx].type_id.is_integer() {
                return Err(RouteError::policy(
                    function,
                    "type 'anode' must be one of (int2, int4 (integer), int8)",
                ));
            }
            RoutingPolicy::ArgNode(idx)
        }
    };

    Ok(CompiledStatement {
        cluster: stmt.cluster,
        run_query,
        policy,
    })
}
