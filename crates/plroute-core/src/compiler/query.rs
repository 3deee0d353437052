use super::parser::{CallArg, CallExpr};

/// SQL text with `$k` placeholders, and for each placeholder the index of
/// the function argument bound to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub sql: String,
    pub arg_indexes: Vec<usize>,
}

/// Declared input argument of the routed function, in call order.
#[derive(Debug, Clone, Copy)]
pub struct ArgRef<'a> {
    pub name: Option<&'a str>,
}

impl Query {
    /// Renders `name(args)` with references rewritten to bind placeholders.
    pub fn from_call(call: &CallExpr, select: bool, args: &[ArgRef<'_>]) -> Result<Self, String> {
        let mut arg_indexes = Vec::new();
        let mut rendered = Vec::with_capacity(call.args.len());
        for arg in &call.args {
            match arg {
                CallArg::Literal(n) => rendered.push(n.clone()),
                CallArg::Reference(name) => {
                    let idx = resolve_arg(name, args)?;
                    arg_indexes.push(idx);
                    rendered.push(format!("${}", arg_indexes.len()));
                }
            }
        }
        let call_sql = format!("{}({})", call.name, rendered.join(","));
        let sql = if select {
            format!("select {call_sql}")
        } else {
            call_sql
        };
        Ok(Self { sql, arg_indexes })
    }

    /// `name($1,...,$n)` binding every argument in order.
    pub fn default_call(qualified_name: &str, nargs: usize) -> Self {
        let placeholders: Vec<String> = (1..=nargs).map(|i| format!("${i}")).collect();
        Self {
            sql: format!("{qualified_name}({})", placeholders.join(",")),
            arg_indexes: (0..nargs).collect(),
        }
    }
}

/// Index of the argument `name` or `$n` refers to.
pub(crate) fn resolve_arg(name: &str, args: &[ArgRef<'_>]) -> Result<usize, String> {
    let missing = || format!("no '{name}' among function args");
    if let Some(pos) = name.strip_prefix('$') {
        let n: usize = pos.parse().map_err(|_| missing())?;
        if n >= 1 && n <= args.len() {
            return Ok(n - 1);
        }
        return Err(missing());
    }
    args.iter()
        .position(|a| a.name.is_some_and(|declared| declared.eq_ignore_ascii_case(name)))
        .ok_or_else(missing)
}
