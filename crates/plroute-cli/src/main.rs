use std::path::PathBuf;
use std::rc::Rc;

use clap::{Parser, Subcommand};
use plroute_core::catalog::{BoundParam, NoLocalQueries};
use plroute_core::cluster::{validate_server_options, validate_user_mapping_options};
use plroute_core::{
    Call, CallOutput, ColumnDef, Engine, EngineConfig, LocalExecutor, MemoryCatalog, Result,
    RouteError, Value, XactEvent,
};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "plroute")]
#[command(about = "Compile and run cluster routing functions")]
struct Cli {
    /// JSON catalog with functions, servers and user mappings.
    #[arg(long, default_value = "./catalog.json")]
    catalog: PathBuf,

    /// JSON engine settings.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile routing functions and print their policies.
    Check { function: Option<String> },
    /// Check server and user mapping options.
    Validate,
    /// Run a routing function against the cluster's nodes.
    Call {
        function: String,
        /// Arguments in text form; `NULL` passes a null.
        args: Vec<String>,
        /// Node number a hash query evaluates to.
        #[arg(long)]
        hash_node: Option<i64>,
        /// Column list for record-returning functions, as `name:type,...`.
        #[arg(long)]
        columns: Option<String>,
        /// Roll the remote transaction back instead of committing.
        #[arg(long, default_value_t = false)]
        rollback: bool,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

/// Answers every hash query with a fixed node number.
struct FixedHash(i64);

impl LocalExecutor for FixedHash {
    fn query_scalar(&self, _sql: &str, _params: &[BoundParam<'_>]) -> Result<Option<Value>> {
        Ok(Some(Value::Int8(self.0)))
    }
}

fn main() {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)?,
        None => EngineConfig::default(),
    };
    let catalog = Rc::new(MemoryCatalog::from_json_file(&cli.catalog)?);
    debug!(
        catalog = %cli.catalog.display(),
        functions = catalog.functions().len(),
        servers = catalog.servers().len(),
        "catalog loaded"
    );

    match cli.cmd {
        Command::Check { function } => check(config, &catalog, function.as_deref()),
        Command::Validate => validate(&catalog),
        Command::Call {
            function,
            args,
            hash_node,
            columns,
            rollback,
            json,
        } => {
            let local: Rc<dyn LocalExecutor> = match hash_node {
                Some(n) => Rc::new(FixedHash(n)),
                None => Rc::new(NoLocalQueries),
            };
            let engine = Engine::with_tcp(config, catalog.clone(), local)?;
            let columns = columns.as_deref().map(parse_columns).transpose()?;
            let result = call(&engine, &catalog, &function, &args, columns, json);
            let event = if result.is_ok() && !rollback {
                XactEvent::PreCommit
            } else {
                XactEvent::Abort
            };
            let finished = engine.on_xact(event);
            result.and(finished)
        }
    }
}

fn check(config: EngineConfig, catalog: &Rc<MemoryCatalog>, only: Option<&str>) -> Result<()> {
    let engine = Engine::new(
        config,
        catalog.clone(),
        Rc::new(NoLocalQueries),
        Box::new(plroute_core::transport::memory::MemoryConnector::new(|_, _| Vec::new())),
    )?;
    let functions = match only {
        Some(name) => vec![lookup_function(catalog, name)?],
        None => catalog.functions(),
    };

    let mut failures = 0;
    for def in functions {
        match engine.validate(def.id) {
            Ok(f) => println!(
                "{}: cluster {}, policy {}, remote {}, {}",
                f.name,
                f.cluster,
                f.policy.name(),
                f.run_query.sql,
                if f.binary { "binary" } else { "text" }
            ),
            Err(e) => {
                failures += 1;
                eprintln!("{e}");
            }
        }
    }
    if failures > 0 {
        return Err(RouteError::Config(format!("{failures} function(s) failed to compile")));
    }
    Ok(())
}

fn validate(catalog: &MemoryCatalog) -> Result<()> {
    for server in catalog.servers() {
        validate_server_options(&server.options)
            .map_err(|e| RouteError::Config(format!("server {}: {e}", server.name)))?;
        println!("server {}: ok", server.name);
    }
    for (server, options) in catalog.user_mappings() {
        validate_user_mapping_options(&options)
            .map_err(|e| RouteError::Config(format!("user mapping for {server}: {e}")))?;
        println!("user mapping for {server}: ok");
    }
    Ok(())
}

fn call(
    engine: &Engine,
    catalog: &MemoryCatalog,
    name: &str,
    raw_args: &[String],
    columns: Option<Vec<ColumnDef>>,
    json: bool,
) -> Result<()> {
    let def = lookup_function(catalog, name)?;
    let function = engine.compiled_function(def.id)?;
    if raw_args.len() != function.arg_types.len() {
        return Err(RouteError::Type(format!(
            "function {} takes {} arguments, {} given",
            function.name,
            function.arg_types.len(),
            raw_args.len()
        )));
    }
    let args = raw_args
        .iter()
        .zip(&function.arg_types)
        .map(|(raw, ty)| {
            if raw.eq_ignore_ascii_case("null") {
                Ok(None)
            } else {
                ty.parse_text(raw).map(Some)
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let mut request = Call::new(def.id, args);
    if let Some(columns) = columns {
        request = request.with_record_columns(columns);
    }

    let values = match engine.call(&request)? {
        CallOutput::Value(v) => vec![v],
        CallOutput::Rows(rows) => rows.collect::<Result<Vec<_>>>()?,
    };
    let rendered: Vec<Option<String>> = values
        .iter()
        .map(|v| v.as_ref().map(|v| function.return_type.format_text(v)).transpose())
        .collect::<Result<_>>()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&rendered)?);
    } else {
        for value in rendered {
            println!("{}", value.as_deref().unwrap_or("NULL"));
        }
    }
    Ok(())
}

fn lookup_function(catalog: &MemoryCatalog, name: &str) -> Result<plroute_core::FunctionDef> {
    catalog
        .function_by_name(name)
        .ok_or_else(|| RouteError::Catalog(format!("function {name} not found")))
}

fn parse_columns(raw: &str) -> Result<Vec<ColumnDef>> {
    raw.split(',')
        .map(|col| {
            let (name, ty) = col.split_once(':').ok_or_else(|| {
                RouteError::Config(format!("column '{col}' must be written as name:type"))
            })?;
            Ok(ColumnDef::new(name.trim(), ty.trim()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_lists() {
        let cols = parse_columns("id:integer, name:text").unwrap();
        assert_eq!(cols, vec![ColumnDef::new("id", "integer"), ColumnDef::new("name", "text")]);
        assert!(parse_columns("id integer").is_err());
    }

    #[test]
    fn cli_parses_call() {
        let cli = Cli::try_parse_from(["plroute", "-v", "call", "get_user", "7", "NULL", "--json"]).unwrap();
        assert!(cli.verbose);
        match cli.cmd {
            Command::Call { function, args, json, .. } => {
                assert_eq!(function, "get_user");
                assert_eq!(args, vec!["7", "NULL"]);
                assert!(json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
