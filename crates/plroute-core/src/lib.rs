//! plroute core: routes calls of a logical function to the nodes of a
//! partitioned PostgreSQL cluster.
//!
//! Each routing function carries a short statement naming its cluster and
//! how to pick the node(s):
//!
//! ```text
//! cluster users;
//! run get_user_remote(uid) on hashtext(username);
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              Host (Catalog, LocalExecutor)       │
//! ├─────────────────────────────────────────────────┤
//! │  Engine                                          │
//! │   ├─ StampedCache (functions, types)            │
//! │   ├─ compiler (lexer -> parser -> Query)        │
//! │   ├─ routing (hash/node/arg/any/all/coalesce)   │
//! │   ├─ TxnCoordinator (savepoint mirroring)       │
//! │   └─ ConnectionPool                              │
//! │       └─ executor state machine                  │
//! ├─────────────────────────────────────────────────┤
//! │  transport: pgwire over TCP (Reactor) | memory   │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! The engine is single-threaded. All I/O waits go through one
//! current-thread tokio runtime and are bounded by the configured poll
//! interval, at which point the call's cancellation token is checked.

pub mod cache;
pub mod catalog;
pub mod cluster;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod function;
pub mod pool;
pub mod reactor;
pub mod routing;
pub mod transport;
pub mod txn;
pub mod types;

pub use catalog::{Catalog, ColumnDef, FunctionDef, FunctionId, LocalExecutor, MemoryCatalog, ServerDef};
pub use cluster::{Cluster, IsolationLevel};
pub use config::EngineConfig;
pub use engine::{Call, CallOutput, Engine, RowStream};
pub use error::{RemoteError, Result, RouteError};
pub use function::CompiledFunction;
pub use routing::RoutingPolicy;
pub use txn::{SubXactEvent, XactEvent};
pub use types::{TypeId, Value};
