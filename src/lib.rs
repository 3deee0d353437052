//! plroute: call a function once, run it on the right node(s) of a cluster.
//!
//! This crate re-exports [`plroute_core`]; see its documentation for the
//! architecture.

pub use plroute_core::*;
