//! Graph-awareness environment variables.
//!
//! The shell that builds the pipeline announces, per tool, which of its two
//! inherited descriptors speak the negotiation protocol. The variables are
//! integer-valued; any nonzero value means graph-aware.

use crate::error::NegotiateError;

/// Set by the shell when the tool's standard input is graph-aware.
pub const ENV_GRAPH_IN: &str = "MANIFOLD_IN";

/// Set by the shell when the tool's standard output is graph-aware.
pub const ENV_GRAPH_OUT: &str = "MANIFOLD_OUT";

/// Which inherited descriptors are graph-aware, per the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphEnv {
    pub graph_in: bool,
    pub graph_out: bool,
}

/// Read both variables from the process environment.
///
/// Absence or parse failure of either variable is fatal: a tool that runs
/// outside a graph-building shell has no business negotiating.
pub fn graph_env() -> Result<GraphEnv, NegotiateError> {
    Ok(GraphEnv {
        graph_in: parse_graph_flag(ENV_GRAPH_IN, std::env::var(ENV_GRAPH_IN).ok().as_deref())?,
        graph_out: parse_graph_flag(ENV_GRAPH_OUT, std::env::var(ENV_GRAPH_OUT).ok().as_deref())?,
    })
}

fn parse_graph_flag(name: &str, value: Option<&str>) -> Result<bool, NegotiateError> {
    let value =
        value.ok_or_else(|| NegotiateError::Config(format!("environment variable {name} is not set")))?;
    let parsed: i64 = value.trim().parse().map_err(|_| {
        NegotiateError::Config(format!(
            "environment variable {name} holds {value:?}, expected an integer"
        ))
    })?;
    Ok(parsed != 0)
}
