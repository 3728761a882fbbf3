//! In-band pipeline negotiation.
//!
//! A graph-aware tool calls [`negotiate`] once at startup. The call joins
//! the pipeline's negotiation ring on the two shell-assigned descriptors,
//! circulates the message block until the whole graph of tools and edges
//! is known, and returns the concrete data descriptors that satisfy the
//! tool's declared arities.
//!
//! ```ignore
//! let negotiated = manifold_negotiate::negotiate("dedupe", 1, 1).await?;
//! let input = File::from(negotiated.input_fds.into_iter().next().unwrap());
//! ```
//!
//! Everything observable is also reachable without touching process-global
//! state: [`negotiate_on`] takes an explicit [`Ring`] and [`NodeSpec`],
//! which is how the integration tests drive whole rings in one process.

pub mod env;
mod error;
mod fdpass;
pub mod ring;
pub mod session;

mod alloc;

pub use alloc::Negotiated;
pub use error::NegotiateError;
pub use ring::Ring;
pub use session::{NodeSpec, Phase, Session, Step};

use tracing::debug;

use manifold_wire::ProtocolState;

/// Join the pipeline on the process's standard descriptors.
///
/// Reads `MANIFOLD_IN` / `MANIFOLD_OUT` from the environment, wraps fds 0
/// and 1, and runs the protocol to completion. The returned descriptor
/// arrays match the declared arities exactly; any failure reports why the
/// tool could not be wired in.
pub async fn negotiate(
    tool_name: &str,
    requires: u32,
    provides: u32,
) -> Result<Negotiated, NegotiateError> {
    let graph_env = env::graph_env()?;
    let spec = NodeSpec::new(
        tool_name,
        std::process::id() as i32,
        requires,
        provides,
        graph_env.graph_in,
        graph_env.graph_out,
    )?;
    let ring = Ring::from_stdio(spec.graph_in, spec.graph_out)
        .map_err(|e| NegotiateError::io("preparing negotiation descriptors", e))?;
    negotiate_on(ring, spec).await
}

/// Run the full negotiation over an explicit ring.
pub async fn negotiate_on(ring: Ring, spec: NodeSpec) -> Result<Negotiated, NegotiateError> {
    debug!(name = %spec.name, pid = spec.pid, requires = spec.requires, provides = spec.provides,
           "tool entered negotiation");

    // Startup rule: a tool with no upstream peer constructs the block;
    // everyone else waits for one to arrive.
    let mut session = if spec.graph_out && !spec.graph_in {
        Session::initiate(spec)?
    } else {
        let (block, side) = ring.read_block().await?;
        Session::adopt(spec, block, side)?
    };

    if let Err(e) = drive(&ring, &mut session).await {
        session.set_phase(Phase::Failed);
        return Err(e);
    }

    let allocated = alloc::allocate(&ring, &session).await;
    match allocated {
        Ok((input_fds, output_fds)) => {
            session.set_phase(Phase::Completed);
            debug!(name = %session.spec().name, inputs = input_fds.len(), outputs = output_fds.len(),
                   "negotiation completed");
            let self_index = session.self_index();
            Ok(Negotiated {
                input_fds,
                output_fds,
                graph: session.into_block(),
                self_index,
            })
        }
        Err(e) => {
            session.set_phase(Phase::Failed);
            Err(e)
        }
    }
}

/// The forwarding loop: transmit, read, compete, until the chosen block
/// reaches the end state and the stamped copy has been relayed.
async fn drive(ring: &Ring, session: &mut Session) -> Result<(), NegotiateError> {
    // A late joiner can adopt a block that already ended; there is nothing
    // to forward and the arity check will have the last word.
    while session.state() == ProtocolState::Negotiating {
        if session.should_transmit() {
            let side = session.write_side();
            let bytes = session.outgoing(side)?;
            ring.write_block(&bytes, side).await?;
        }
        let (fresh, side) = ring.read_block().await?;
        match session.receive(fresh, side)? {
            Step::Continue => {}
            Step::Finished { relay } => {
                for side in relay {
                    let bytes = session.outgoing(side)?;
                    ring.write_block(&bytes, side).await?;
                }
                break;
            }
        }
    }
    Ok(())
}
