//! The pure negotiation engine.
//!
//! A [`Session`] holds everything one tool knows mid-negotiation: its own
//! node, the chosen message block, the dispatch side for the next write,
//! and the peers seen behind each descriptor. It performs no I/O; the ring
//! driver in [`crate::ring`] feeds it arriving blocks and ships the ones it
//! wants forwarded. Keeping the engine synchronous makes every protocol
//! rule unit-testable with hand-built blocks.

use std::cmp::Ordering;

use tracing::debug;

use manifold_wire::{codec, MessageBlock, Node, Origin, ProtocolState, Side, NAME_MAX};

use crate::error::NegotiateError;

/// What one tool declares about itself when joining a pipeline.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub pid: i32,
    pub requires: u32,
    pub provides: u32,
    pub graph_in: bool,
    pub graph_out: bool,
}

impl NodeSpec {
    pub fn new(
        name: impl Into<String>,
        pid: i32,
        requires: u32,
        provides: u32,
        graph_in: bool,
        graph_out: bool,
    ) -> Result<NodeSpec, NegotiateError> {
        let name = name.into();
        if name.len() > NAME_MAX {
            return Err(NegotiateError::Config(format!(
                "tool name {name:?} exceeds {NAME_MAX} bytes"
            )));
        }
        if !graph_in && !graph_out {
            return Err(NegotiateError::Config(
                "neither descriptor is graph-aware; nothing to negotiate".to_string(),
            ));
        }
        Ok(NodeSpec {
            name,
            pid,
            requires,
            provides,
            graph_in,
            graph_out,
        })
    }

    fn to_node(&self) -> Node {
        Node {
            pid: self.pid,
            name: self.name.clone(),
            requires_channels: self.requires,
            provides_channels: self.provides,
            graph_in: self.graph_in,
            graph_out: self.graph_out,
        }
    }

    fn side_is_aware(&self, side: Side) -> bool {
        match side {
            Side::Input => self.graph_in,
            Side::Output => self.graph_out,
        }
    }
}

/// Lifecycle of one tool's participation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Entered,
    Contributing,
    Forwarding,
    Completed,
    Failed,
}

/// What the driver should do after feeding the session.
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Keep looping: transmit if asked, then read the next block.
    Continue,
    /// Negotiation ended. Ship the end-stamped block to each listed side,
    /// then move on to connection allocation.
    Finished { relay: Vec<Side> },
}

/// One tool's negotiation state.
#[derive(Debug)]
pub struct Session {
    spec: NodeSpec,
    chosen: MessageBlock,
    self_index: u32,
    write_side: Side,
    /// Pid of the peer most recently seen behind each descriptor.
    neighbors: [Option<i32>; 2],
    should_transmit: bool,
    round: u32,
    serial_at_last_arrival: Option<u32>,
    phase: Phase,
}

impl Session {
    /// Startup rule for a tool with no upstream peer: construct a fresh
    /// block naming self as initiator and forward it on the output side.
    pub fn initiate(spec: NodeSpec) -> Result<Session, NegotiateError> {
        if !spec.graph_out {
            return Err(NegotiateError::Config(
                "an initiating tool must be graph-aware on its output side".to_string(),
            ));
        }
        let chosen = MessageBlock::new(spec.pid);
        let mut session = Session {
            spec,
            chosen,
            self_index: 0,
            write_side: Side::Output,
            neighbors: [None; 2],
            should_transmit: true,
            round: 0,
            serial_at_last_arrival: None,
            phase: Phase::Contributing,
        };
        session.contribute()?;
        session.phase = Phase::Forwarding;
        debug!(name = %session.spec.name, pid = session.spec.pid, "entered negotiation as initiator");
        Ok(session)
    }

    /// Startup rule for every other tool: adopt the first block read and
    /// contribute self to it.
    pub fn adopt(
        spec: NodeSpec,
        fresh: MessageBlock,
        arrival: Side,
    ) -> Result<Session, NegotiateError> {
        let sender_pid = sender_pid(&fresh)?;
        let mut session = Session {
            write_side: flip_side(&spec, arrival),
            spec,
            chosen: fresh,
            self_index: 0,
            neighbors: [None; 2],
            should_transmit: true,
            round: 0,
            serial_at_last_arrival: None,
            phase: Phase::Contributing,
        };
        session.neighbors[arrival.index()] = Some(sender_pid);
        session.contribute()?;
        session.phase = Phase::Forwarding;
        debug!(name = %session.spec.name, pid = session.spec.pid, "entered negotiation by adoption");
        Ok(session)
    }

    pub fn state(&self) -> ProtocolState {
        self.chosen.state
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    pub fn block(&self) -> &MessageBlock {
        &self.chosen
    }

    pub fn into_block(self) -> MessageBlock {
        self.chosen
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn self_index(&self) -> u32 {
        self.self_index
    }

    pub fn write_side(&self) -> Side {
        self.write_side
    }

    pub fn should_transmit(&self) -> bool {
        self.should_transmit
    }

    pub fn neighbor(&self, side: Side) -> Option<i32> {
        self.neighbors[side.index()]
    }

    /// The side whose recorded peer is `pid`, preferring `preferred` when
    /// both descriptors face the same peer (a two-tool cycle).
    pub fn side_for_neighbor(&self, pid: i32, preferred: Side) -> Option<Side> {
        if self.neighbors[preferred.index()] == Some(pid) {
            Some(preferred)
        } else if self.neighbors[preferred.opposite().index()] == Some(pid) {
            Some(preferred.opposite())
        } else {
            None
        }
    }

    /// Encode the chosen block for transmission on `side`, stamping the
    /// origin with self.
    pub fn outgoing(&mut self, side: Side) -> Result<Vec<u8>, NegotiateError> {
        self.chosen.origin = Some(Origin {
            index: self.self_index,
            side,
        });
        Ok(codec::encode(&self.chosen)?)
    }

    /// Feed one arriving block. Runs the competition rule, the edge
    /// bookkeeping, and (at the initiator) the round check.
    pub fn receive(
        &mut self,
        fresh: MessageBlock,
        arrival: Side,
    ) -> Result<Step, NegotiateError> {
        let sender = sender_pid(&fresh)?;
        let origin_side = fresh.origin.map(|o| o.side).unwrap_or(arrival);
        self.neighbors[arrival.index()] = Some(sender);
        self.write_side = flip_side(&self.spec, arrival);
        self.should_transmit = true;

        let mut arrived_chosen = true;
        match fresh.initiator_pid.cmp(&self.chosen.initiator_pid) {
            Ordering::Less => {
                debug!(
                    fresh = fresh.initiator_pid,
                    chosen = self.chosen.initiator_pid,
                    "adopting block from older initiator"
                );
                self.chosen = fresh;
                self.contribute()?;
            }
            Ordering::Greater => {
                debug!(
                    fresh = fresh.initiator_pid,
                    chosen = self.chosen.initiator_pid,
                    "discarding block from younger initiator"
                );
                self.should_transmit = false;
                arrived_chosen = false;
            }
            Ordering::Equal => {
                if fresh.serial > self.chosen.serial {
                    self.chosen = fresh;
                    self.self_index = self
                        .chosen
                        .node_index_by_pid(self.spec.pid)
                        .ok_or_else(|| {
                            NegotiateError::protocol("own node missing from returning block")
                        })?;
                }
                // Whichever copy won may still lack the adjacency this
                // arrival just demonstrated. An echo of our own write has
                // no adjacency to record.
                if sender != self.spec.pid {
                    if let Some(origin_index) = self.chosen.node_index_by_pid(sender) {
                        self.add_edge_toward(origin_index, origin_side)?;
                    }
                }
            }
        }

        if self.chosen.state == ProtocolState::End {
            debug!(pid = self.spec.pid, "negotiation end reached this tool");
            return Ok(Step::Finished {
                relay: self.end_relay(arrival),
            });
        }

        if arrived_chosen && self.round_check() {
            return Ok(Step::Finished {
                relay: self.end_broadcast(),
            });
        }
        Ok(Step::Continue)
    }

    /// Add self to the chosen block: the node (if absent), the initiator
    /// stamp (if self has the smallest pid so far), and the edge to the
    /// block's origin.
    fn contribute(&mut self) -> Result<(), NegotiateError> {
        self.self_index = self.chosen.add_node(self.spec.to_node());
        if self.spec.pid < self.chosen.initiator_pid {
            debug!(
                old = self.chosen.initiator_pid,
                new = self.spec.pid,
                "taking over as initiator"
            );
            self.chosen.initiator_pid = self.spec.pid;
            self.chosen.bump_serial();
        }
        if let Some(origin) = self.chosen.origin {
            self.add_edge_toward(origin.index, origin.side)?;
        }
        Ok(())
    }

    /// Infer the direction of the edge between self and the origin node
    /// from the side the origin forwarded on, and add it.
    ///
    /// A block forwarded from the origin's input side travels upstream, so
    /// the origin consumes self's output: self -> origin. Forwarded from
    /// its output side, the origin is upstream: origin -> self. Either way
    /// the declared graph-awareness of self must agree.
    fn add_edge_toward(
        &mut self,
        origin_index: u32,
        origin_side: Side,
    ) -> Result<(), NegotiateError> {
        if origin_index as usize >= self.chosen.nodes.len() {
            return Err(NegotiateError::protocol(format!(
                "origin index {origin_index} not present in graph of {} nodes",
                self.chosen.nodes.len()
            )));
        }
        let (from, to) = match origin_side {
            Side::Input => {
                if !self.spec.graph_out {
                    return Err(NegotiateError::protocol(format!(
                        "block forwarded from an input side reached tool {} \
                         whose output is not graph-aware",
                        self.spec.name
                    )));
                }
                (self.self_index, origin_index)
            }
            Side::Output => {
                if !self.spec.graph_in {
                    return Err(NegotiateError::protocol(format!(
                        "block forwarded from an output side reached tool {} \
                         whose input is not graph-aware",
                        self.spec.name
                    )));
                }
                (origin_index, self.self_index)
            }
        };
        self.chosen.add_edge(from, to);
        Ok(())
    }

    /// Round bookkeeping at the initiator. Returns true when this arrival
    /// closed a round with no structural change and the block was stamped.
    fn round_check(&mut self) -> bool {
        if self.spec.pid != self.chosen.initiator_pid {
            return false;
        }
        self.round += 1;
        if self.serial_at_last_arrival == Some(self.chosen.serial) {
            self.chosen.state = ProtocolState::End;
            self.chosen.bump_serial();
            debug!(
                round = self.round,
                serial = self.chosen.serial,
                "round passed with no update: negotiation ends"
            );
            return true;
        }
        self.serial_at_last_arrival = Some(self.chosen.serial);
        false
    }

    /// Sides the freshly stamped end block must go out on: the current
    /// write side, plus the other one when it is also graph-aware (a
    /// mid-pipeline initiator informs both halves of the ring).
    fn end_broadcast(&self) -> Vec<Side> {
        let mut sides = vec![self.write_side];
        let other = self.write_side.opposite();
        if self.spec.side_is_aware(other) {
            sides.push(other);
        }
        sides
    }

    /// Relay sides for an end block received from a peer: pass it along
    /// unless self sits at the end of the pipeline, where the only
    /// graph-aware side is the one it arrived on.
    fn end_relay(&self, arrival: Side) -> Vec<Side> {
        if self.write_side != arrival {
            vec![self.write_side]
        } else {
            Vec::new()
        }
    }
}

fn flip_side(spec: &NodeSpec, arrival: Side) -> Side {
    match arrival {
        Side::Input if spec.graph_out => Side::Output,
        Side::Output if spec.graph_in => Side::Input,
        _ => arrival,
    }
}

fn sender_pid(fresh: &MessageBlock) -> Result<i32, NegotiateError> {
    let origin = fresh
        .origin
        .ok_or_else(|| NegotiateError::protocol("message block arrived without an origin"))?;
    fresh
        .origin_node()
        .map(|n| n.pid)
        .ok_or_else(|| {
            NegotiateError::protocol(format!(
                "origin index {} not present in graph of {} nodes",
                origin.index,
                fresh.nodes.len()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(pid: i32, graph_in: bool, graph_out: bool) -> NodeSpec {
        NodeSpec::new(
            format!("tool-{pid}"),
            pid,
            u32::from(graph_in),
            u32::from(graph_out),
            graph_in,
            graph_out,
        )
        .unwrap()
    }

    /// A block as it would arrive from an upstream initiator: one node,
    /// origin stamped on its output side.
    fn block_from_upstream(pid: i32) -> MessageBlock {
        let mut session = Session::initiate(spec(pid, false, true)).unwrap();
        let bytes = session.outgoing(Side::Output).unwrap();
        manifold_wire::codec::decode(&bytes).unwrap()
    }

    #[test]
    fn initiator_contributes_itself() {
        let session = Session::initiate(spec(42, false, true)).unwrap();
        assert_eq!(session.block().nodes.len(), 1);
        assert_eq!(session.block().initiator_pid, 42);
        assert_eq!(session.write_side(), Side::Output);
        assert_eq!(session.phase(), Phase::Forwarding);
    }

    #[test]
    fn adoption_adds_node_and_upstream_edge() {
        let fresh = block_from_upstream(42);
        let session = Session::adopt(spec(50, true, true), fresh, Side::Input).unwrap();

        let mb = session.block();
        assert_eq!(mb.nodes.len(), 2);
        // Origin forwarded from its output side, so it is upstream of self.
        assert!(mb.has_edge(0, 1));
        assert_eq!(session.neighbor(Side::Input), Some(42));
        assert_eq!(session.write_side(), Side::Output);
    }

    #[test]
    fn smallest_pid_takes_over_as_initiator() {
        let fresh = block_from_upstream(42);
        let session = Session::adopt(spec(17, true, true), fresh, Side::Input).unwrap();
        assert_eq!(session.block().initiator_pid, 17);
    }

    #[test]
    fn direction_sanity_is_enforced() {
        // A block forwarded from an output side lands on a tool whose
        // input is not graph-aware: fatal.
        let fresh = block_from_upstream(42);
        let err = Session::adopt(spec(50, false, true), fresh, Side::Output).unwrap_err();
        assert!(matches!(err, NegotiateError::Protocol(_)));
    }

    #[test]
    fn competition_adopts_older_initiator() {
        // Self initiated with pid 42; a block stamped by pid 17 arrives.
        let mut session = Session::initiate(spec(42, true, true)).unwrap();
        let fresh = block_from_upstream(17);

        let step = session.receive(fresh, Side::Input).unwrap();
        assert_eq!(step, Step::Continue);
        assert_eq!(session.block().initiator_pid, 17);
        assert!(session.should_transmit());
        // Self was re-contributed into the adopted block.
        assert!(session.block().node_index_by_pid(42).is_some());
    }

    #[test]
    fn competition_discards_younger_initiator() {
        let mut session = Session::initiate(spec(17, true, true)).unwrap();
        let serial_before = session.block().serial;
        let fresh = block_from_upstream(42);

        let step = session.receive(fresh, Side::Input).unwrap();
        assert_eq!(step, Step::Continue);
        assert_eq!(session.block().initiator_pid, 17);
        assert_eq!(session.block().serial, serial_before);
        // The discarded block is not forwarded this round.
        assert!(!session.should_transmit());
    }

    #[test]
    fn equal_initiators_keep_larger_serial() {
        let mut session = Session::initiate(spec(42, false, true)).unwrap();

        // The block comes back enriched by a downstream tool.
        let fresh = block_from_upstream(42);
        let mut downstream = Session::adopt(spec(50, true, false), fresh, Side::Input).unwrap();
        let bytes = downstream.outgoing(Side::Input).unwrap();
        let returning = manifold_wire::codec::decode(&bytes).unwrap();
        assert!(returning.serial > session.block().serial);

        session.receive(returning, Side::Output).unwrap();
        assert_eq!(session.block().nodes.len(), 2);
        assert!(session.block().has_edge(0, 1));
    }

    #[test]
    fn stale_duplicate_is_dropped_without_forgetting_edges() {
        let mut session = Session::initiate(spec(42, false, true)).unwrap();
        let stale = {
            let mut mb = session.block().clone();
            mb.origin = Some(manifold_wire::Origin {
                index: 0,
                side: Side::Output,
            });
            mb.serial = 0;
            mb
        };
        let before = session.block().clone();
        // Equal initiator, smaller serial: chosen stays.
        session.receive(stale, Side::Output).unwrap();
        assert_eq!(session.block().nodes, before.nodes);
        assert_eq!(session.block().serial, before.serial);
    }

    #[test]
    fn unchanged_round_stamps_end_and_broadcasts() {
        // Two-tool pipeline: initiator 10 -> sink 20.
        let mut head = Session::initiate(spec(10, false, true)).unwrap();
        let out = head.outgoing(Side::Output).unwrap();

        let mut sink = Session::adopt(
            spec(20, true, false),
            manifold_wire::codec::decode(&out).unwrap(),
            Side::Input,
        )
        .unwrap();

        // First return: the sink contributed, serial changed, no end.
        let back = sink.outgoing(Side::Input).unwrap();
        let step = head
            .receive(manifold_wire::codec::decode(&back).unwrap(), Side::Output)
            .unwrap();
        assert_eq!(step, Step::Continue);
        assert_eq!(head.state(), ProtocolState::Negotiating);

        // Second round trip with nothing new: the very next arrival ends it.
        let out = head.outgoing(Side::Output).unwrap();
        let step = sink
            .receive(manifold_wire::codec::decode(&out).unwrap(), Side::Input)
            .unwrap();
        assert_eq!(step, Step::Continue);
        let back = sink.outgoing(Side::Input).unwrap();
        let step = head
            .receive(manifold_wire::codec::decode(&back).unwrap(), Side::Output)
            .unwrap();

        assert_eq!(head.state(), ProtocolState::End);
        // Endpoint initiator: the end goes out on the output side only.
        assert_eq!(
            step,
            Step::Finished {
                relay: vec![Side::Output]
            }
        );

        // The sink adopts the end stamp and, being an endpoint, relays
        // nowhere.
        let end = head.outgoing(Side::Output).unwrap();
        let step = sink
            .receive(manifold_wire::codec::decode(&end).unwrap(), Side::Input)
            .unwrap();
        assert_eq!(step, Step::Finished { relay: Vec::new() });
        assert_eq!(sink.state(), ProtocolState::End);
    }

    #[test]
    fn edge_pairs_stay_unique_across_rounds() {
        let fresh = block_from_upstream(42);
        let mut session = Session::adopt(spec(50, true, true), fresh, Side::Input).unwrap();

        // The same adjacency demonstrated again adds nothing.
        let again = block_from_upstream(42);
        session.receive(again, Side::Input).unwrap();
        assert_eq!(session.block().edges.len(), 1);
    }
}
