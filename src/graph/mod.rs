//! Immutable adjacency view over a flattened transition graph.
//!
//! Graphs arrive as CSR-style arrays: one `(first_transition, count)` pair
//! per state and a flat list of `(from, to, class_id)` triples with a
//! parallel list of log-domain weights. [`Graph`] validates that layout once
//! and then addresses everything by integer index, so a single instance can
//! be shared read-only by every sequence worker.

use std::ops::Range;

use crate::error::ChainLossError;

mod denominator;

pub use denominator::DenominatorGraph;

/// One arc of a graph. `weight` is a log-domain score added to the frame's
/// class score whenever the arc is taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub from: usize,
    pub to: usize,
    pub class_id: usize,
    pub weight: f32,
}

impl Transition {
    pub fn new(from: usize, to: usize, class_id: usize, weight: f32) -> Self {
        Self {
            from,
            to,
            class_id,
            weight,
        }
    }
}

/// Borrowed flattened graph arrays, laid out the way the tensor binding
/// hands them over.
#[derive(Debug, Clone, Copy)]
pub struct FlatGraph<'a> {
    pub num_states: usize,
    /// `[first_transition_index, transition_count]` per state.
    pub state_offsets: &'a [[i32; 2]],
    /// `[from_state, to_state, class_id]` per transition.
    pub transitions: &'a [[i32; 3]],
    pub weights: &'a [f32],
}

#[derive(Debug, Clone)]
pub struct Graph {
    num_states: usize,
    num_classes: usize,
    transitions: Vec<Transition>,
    outgoing: Vec<Range<usize>>,
    incoming: Vec<usize>,
    incoming_offsets: Vec<usize>,
    log_initial: Vec<f64>,
    log_final: Vec<f64>,
}

impl Graph {
    /// Build a graph from flattened arrays, validating that the state
    /// offsets partition the transition list and that every index is in
    /// range.
    ///
    /// The result uses numerator endpoints: state 0 is the start state and
    /// the states without outgoing transitions are final (every state is
    /// final when no such state exists).
    pub fn from_flat(flat: FlatGraph<'_>, num_classes: usize) -> Result<Self, ChainLossError> {
        let num_states = flat.num_states;
        if num_states == 0 {
            return Err(ChainLossError::malformed("graph has no states"));
        }
        if flat.state_offsets.len() != num_states {
            return Err(ChainLossError::malformed(format!(
                "{} state offset rows for {num_states} states",
                flat.state_offsets.len()
            )));
        }
        if flat.weights.len() != flat.transitions.len() {
            return Err(ChainLossError::malformed(format!(
                "{} weights for {} transitions",
                flat.weights.len(),
                flat.transitions.len()
            )));
        }

        let num_arcs = flat.transitions.len();
        let mut outgoing = Vec::with_capacity(num_states);
        for (state, &[first, count]) in flat.state_offsets.iter().enumerate() {
            if first < 0 || count < 0 {
                return Err(ChainLossError::malformed_state(
                    state,
                    format!("negative offset ({first}, {count})"),
                ));
            }
            let start = first as usize;
            let end = start + count as usize;
            if end > num_arcs {
                return Err(ChainLossError::malformed_state(
                    state,
                    format!("transition range {start}..{end} exceeds {num_arcs} transitions"),
                ));
            }
            outgoing.push(start..end);
        }

        let mut transitions = Vec::with_capacity(num_arcs);
        for (arc, (&[from, to, class_id], &weight)) in
            flat.transitions.iter().zip(flat.weights).enumerate()
        {
            if from < 0 || to < 0 || class_id < 0 {
                return Err(ChainLossError::malformed_arc(
                    arc,
                    format!("negative index in ({from}, {to}, {class_id})"),
                ));
            }
            transitions.push(Transition::new(
                from as usize,
                to as usize,
                class_id as usize,
                weight,
            ));
        }

        Self::assemble(num_states, num_classes, transitions, outgoing)
    }

    /// Build a graph from an unordered transition list. Transitions are
    /// grouped by source state, keeping their relative order.
    pub fn from_transitions(
        num_states: usize,
        num_classes: usize,
        mut transitions: Vec<Transition>,
    ) -> Result<Self, ChainLossError> {
        if num_states == 0 {
            return Err(ChainLossError::malformed("graph has no states"));
        }
        if let Some((arc, t)) = transitions
            .iter()
            .enumerate()
            .find(|(_, t)| t.from >= num_states)
        {
            return Err(ChainLossError::malformed_arc(
                arc,
                format!("source state {} out of range 0..{num_states}", t.from),
            ));
        }
        transitions.sort_by_key(|t| t.from);

        let mut outgoing = Vec::with_capacity(num_states);
        let mut cursor = 0usize;
        for state in 0..num_states {
            let start = cursor;
            while cursor < transitions.len() && transitions[cursor].from == state {
                cursor += 1;
            }
            outgoing.push(start..cursor);
        }

        Self::assemble(num_states, num_classes, transitions, outgoing)
    }

    fn assemble(
        num_states: usize,
        num_classes: usize,
        transitions: Vec<Transition>,
        outgoing: Vec<Range<usize>>,
    ) -> Result<Self, ChainLossError> {
        check_partition(&outgoing, transitions.len())?;

        for (state, range) in outgoing.iter().enumerate() {
            for arc in range.clone() {
                let t = &transitions[arc];
                if t.from != state {
                    return Err(ChainLossError::malformed_arc(
                        arc,
                        format!("listed under state {state} but leaves state {}", t.from),
                    ));
                }
                if t.to >= num_states {
                    return Err(ChainLossError::malformed_arc(
                        arc,
                        format!("destination state {} out of range 0..{num_states}", t.to),
                    ));
                }
                if t.class_id >= num_classes {
                    return Err(ChainLossError::malformed_arc(
                        arc,
                        format!("class id {} out of range 0..{num_classes}", t.class_id),
                    ));
                }
                if t.weight.is_nan() || t.weight == f32::INFINITY {
                    return Err(ChainLossError::malformed_arc(
                        arc,
                        format!("invalid weight {}", t.weight),
                    ));
                }
            }
        }

        let mut incoming_offsets = vec![0usize; num_states + 1];
        for t in &transitions {
            incoming_offsets[t.to + 1] += 1;
        }
        for state in 0..num_states {
            incoming_offsets[state + 1] += incoming_offsets[state];
        }
        let mut fill = incoming_offsets.clone();
        let mut incoming = vec![0usize; transitions.len()];
        for range in &outgoing {
            for arc in range.clone() {
                let to = transitions[arc].to;
                incoming[fill[to]] = arc;
                fill[to] += 1;
            }
        }

        let mut log_initial = vec![f64::NEG_INFINITY; num_states];
        log_initial[0] = 0.0;
        let has_sink = outgoing.iter().any(|r| r.is_empty());
        let log_final = outgoing
            .iter()
            .map(|r| if !has_sink || r.is_empty() { 0.0 } else { f64::NEG_INFINITY })
            .collect();

        Ok(Self {
            num_states,
            num_classes,
            transitions,
            outgoing,
            incoming,
            incoming_offsets,
            log_initial,
            log_final,
        })
    }

    /// Replace the final-state set. Each listed state gets log weight 0,
    /// every other state becomes non-final.
    pub fn with_final_states(mut self, finals: &[usize]) -> Result<Self, ChainLossError> {
        if finals.is_empty() {
            return Err(ChainLossError::malformed("final state set is empty"));
        }
        let mut log_final = vec![f64::NEG_INFINITY; self.num_states];
        for &state in finals {
            if state >= self.num_states {
                return Err(ChainLossError::malformed_state(
                    state,
                    format!("final state out of range 0..{}", self.num_states),
                ));
            }
            log_final[state] = 0.0;
        }
        self.log_final = log_final;
        Ok(self)
    }

    pub(crate) fn set_endpoints(&mut self, log_initial: Vec<f64>, log_final: Vec<f64>) {
        debug_assert_eq!(log_initial.len(), self.num_states);
        debug_assert_eq!(log_final.len(), self.num_states);
        self.log_initial = log_initial;
        self.log_final = log_final;
    }

    pub fn num_states(&self) -> usize {
        self.num_states
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn num_transitions(&self) -> usize {
        self.transitions.len()
    }

    /// All transitions in arc-index order.
    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    /// Arc indices of the transitions leaving `state`, in stored order.
    pub fn outgoing_arcs(&self, state: usize) -> Range<usize> {
        self.outgoing[state].clone()
    }

    pub fn outgoing(&self, state: usize) -> &[Transition] {
        &self.transitions[self.outgoing[state].clone()]
    }

    /// Arc indices of the transitions entering `state`.
    pub fn incoming_arcs(&self, state: usize) -> &[usize] {
        &self.incoming[self.incoming_offsets[state]..self.incoming_offsets[state + 1]]
    }

    pub fn log_initial(&self) -> &[f64] {
        &self.log_initial
    }

    pub fn log_final(&self) -> &[f64] {
        &self.log_final
    }

    pub fn is_final(&self, state: usize) -> bool {
        self.log_final[state] > f64::NEG_INFINITY
    }
}

/// Non-empty ranges must tile `0..num_arcs` with no gap and no overlap.
fn check_partition(ranges: &[Range<usize>], num_arcs: usize) -> Result<(), ChainLossError> {
    let mut ordered = ranges
        .iter()
        .enumerate()
        .filter(|(_, r)| !r.is_empty())
        .collect::<Vec<_>>();
    ordered.sort_by_key(|(_, r)| r.start);

    let mut expected = 0usize;
    for (state, range) in ordered {
        if range.start > expected {
            return Err(ChainLossError::malformed_state(
                state,
                format!("transitions {expected}..{} belong to no state", range.start),
            ));
        }
        if range.start < expected {
            return Err(ChainLossError::malformed_state(
                state,
                format!("range {}..{} overlaps a previous state", range.start, range.end),
            ));
        }
        expected = range.end;
    }
    if expected != num_arcs {
        return Err(ChainLossError::malformed(format!(
            "transitions {expected}..{num_arcs} belong to no state"
        )));
    }
    Ok(())
}
