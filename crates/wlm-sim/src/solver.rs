//! Newton steady-state solve on junction heads.
//!
//! Unknowns are the hydraulic heads of all junctions; sources hold fixed
//! heads. Each junction contributes one mass-balance equation
//! `net pipe inflow − delivered demand = 0`, with pipe flow following
//! Hazen-Williams `Q = sign(Δh)·(|Δh|/r)^(1/1.852)` and delivered demand
//! following the Wagner pressure-demand curve, so a leak anywhere in the
//! network perturbs deliveries elsewhere through the shared pressure field.
//!
//! The Hazen-Williams derivative is unbounded at Δh = 0 and the Wagner curve
//! has a kink at minimum pressure; both are regularized so the Jacobian
//! stays finite, and the Newton step is damped to a maximum head change per
//! iteration. Each linear step goes through faer's partially-pivoted LU on
//! the dense Jacobian; networks small enough for the hierarchy model stay
//! well within dense territory.

use std::collections::{HashMap, HashSet, VecDeque};

use faer::{prelude::*, solvers::PartialPivLu, Mat};
use tracing::debug;
use wlm_core::{WlmError, WlmResult};

use crate::network::{HydraulicNetwork, NodeRef, HW_EXPONENT};

/// Minimum |Δh| used when evaluating flows and their derivatives.
const DH_EPS: f64 = 1e-6;
/// Largest per-iteration head change, meters.
const MAX_STEP_M: f64 = 50.0;
/// Pressure margin used to cap the Wagner derivative near the kink.
const WAGNER_EPS_M: f64 = 0.01;

/// Tuning knobs for the steady-state solve.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Convergence threshold on the largest junction mismatch, L/s
    pub tolerance_lps: f64,
    pub max_iterations: u32,
    /// Pressure below which nothing is delivered, m
    pub pressure_min_m: f64,
    /// Pressure at which full demand is delivered, m
    pub pressure_required_m: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            tolerance_lps: 1e-6,
            max_iterations: 60,
            pressure_min_m: 0.0,
            pressure_required_m: 20.0,
        }
    }
}

/// Converged steady state.
#[derive(Debug, Clone)]
pub struct SteadySolution {
    /// Hydraulic head per node (junctions and sources), m
    pub heads_m: HashMap<String, f64>,
    /// Pressure above ground per junction, m
    pub pressures_m: HashMap<String, f64>,
    /// Delivered demand per junction, L/s
    pub delivered_lps: HashMap<String, f64>,
    /// Net outflow per source, L/s
    pub supplies_lps: HashMap<String, f64>,
    pub pipe_flows_lps: HashMap<String, f64>,
    pub iterations: u32,
    pub max_mismatch_lps: f64,
}

impl SteadySolution {
    /// Flow figure a sensor on this node reports: delivered demand for a
    /// junction, supplied flow for a source.
    pub fn node_flow(&self, id: &str) -> Option<f64> {
        self.delivered_lps
            .get(id)
            .copied()
            .or_else(|| self.supplies_lps.get(id).copied())
    }
}

/// Wagner pressure-demand fraction and its derivative w.r.t. pressure.
fn wagner_fraction(pressure: f64, p_min: f64, p_req: f64) -> (f64, f64) {
    let span = (p_req - p_min).max(1e-9);
    if pressure <= p_min {
        (0.0, 0.0)
    } else if pressure >= p_req {
        (1.0, 0.0)
    } else {
        let x = (pressure - p_min).max(WAGNER_EPS_M);
        let fraction = (x / span).sqrt().min(1.0);
        let derivative = 0.5 / (x * span).sqrt();
        (fraction, derivative)
    }
}

/// Flow magnitude and derivative for a head difference, both regularized.
fn pipe_flow(delta_h: f64, resistance: f64) -> (f64, f64) {
    let kappa = 1.0 / HW_EXPONENT;
    let magnitude = delta_h.abs().max(DH_EPS);
    let q = (magnitude / resistance).powf(kappa);
    let gradient = kappa * q / magnitude;
    (delta_h.signum() * q, gradient)
}

/// One Newton correction: solve `J · Δh = −F` for the head update.
///
/// faer's LU factors whatever it is given; a hydraulically degenerate
/// Jacobian (isolated loop, zero-gradient row) shows up as a non-finite
/// step, which is rejected here rather than propagated into the heads.
fn newton_step(jacobian: &[Vec<f64>], residual: &[f64]) -> WlmResult<Vec<f64>> {
    let unknowns = residual.len();
    let lhs = Mat::from_fn(unknowns, unknowns, |row, col| jacobian[row][col]);
    let rhs = Mat::from_fn(unknowns, 1, |row, _| -residual[row]);

    let factored = PartialPivLu::new(lhs.as_ref());
    let correction = factored.solve(&rhs);

    let step: Vec<f64> = (0..unknowns).map(|row| correction.read(row, 0)).collect();
    if step.iter().any(|value| !value.is_finite()) {
        return Err(WlmError::SimulationFailed(
            "Newton step is not finite; the network Jacobian is singular".into(),
        ));
    }
    Ok(step)
}

/// Solve the network to steady state.
pub fn solve_steady(
    network: &HydraulicNetwork,
    options: &SolverOptions,
) -> WlmResult<SteadySolution> {
    let n = network.junctions.len();

    let (mut heads, disconnected) = initial_heads(network);

    let mut iterations = 0;
    let mut converged = n == 0;
    let mut max_mismatch = if converged { 0.0 } else { f64::INFINITY };

    while iterations < options.max_iterations && !converged {
        let (residual, jacobian) =
            assemble_system(network, &heads, &disconnected, options);

        max_mismatch = residual
            .iter()
            .enumerate()
            .filter(|(i, _)| !disconnected.contains(i))
            .map(|(_, f)| f.abs())
            .fold(0.0, f64::max);
        if max_mismatch < options.tolerance_lps {
            converged = true;
            break;
        }

        let delta = newton_step(&jacobian, &residual)?;

        let largest = delta.iter().fold(0.0_f64, |acc, d| acc.max(d.abs()));
        let scale = if largest > MAX_STEP_M {
            MAX_STEP_M / largest
        } else {
            1.0
        };
        for (head, step) in heads.iter_mut().zip(delta.iter()) {
            *head += scale * step;
        }

        iterations += 1;
    }

    if !converged {
        return Err(WlmError::SimulationFailed(format!(
            "steady-state solve did not converge in {} iterations (max mismatch {:.3e} L/s)",
            options.max_iterations, max_mismatch
        )));
    }

    debug!(iterations, max_mismatch, "steady-state solve converged");
    Ok(assemble_solution(
        network,
        &heads,
        &disconnected,
        options,
        iterations,
        max_mismatch,
    ))
}

/// Seed junction heads by BFS distance from the sources; junctions no pipe
/// path reaches are pinned to ground level and delivered nothing.
fn initial_heads(network: &HydraulicNetwork) -> (Vec<f64>, HashSet<usize>) {
    let n = network.junctions.len();
    let mut adjacency: Vec<Vec<NodeRef>> = vec![Vec::new(); n];
    let mut source_adjacency: Vec<Vec<NodeRef>> = vec![Vec::new(); network.sources.len()];
    for pipe in &network.pipes {
        for (a, b) in [(pipe.from, pipe.to), (pipe.to, pipe.from)] {
            match a {
                NodeRef::Junction(i) => adjacency[i].push(b),
                NodeRef::Source(i) => source_adjacency[i].push(b),
            }
        }
    }

    let mut heads = vec![0.0; n];
    let mut reached = vec![false; n];
    let mut queue = VecDeque::new();
    for (i, source) in network.sources.iter().enumerate() {
        for neighbor in &source_adjacency[i] {
            if let NodeRef::Junction(j) = neighbor {
                if !reached[*j] {
                    reached[*j] = true;
                    heads[*j] = source.head_m - 0.5;
                    queue.push_back(*j);
                }
            }
        }
    }
    while let Some(i) = queue.pop_front() {
        for neighbor in &adjacency[i] {
            if let NodeRef::Junction(j) = neighbor {
                if !reached[*j] {
                    reached[*j] = true;
                    heads[*j] = heads[i] - 0.5;
                    queue.push_back(*j);
                }
            }
        }
    }

    let mut disconnected = HashSet::new();
    for (i, junction) in network.junctions.iter().enumerate() {
        if !reached[i] {
            disconnected.insert(i);
            heads[i] = junction.elevation_m;
        }
    }
    (heads, disconnected)
}

fn head_of(network: &HydraulicNetwork, heads: &[f64], node: NodeRef) -> f64 {
    match node {
        NodeRef::Junction(i) => heads[i],
        NodeRef::Source(i) => network.sources[i].head_m,
    }
}

fn assemble_system(
    network: &HydraulicNetwork,
    heads: &[f64],
    disconnected: &HashSet<usize>,
    options: &SolverOptions,
) -> (Vec<f64>, Vec<Vec<f64>>) {
    let n = network.junctions.len();
    let mut residual = vec![0.0; n];
    let mut jacobian = vec![vec![0.0; n]; n];

    let skip = |node: NodeRef| matches!(node, NodeRef::Junction(i) if disconnected.contains(&i));

    for pipe in &network.pipes {
        if skip(pipe.from) || skip(pipe.to) {
            continue;
        }
        let delta_h = head_of(network, heads, pipe.from) - head_of(network, heads, pipe.to);
        let (flow, gradient) = pipe_flow(delta_h, pipe.resistance);

        if let NodeRef::Junction(a) = pipe.from {
            residual[a] -= flow;
            jacobian[a][a] -= gradient;
            if let NodeRef::Junction(b) = pipe.to {
                jacobian[a][b] += gradient;
            }
        }
        if let NodeRef::Junction(b) = pipe.to {
            residual[b] += flow;
            jacobian[b][b] -= gradient;
            if let NodeRef::Junction(a) = pipe.from {
                jacobian[b][a] += gradient;
            }
        }
    }

    for (i, junction) in network.junctions.iter().enumerate() {
        if disconnected.contains(&i) {
            residual[i] = heads[i] - junction.elevation_m;
            jacobian[i][i] = 1.0;
            continue;
        }
        let pressure = heads[i] - junction.elevation_m;
        let (fraction, derivative) =
            wagner_fraction(pressure, options.pressure_min_m, options.pressure_required_m);
        residual[i] -= junction.base_demand_lps * fraction;
        jacobian[i][i] -= junction.base_demand_lps * derivative;
    }

    (residual, jacobian)
}

fn assemble_solution(
    network: &HydraulicNetwork,
    heads: &[f64],
    disconnected: &HashSet<usize>,
    options: &SolverOptions,
    iterations: u32,
    max_mismatch: f64,
) -> SteadySolution {
    let mut heads_m = HashMap::new();
    let mut pressures_m = HashMap::new();
    let mut delivered_lps = HashMap::new();
    let mut supplies_lps: HashMap<String, f64> =
        network.sources.iter().map(|s| (s.id.clone(), 0.0)).collect();
    let mut pipe_flows_lps = HashMap::new();

    for source in &network.sources {
        heads_m.insert(source.id.clone(), source.head_m);
    }
    for (i, junction) in network.junctions.iter().enumerate() {
        let pressure = heads[i] - junction.elevation_m;
        let delivered = if disconnected.contains(&i) {
            0.0
        } else {
            let (fraction, _) =
                wagner_fraction(pressure, options.pressure_min_m, options.pressure_required_m);
            junction.base_demand_lps * fraction
        };
        heads_m.insert(junction.id.clone(), heads[i]);
        pressures_m.insert(junction.id.clone(), pressure);
        delivered_lps.insert(junction.id.clone(), delivered);
    }

    for pipe in &network.pipes {
        let delta_h = head_of(network, heads, pipe.from) - head_of(network, heads, pipe.to);
        let (flow, _) = pipe_flow(delta_h, pipe.resistance);
        pipe_flows_lps.insert(pipe.id.clone(), flow);
        if let NodeRef::Source(i) = pipe.from {
            *supplies_lps
                .get_mut(&network.sources[i].id)
                .expect("source registered above") += flow;
        }
        if let NodeRef::Source(i) = pipe.to {
            *supplies_lps
                .get_mut(&network.sources[i].id)
                .expect("source registered above") -= flow;
        }
    }

    SteadySolution {
        heads_m,
        pressures_m,
        delivered_lps,
        supplies_lps,
        pipe_flows_lps,
        iterations,
        max_mismatch_lps: max_mismatch,
    }
}
