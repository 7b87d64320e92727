//! # wlm-sim: Steady-State Hydraulic Simulation
//!
//! Solves a water network to steady state and exposes the simulator seam
//! the sensitivity engine drives: load a stored `.inp`, solve a baseline,
//! solve leak-perturbed variants, read sensor-node flows.
//!
//! ## Layers
//!
//! - [`network`] - the hydraulic model assembled from a parsed `.inp`
//! - [`solver`] - Newton iteration on junction heads with
//!   pressure-sensitive (Wagner) demands; each correction is a dense
//!   faer LU solve of the assembled Jacobian
//! - [`engine`] - the [`engine::HydraulicEngine`] trait, the built-in
//!   [`engine::NativeEngine`], and the async [`engine::SimSession`] with
//!   per-solve timeouts and load retry
//!
//! Delivered demand depends on available pressure, so a synthetic leak at
//! one node shifts the whole pressure field and with it the flows every
//! other sensor sees; that coupling is what the sensitivity matrix measures.

pub mod engine;
pub mod network;
pub mod solver;

pub use engine::{
    EngineSession, HydraulicEngine, NativeEngine, SimSession, SimulatorAdapter, LOAD_ATTEMPTS,
    LOAD_BACKOFF, SOLVE_TIMEOUT,
};
pub use network::{hazen_williams_resistance, HydraulicNetwork, NodeRef};
pub use solver::{solve_steady, SolverOptions, SteadySolution};
