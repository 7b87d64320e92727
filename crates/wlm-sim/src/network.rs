//! Hydraulic model assembled from a parsed `.inp` document.
//!
//! The model separates **sources** (fixed hydraulic head: reservoirs, plus
//! any node water can only leave) from **junctions** (unknown head, optional
//! base demand). Pipes carry a Hazen-Williams resistance precomputed so that
//! head loss is `r · Q^1.852` with `Q` in L/s. Pumps and valves participate
//! as low-resistance connectors; head curves are outside the steady model.

use std::collections::{HashMap, HashSet};

use wlm_io::{InpDocument, LinkKind, NodeSection};
use wlm_core::{WlmError, WlmResult};

/// Hazen-Williams head-loss exponent.
pub const HW_EXPONENT: f64 = 1.852;

pub const DEFAULT_PIPE_LENGTH_M: f64 = 100.0;
pub const DEFAULT_PIPE_DIAMETER_MM: f64 = 100.0;
pub const DEFAULT_ROUGHNESS: f64 = 130.0;
/// Head margin above ground applied to sources that declare no head.
pub const DEFAULT_SOURCE_PRESSURE_M: f64 = 50.0;
/// Stand-in resistance for pumps/valves (near-lossless connectors).
const CONNECTOR_RESISTANCE: f64 = 1e-6;

/// Reference into the node arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRef {
    Junction(usize),
    Source(usize),
}

#[derive(Debug, Clone)]
pub struct Junction {
    pub id: String,
    pub elevation_m: f64,
    pub base_demand_lps: f64,
}

#[derive(Debug, Clone)]
pub struct Source {
    pub id: String,
    pub head_m: f64,
}

#[derive(Debug, Clone)]
pub struct Pipe {
    pub id: String,
    pub from: NodeRef,
    pub to: NodeRef,
    /// Head loss coefficient: `h = resistance · Q^1.852`, Q in L/s
    pub resistance: f64,
}

/// The assembled steady-state model.
#[derive(Debug, Clone)]
pub struct HydraulicNetwork {
    pub junctions: Vec<Junction>,
    pub sources: Vec<Source>,
    pub pipes: Vec<Pipe>,
    index: HashMap<String, NodeRef>,
}

impl HydraulicNetwork {
    /// Build the model from a parsed document.
    ///
    /// Reservoirs, and nodes no link flows into, become fixed-head sources;
    /// everything else (tanks included) is a junction. Fails with
    /// `InvalidInput` when the document yields no supply source.
    pub fn from_document(doc: &InpDocument) -> WlmResult<Self> {
        let mut has_incoming: HashSet<&str> = HashSet::new();
        for link in &doc.links {
            has_incoming.insert(link.to.as_str());
        }

        let mut junctions = Vec::new();
        let mut sources = Vec::new();
        let mut index = HashMap::new();

        for node in &doc.nodes {
            let is_source = node.section == NodeSection::Reservoir
                || !has_incoming.contains(node.id.as_str());
            if is_source {
                let head = node.head.unwrap_or_else(|| {
                    node.elevation.unwrap_or(0.0) + DEFAULT_SOURCE_PRESSURE_M
                });
                index.insert(node.id.clone(), NodeRef::Source(sources.len()));
                sources.push(Source {
                    id: node.id.clone(),
                    head_m: head,
                });
            } else {
                index.insert(node.id.clone(), NodeRef::Junction(junctions.len()));
                junctions.push(Junction {
                    id: node.id.clone(),
                    elevation_m: node.elevation.unwrap_or(0.0),
                    base_demand_lps: node.base_demand.unwrap_or(0.0),
                });
            }
        }

        if sources.is_empty() {
            return Err(WlmError::InvalidInput(
                "network has no supply source (reservoir or root node)".into(),
            ));
        }

        let mut pipes = Vec::new();
        for link in &doc.links {
            let from = *index.get(&link.from).ok_or_else(|| {
                WlmError::InvalidInput(format!("link '{}' references unknown node", link.id))
            })?;
            let to = *index.get(&link.to).ok_or_else(|| {
                WlmError::InvalidInput(format!("link '{}' references unknown node", link.id))
            })?;
            let resistance = match link.kind {
                LinkKind::Pipe => hazen_williams_resistance(
                    link.length.filter(|v| *v > 0.0).unwrap_or(DEFAULT_PIPE_LENGTH_M),
                    link.diameter
                        .filter(|v| *v > 0.0)
                        .unwrap_or(DEFAULT_PIPE_DIAMETER_MM),
                    link.roughness
                        .filter(|v| *v > 0.0)
                        .unwrap_or(DEFAULT_ROUGHNESS),
                ),
                LinkKind::Pump | LinkKind::Valve => CONNECTOR_RESISTANCE,
            };
            pipes.push(Pipe {
                id: link.id.clone(),
                from,
                to,
                resistance,
            });
        }

        Ok(Self {
            junctions,
            sources,
            pipes,
            index,
        })
    }

    pub fn node_ref(&self, id: &str) -> Option<NodeRef> {
        self.index.get(id).copied()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Base demand of a junction node; fixed-head nodes carry none.
    pub fn base_demand(&self, id: &str) -> WlmResult<f64> {
        match self.node_ref(id) {
            Some(NodeRef::Junction(idx)) => Ok(self.junctions[idx].base_demand_lps),
            Some(NodeRef::Source(_)) => Err(WlmError::InvalidInput(format!(
                "node '{id}' is a fixed-head source and has no demand"
            ))),
            None => Err(WlmError::NotFound(format!("node '{id}' not in model"))),
        }
    }

    pub fn set_base_demand(&mut self, id: &str, demand_lps: f64) -> WlmResult<()> {
        match self.node_ref(id) {
            Some(NodeRef::Junction(idx)) => {
                self.junctions[idx].base_demand_lps = demand_lps;
                Ok(())
            }
            Some(NodeRef::Source(_)) => Err(WlmError::InvalidInput(format!(
                "node '{id}' is a fixed-head source and has no demand"
            ))),
            None => Err(WlmError::NotFound(format!("node '{id}' not in model"))),
        }
    }

    pub fn total_base_demand_lps(&self) -> f64 {
        self.junctions.iter().map(|j| j.base_demand_lps).sum()
    }
}

/// Hazen-Williams resistance for `h = r · Q^1.852` with Q in L/s.
///
/// `10.67 · L / (C^1.852 · d^4.871)` in SI (Q in m³/s, d in m), folded with
/// the L/s conversion factor `(10⁻³)^1.852`.
pub fn hazen_williams_resistance(length_m: f64, diameter_mm: f64, roughness: f64) -> f64 {
    let diameter_m = diameter_mm / 1000.0;
    let si = 10.67 * length_m / (roughness.powf(HW_EXPONENT) * diameter_m.powf(4.871));
    si * 1e-3_f64.powf(HW_EXPONENT)
}
