//! Hierarchy role inference over a parsed `.inp` document.
//!
//! Rules are applied in a fixed order so imports are reproducible:
//! 1. no incoming link, or declared a reservoir → MAINLINE
//! 2. remaining nodes with declared demand > 0 → HOUSEHOLD
//! 3. remaining nodes with fan-out ≥ 2, or declared in [JUNCTIONS] → JUNCTION
//! 4. everything else → BRANCH
//!
//! The parent of a non-mainline node is the source of its first incoming
//! link; links are ordered lexicographically by id first, so both the parent
//! choice and the output order never depend on file layout quirks.

use std::collections::HashMap;

use wlm_core::NodeKind;

use super::{InpDocument, InpLink, NodeSection};

/// A node with its inferred hierarchy role and parent label.
#[derive(Debug, Clone)]
pub struct ClassifiedNode {
    pub id: String,
    pub role: NodeKind,
    pub parent: Option<String>,
    pub elevation: Option<f64>,
    /// Declared consumption in L/s (0 when none was declared)
    pub demand_lps: f64,
    pub coordinates: Option<(f64, f64)>,
}

/// Classify every node of the document, preserving declaration order.
pub fn infer_roles(doc: &InpDocument) -> Vec<ClassifiedNode> {
    let mut links: Vec<&InpLink> = doc.links.iter().collect();
    links.sort_by(|a, b| a.id.cmp(&b.id));

    let mut incoming: HashMap<&str, Vec<&InpLink>> = HashMap::new();
    let mut fan_out: HashMap<&str, usize> = HashMap::new();
    for link in &links {
        incoming.entry(link.to.as_str()).or_default().push(link);
        *fan_out.entry(link.from.as_str()).or_insert(0) += 1;
    }

    doc.nodes
        .iter()
        .map(|node| {
            let id = node.id.as_str();
            let demand = node.base_demand.unwrap_or(0.0);
            let has_incoming = incoming.contains_key(id);
            let out_degree = fan_out.get(id).copied().unwrap_or(0);

            let role = if !has_incoming || node.section == NodeSection::Reservoir {
                NodeKind::Mainline
            } else if demand > 0.0 {
                NodeKind::Household
            } else if out_degree >= 2 || node.section == NodeSection::Junction {
                NodeKind::Junction
            } else {
                NodeKind::Branch
            };

            // Mainlines are forest roots regardless of stray upstream links
            let parent = if role == NodeKind::Mainline {
                None
            } else {
                incoming.get(id).map(|inc| inc[0].from.clone())
            };

            ClassifiedNode {
                id: node.id.clone(),
                role,
                parent,
                elevation: node.elevation,
                demand_lps: demand,
                coordinates: node.coordinates,
            }
        })
        .collect()
}
