//! EPANET `.inp` parsing and role inference.

mod parser;
mod roles;

pub use parser::{parse_inp_file, parse_inp_str, MAX_INP_BYTES};
pub use roles::{infer_roles, ClassifiedNode};

/// Which section a node was declared in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSection {
    Junction,
    Reservoir,
    Tank,
    /// Never declared; appears only as a link endpoint
    Implicit,
}

/// Kind of a directed link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Pipe,
    Pump,
    Valve,
}

/// A non-fatal finding from parsing one `.inp` document.
///
/// The parser keeps going past all of these (offending rows are skipped,
/// implicit nodes are synthesized); only a missing `[JUNCTIONS]`/`[PIPES]`
/// pair or an oversized file aborts the parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InpWarning {
    /// A node id was declared twice; the later row is ignored
    DuplicateNode { id: String, line: usize },
    /// A link id was declared twice; the later row is ignored
    DuplicateLink { id: String, line: usize },
    /// A link row without id, from-node, and to-node
    TruncatedLinkRow { line: usize },
    /// A numeric field that did not parse; the row is skipped
    UnparseableNumber { section: &'static str, line: usize },
    /// A `[DEMANDS]` row naming a node that was never declared
    UnknownDemandNode { id: String, line: usize },
    /// A `[COORDINATES]` row naming a node that was never declared
    UnknownCoordinateNode { id: String, line: usize },
    /// A link endpoint with no declaration anywhere; synthesized as a node
    UndeclaredEndpoint { id: String },
}

impl InpWarning {
    /// Line the warning points at, when it came from a specific row.
    pub fn line(&self) -> Option<usize> {
        match self {
            InpWarning::DuplicateNode { line, .. }
            | InpWarning::DuplicateLink { line, .. }
            | InpWarning::TruncatedLinkRow { line }
            | InpWarning::UnparseableNumber { line, .. }
            | InpWarning::UnknownDemandNode { line, .. }
            | InpWarning::UnknownCoordinateNode { line, .. } => Some(*line),
            InpWarning::UndeclaredEndpoint { .. } => None,
        }
    }
}

impl std::fmt::Display for InpWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InpWarning::DuplicateNode { id, line } => {
                write!(f, "line {line}: node '{id}' declared more than once")
            }
            InpWarning::DuplicateLink { id, line } => {
                write!(f, "line {line}: link '{id}' declared more than once")
            }
            InpWarning::TruncatedLinkRow { line } => {
                write!(f, "line {line}: link row needs id, from-node, and to-node")
            }
            InpWarning::UnparseableNumber { section, line } => {
                write!(f, "line {line}: unparseable number in [{section}] row")
            }
            InpWarning::UnknownDemandNode { id, line } => {
                write!(f, "line {line}: [DEMANDS] row references unknown node '{id}'")
            }
            InpWarning::UnknownCoordinateNode { id, line } => {
                write!(
                    f,
                    "line {line}: [COORDINATES] row references unknown node '{id}'"
                )
            }
            InpWarning::UndeclaredEndpoint { id } => {
                write!(
                    f,
                    "node '{id}' appears only as a link endpoint; treated as implicit"
                )
            }
        }
    }
}

/// A node as declared (or implied) by the input file.
#[derive(Debug, Clone)]
pub struct InpNode {
    pub id: String,
    pub section: NodeSection,
    /// Ground elevation in meters (junctions, tanks)
    pub elevation: Option<f64>,
    /// Base demand in L/s, [DEMANDS] rows folded in
    pub base_demand: Option<f64>,
    /// Fixed hydraulic head in meters (reservoirs)
    pub head: Option<f64>,
    pub coordinates: Option<(f64, f64)>,
}

/// A directed link between two nodes.
#[derive(Debug, Clone)]
pub struct InpLink {
    pub id: String,
    pub kind: LinkKind,
    pub from: String,
    pub to: String,
    /// Pipe length in meters
    pub length: Option<f64>,
    /// Pipe diameter in millimeters
    pub diameter: Option<f64>,
    /// Hazen-Williams roughness coefficient
    pub roughness: Option<f64>,
}

/// Parsed `.inp` content: ordered nodes, directed links, and whatever the
/// parser had to tolerate along the way.
#[derive(Debug, Default)]
pub struct InpDocument {
    pub title: String,
    pub nodes: Vec<InpNode>,
    pub links: Vec<InpLink>,
    pub warnings: Vec<InpWarning>,
}

impl InpDocument {
    pub fn node(&self, id: &str) -> Option<&InpNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn pipes(&self) -> impl Iterator<Item = &InpLink> {
        self.links.iter().filter(|l| l.kind == LinkKind::Pipe)
    }
}
