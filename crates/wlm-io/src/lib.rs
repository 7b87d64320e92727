//! EPANET `.inp` import for wlm.
//!
//! Parses the text format into an [`inp::InpDocument`], infers hierarchy
//! roles for every node, and manages the per-network `.inp` storage
//! directory that the hydraulic engine loads from.

pub mod inp;
pub mod storage;

pub use inp::{
    infer_roles, parse_inp_file, parse_inp_str, ClassifiedNode, InpDocument, InpLink, InpNode,
    InpWarning, LinkKind, NodeSection, MAX_INP_BYTES,
};
pub use storage::InpStorage;
