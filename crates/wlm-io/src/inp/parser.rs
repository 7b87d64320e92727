//! EPANET `.inp` text parser
//!
//! Parses the sectioned EPANET input format. Only the sections the water
//! model needs are interpreted ([TITLE], [JUNCTIONS], [RESERVOIRS], [TANKS],
//! [PIPES], [PUMPS], [VALVES], [DEMANDS], [COORDINATES]); everything else is
//! skipped. The format is CR/LF tolerant and `;` starts a comment, either as
//! a full line or trailing a data row. Tolerated oddities are collected as
//! [`InpWarning`]s on the document.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

use wlm_core::{WlmError, WlmResult};

use super::{InpDocument, InpLink, InpNode, InpWarning, LinkKind, NodeSection};

/// Input files above this size are rejected before reading.
pub const MAX_INP_BYTES: u64 = 50 * 1024 * 1024;

/// Parse an `.inp` file from disk, enforcing the size cap.
pub fn parse_inp_file(path: &Path) -> WlmResult<InpDocument> {
    let metadata = fs::metadata(path)?;
    if metadata.len() > MAX_INP_BYTES {
        return Err(WlmError::InvalidInput(format!(
            "input file '{}' is {} bytes, above the {} MiB limit",
            path.display(),
            metadata.len(),
            MAX_INP_BYTES / (1024 * 1024)
        )));
    }
    let content = fs::read_to_string(path)?;
    parse_inp_str(&content)
}

/// Parse `.inp` content from a string.
pub fn parse_inp_str(content: &str) -> WlmResult<InpDocument> {
    let mut doc = InpDocument::default();
    let mut section: Option<String> = None;
    let mut saw_junctions = false;
    let mut saw_pipes = false;
    let mut declared: HashSet<String> = HashSet::new();
    let mut link_ids: HashSet<String> = HashSet::new();
    // Supplementary rows applied after all declarations are in
    let mut extra_demands: Vec<(String, f64, usize)> = Vec::new();
    let mut coordinates: Vec<(String, f64, f64, usize)> = Vec::new();

    for (index, raw) in content.lines().enumerate() {
        let line_no = index + 1;
        let line = strip_comment(raw);
        if line.is_empty() {
            continue;
        }

        if line.starts_with('[') {
            let name = line
                .trim_start_matches('[')
                .split(']')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_uppercase();
            match name.as_str() {
                "JUNCTIONS" => saw_junctions = true,
                "PIPES" => saw_pipes = true,
                _ => {}
            }
            section = Some(name);
            continue;
        }

        let Some(current) = section.as_deref() else {
            // Content before the first section header carries no meaning
            continue;
        };

        match current {
            "TITLE" => {
                if doc.title.is_empty() {
                    doc.title = line.to_string();
                }
            }
            "JUNCTIONS" => {
                parse_node_row(
                    line,
                    line_no,
                    NodeSection::Junction,
                    &mut doc,
                    &mut declared,
                );
            }
            "RESERVOIRS" => {
                parse_node_row(
                    line,
                    line_no,
                    NodeSection::Reservoir,
                    &mut doc,
                    &mut declared,
                );
            }
            "TANKS" => {
                parse_node_row(line, line_no, NodeSection::Tank, &mut doc, &mut declared);
            }
            "PIPES" => {
                parse_link_row(line, line_no, LinkKind::Pipe, &mut doc, &mut link_ids);
            }
            "PUMPS" => {
                parse_link_row(line, line_no, LinkKind::Pump, &mut doc, &mut link_ids);
            }
            "VALVES" => {
                parse_link_row(line, line_no, LinkKind::Valve, &mut doc, &mut link_ids);
            }
            "DEMANDS" => {
                let fields = split_fields(line);
                if fields.len() >= 2 {
                    match fields[1].parse::<f64>() {
                        Ok(demand) => {
                            extra_demands.push((fields[0].to_string(), demand, line_no));
                        }
                        Err(_) => doc.warnings.push(InpWarning::UnparseableNumber {
                            section: "DEMANDS",
                            line: line_no,
                        }),
                    }
                }
            }
            "COORDINATES" => {
                let fields = split_fields(line);
                if fields.len() >= 3 {
                    match (fields[1].parse::<f64>(), fields[2].parse::<f64>()) {
                        (Ok(x), Ok(y)) => {
                            coordinates.push((fields[0].to_string(), x, y, line_no));
                        }
                        _ => doc.warnings.push(InpWarning::UnparseableNumber {
                            section: "COORDINATES",
                            line: line_no,
                        }),
                    }
                }
            }
            // Unknown sections are ignored
            _ => {}
        }
    }

    if !saw_junctions && !saw_pipes {
        return Err(WlmError::InvalidInput(
            "input has neither a [JUNCTIONS] nor a [PIPES] section".into(),
        ));
    }

    // Nodes that only appear as link endpoints still exist in the topology
    for link in doc.links.clone() {
        for endpoint in [&link.from, &link.to] {
            if declared.insert(endpoint.clone()) {
                doc.warnings.push(InpWarning::UndeclaredEndpoint {
                    id: endpoint.clone(),
                });
                doc.nodes.push(InpNode {
                    id: endpoint.clone(),
                    section: NodeSection::Implicit,
                    elevation: None,
                    base_demand: None,
                    head: None,
                    coordinates: None,
                });
            }
        }
    }

    let by_id: HashMap<String, usize> = doc
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.id.clone(), i))
        .collect();

    for (node_id, demand, line_no) in extra_demands {
        match by_id.get(&node_id) {
            Some(&idx) => {
                let node = &mut doc.nodes[idx];
                node.base_demand = Some(node.base_demand.unwrap_or(0.0) + demand);
            }
            None => doc.warnings.push(InpWarning::UnknownDemandNode {
                id: node_id,
                line: line_no,
            }),
        }
    }

    for (node_id, x, y, line_no) in coordinates {
        match by_id.get(&node_id) {
            Some(&idx) => doc.nodes[idx].coordinates = Some((x, y)),
            None => doc.warnings.push(InpWarning::UnknownCoordinateNode {
                id: node_id,
                line: line_no,
            }),
        }
    }

    Ok(doc)
}

/// Drop a trailing `\r`, strip everything from the first `;`, and trim.
fn strip_comment(raw: &str) -> &str {
    let line = raw.trim_end_matches('\r');
    let line = match line.find(';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    line.trim()
}

fn split_fields(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

fn parse_node_row(
    line: &str,
    line_no: usize,
    section: NodeSection,
    doc: &mut InpDocument,
    declared: &mut HashSet<String>,
) {
    let fields = split_fields(line);
    if fields.is_empty() {
        return;
    }
    let id = fields[0].to_string();
    if !declared.insert(id.clone()) {
        doc.warnings.push(InpWarning::DuplicateNode {
            id,
            line: line_no,
        });
        return;
    }

    let first_value = fields.get(1).and_then(|f| f.parse::<f64>().ok());
    let (elevation, head) = match section {
        NodeSection::Reservoir => (None, first_value),
        _ => (first_value, None),
    };
    let base_demand = match section {
        NodeSection::Junction => fields.get(2).and_then(|f| f.parse::<f64>().ok()),
        _ => None,
    };

    doc.nodes.push(InpNode {
        id,
        section,
        elevation,
        base_demand,
        head,
        coordinates: None,
    });
}

fn parse_link_row(
    line: &str,
    line_no: usize,
    kind: LinkKind,
    doc: &mut InpDocument,
    link_ids: &mut HashSet<String>,
) {
    let fields = split_fields(line);
    if fields.len() < 3 {
        doc.warnings
            .push(InpWarning::TruncatedLinkRow { line: line_no });
        return;
    }
    let id = fields[0].to_string();
    if !link_ids.insert(id.clone()) {
        doc.warnings.push(InpWarning::DuplicateLink {
            id,
            line: line_no,
        });
        return;
    }

    let (length, diameter, roughness) = if kind == LinkKind::Pipe {
        (
            fields.get(3).and_then(|f| f.parse::<f64>().ok()),
            fields.get(4).and_then(|f| f.parse::<f64>().ok()),
            fields.get(5).and_then(|f| f.parse::<f64>().ok()),
        )
    } else {
        (None, None, None)
    };

    doc.links.push(InpLink {
        id,
        kind,
        from: fields[1].to_string(),
        to: fields[2].to_string(),
        length,
        diameter,
        roughness,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SMALL_NET: &str = "\
[TITLE]
Two-loop test network

[RESERVOIRS]
;ID    Head
R1     100.0

[JUNCTIONS]
;ID    Elev    Demand
J1     50.0    0.0
J2     48.0    2.5
H1     45.0    1.2

[PIPES]
;ID    Node1  Node2  Length  Diameter  Roughness
P1     R1     J1     1000    300       130
P2     J1     J2     500     200       130
P3     J2     H1     200     100       130

[OPTIONS]
Units LPS
";

    #[test]
    fn test_parse_small_network() {
        let doc = parse_inp_str(SMALL_NET).unwrap();
        assert_eq!(doc.title, "Two-loop test network");
        assert_eq!(doc.nodes.len(), 4);
        assert_eq!(doc.links.len(), 3);
        assert!(doc.warnings.is_empty());

        let r1 = doc.node("R1").unwrap();
        assert_eq!(r1.section, NodeSection::Reservoir);
        assert_eq!(r1.head, Some(100.0));

        let j2 = doc.node("J2").unwrap();
        assert_eq!(j2.elevation, Some(48.0));
        assert_eq!(j2.base_demand, Some(2.5));

        let p1 = &doc.links[0];
        assert_eq!(p1.kind, LinkKind::Pipe);
        assert_eq!((p1.from.as_str(), p1.to.as_str()), ("R1", "J1"));
        assert_eq!(p1.length, Some(1000.0));
    }

    #[test]
    fn test_crlf_and_trailing_comments() {
        let content = "[JUNCTIONS]\r\nJ1 10.0 1.0 ; corner junction\r\n\r\n[PIPES]\r\nP1 J1 J2 100 100 130\r\n";
        let doc = parse_inp_str(content).unwrap();
        assert_eq!(doc.node("J1").unwrap().base_demand, Some(1.0));
        assert_eq!(doc.links.len(), 1);
    }

    #[test]
    fn test_unknown_sections_ignored() {
        let content = "[JUNCTIONS]\nJ1 10.0\n[ENERGY]\nGlobal Efficiency 75\n[REPORT]\nStatus Yes\n";
        let doc = parse_inp_str(content).unwrap();
        assert_eq!(doc.nodes.len(), 1);
        assert!(doc.links.is_empty());
    }

    #[test]
    fn test_missing_required_sections() {
        let err = parse_inp_str("[TITLE]\nempty\n[OPTIONS]\nUnits LPS\n").unwrap_err();
        assert!(matches!(err, WlmError::InvalidInput(_)));
    }

    #[test]
    fn test_implicit_nodes_from_link_endpoints() {
        let content = "[PIPES]\nP1 A B 100 100 130\n";
        let doc = parse_inp_str(content).unwrap();
        assert_eq!(doc.nodes.len(), 2);
        assert!(doc
            .nodes
            .iter()
            .all(|n| n.section == NodeSection::Implicit));
        assert_eq!(doc.warnings.len(), 2);
        assert!(doc
            .warnings
            .iter()
            .all(|w| matches!(w, InpWarning::UndeclaredEndpoint { .. })));
    }

    #[test]
    fn test_demands_fold_into_base_demand() {
        let content = "\
[JUNCTIONS]
J1 10.0 1.0

[PIPES]
P1 J1 J2 100 100 130

[DEMANDS]
J1 0.5
J1 0.25
";
        let doc = parse_inp_str(content).unwrap();
        assert_eq!(doc.node("J1").unwrap().base_demand, Some(1.75));
    }

    #[test]
    fn test_unknown_demand_node_flagged() {
        let content = "[JUNCTIONS]\nJ1 10.0\n\n[DEMANDS]\nGHOST 2.0\n";
        let doc = parse_inp_str(content).unwrap();
        assert_eq!(
            doc.warnings,
            vec![InpWarning::UnknownDemandNode {
                id: "GHOST".into(),
                line: 5
            }]
        );
    }

    #[test]
    fn test_coordinates_attach() {
        let content = "\
[JUNCTIONS]
J1 10.0

[COORDINATES]
J1 12.5 -3.25
";
        let doc = parse_inp_str(content).unwrap();
        assert_eq!(doc.node("J1").unwrap().coordinates, Some((12.5, -3.25)));
    }

    #[test]
    fn test_duplicate_node_flagged() {
        let content = "[JUNCTIONS]\nJ1 10.0\nJ1 12.0\n";
        let doc = parse_inp_str(content).unwrap();
        assert_eq!(doc.nodes.len(), 1);
        assert_eq!(
            doc.warnings,
            vec![InpWarning::DuplicateNode {
                id: "J1".into(),
                line: 3
            }]
        );
        assert_eq!(doc.warnings[0].line(), Some(3));
        assert_eq!(doc.node("J1").unwrap().elevation, Some(10.0));
    }

    #[test]
    fn test_truncated_link_row_flagged() {
        let content = "[JUNCTIONS]\nJ1 10.0\n\n[PIPES]\nP1 J1\n";
        let doc = parse_inp_str(content).unwrap();
        assert!(doc.links.is_empty());
        assert_eq!(
            doc.warnings,
            vec![InpWarning::TruncatedLinkRow { line: 5 }]
        );
    }

    #[test]
    fn test_file_size_cap() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[JUNCTIONS]\nJ1 10.0").unwrap();
        // Small files parse through the path-based entry
        let doc = parse_inp_file(file.path()).unwrap();
        assert_eq!(doc.nodes.len(), 1);
        assert!(MAX_INP_BYTES == 50 * 1024 * 1024);
    }
}
