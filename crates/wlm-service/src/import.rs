//! EPANET import workflow: parse, classify, persist, store, partition.
//!
//! The persistence phase (network, nodes, DMAs) runs under a five-minute
//! timeout; the count of tolerated parser warnings rides along in the
//! report so hosts can surface skipped rows without failing the import.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use wlm_core::{
    missing_dmas, Network, NetworkId, NetworkNode, NodeId, Partition, Stores, Topology,
    WlmError, WlmResult,
};
use wlm_io::{infer_roles, parse_inp_str, InpStorage};

/// Budget for the import write-through.
pub const IMPORT_PERSIST_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of one `.inp` import.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub status: String,
    pub network_id: NetworkId,
    pub nodes_imported: usize,
    pub links_imported: usize,
    pub dmas_created: usize,
    pub parse_warnings: usize,
}

/// Imports networks from EPANET text into the repositories.
pub struct ImportService {
    stores: Stores,
    storage: InpStorage,
}

impl ImportService {
    pub fn new(stores: Stores, storage: InpStorage) -> Self {
        Self { stores, storage }
    }

    /// Import an `.inp` document: build the hierarchy, persist it, store
    /// the raw text for the simulator, and create missing DMAs.
    pub async fn import_epanet(
        &self,
        name: Option<String>,
        inp_text: &str,
    ) -> WlmResult<ImportReport> {
        let doc = parse_inp_str(inp_text)?;
        let classified = infer_roles(&doc);
        let links_imported = doc.links.len();
        let parse_warnings = doc.warnings.len();

        let network = Network::new(name);
        let network_id = network.id;

        // First pass mints ids, second pass wires parents by label
        let mut nodes: Vec<NetworkNode> = classified
            .iter()
            .map(|c| {
                let mut node = NetworkNode::new(network_id, c.id.clone(), c.role)
                    .with_epanet_id(c.id.clone());
                if let Some((x, y)) = c.coordinates {
                    node = node.with_location(x, y);
                }
                node
            })
            .collect();
        let id_by_label: HashMap<&str, NodeId> = classified
            .iter()
            .zip(nodes.iter())
            .map(|(c, n)| (c.id.as_str(), n.id))
            .collect();
        for (node, class) in nodes.iter_mut().zip(classified.iter()) {
            if let Some(parent_label) = &class.parent {
                node.parent_id = id_by_label.get(parent_label.as_str()).copied();
            }
        }
        let nodes_imported = nodes.len();

        // Reject structural breakage before anything is written
        Topology::from_nodes(network_id, nodes.clone())?;

        let stores = self.stores.clone();
        let persisted = tokio::time::timeout(IMPORT_PERSIST_TIMEOUT, async move {
            stores.networks.insert_network(network).await?;
            stores.nodes.insert_nodes(nodes).await?;
            create_dmas_for_mainlines(&stores, network_id).await
        })
        .await
        .map_err(|_| {
            WlmError::Other(format!(
                "import persistence exceeded {}s",
                IMPORT_PERSIST_TIMEOUT.as_secs()
            ))
        })?;
        let dmas_created = persisted?;

        self.storage.save(network_id, inp_text)?;

        info!(
            network = %network_id,
            nodes = nodes_imported,
            links = links_imported,
            dmas = dmas_created,
            "network imported"
        );
        Ok(ImportReport {
            status: "success".to_string(),
            network_id,
            nodes_imported,
            links_imported,
            dmas_created,
            parse_warnings,
        })
    }
}

/// Idempotently create one partition per mainline that lacks one, labelled
/// `DMA_<mainline label>`. Returns how many were created.
pub async fn create_dmas_for_mainlines(stores: &Stores, network: NetworkId) -> WlmResult<usize> {
    let topology = stores.topology(network).await?;
    let existing = stores.partitions.partitions_of(network).await?;
    let mut created = 0;
    for mainline in missing_dmas(&topology, &existing) {
        let partition = Partition::new(network, mainline.id, &mainline.label);
        stores.partitions.insert_partition(partition).await?;
        created += 1;
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wlm_core::NodeKind;

    const SMALL_NET: &str = "\
[RESERVOIRS]
R1 100.0

[JUNCTIONS]
J1 50.0 0.0
H1 45.0 1.5
H2 44.0 0.8

[PIPES]
P1 R1 J1 1000 300 130
P2 J1 H1 100 100 130
P3 J1 H2 100 100 130
";

    fn service() -> (ImportService, Stores, tempfile::TempDir) {
        let stores = Stores::in_memory();
        let dir = tempfile::tempdir().unwrap();
        let storage = InpStorage::new(dir.path());
        (ImportService::new(stores.clone(), storage), stores, dir)
    }

    #[tokio::test]
    async fn test_import_builds_topology_and_dmas() {
        let (service, stores, _dir) = service();
        let report = service
            .import_epanet(Some("demo".into()), SMALL_NET)
            .await
            .unwrap();

        assert_eq!(report.status, "success");
        assert_eq!(report.nodes_imported, 4);
        assert_eq!(report.links_imported, 3);
        assert_eq!(report.dmas_created, 1);

        let nodes = stores.nodes.nodes_of(report.network_id).await.unwrap();
        let r1 = nodes.iter().find(|n| n.label == "R1").unwrap();
        assert_eq!(r1.kind, NodeKind::Mainline);
        assert_eq!(r1.epanet_id.as_deref(), Some("R1"));
        let h1 = nodes.iter().find(|n| n.label == "H1").unwrap();
        assert_eq!(h1.kind, NodeKind::Household);
        let j1 = nodes.iter().find(|n| n.label == "J1").unwrap();
        assert_eq!(h1.parent_id, Some(j1.id));

        let partitions = stores.partitions.partitions_of(report.network_id).await.unwrap();
        assert_eq!(partitions.len(), 1);
        assert_eq!(partitions[0].label, "DMA_R1");
        assert_eq!(partitions[0].mainline_id, r1.id);
    }

    #[tokio::test]
    async fn test_import_stores_inp_for_simulator() {
        let stores = Stores::in_memory();
        let dir = tempfile::tempdir().unwrap();
        let storage = InpStorage::new(dir.path());
        let service = ImportService::new(stores, storage.clone());

        let report = service.import_epanet(None, SMALL_NET).await.unwrap();
        assert!(storage.exists(report.network_id));
        assert_eq!(storage.load(report.network_id).unwrap(), SMALL_NET);
    }

    #[tokio::test]
    async fn test_dma_creation_is_idempotent() {
        let (service, stores, _dir) = service();
        let report = service.import_epanet(None, SMALL_NET).await.unwrap();

        let again = create_dmas_for_mainlines(&stores, report.network_id)
            .await
            .unwrap();
        assert_eq!(again, 0);
        let partitions = stores.partitions.partitions_of(report.network_id).await.unwrap();
        assert_eq!(partitions.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_input_rejected() {
        let (service, ..) = service();
        let err = service
            .import_epanet(None, "[OPTIONS]\nUnits LPS\n")
            .await
            .unwrap_err();
        assert!(matches!(err, WlmError::InvalidInput(_)));
    }
}
