//! Asynchronous sensitivity matrix build.
//!
//! One build at a time per process. The build task owns a pool of simulator
//! sessions (one per worker), computes the baseline vector exactly once,
//! then fans candidates out under a semaphore of [`PARALLEL_SIMULATIONS`].
//! A failing candidate is logged and skipped; only a setup failure (session
//! pool, baseline) fails the build as a whole. Entries are upserted in
//! batches of [`PERSIST_BATCH_SIZE`], and every opened session is closed
//! once on every exit path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::future;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

use wlm_core::{NetworkId, NodeId, SensitivityEntry, SensorId, Stores, WlmError, WlmResult};
use wlm_io::InpStorage;
use wlm_sim::{SimSession, SimulatorAdapter};

use super::matrix::SensitivityMatrix;
use super::status::{BuildCoordinator, BuildState, MatrixBuildStatus, MatrixStats};

/// Synthetic leak size applied per candidate, L/s.
pub const UNIT_LEAK_LPS: f64 = 1.0;
/// Upper bound on concurrently running leak simulations.
pub const PARALLEL_SIMULATIONS: usize = 5;
/// Entries per persistence upsert.
pub const PERSIST_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone)]
struct Candidate {
    node_id: NodeId,
    label: String,
    epanet_id: String,
}

#[derive(Debug, Clone)]
struct SensorRef {
    sensor_id: SensorId,
    epanet_id: String,
}

/// Orchestrates matrix generation for one process.
pub struct SensitivityEngine {
    stores: Stores,
    adapter: SimulatorAdapter,
    storage: InpStorage,
    coordinator: BuildCoordinator,
}

impl SensitivityEngine {
    pub fn new(stores: Stores, adapter: SimulatorAdapter, storage: InpStorage) -> Self {
        Self {
            stores,
            adapter,
            storage,
            coordinator: BuildCoordinator::new(),
        }
    }

    pub fn coordinator(&self) -> &BuildCoordinator {
        &self.coordinator
    }

    /// Live build status.
    pub async fn status(&self) -> MatrixBuildStatus {
        self.coordinator.snapshot().await
    }

    /// Materialize the persisted matrix of a network.
    pub async fn matrix(&self, network: NetworkId) -> WlmResult<SensitivityMatrix> {
        let entries = self.stores.sensitivity.entries_of(network).await?;
        Ok(SensitivityMatrix::from_entries(&entries))
    }

    /// Start (or reuse) a matrix build.
    ///
    /// - build already running → its live status, no new build
    /// - matrix exists and `force` is false → `Completed` immediately
    /// - zero candidates or zero usable sensors → `InvalidInput`
    /// - otherwise the build is spawned and `InProgress` returned
    pub async fn generate(
        &self,
        network: NetworkId,
        force: bool,
    ) -> WlmResult<MatrixBuildStatus> {
        let current = self.coordinator.snapshot().await;
        if current.state == BuildState::InProgress {
            return Ok(current);
        }

        if !force && self.stores.sensitivity.has_entries(network).await? {
            // Derived from this network's entries, not the last build's
            // snapshot: the coordinator is process-wide
            return self.completed_status(network).await;
        }

        let (candidates, sensors) = self.resolve_inputs(network).await?;
        if !self.storage.exists(network) {
            return Err(WlmError::NotFound(format!(
                "no stored network input file for {network}"
            )));
        }

        let total = candidates.len();
        if !self.coordinator.try_begin(total).await {
            return Ok(self.coordinator.snapshot().await);
        }

        info!(
            network = %network,
            candidates = total,
            sensors = sensors.len(),
            "starting sensitivity matrix build"
        );
        let context = BuildContext {
            stores: self.stores.clone(),
            adapter: self.adapter.clone(),
            coordinator: self.coordinator.clone(),
            network,
            inp_path: self.storage.path_for(network),
            candidates,
            sensors,
        };
        tokio::spawn(run_build(context));

        Ok(self.coordinator.snapshot().await)
    }

    async fn completed_status(&self, network: NetworkId) -> WlmResult<MatrixBuildStatus> {
        let entries = self.stores.sensitivity.entries_of(network).await?;
        let matrix = SensitivityMatrix::from_entries(&entries);
        Ok(MatrixBuildStatus {
            state: BuildState::Completed,
            progress: None,
            stats: Some(MatrixStats {
                candidates: matrix.num_candidates(),
                sensors: matrix.num_sensors(),
                total_entries: entries.len(),
                generated_at: Utc::now(),
            }),
            error: None,
        })
    }

    /// Candidate leak nodes (non-mainline, EPANET-tagged) and active sensors
    /// hosted on EPANET-tagged nodes.
    async fn resolve_inputs(
        &self,
        network: NetworkId,
    ) -> WlmResult<(Vec<Candidate>, Vec<SensorRef>)> {
        let nodes = self.stores.nodes.nodes_of(network).await?;

        let candidates: Vec<Candidate> = nodes
            .iter()
            .filter(|n| n.kind.is_leak_candidate())
            .filter_map(|n| {
                n.epanet_id.as_ref().map(|epanet| Candidate {
                    node_id: n.id,
                    label: n.label.clone(),
                    epanet_id: epanet.clone(),
                })
            })
            .collect();
        if candidates.is_empty() {
            return Err(WlmError::InvalidInput(format!(
                "network {network} has no candidate leak nodes with EPANET ids"
            )));
        }

        let epanet_by_node: HashMap<NodeId, &String> = nodes
            .iter()
            .filter_map(|n| n.epanet_id.as_ref().map(|e| (n.id, e)))
            .collect();
        let sensors: Vec<SensorRef> = self
            .stores
            .sensors
            .active_sensors_of(network)
            .await?
            .into_iter()
            .filter_map(|s| {
                epanet_by_node.get(&s.node_id).map(|epanet| SensorRef {
                    sensor_id: s.id,
                    epanet_id: (*epanet).clone(),
                })
            })
            .collect();
        if sensors.is_empty() {
            return Err(WlmError::InvalidInput(format!(
                "network {network} has no active sensors on EPANET-tagged nodes"
            )));
        }

        Ok((candidates, sensors))
    }
}

struct BuildContext {
    stores: Stores,
    adapter: SimulatorAdapter,
    coordinator: BuildCoordinator,
    network: NetworkId,
    inp_path: PathBuf,
    candidates: Vec<Candidate>,
    sensors: Vec<SensorRef>,
}

async fn run_build(context: BuildContext) {
    let network = context.network;
    match build_matrix(&context).await {
        Ok(stats) => {
            info!(
                network = %network,
                entries = stats.total_entries,
                "sensitivity matrix build completed"
            );
            context.coordinator.complete(stats).await;
        }
        Err(err) => {
            error!(network = %network, error = %err, "sensitivity matrix build failed");
            context.coordinator.fail(err.to_string()).await;
        }
    }
}

async fn build_matrix(context: &BuildContext) -> WlmResult<MatrixStats> {
    let pool_size = PARALLEL_SIMULATIONS.min(context.candidates.len()).max(1);
    let mut sessions = Vec::with_capacity(pool_size);
    for _ in 0..pool_size {
        sessions.push(context.adapter.open(&context.inp_path).await?);
    }

    let pool = Arc::new(Mutex::new(sessions));
    let outcome = run_candidates(context, pool.clone()).await;

    // Close every opened session exactly here, success or failure
    for session in pool.lock().await.iter_mut() {
        session.close();
    }

    outcome
}

async fn run_candidates(
    context: &BuildContext,
    pool: Arc<Mutex<Vec<SimSession>>>,
) -> WlmResult<MatrixStats> {
    let sensor_epanet: Vec<String> = context
        .sensors
        .iter()
        .map(|s| s.epanet_id.clone())
        .collect();

    // Baseline vector, computed once; failure here is fatal to the build
    let baseline = {
        let mut sessions = pool.lock().await;
        let session = sessions.first_mut().expect("session pool is non-empty");
        session.baseline(&sensor_epanet).await?
    };

    let total = context.candidates.len();
    let worker_count = pool.lock().await.len();
    let semaphore = Arc::new(Semaphore::new(worker_count));
    let mut processed = 0usize;
    let mut pending: Vec<SensitivityEntry> = Vec::new();

    for chunk in context.candidates.chunks(PARALLEL_SIMULATIONS) {
        let simulations = chunk.iter().map(|candidate| {
            let semaphore = semaphore.clone();
            let pool = pool.clone();
            let adapter = context.adapter.clone();
            let inp_path = context.inp_path.clone();
            let sensor_epanet = sensor_epanet.clone();
            let candidate = candidate.clone();
            async move {
                let _permit = semaphore
                    .acquire()
                    .await
                    .expect("semaphore is never closed");
                let mut session = pool
                    .lock()
                    .await
                    .pop()
                    .expect("pool holds one session per permit");
                let result = session
                    .with_leak(&candidate.epanet_id, UNIT_LEAK_LPS, &sensor_epanet)
                    .await;
                if !session.is_open() {
                    // A timed-out solve abandons its engine; replace it so
                    // later candidates are not starved
                    match adapter.open(&inp_path).await {
                        Ok(fresh) => session = fresh,
                        Err(err) => {
                            warn!(error = %err, "could not replace lost simulator session");
                        }
                    }
                }
                pool.lock().await.push(session);
                (candidate, result)
            }
        });

        for (candidate, result) in future::join_all(simulations).await {
            processed += 1;
            match result {
                Ok(readings) => append_entries(
                    context.network,
                    &candidate,
                    &context.sensors,
                    &baseline,
                    &readings,
                    &mut pending,
                ),
                Err(err) => {
                    warn!(
                        candidate = %candidate.label,
                        error = %err,
                        "leak simulation failed; candidate skipped"
                    );
                }
            }
        }

        while pending.len() >= PERSIST_BATCH_SIZE {
            let batch: Vec<SensitivityEntry> =
                pending.drain(..PERSIST_BATCH_SIZE).collect();
            context.stores.sensitivity.upsert_entries(batch).await?;
        }
        context.coordinator.record_progress(processed, total).await;
    }

    if !pending.is_empty() {
        context.stores.sensitivity.upsert_entries(pending).await?;
    }

    let total_entries = context.stores.sensitivity.entry_count(context.network).await?;
    Ok(MatrixStats {
        candidates: total,
        sensors: context.sensors.len(),
        total_entries,
        generated_at: Utc::now(),
    })
}

/// Sensitivity per sensor: `(d_c[s] − b[s]) / L`, zero when `L ≤ 0`.
fn append_entries(
    network: NetworkId,
    candidate: &Candidate,
    sensors: &[SensorRef],
    baseline: &HashMap<String, f64>,
    readings: &HashMap<String, f64>,
    pending: &mut Vec<SensitivityEntry>,
) {
    for sensor in sensors {
        let Some(base) = baseline.get(&sensor.epanet_id) else {
            continue;
        };
        let Some(with_leak) = readings
            .get(&sensor.epanet_id)
            .filter(|v| v.is_finite())
        else {
            continue;
        };
        let value = if UNIT_LEAK_LPS > 0.0 {
            (with_leak - base) / UNIT_LEAK_LPS
        } else {
            0.0
        };
        if !value.is_finite() {
            continue;
        }
        pending.push(SensitivityEntry {
            network_id: network,
            leak_node_id: candidate.node_id,
            sensor_id: sensor.sensor_id,
            value,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use wlm_core::{NetworkNode, NodeKind, Sensor, SensorKind};
    use wlm_sim::{EngineSession, HydraulicEngine};

    struct MockEngine {
        baseline: f64,
        delta: f64,
        fail_leak: Option<String>,
        loads: AtomicU32,
        solve_delay: Option<Duration>,
    }

    impl MockEngine {
        fn new(baseline: f64, delta: f64) -> Self {
            Self {
                baseline,
                delta,
                fail_leak: None,
                loads: AtomicU32::new(0),
                solve_delay: None,
            }
        }
    }

    impl HydraulicEngine for MockEngine {
        fn load(&self, _inp_path: &Path) -> WlmResult<Box<dyn EngineSession>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(MockSession {
                baseline: self.baseline,
                delta: self.delta,
                fail_leak: self.fail_leak.clone(),
                solve_delay: self.solve_delay,
            }))
        }
    }

    struct MockSession {
        baseline: f64,
        delta: f64,
        fail_leak: Option<String>,
        solve_delay: Option<Duration>,
    }

    impl EngineSession for MockSession {
        fn solve_baseline(
            &mut self,
            sensor_ids: &[String],
        ) -> WlmResult<HashMap<String, f64>> {
            if let Some(delay) = self.solve_delay {
                std::thread::sleep(delay);
            }
            Ok(sensor_ids
                .iter()
                .map(|id| (id.clone(), self.baseline))
                .collect())
        }

        fn solve_with_leak(
            &mut self,
            leak_node: &str,
            _leak_lps: f64,
            sensor_ids: &[String],
        ) -> WlmResult<HashMap<String, f64>> {
            if let Some(delay) = self.solve_delay {
                std::thread::sleep(delay);
            }
            if self.fail_leak.as_deref() == Some(leak_node) {
                return Err(WlmError::SimulationFailed(format!(
                    "mock failure at {leak_node}"
                )));
            }
            Ok(sensor_ids
                .iter()
                .map(|id| (id.clone(), self.baseline + self.delta))
                .collect())
        }
    }

    struct Fixture {
        stores: Stores,
        network: NetworkId,
        _dir: tempfile::TempDir,
        storage: InpStorage,
    }

    /// `candidate_count` junctions under one mainline; sensors on the first
    /// `sensor_count` of them.
    async fn fixture(candidate_count: usize, sensor_count: usize) -> Fixture {
        let stores = Stores::in_memory();
        let network = NetworkId::new();

        let mainline =
            NetworkNode::new(network, "M", NodeKind::Mainline).with_epanet_id("M");
        let mainline_id = mainline.id;
        let mut nodes = vec![mainline];
        for i in 0..candidate_count {
            nodes.push(
                NetworkNode::new(network, format!("J{i:02}"), NodeKind::Junction)
                    .with_parent(mainline_id)
                    .with_epanet_id(format!("J{i:02}")),
            );
        }
        let sensor_hosts: Vec<NodeId> = nodes[1..=sensor_count].iter().map(|n| n.id).collect();
        stores.nodes.insert_nodes(nodes).await.unwrap();
        for (i, host) in sensor_hosts.into_iter().enumerate() {
            stores
                .sensors
                .insert_sensor(Sensor::new(
                    network,
                    format!("S{i:02}"),
                    SensorKind::BranchJunctionFlow,
                    host,
                ))
                .await
                .unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        let storage = InpStorage::new(dir.path());
        storage.save(network, "[JUNCTIONS]\nJ1 1.0\n").unwrap();

        Fixture {
            stores,
            network,
            _dir: dir,
            storage,
        }
    }

    async fn wait_for_build(engine: &SensitivityEngine) -> MatrixBuildStatus {
        for _ in 0..500 {
            let status = engine.status().await;
            match status.state {
                BuildState::Completed | BuildState::Error => return status,
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
        panic!("build did not finish in time");
    }

    #[tokio::test]
    async fn test_matrix_shape_candidates_times_sensors() {
        let fixture = fixture(10, 3).await;
        let engine = SensitivityEngine::new(
            fixture.stores.clone(),
            SimulatorAdapter::new(Arc::new(MockEngine::new(10.0, 0.25))),
            fixture.storage.clone(),
        );

        let status = engine.generate(fixture.network, false).await.unwrap();
        assert_eq!(status.state, BuildState::InProgress);

        let finished = wait_for_build(&engine).await;
        assert_eq!(finished.state, BuildState::Completed);
        let stats = finished.stats.unwrap();
        assert_eq!(stats.candidates, 10);
        assert_eq!(stats.sensors, 3);
        assert_eq!(stats.total_entries, 30);
        assert_eq!(finished.progress.unwrap().percentage, 100);

        let matrix = engine.matrix(fixture.network).await.unwrap();
        assert_eq!(matrix.num_candidates(), 10);
        assert_eq!(matrix.num_sensors(), 3);
        assert!(matrix
            .values
            .iter()
            .flatten()
            .all(|v| (v - 0.25).abs() < 1e-12));
    }

    #[tokio::test]
    async fn test_failing_candidate_is_skipped_not_fatal() {
        let fixture = fixture(5, 2).await;
        let mut mock = MockEngine::new(10.0, 0.1);
        mock.fail_leak = Some("J02".to_string());
        let engine = SensitivityEngine::new(
            fixture.stores.clone(),
            SimulatorAdapter::new(Arc::new(mock)),
            fixture.storage.clone(),
        );

        engine.generate(fixture.network, false).await.unwrap();
        let finished = wait_for_build(&engine).await;
        assert_eq!(finished.state, BuildState::Completed);
        // 4 of 5 candidates produced entries
        assert_eq!(finished.stats.unwrap().total_entries, 8);
    }

    #[tokio::test]
    async fn test_no_candidates_is_invalid_input() {
        let stores = Stores::in_memory();
        let network = NetworkId::new();
        // A mainline alone: not a leak candidate
        stores
            .nodes
            .insert_nodes(vec![
                NetworkNode::new(network, "M", NodeKind::Mainline).with_epanet_id("M")
            ])
            .await
            .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let storage = InpStorage::new(dir.path());
        storage.save(network, "x").unwrap();

        let engine = SensitivityEngine::new(
            stores,
            SimulatorAdapter::new(Arc::new(MockEngine::new(10.0, 0.1))),
            storage,
        );
        let err = engine.generate(network, false).await.unwrap_err();
        assert!(matches!(err, WlmError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_no_sensors_is_invalid_input() {
        let fixture = fixture(3, 0).await;
        let engine = SensitivityEngine::new(
            fixture.stores.clone(),
            SimulatorAdapter::new(Arc::new(MockEngine::new(10.0, 0.1))),
            fixture.storage.clone(),
        );
        let err = engine.generate(fixture.network, false).await.unwrap_err();
        assert!(matches!(err, WlmError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_generate_is_idempotent_without_force() {
        let fixture = fixture(4, 2).await;
        let mock = Arc::new(MockEngine::new(10.0, 0.1));
        let engine = SensitivityEngine::new(
            fixture.stores.clone(),
            SimulatorAdapter::new(mock.clone()),
            fixture.storage.clone(),
        );

        engine.generate(fixture.network, false).await.unwrap();
        let first = wait_for_build(&engine).await;
        let first_entries = first.stats.as_ref().unwrap().total_entries;
        let loads_after_first = mock.loads.load(Ordering::SeqCst);

        let second = engine.generate(fixture.network, false).await.unwrap();
        assert_eq!(second.state, BuildState::Completed);
        assert_eq!(second.stats.unwrap().total_entries, first_entries);
        // No further engine loads: the existing matrix was reused
        assert_eq!(mock.loads.load(Ordering::SeqCst), loads_after_first);
    }

    #[tokio::test]
    async fn test_force_rebuilds() {
        let fixture = fixture(4, 2).await;
        let mock = Arc::new(MockEngine::new(10.0, 0.1));
        let engine = SensitivityEngine::new(
            fixture.stores.clone(),
            SimulatorAdapter::new(mock.clone()),
            fixture.storage.clone(),
        );

        engine.generate(fixture.network, false).await.unwrap();
        wait_for_build(&engine).await;
        let loads_after_first = mock.loads.load(Ordering::SeqCst);

        engine.generate(fixture.network, true).await.unwrap();
        let rebuilt = wait_for_build(&engine).await;
        assert_eq!(rebuilt.state, BuildState::Completed);
        assert!(mock.loads.load(Ordering::SeqCst) > loads_after_first);
    }

    #[tokio::test]
    async fn test_concurrent_generate_returns_live_progress() {
        let fixture = fixture(6, 2).await;
        let mut mock = MockEngine::new(10.0, 0.1);
        mock.solve_delay = Some(Duration::from_millis(30));
        let engine = SensitivityEngine::new(
            fixture.stores.clone(),
            SimulatorAdapter::new(Arc::new(mock)),
            fixture.storage.clone(),
        );

        let started = engine.generate(fixture.network, false).await.unwrap();
        assert_eq!(started.state, BuildState::InProgress);

        // While running, a second generate (forced or not) observes the
        // same build rather than starting another
        let observed = engine.generate(fixture.network, true).await.unwrap();
        assert_eq!(observed.state, BuildState::InProgress);

        let finished = wait_for_build(&engine).await;
        assert_eq!(finished.state, BuildState::Completed);
        assert_eq!(finished.stats.unwrap().total_entries, 12);
    }

    #[tokio::test]
    async fn test_fatal_baseline_marks_error() {
        struct BrokenBaseline;
        impl HydraulicEngine for BrokenBaseline {
            fn load(&self, _inp_path: &Path) -> WlmResult<Box<dyn EngineSession>> {
                Ok(Box::new(BrokenSession))
            }
        }
        struct BrokenSession;
        impl EngineSession for BrokenSession {
            fn solve_baseline(
                &mut self,
                _sensor_ids: &[String],
            ) -> WlmResult<HashMap<String, f64>> {
                Err(WlmError::SimulationFailed("hydraulics diverged".into()))
            }
            fn solve_with_leak(
                &mut self,
                _leak_node: &str,
                _leak_lps: f64,
                _sensor_ids: &[String],
            ) -> WlmResult<HashMap<String, f64>> {
                unreachable!("baseline fails first")
            }
        }

        let fixture = fixture(3, 1).await;
        let engine = SensitivityEngine::new(
            fixture.stores.clone(),
            SimulatorAdapter::new(Arc::new(BrokenBaseline)),
            fixture.storage.clone(),
        );
        engine.generate(fixture.network, false).await.unwrap();
        let finished = wait_for_build(&engine).await;
        assert_eq!(finished.state, BuildState::Error);
        assert!(finished.error.unwrap().contains("hydraulics diverged"));
        assert_eq!(
            fixture
                .stores
                .sensitivity
                .entry_count(fixture.network)
                .await
                .unwrap(),
            0
        );
    }
}
