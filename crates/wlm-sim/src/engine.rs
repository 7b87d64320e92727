//! Simulator adapter: the seam between the analysis engines and whatever
//! solves the hydraulics.
//!
//! [`HydraulicEngine`] opens an [`EngineSession`] from a stored `.inp` file;
//! the bundled [`NativeEngine`] backs it with the crate's own steady-state
//! solver. Sessions are single-threaded by ownership: callers wanting
//! parallel solves open one session per worker.
//!
//! [`SimSession`] is the async wrapper the rest of the workspace uses. It
//! drives the blocking solves on the blocking pool with a 30 s budget each,
//! closes idempotently, and keeps the leak-perturbation contract: the base
//! demand touched by a leak solve is restored on every exit path.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;
use wlm_core::{WlmError, WlmResult};
use wlm_io::parse_inp_file;

use crate::network::HydraulicNetwork;
use crate::solver::{solve_steady, SolverOptions};

/// Per-solve wall-clock budget.
pub const SOLVE_TIMEOUT: Duration = Duration::from_secs(30);
/// Attempts made to open a workspace before giving up.
pub const LOAD_ATTEMPTS: u32 = 3;
/// Pause between load attempts.
pub const LOAD_BACKOFF: Duration = Duration::from_secs(1);

/// A loaded, solvable model instance.
pub trait EngineSession: Send {
    /// Solve the unmodified network and report the flow at each sensor node.
    fn solve_baseline(&mut self, sensor_ids: &[String]) -> WlmResult<HashMap<String, f64>>;

    /// Add `leak_lps` to the leak node's base demand, re-solve, and report
    /// sensor flows. Implementations must restore the original demand on
    /// every exit path.
    fn solve_with_leak(
        &mut self,
        leak_node: &str,
        leak_lps: f64,
        sensor_ids: &[String],
    ) -> WlmResult<HashMap<String, f64>>;
}

/// Factory for engine sessions.
pub trait HydraulicEngine: Send + Sync {
    fn load(&self, inp_path: &Path) -> WlmResult<Box<dyn EngineSession>>;
}

/// The built-in engine running this crate's Newton solver.
#[derive(Default)]
pub struct NativeEngine {
    options: SolverOptions,
}

impl NativeEngine {
    pub fn new(options: SolverOptions) -> Self {
        Self { options }
    }
}

impl HydraulicEngine for NativeEngine {
    fn load(&self, inp_path: &Path) -> WlmResult<Box<dyn EngineSession>> {
        let doc = parse_inp_file(inp_path)?;
        let network = HydraulicNetwork::from_document(&doc)?;
        Ok(Box::new(NativeSession {
            network,
            options: self.options.clone(),
        }))
    }
}

struct NativeSession {
    network: HydraulicNetwork,
    options: SolverOptions,
}

impl NativeSession {
    fn solve_and_read(&self, sensor_ids: &[String]) -> WlmResult<HashMap<String, f64>> {
        let solution = solve_steady(&self.network, &self.options)?;
        Ok(sensor_ids
            .iter()
            .map(|id| {
                let value = solution.node_flow(id).unwrap_or(f64::NAN);
                (id.clone(), value)
            })
            .collect())
    }
}

impl EngineSession for NativeSession {
    fn solve_baseline(&mut self, sensor_ids: &[String]) -> WlmResult<HashMap<String, f64>> {
        self.solve_and_read(sensor_ids)
    }

    fn solve_with_leak(
        &mut self,
        leak_node: &str,
        leak_lps: f64,
        sensor_ids: &[String],
    ) -> WlmResult<HashMap<String, f64>> {
        let original = self.network.base_demand(leak_node)?;
        self.network
            .set_base_demand(leak_node, original + leak_lps)?;
        let result = self.solve_and_read(sensor_ids);
        // Restoration must happen whether the solve succeeded or not
        self.network
            .set_base_demand(leak_node, original)
            .expect("restoring a demand that was just read");
        result
    }
}

/// Async session handle. Owns the engine session and serializes access;
/// parallel callers open one `SimSession` each.
pub struct SimSession {
    inner: Option<Box<dyn EngineSession>>,
}

impl std::fmt::Debug for SimSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimSession")
            .field("inner", &self.inner.is_some())
            .finish()
    }
}

impl SimSession {
    fn new(inner: Box<dyn EngineSession>) -> Self {
        Self {
            inner: Some(inner),
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    /// Release the session. Safe to call any number of times; a timed-out
    /// solve leaves the session closed already.
    pub fn close(&mut self) {
        self.inner = None;
    }

    /// Baseline solve. Non-finite sensor values are dropped with a warning;
    /// when every value is non-finite the call fails with `NoValidReadings`.
    pub async fn baseline(&mut self, sensor_ids: &[String]) -> WlmResult<HashMap<String, f64>> {
        let ids = sensor_ids.to_vec();
        let readings = self
            .run(move |session| session.solve_baseline(&ids))
            .await?;
        let finite: HashMap<String, f64> = readings
            .iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        if !readings.is_empty() && finite.is_empty() {
            return Err(WlmError::NoValidReadings(
                "every sensor read returned NaN or infinity".into(),
            ));
        }
        for (id, value) in &readings {
            if !value.is_finite() {
                warn!(sensor = %id, value, "dropping non-finite sensor read");
            }
        }
        Ok(finite)
    }

    /// Leak-perturbed solve; the engine restores the base demand on all
    /// exit paths.
    pub async fn with_leak(
        &mut self,
        leak_node: &str,
        leak_lps: f64,
        sensor_ids: &[String],
    ) -> WlmResult<HashMap<String, f64>> {
        let node = leak_node.to_string();
        let ids = sensor_ids.to_vec();
        self.run(move |session| session.solve_with_leak(&node, leak_lps, &ids))
            .await
    }

    async fn run<T, F>(&mut self, op: F) -> WlmResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn EngineSession) -> WlmResult<T> + Send + 'static,
    {
        let mut inner = self.inner.take().ok_or_else(|| {
            WlmError::SimulationFailed("session is closed".into())
        })?;
        let handle = tokio::task::spawn_blocking(move || {
            let result = op(inner.as_mut());
            (inner, result)
        });
        match tokio::time::timeout(SOLVE_TIMEOUT, handle).await {
            Ok(Ok((inner, result))) => {
                self.inner = Some(inner);
                result
            }
            Ok(Err(join_err)) => Err(WlmError::SimulationFailed(format!(
                "solver task aborted: {join_err}"
            ))),
            // The blocking task keeps running detached; the session it owns
            // is lost, so this handle stays closed
            Err(_) => Err(WlmError::SimulationFailed(format!(
                "solve exceeded the {} s budget",
                SOLVE_TIMEOUT.as_secs()
            ))),
        }
    }
}

/// Opens sessions with retry/backoff on top of any [`HydraulicEngine`].
#[derive(Clone)]
pub struct SimulatorAdapter {
    engine: Arc<dyn HydraulicEngine>,
}

impl SimulatorAdapter {
    pub fn new(engine: Arc<dyn HydraulicEngine>) -> Self {
        Self { engine }
    }

    /// Adapter over the built-in Newton engine.
    pub fn native() -> Self {
        Self::new(Arc::new(NativeEngine::default()))
    }

    /// Open a session for a stored input file, retrying transient load
    /// failures. After the final attempt the error surfaces as
    /// `SimulatorUnavailable`.
    pub async fn open(&self, inp_path: &Path) -> WlmResult<SimSession> {
        let mut last_error = None;
        for attempt in 1..=LOAD_ATTEMPTS {
            match self.engine.load(inp_path) {
                Ok(session) => return Ok(SimSession::new(session)),
                Err(err) => {
                    warn!(
                        attempt,
                        path = %inp_path.display(),
                        error = %err,
                        "engine load failed"
                    );
                    last_error = Some(err);
                    if attempt < LOAD_ATTEMPTS {
                        tokio::time::sleep(LOAD_BACKOFF).await;
                    }
                }
            }
        }
        Err(WlmError::SimulatorUnavailable(format!(
            "load failed after {LOAD_ATTEMPTS} attempts: {}",
            last_error.expect("at least one attempt was made")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};

    const CHAIN: &str = "\
[RESERVOIRS]
R1 100.0

[JUNCTIONS]
J1 10.0 0.0
H1 5.0  4.0
H2 5.0  6.0

[PIPES]
P1 R1 J1 1000 300 130
P2 J1 H1 200 150 130
P3 J1 H2 200 150 130
";

    fn write_inp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_native_baseline_reads_sensor_flows() {
        let file = write_inp(CHAIN);
        let adapter = SimulatorAdapter::native();
        let mut session = adapter.open(file.path()).await.unwrap();

        let sensors = vec!["R1".to_string(), "H1".to_string(), "H2".to_string()];
        let readings = session.baseline(&sensors).await.unwrap();
        assert!((readings["H1"] - 4.0).abs() < 1e-6);
        assert!((readings["H2"] - 6.0).abs() < 1e-6);
        assert!((readings["R1"] - 10.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_leak_perturbs_and_restores() {
        let file = write_inp(CHAIN);
        let adapter = SimulatorAdapter::native();
        let mut session = adapter.open(file.path()).await.unwrap();
        let sensors = vec!["R1".to_string()];

        let baseline = session.baseline(&sensors).await.unwrap();
        let leaked = session
            .with_leak("J1", 1.0, &sensors)
            .await
            .unwrap();
        assert!(leaked["R1"] > baseline["R1"] + 0.5);

        // A second baseline must match the first: demand was restored
        let again = session.baseline(&sensors).await.unwrap();
        assert!((again["R1"] - baseline["R1"]).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_leak_on_fixed_head_node_fails_without_poisoning() {
        let file = write_inp(CHAIN);
        let adapter = SimulatorAdapter::native();
        let mut session = adapter.open(file.path()).await.unwrap();
        let sensors = vec!["R1".to_string()];

        let err = session.with_leak("R1", 1.0, &sensors).await.unwrap_err();
        assert!(matches!(err, WlmError::InvalidInput(_)));
        // Session still usable
        assert!(session.baseline(&sensors).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_sensor_reads_are_dropped() {
        let file = write_inp(CHAIN);
        let adapter = SimulatorAdapter::native();
        let mut session = adapter.open(file.path()).await.unwrap();

        let sensors = vec!["H1".to_string(), "GHOST".to_string()];
        let readings = session.baseline(&sensors).await.unwrap();
        assert!(readings.contains_key("H1"));
        assert!(!readings.contains_key("GHOST"));
    }

    #[tokio::test]
    async fn test_all_unknown_sensors_is_no_valid_readings() {
        let file = write_inp(CHAIN);
        let adapter = SimulatorAdapter::native();
        let mut session = adapter.open(file.path()).await.unwrap();

        let sensors = vec!["GHOST1".to_string(), "GHOST2".to_string()];
        let err = session.baseline(&sensors).await.unwrap_err();
        assert!(matches!(err, WlmError::NoValidReadings(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let file = write_inp(CHAIN);
        let adapter = SimulatorAdapter::native();
        let mut session = adapter.open(file.path()).await.unwrap();
        assert!(session.is_open());
        session.close();
        session.close();
        assert!(!session.is_open());

        let err = session.baseline(&["R1".to_string()]).await.unwrap_err();
        assert!(matches!(err, WlmError::SimulationFailed(_)));
    }

    struct FlakyEngine {
        failures: AtomicU32,
        inner: NativeEngine,
    }

    impl HydraulicEngine for FlakyEngine {
        fn load(&self, inp_path: &Path) -> WlmResult<Box<dyn EngineSession>> {
            if self.failures.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                if f > 0 {
                    Some(f - 1)
                } else {
                    None
                }
            }).is_ok()
            {
                return Err(WlmError::SimulatorUnavailable("warming up".into()));
            }
            self.inner.load(inp_path)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_retries_through_transient_failures() {
        let file = write_inp(CHAIN);
        let adapter = SimulatorAdapter::new(Arc::new(FlakyEngine {
            failures: AtomicU32::new(2),
            inner: NativeEngine::default(),
        }));
        let session = adapter.open(file.path()).await.unwrap();
        assert!(session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_exhausts_into_simulator_unavailable() {
        let file = write_inp(CHAIN);
        let adapter = SimulatorAdapter::new(Arc::new(FlakyEngine {
            failures: AtomicU32::new(10),
            inner: NativeEngine::default(),
        }));
        let err = adapter.open(file.path()).await.unwrap_err();
        assert!(matches!(err, WlmError::SimulatorUnavailable(_)));
    }
}
