//! `wlm` - water loss management pipeline driver.
//!
//! One-shot workflows over an in-process repository: inspect an EPANET
//! file, build a sensitivity matrix, run detection with explicit
//! parameters, or run the whole import → sensors → matrix → analyze path
//! and print the JSON report.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use wlm_algo::{
    BuildState, DetectionRequest, Localizer, MassBalanceDetector, MatrixBuildStatus,
    SensitivityEngine, SensorPlanner, DEFAULT_BASELINE_WINDOW_SECS,
};
use wlm_core::{NetworkId, ReadingSource, Sensor, SensorKind, Stores};
use wlm_io::{infer_roles, parse_inp_file, InpStorage};
use wlm_service::{AnalysisReport, AnalysisService, ImportService, ReadingInput, ReadingService};
use wlm_sim::SimulatorAdapter;

#[derive(Parser)]
#[command(name = "wlm", about = "Water network leak detection and localization")]
struct Cli {
    /// Root directory for stored network input files
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct NetworkArgs {
    /// EPANET .inp file
    inp: PathBuf,
    /// Sensor definitions CSV (label,node,kind[,active])
    #[arg(long)]
    sensors: Option<PathBuf>,
    /// Auto-place this many sensors instead of reading a CSV
    #[arg(long)]
    auto_place: Option<usize>,
    /// Historical readings CSV (sensor,timestamp,flow_lps)
    #[arg(long)]
    history: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse an .inp file and print inferred roles and topology stats
    Inspect {
        /// EPANET .inp file
        inp: PathBuf,
    },
    /// Import a network and build its sensitivity matrix
    Matrix {
        #[command(flatten)]
        network: NetworkArgs,
        /// Rebuild even if a matrix exists
        #[arg(long)]
        force: bool,
    },
    /// Run mass-balance detection with explicit parameters
    Detect {
        #[command(flatten)]
        network: NetworkArgs,
        /// Batch readings CSV for the analysis instant (sensor,flow_lps)
        batch: PathBuf,
        /// Analysis instant, RFC 3339 (defaults to now)
        #[arg(long)]
        at: Option<String>,
        /// Detection threshold in L/s
        #[arg(long)]
        threshold: Option<f64>,
        /// Detection window in seconds
        #[arg(long)]
        window: Option<i64>,
        /// Localize each detection afterwards (requires a matrix)
        #[arg(long)]
        localize: bool,
    },
    /// Full pipeline: import, sensors, history, matrix, analyze
    Analyze {
        #[command(flatten)]
        network: NetworkArgs,
        /// Batch readings CSV for the analysis instant (sensor,flow_lps)
        batch: PathBuf,
        /// Analysis instant, RFC 3339 (defaults to now)
        #[arg(long)]
        at: Option<String>,
        /// Skip the sensitivity matrix build (detection only)
        #[arg(long)]
        no_matrix: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("installing tracing subscriber")?;

    let cli = Cli::parse();
    let storage = match &cli.storage_dir {
        Some(dir) => InpStorage::new(dir.clone()),
        None => InpStorage::from_env(),
    };

    match cli.command {
        Commands::Inspect { inp } => inspect(&inp),
        Commands::Matrix { network, force } => {
            let pipeline = Pipeline::bootstrap(&network, storage).await?;
            let status = pipeline.build_matrix(force).await?;
            print_json(&status)
        }
        Commands::Detect {
            network,
            batch,
            at,
            threshold,
            window,
            localize,
        } => {
            let timestamp = parse_at(at.as_deref())?;
            let pipeline = Pipeline::bootstrap(&network, storage).await?;
            if localize {
                pipeline.build_matrix(false).await?;
            }
            let detections = pipeline
                .detect(timestamp, &batch, threshold, window, localize)
                .await?;
            print_json(&detections)
        }
        Commands::Analyze {
            network,
            batch,
            at,
            no_matrix,
        } => {
            let timestamp = parse_at(at.as_deref())?;
            let pipeline = Pipeline::bootstrap(&network, storage).await?;
            if !no_matrix {
                pipeline.build_matrix(false).await?;
            }
            let report = pipeline.analyze(timestamp, &batch).await?;
            print_json(&report)
        }
    }
}

fn parse_at(at: Option<&str>) -> Result<DateTime<Utc>> {
    match at {
        Some(raw) => {
            AnalysisService::parse_timestamp(raw).map_err(|err| anyhow!(err.to_string()))
        }
        None => Ok(Utc::now()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn inspect(inp: &Path) -> Result<()> {
    let doc = parse_inp_file(inp)?;
    let classified = infer_roles(&doc);

    println!(
        "Title: {}",
        if doc.title.is_empty() {
            "(none)"
        } else {
            &doc.title
        }
    );
    println!("Nodes: {}  Links: {}", doc.nodes.len(), doc.links.len());
    println!();
    println!(
        "{:<16} {:<10} {:<16} {:>10}",
        "NODE", "ROLE", "PARENT", "DEMAND"
    );
    for node in &classified {
        println!(
            "{:<16} {:<10} {:<16} {:>10.3}",
            node.id,
            node.role.to_string(),
            node.parent.as_deref().unwrap_or("-"),
            node.demand_lps
        );
    }

    if !doc.warnings.is_empty() {
        println!();
        for warning in &doc.warnings {
            println!("warning: {warning}");
        }
    }
    Ok(())
}

/// In-process wiring of the full stack for one CLI invocation.
struct Pipeline {
    stores: Stores,
    storage: InpStorage,
    network: NetworkId,
}

impl Pipeline {
    async fn bootstrap(args: &NetworkArgs, storage: InpStorage) -> Result<Self> {
        let inp_text = std::fs::read_to_string(&args.inp)
            .with_context(|| format!("reading {}", args.inp.display()))?;

        let stores = Stores::in_memory();
        let import = ImportService::new(stores.clone(), storage.clone());
        let report = import
            .import_epanet(
                args.inp
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned()),
                &inp_text,
            )
            .await?;
        info!(
            network = %report.network_id,
            nodes = report.nodes_imported,
            dmas = report.dmas_created,
            "network imported"
        );

        let pipeline = Self {
            stores,
            storage,
            network: report.network_id,
        };

        match (&args.sensors, args.auto_place) {
            (Some(path), _) => pipeline.install_sensors(path).await?,
            (None, count) => {
                let planner = SensorPlanner::new(pipeline.stores.clone());
                let placed = planner.auto_place(pipeline.network, count).await?;
                info!(placed = placed.placed, "sensors auto-placed");
            }
        }

        if let Some(history) = &args.history {
            pipeline.ingest_history(history).await?;
        }

        Ok(pipeline)
    }

    async fn install_sensors(&self, path: &Path) -> Result<()> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("opening sensors file {}", path.display()))?;
        let mut installed = 0usize;
        for record in reader.records() {
            let record = record.context("reading sensors row")?;
            let label = record
                .get(0)
                .ok_or_else(|| anyhow!("sensors row missing label column"))?;
            let node_label = record
                .get(1)
                .ok_or_else(|| anyhow!("sensors row missing node column"))?;
            let kind = parse_sensor_kind(
                record
                    .get(2)
                    .ok_or_else(|| anyhow!("sensors row missing kind column"))?,
            )?;
            let active = record
                .get(3)
                .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
                .unwrap_or(true);

            let node = self
                .stores
                .nodes
                .node_by_label(self.network, node_label)
                .await?
                .ok_or_else(|| {
                    anyhow!("sensors row references unknown node '{node_label}'")
                })?;
            let mut sensor = Sensor::new(self.network, label, kind, node.id);
            sensor.is_active = active;
            sensor.partition_id = self.stores.sensor_partition(&sensor).await?;
            self.stores.sensors.insert_sensor(sensor).await?;
            installed += 1;
        }
        info!(installed, "sensors installed from file");
        Ok(())
    }

    async fn ingest_history(&self, path: &Path) -> Result<()> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .with_context(|| format!("opening history file {}", path.display()))?;
        let service = ReadingService::new(self.stores.clone());
        let mut count = 0usize;
        for record in reader.records() {
            let record = record.context("reading history row")?;
            let sensor = record
                .get(0)
                .ok_or_else(|| anyhow!("history row missing sensor column"))?;
            let timestamp: DateTime<Utc> = record
                .get(1)
                .ok_or_else(|| anyhow!("history row missing timestamp column"))?
                .parse()
                .context("parsing history timestamp")?;
            let flow: f64 = record
                .get(2)
                .ok_or_else(|| anyhow!("history row missing flow column"))?
                .parse()
                .context("parsing history flow value")?;

            let mut input = ReadingInput::new(sensor, flow);
            input.timestamp = Some(timestamp);
            service
                .ingest_batch(self.network, timestamp, &[input], ReadingSource::Sensor)
                .await?;
            count += 1;
        }
        info!(count, "historical readings ingested");
        Ok(())
    }

    async fn build_matrix(&self, force: bool) -> Result<MatrixBuildStatus> {
        let engine = SensitivityEngine::new(
            self.stores.clone(),
            SimulatorAdapter::native(),
            self.storage.clone(),
        );
        engine.generate(self.network, force).await?;
        loop {
            let status = engine.status().await;
            match status.state {
                BuildState::Completed => return Ok(status),
                BuildState::Error => {
                    return Err(anyhow!(
                        "matrix build failed: {}",
                        status.error.unwrap_or_else(|| "unknown".into())
                    ))
                }
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    }

    async fn detect(
        &self,
        timestamp: DateTime<Utc>,
        batch_csv: &Path,
        threshold: Option<f64>,
        window: Option<i64>,
        localize: bool,
    ) -> Result<Vec<wlm_core::LeakDetection>> {
        let inputs = read_batch(batch_csv)?;
        let readings = ReadingService::new(self.stores.clone());
        readings
            .ingest_batch(self.network, timestamp, &inputs, ReadingSource::Sensor)
            .await?;

        let mut request = DetectionRequest::new(self.network, timestamp);
        if let Some(threshold) = threshold {
            request = request.with_threshold(threshold);
        }
        if let Some(window) = window {
            request = request.with_window(window);
        }
        let detector = MassBalanceDetector::new(self.stores.clone());
        let detections = detector.detect(&request).await?;

        if localize {
            let localizer = Localizer::new(self.stores.clone());
            for detection in &detections {
                if let Err(err) = localizer
                    .localize(detection.id, DEFAULT_BASELINE_WINDOW_SECS)
                    .await
                {
                    warn!(detection = %detection.id, error = %err, "localization failed");
                }
            }
            // Re-read for the localized fields
            let mut refreshed = Vec::with_capacity(detections.len());
            for detection in detections {
                refreshed.push(
                    self.stores
                        .detections
                        .detection(detection.id)
                        .await?
                        .unwrap_or(detection),
                );
            }
            return Ok(refreshed);
        }
        Ok(detections)
    }

    async fn analyze(
        &self,
        timestamp: DateTime<Utc>,
        batch_csv: &Path,
    ) -> Result<AnalysisReport> {
        let inputs = read_batch(batch_csv)?;
        let service = AnalysisService::new(self.stores.clone());
        Ok(service.analyze(self.network, timestamp, &inputs).await?)
    }
}

fn parse_sensor_kind(raw: &str) -> Result<SensorKind> {
    match raw.to_ascii_uppercase().as_str() {
        "MAINLINE_FLOW" => Ok(SensorKind::MainlineFlow),
        "BRANCH_JUNCTION_FLOW" => Ok(SensorKind::BranchJunctionFlow),
        "HOUSEHOLD_FLOW" => Ok(SensorKind::HouseholdFlow),
        other => Err(anyhow!(
            "unknown sensor kind '{other}'; expected MAINLINE_FLOW, BRANCH_JUNCTION_FLOW, or HOUSEHOLD_FLOW"
        )),
    }
}

fn read_batch(path: &Path) -> Result<Vec<ReadingInput>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("opening batch file {}", path.display()))?;
    let mut inputs = Vec::new();
    for record in reader.records() {
        let record = record.context("reading batch row")?;
        let sensor = record
            .get(0)
            .ok_or_else(|| anyhow!("batch row missing sensor column"))?;
        let flow: f64 = record
            .get(1)
            .ok_or_else(|| anyhow!("batch row missing flow column"))?
            .parse()
            .context("parsing batch flow value")?;
        inputs.push(ReadingInput::new(sensor, flow));
    }
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_sensor_kind() {
        assert_eq!(
            parse_sensor_kind("mainline_flow").unwrap(),
            SensorKind::MainlineFlow
        );
        assert_eq!(
            parse_sensor_kind("HOUSEHOLD_FLOW").unwrap(),
            SensorKind::HouseholdFlow
        );
        assert!(parse_sensor_kind("PRESSURE").is_err());
    }

    #[test]
    fn test_read_batch_csv() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "sensor,flow_lps").unwrap();
        writeln!(file, "MAIN_01, 20.0").unwrap();
        writeln!(file, "HH_01, 7.0").unwrap();
        let inputs = read_batch(file.path()).unwrap();
        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].sensor_id, "MAIN_01");
        assert_eq!(inputs[1].flow_value, 7.0);
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
