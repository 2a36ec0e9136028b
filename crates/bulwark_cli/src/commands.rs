//! Subcommand implementations.

use crate::output;
use anyhow::{Context, Result, bail};
use bulwark_core::CoordinatorConfig;
use bulwark_sim::{BackendProfile, Outage, SimConfig, SimHarness, SimSeed};
use std::path::{Path, PathBuf};

/// Options of `bulwark simulate`
#[derive(Debug, Clone)]
pub struct SimulateArgs {
    pub seed: u64,
    pub requests: usize,
    pub failure_rate: f64,
    pub outages: Vec<Outage>,
    pub config: Option<PathBuf>,
    pub json: bool,
}

/// Parse `START-END` (milliseconds) into an outage window
pub fn parse_outage(s: &str) -> Result<Outage, String> {
    let (start, end) = s
        .split_once('-')
        .ok_or_else(|| format!("expected START-END in milliseconds, got {s:?}"))?;
    let start: u64 = start.trim().parse().map_err(|e| format!("bad start: {e}"))?;
    let end: u64 = end.trim().parse().map_err(|e| format!("bad end: {e}"))?;
    if end <= start {
        return Err(format!("outage end {end} must be after start {start}"));
    }
    Ok(Outage::new(start, end))
}

fn load_config(path: Option<&Path>) -> Result<CoordinatorConfig> {
    let Some(path) = path else {
        return Ok(CoordinatorConfig::default());
    };
    CoordinatorConfig::from_json_file(path)
        .with_context(|| format!("loading {}", path.display()))
}

/// Run a seeded simulation and render its report
pub async fn simulate(args: &SimulateArgs) -> Result<String> {
    if !(0.0..=1.0).contains(&args.failure_rate) {
        bail!("failure rate must be within 0.0..=1.0, got {}", args.failure_rate);
    }
    let coordinator = load_config(args.config.as_deref())?;
    let backend = args
        .outages
        .iter()
        .fold(
            BackendProfile::default().with_failure_probability(args.failure_rate),
            |profile, outage| profile.with_outage(*outage),
        );
    let config = SimConfig::new(SimSeed::from_literal(args.seed))
        .with_requests(args.requests)
        .with_backend(backend)
        .with_coordinator(coordinator);

    tracing::info!(seed = args.seed, requests = args.requests, "running simulation");
    let report = SimHarness::new(config)
        .run()
        .await
        .context("simulation failed")?;

    if args.json {
        Ok(report.to_json_pretty()?)
    } else {
        Ok(output::render_report(&report))
    }
}

/// Print the default configuration, or validate a file
pub fn config(validate: Option<&Path>) -> Result<String> {
    match validate {
        Some(path) => {
            load_config(Some(path))?;
            Ok(output::render_valid(path))
        }
        None => Ok(CoordinatorConfig::default().to_json_pretty()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_outage() {
        assert_eq!(parse_outage("100-250"), Ok(Outage::new(100, 250)));
        assert!(parse_outage("250-100").is_err());
        assert!(parse_outage("100").is_err());
        assert!(parse_outage("a-b").is_err());
    }

    #[test]
    fn test_config_prints_defaults() {
        let json = config(None).unwrap();
        let parsed = CoordinatorConfig::from_json_str(&json).unwrap();
        assert_eq!(parsed, CoordinatorConfig::default());
    }

    #[test]
    fn test_config_validates_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"max_concurrent\": 12}}").unwrap();
        assert!(config(Some(file.path())).is_ok());

        let mut bad = tempfile::NamedTempFile::new().unwrap();
        write!(bad, "{{\"max_concurrent\": 0}}").unwrap();
        assert!(config(Some(bad.path())).is_err());
    }

    #[tokio::test]
    async fn test_simulate_json() {
        let args = SimulateArgs {
            seed: 7,
            requests: 40,
            failure_rate: 0.0,
            outages: Vec::new(),
            config: None,
            json: true,
        };
        let out = simulate(&args).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["seed"], 7);
        assert_eq!(value["requests"], 40);
    }

    #[tokio::test]
    async fn test_simulate_rejects_bad_rate() {
        let args = SimulateArgs {
            seed: 1,
            requests: 1,
            failure_rate: 1.5,
            outages: Vec::new(),
            config: None,
            json: false,
        };
        assert!(simulate(&args).await.is_err());
    }
}
