//! JSON exporter for CI and offline inspection of simulation runs.

use crate::runner::ScenarioResult;
use crate::world::SimConfig;
use serde::Serialize;
use std::fs::File;
use std::io::Write;

/// Complete export of one simulator invocation.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    /// Configuration every run started from (seed is the base seed)
    pub config: SimConfig,

    /// Number of seeds swept
    pub seeds: usize,

    pub total: usize,
    pub passed: usize,
    pub failed: usize,

    /// One entry per (seed, scenario)
    pub results: Vec<ScenarioResult>,
}

impl SimReport {
    /// Creates an empty report.
    pub fn new(config: SimConfig, seeds: usize) -> Self {
        Self {
            config,
            seeds,
            total: 0,
            passed: 0,
            failed: 0,
            results: Vec::new(),
        }
    }

    /// Adds a scenario result.
    pub fn add(&mut self, result: ScenarioResult) {
        self.total += 1;
        if result.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }

    pub fn failures(&self) -> impl Iterator<Item = &ScenarioResult> {
        self.results.iter().filter(|r| !r.passed)
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> std::io::Result<()> {
        let json = self.to_json()?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ScenarioMetrics;
    use crate::scenarios::ScenarioId;

    fn result(scenario: ScenarioId, passed: bool) -> ScenarioResult {
        ScenarioResult {
            scenario,
            seed: 42,
            passed,
            final_time_secs: 1.5,
            failure_reason: (!passed).then(|| "boom".to_string()),
            metrics: ScenarioMetrics::default(),
        }
    }

    #[test]
    fn test_report_counts() {
        let mut report = SimReport::new(SimConfig::default(), 1);
        report.add(result(ScenarioId::CreateObserve, true));
        report.add(result(ScenarioId::SessionEviction, false));

        assert_eq!(report.total, 2);
        assert_eq!(report.passed, 1);
        assert!(!report.all_passed());
        assert_eq!(report.failures().count(), 1);
    }

    #[test]
    fn test_report_json_uses_scenario_names() {
        let mut report = SimReport::new(SimConfig::default(), 1);
        report.add(result(ScenarioId::MeshDedup, true));

        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["results"][0]["scenario"], "mesh_dedup");
        assert_eq!(json["config"]["seed"], 42);
        assert!(json["results"][0]["failure_reason"].is_null());
    }
}
