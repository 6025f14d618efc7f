use std::fmt;
use std::path::Path;

use crate::runner::BenchmarkResult;

/// Recorded bench-runner results, compared against on later runs.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Baseline {
    pub timestamp: String,
    /// `BackendKind` the results were measured on. Timings from different
    /// backends are not comparable.
    pub backend: String,
    pub results: Vec<BenchmarkResult>,
}

#[derive(Debug, thiserror::Error)]
pub enum BaselineError {
    #[error("baseline i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("baseline json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read a baseline. A missing file is `Ok(None)`; a corrupt one is an error.
pub fn load_baseline(path: &Path) -> Result<Option<Baseline>, BaselineError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_str(&text)?))
}

pub fn save_baseline(path: &Path, baseline: &Baseline) -> Result<(), BaselineError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    std::fs::write(path, serde_json::to_vec_pretty(baseline)?)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Mean,
    P95,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Regression {
    /// Frame time grew by more than the threshold.
    Slower {
        scene: String,
        metric: Metric,
        baseline_ms: f64,
        current_ms: f64,
    },
    /// Frames that rendered before now report a diagnostic.
    NewFailures { scene: String, baseline: u32, current: u32 },
}

impl Regression {
    pub fn scene(&self) -> &str {
        match self {
            Regression::Slower { scene, .. } | Regression::NewFailures { scene, .. } => scene,
        }
    }
}

impl fmt::Display for Regression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regression::Slower { scene, metric, baseline_ms, current_ms } => write!(
                f,
                "{scene}: {metric:?} {baseline_ms:.2} ms -> {current_ms:.2} ms (+{:.1}%)",
                percent_change(*baseline_ms, *current_ms)
            ),
            Regression::NewFailures { scene, baseline, current } => {
                write!(f, "{scene}: failed frames {baseline} -> {current}")
            }
        }
    }
}

fn percent_change(baseline: f64, current: f64) -> f64 {
    (current - baseline) / baseline * 100.0
}

/// Scenes present in both runs are compared on mean and p95 frame time and on
/// failed frames. Scenes only in one run are ignored.
pub fn compare(current: &[BenchmarkResult], baseline: &Baseline, threshold_pct: f64) -> Vec<Regression> {
    let mut regressions = Vec::new();
    for result in current {
        let Some(base) = baseline.results.iter().find(|b| b.scene_name == result.scene_name) else {
            continue;
        };
        if result.failed_frames > base.failed_frames {
            regressions.push(Regression::NewFailures {
                scene: result.scene_name.clone(),
                baseline: base.failed_frames,
                current: result.failed_frames,
            });
        }
        let pairs = [
            (Metric::Mean, base.timings.mean_ms, result.timings.mean_ms),
            (Metric::P95, base.timings.p95_ms, result.timings.p95_ms),
        ];
        for (metric, baseline_ms, current_ms) in pairs {
            if baseline_ms > 0.0 && percent_change(baseline_ms, current_ms) > threshold_pct {
                regressions.push(Regression::Slower {
                    scene: result.scene_name.clone(),
                    metric,
                    baseline_ms,
                    current_ms,
                });
            }
        }
    }
    regressions
}

pub fn format_markdown(results: &[BenchmarkResult]) -> String {
    let mut out = String::from(
        "| Scene | Voxels | Blocks | Failed | Mean (ms) | Per block (ms) | Median (ms) | P95 (ms) | P99 (ms) | Min (ms) | Max (ms) |\n\
         |---|---|---|---|---|---|---|---|---|---|---|\n",
    );
    for r in results {
        let t = &r.timings;
        let per_block = t.mean_ms / r.blocks.max(1) as f64;
        out += &format!(
            "| {} | {} | {} | {} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} |\n",
            r.scene_name,
            r.voxels,
            r.blocks,
            r.failed_frames,
            t.mean_ms,
            per_block,
            t.median_ms,
            t.p95_ms,
            t.p99_ms,
            t.min_ms,
            t.max_ms,
        );
    }
    out
}

pub fn format_comparison(regressions: &[Regression], threshold_pct: f64) -> String {
    if regressions.is_empty() {
        return format!("No scene slowed by more than {threshold_pct:.0}% or gained failed frames.\n");
    }
    let mut out = format!("{} regression(s), threshold {threshold_pct:.0}%:\n", regressions.len());
    for r in regressions {
        out += &format!("  - {r}\n");
    }
    out
}
