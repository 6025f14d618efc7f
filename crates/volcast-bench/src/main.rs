use std::path::{Path, PathBuf};
use std::process;
use std::time::{SystemTime, UNIX_EPOCH};

use volcast_bench::report::{self, Baseline};
use volcast_bench::runner::{BackendKind, BenchmarkRunner};
use volcast_bench::scenes;
use volcast_core::config::MapperConfig;

const USAGE: &str = "\
Usage: bench-runner [OPTIONS]
  --gpu                          Render through wgpu instead of the software backend
  --config <path>                Mapper config RON
  --frames <n>                   Frames per scene (default: 24)
  --size <px>                    Square viewport edge (default: 128)
  --baseline <path>              Compare against a saved baseline
  --output <path>                Save this run as a baseline
  --regression-threshold <pct>   Allowed slowdown before failing (default: 10)";

struct Options {
    backend: BackendKind,
    config: Option<PathBuf>,
    frames: u32,
    size: u32,
    baseline: Option<PathBuf>,
    output: Option<PathBuf>,
    threshold_pct: f64,
}

impl Options {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self, String> {
        let mut opts = Options {
            backend: BackendKind::Software,
            config: None,
            frames: 24,
            size: 128,
            baseline: None,
            output: None,
            threshold_pct: 10.0,
        };
        while let Some(flag) = args.next() {
            let mut value = || args.next().ok_or_else(|| format!("{flag} needs a value"));
            match flag.as_str() {
                "--gpu" => opts.backend = BackendKind::Gpu,
                "--config" => opts.config = Some(value()?.into()),
                "--frames" => opts.frames = parse_number(&flag, &value()?)?,
                "--size" => opts.size = parse_number(&flag, &value()?)?,
                "--baseline" => opts.baseline = Some(value()?.into()),
                "--output" => opts.output = Some(value()?.into()),
                "--regression-threshold" => opts.threshold_pct = parse_number(&flag, &value()?)?,
                "--help" | "-h" => {
                    println!("{USAGE}");
                    process::exit(0);
                }
                other => return Err(format!("unknown argument {other}\n{USAGE}")),
            }
        }
        Ok(opts)
    }
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> Result<T, String> {
    value.parse().map_err(|_| format!("{flag}: not a number: {value}"))
}

fn load_config(path: &Path) -> Result<MapperConfig, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    MapperConfig::from_ron_str(&text).map_err(|e| format!("{}: {e}", path.display()))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        eprintln!("bench-runner: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let opts = Options::parse(std::env::args().skip(1))?;

    let mut runner = BenchmarkRunner::new(opts.frames, opts.size, opts.size);
    if let Some(path) = &opts.config {
        runner = runner.with_config(load_config(path)?);
    }

    log::info!("{:?} backend, {} frames per scene at {}px", opts.backend, opts.frames, opts.size);
    let results = scenes::standard_scenes()
        .iter()
        .map(|scene| {
            runner
                .run_scene(opts.backend, scene)
                .map_err(|e| format!("scene {}: {e}", scene.name))
        })
        .collect::<Result<Vec<_>, _>>()?;

    println!("\n## volcast frame times\n");
    println!("{}", report::format_markdown(&results));

    let backend = format!("{:?}", opts.backend);
    if let Some(path) = &opts.output {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let baseline = Baseline {
            timestamp: secs.to_string(),
            backend: backend.clone(),
            results: results.clone(),
        };
        report::save_baseline(path, &baseline).map_err(|e| e.to_string())?;
        log::info!("Baseline written to {}", path.display());
    }

    let Some(path) = &opts.baseline else {
        return Ok(());
    };
    let Some(baseline) = report::load_baseline(path).map_err(|e| e.to_string())? else {
        log::warn!("No baseline at {}, skipping comparison", path.display());
        return Ok(());
    };
    if baseline.backend != backend {
        log::warn!(
            "Baseline was measured on {}, this run on {backend}; skipping comparison",
            baseline.backend
        );
        return Ok(());
    }
    let regressions = report::compare(&results, &baseline, opts.threshold_pct);
    print!("{}", report::format_comparison(&regressions, opts.threshold_pct));
    if regressions.is_empty() {
        Ok(())
    } else {
        Err(format!("{} regression(s) against {}", regressions.len(), path.display()))
    }
}
