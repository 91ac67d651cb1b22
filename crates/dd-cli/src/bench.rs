use std::cmp::Ordering;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Instant;

use dd_core::{DetectionConfig, DeviceDetector, MatchMethod};

pub struct BenchOptions {
    pub data_path: String,
    pub ua_file: String,
    pub config: DetectionConfig,
    pub threads: usize,
    pub iterations: usize,
    pub warmup_ops: usize,
    pub sample_batch_ops: usize,
}

struct BenchResult {
    name: String,
    op_count: usize,
    total_ms: f64,
    avg_us: f64,
    p50_us: f64,
    p95_us: f64,
    p99_us: f64,
    ops_per_sec: u64,
    matched_pct: f64,
}

/// Per-thread timings before they are summarised.
struct ThreadRun {
    samples_us: Vec<f64>,
    ops: usize,
    matched: usize,
}

pub fn run(opts: BenchOptions) -> Result<(), String> {
    println!("========================================================================");
    println!("DeviceDetect Benchmark");
    println!("========================================================================");

    let user_agents = load_user_agents(Path::new(&opts.ua_file))?;
    if user_agents.is_empty() {
        return Err(format!("No user agents in '{}'", opts.ua_file));
    }

    let detector = DeviceDetector::from_file(Path::new(&opts.data_path), opts.config)
        .map_err(|e| format!("Invalid data set '{}': {}", opts.data_path, e))?;
    let data_set = detector.data_set();
    println!("Data set:   {} ({:?}, {})", data_set.name(), data_set.engine(), data_set.source_kind());
    println!("User agents: {}", user_agents.len());
    println!("Threads:    {}", opts.threads.max(1));
    println!("Iterations: {}", opts.iterations.max(1));

    println!("Warmup...");
    warmup(&detector, &user_agents, opts.warmup_ops);

    println!("------------------------------------------------------------------------");
    let start = Instant::now();
    let runs: Vec<ThreadRun> = thread::scope(|scope| {
        let handles: Vec<_> = (0..opts.threads.max(1))
            .map(|_| {
                let detector = &detector;
                let user_agents = &user_agents;
                scope.spawn(move || run_thread(detector, user_agents, opts.iterations, opts.sample_batch_ops))
            })
            .collect();
        handles.into_iter().filter_map(|h| h.join().ok()).collect()
    });
    let total_ms = start.elapsed().as_secs_f64() * 1000.0;

    if runs.len() != opts.threads.max(1) {
        return Err("A benchmark thread panicked".to_string());
    }

    let result = summarise("Process user agents", runs, total_ms);
    println!("{}", format_result(&result));
    Ok(())
}

fn load_user_agents(path: &Path) -> Result<Vec<String>, String> {
    let content = fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path.display(), e))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn warmup(detector: &DeviceDetector, user_agents: &[String], warmup_ops: usize) {
    for user_agent in user_agents.iter().cycle().take(warmup_ops) {
        let _ = detector.process_user_agent(user_agent).device_id();
    }
}

fn run_thread(detector: &DeviceDetector, user_agents: &[String], iterations: usize, sample_batch_ops: usize) -> ThreadRun {
    let sample_batch_ops = sample_batch_ops.max(1);
    let mut samples_us = Vec::new();
    let mut matched = 0usize;
    let mut ops = 0usize;

    let mut batch_ops = 0usize;
    let mut batch_start = Instant::now();

    for _ in 0..iterations.max(1) {
        for user_agent in user_agents {
            let results = detector.process_user_agent(user_agent);
            if results.method() != MatchMethod::None {
                matched += 1;
            }
            ops += 1;
            batch_ops += 1;
            if batch_ops == sample_batch_ops {
                let dt = batch_start.elapsed();
                samples_us.push(dt.as_secs_f64() * 1_000_000.0 / sample_batch_ops as f64);
                batch_ops = 0;
                batch_start = Instant::now();
            }
        }
    }

    ThreadRun {
        samples_us,
        ops,
        matched,
    }
}

fn summarise(name: &str, runs: Vec<ThreadRun>, total_ms: f64) -> BenchResult {
    let op_count: usize = runs.iter().map(|r| r.ops).sum();
    let matched: usize = runs.iter().map(|r| r.matched).sum();
    let mut samples_us: Vec<f64> = runs.into_iter().flat_map(|r| r.samples_us).collect();
    samples_us.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let avg_us = if samples_us.is_empty() {
        0.0
    } else {
        samples_us.iter().sum::<f64>() / samples_us.len() as f64
    };

    BenchResult {
        name: name.to_string(),
        op_count,
        total_ms,
        avg_us,
        p50_us: percentile(&samples_us, 0.50),
        p95_us: percentile(&samples_us, 0.95),
        p99_us: percentile(&samples_us, 0.99),
        ops_per_sec: if total_ms > 0.0 { (op_count as f64 / (total_ms / 1000.0)) as u64 } else { 0 },
        matched_pct: if op_count > 0 { (matched as f64 / op_count as f64) * 100.0 } else { 0.0 },
    }
}

fn format_result(result: &BenchResult) -> String {
    format!(
        "{}:\n  Ops: {}\n  Total: {:.2} ms\n  Avg: {:.2} us\n  P50: {:.2} us\n  P95: {:.2} us\n  P99: {:.2} us\n  Throughput: {} ops/sec\n  Matched: {:.1}%",
        result.name,
        result.op_count,
        result.total_ms,
        result.avg_us,
        result.p50_us,
        result.p95_us,
        result.p99_us,
        result.ops_per_sec,
        result.matched_pct,
    )
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let idx = ((values.len() as f64) * p).ceil() as usize;
    let idx = idx.saturating_sub(1).min(values.len() - 1);
    values[idx]
}
