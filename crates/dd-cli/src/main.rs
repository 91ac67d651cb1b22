//! DeviceDetect CLI
//!
//! CLI tool for compiling data sets, inspecting them and running detections.

mod bench;
mod dataset;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Map, Value};

use dd_core::{DataSet, Evidence, Results};

use crate::dataset::{ConfigArgs, EngineArg, ModeArg};

#[derive(Parser)]
#[command(name = "dd-cli")]
#[command(about = "DeviceDetect data set compiler and tools")]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a JSON source into a binary data set
    Compile {
        /// Source JSON file
        #[arg(short, long)]
        input: String,

        /// Output data set file
        #[arg(short, long, default_value = "data.dds")]
        output: String,

        /// Leave the CRC-32 out of the header
        #[arg(long)]
        no_crc: bool,
    },

    /// Validate a data set
    Validate {
        /// Data set file to validate
        #[arg(short, long)]
        input: String,
    },

    /// Dump data set info
    Info {
        /// Data set file to inspect
        #[arg(short, long)]
        input: String,
    },

    /// Detect a device and print the results as JSON
    Detect {
        /// Data set file
        #[arg(short, long)]
        data: String,

        /// User-Agent header value
        #[arg(long)]
        ua: Option<String>,

        /// Evidence as prefix.key=value, e.g. header.sec-ch-ua-mobile=?1
        #[arg(short, long)]
        evidence: Vec<String>,

        /// Device id to rebuild results from instead of matching
        #[arg(long, conflicts_with_all = ["ua", "evidence"])]
        device_id: Option<String>,

        /// Comma separated required properties
        #[arg(short, long)]
        properties: Option<String>,

        #[arg(long, value_enum)]
        engine: Option<EngineArg>,

        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// JSON detection config file
        #[arg(long)]
        config: Option<String>,
    },

    /// Convert Client Hints JSON into HTTP header values
    Transform {
        #[arg(long, value_enum)]
        kind: TransformKind,

        /// Input document
        #[arg(long)]
        input: String,
    },

    /// Measure detection latency over a file of user agents
    Bench {
        /// Data set file
        #[arg(short, long)]
        data: String,

        /// One user agent per line
        #[arg(long)]
        ua_file: String,

        #[arg(long, default_value_t = 1)]
        threads: usize,

        #[arg(long, default_value_t = 100)]
        iterations: usize,

        #[arg(long, default_value_t = 10_000)]
        warmup_ops: usize,

        /// Operations timed together for one latency sample
        #[arg(long, default_value_t = 100)]
        sample_batch_ops: usize,

        #[arg(long, value_enum)]
        engine: Option<EngineArg>,

        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// JSON detection config file
        #[arg(long)]
        config: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
enum TransformKind {
    Ghev,
    GhevBase64,
    Sua,
}

fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    let result = match cli.command {
        Commands::Compile { input, output, no_crc } => cmd_compile(&input, &output, !no_crc, verbose),
        Commands::Validate { input } => cmd_validate(&input),
        Commands::Info { input } => cmd_info(&input, verbose),
        Commands::Detect {
            data,
            ua,
            evidence,
            device_id,
            properties,
            engine,
            mode,
            config,
        } => {
            let args = ConfigArgs {
                config,
                engine,
                mode,
                properties,
            };
            cmd_detect(&data, ua.as_deref(), &evidence, device_id.as_deref(), &args, verbose)
        }
        Commands::Transform { kind, input } => cmd_transform(kind, &input),
        Commands::Bench {
            data,
            ua_file,
            threads,
            iterations,
            warmup_ops,
            sample_batch_ops,
            engine,
            mode,
            config,
        } => ConfigArgs {
            config,
            engine,
            mode,
            properties: None,
        }
        .build()
        .and_then(|config| {
            bench::run(bench::BenchOptions {
                data_path: data,
                ua_file,
                config,
                threads,
                iterations,
                warmup_ops,
                sample_batch_ops,
            })
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn cmd_compile(input: &str, output: &str, crc32: bool, verbose: bool) -> Result<(), String> {
    let (bytes, stats) = dataset::compile_data_set_bytes(Path::new(input), crc32, verbose)?;
    dataset::write_data_set(Path::new(output), &bytes)?;

    println!("Compiled '{}' to '{}'", input, output);
    println!("  Components: {}", stats.components);
    println!("  Properties: {}", stats.properties);
    println!("  Profiles:   {}", stats.profiles);
    println!("  Patterns:   {}", stats.patterns);
    println!("  Graphs:     {}", stats.graphs);
    println!("  Size:       {} bytes ({:.1} KB)", bytes.len(), bytes.len() as f64 / 1024.0);
    println!("  Time:       {:.1}ms", stats.total_ms);

    Ok(())
}

fn cmd_validate(input: &str) -> Result<(), String> {
    let data_set = dataset::load_data_set(Path::new(input), ConfigArgs::default().build()?)?;
    let size = fs::metadata(input).map(|m| m.len()).unwrap_or(0);

    println!("Data set '{}' is valid", input);
    println!("  Name:        {}", data_set.name());
    println!("  Version:     {}.{}", data_set.header().version_major, data_set.header().version_minor);
    println!("  Profiles:    {}", data_set.profile_count());
    println!("  Size:        {} bytes", size);

    Ok(())
}

fn cmd_info(input: &str, verbose: bool) -> Result<(), String> {
    let path = Path::new(input);
    let config = ConfigArgs::default().build()?;
    let data_set = dataset::load_data_set(path, config.clone())?;
    let header = data_set.header();

    println!("Data set: {}", input);
    println!("  Name:        {}", data_set.name());
    println!("  Version:     {}.{}", header.version_major, header.version_minor);
    println!("  Build:       {}", header.build_id);
    println!("  Published:   {}", header.published);
    println!("  Engine:      {:?}", data_set.engine());
    println!("  Source:      {}", data_set.source_kind());
    println!();

    println!("Components:");
    for component in data_set.components() {
        let headers: Vec<&str> = component
            .headers
            .iter()
            .filter_map(|&h| data_set.headers().get(h as usize).map(|name| &**name))
            .collect();
        println!(
            "  [{}] {:<12} default {:<6} headers [{}]",
            component.index,
            component.name,
            component.default_profile_id,
            headers.join(", ")
        );
    }
    println!();

    println!("Contents:");
    println!("  Headers:     {}", data_set.headers().len());
    println!("  Properties:  {}", data_set.properties().len());
    println!("  Profiles:    {}", data_set.profile_count());
    match data_set.pattern() {
        Some(pattern) => println!("  Signatures:  {}", pattern.signature_count()),
        None => println!("  Signatures:  none"),
    }
    match data_set.graphs() {
        Some(graphs) => println!("  Graphs:      {}", graphs.graphs().len()),
        None => println!("  Graphs:      none"),
    }
    if verbose {
        for property in data_set.properties() {
            println!("    {:<24} component {} flags {:?}", property.name, property.component, property.flags);
        }
    }
    println!();

    let estimate = DataSet::estimate_memory(path, config).map_err(|e| e.to_string())?;
    let memory = data_set.memory();
    println!("Memory:");
    println!("  Resident:    {} bytes", memory.resident());
    println!("  Cache bound: {} bytes", memory.cache_bound());
    println!("  Estimate:    {} bytes ({:.1} KB)", estimate, estimate as f64 / 1024.0);

    Ok(())
}

fn cmd_detect(
    data: &str,
    ua: Option<&str>,
    evidence: &[String],
    device_id: Option<&str>,
    args: &ConfigArgs,
    verbose: bool,
) -> Result<(), String> {
    let data_set = Arc::new(dataset::load_data_set(Path::new(data), args.build()?)?);

    let results = match device_id {
        Some(id) => data_set.process_device_id(id),
        None => data_set.process_evidence(&parse_evidence(ua, evidence)?),
    };

    let report = results_json(&results, verbose);
    let text = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
    println!("{}", text);
    Ok(())
}

fn parse_evidence(ua: Option<&str>, pairs: &[String]) -> Result<Evidence, String> {
    let mut evidence = match ua {
        Some(ua) => Evidence::from_user_agent(ua),
        None => Evidence::new(),
    };
    for pair in pairs {
        let (field, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("Evidence '{}' is not prefix.key=value", pair))?;
        if !evidence.add_pair(field, value) {
            return Err(format!("Evidence '{}' has an unknown prefix", pair));
        }
    }
    Ok(evidence)
}

fn results_json(results: &Results, verbose: bool) -> Value {
    let data_set = results.data_set();

    let mut values = Map::new();
    for (index, &property) in data_set.required_properties().iter().enumerate() {
        let Some(property) = data_set.properties().get(property as usize) else {
            continue;
        };
        let value = match results.values(index) {
            Ok(list) => Value::Array(list.iter().map(|v| Value::String(v.to_string())).collect()),
            Err(reason) => json!({ "no_value": reason.to_string() }),
        };
        values.insert(property.name.to_string(), value);
    }

    let mut report = json!({
        "device_id": results.device_id(),
        "method": results.method().as_str(),
        "difference": results.difference(),
        "drift": results.drift(),
        "values": values,
    });
    if verbose {
        report["results"] = serde_json::to_value(results.results()).unwrap_or(Value::Null);
    }
    report
}

fn cmd_transform(kind: TransformKind, input: &str) -> Result<(), String> {
    let mut buffer = vec![0u8; 256];
    loop {
        let mut pairs = Vec::new();
        let callback = |name: &'static str, value: &str| pairs.push((name, value.to_string()));
        let outcome = match kind {
            TransformKind::Ghev => dd_transform::from_ghev_json(input, &mut buffer, callback),
            TransformKind::GhevBase64 => dd_transform::from_ghev_base64(input, &mut buffer, callback),
            TransformKind::Sua => dd_transform::from_sua_json(input, &mut buffer, callback),
        }
        .map_err(|e| e.to_string())?;

        if outcome.buffer_too_small {
            buffer.resize(outcome.written, 0);
            continue;
        }

        let mut headers = Map::new();
        for (name, value) in pairs {
            headers.insert(name.to_string(), Value::String(value));
        }
        let text = serde_json::to_string_pretty(&headers).map_err(|e| e.to_string())?;
        println!("{}", text);
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dd_core::{DetectionConfig, EvidencePrefix};

    const SAMPLE: &str = include_str!("../../dd-compiler/tests/data/sample.json");
    const IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_0) Safari/604.1";

    #[test]
    fn evidence_pairs_are_parsed() {
        let pairs = vec!["header.sec-ch-ua-mobile=?1".to_string(), "query.51D_deviceId=1-2=3".to_string()];
        let evidence = parse_evidence(Some("agent"), &pairs).unwrap();
        assert_eq!(evidence.header("user-agent"), Some("agent"));
        assert_eq!(evidence.header("sec-ch-ua-mobile"), Some("?1"));
        assert_eq!(evidence.get(&[EvidencePrefix::QUERY], "51D_deviceId"), Some("1-2=3"));
    }

    #[test]
    fn malformed_evidence_is_rejected() {
        assert!(parse_evidence(None, &["header.user-agent".to_string()]).is_err());
        assert!(parse_evidence(None, &["body.key=value".to_string()]).is_err());
    }

    #[test]
    fn report_lists_required_properties() {
        let bytes = dd_compiler::compile_json(SAMPLE, &dd_compiler::BuildOptions::default()).unwrap();
        let config = DetectionConfig::new().with_properties("IsMobile,BrowserName");
        let data_set = Arc::new(DataSet::from_memory(bytes, config).unwrap());
        let results = data_set.process_user_agent(IPHONE);

        let report = results_json(&results, false);
        assert_eq!(report["device_id"], results.device_id());
        assert_eq!(report["values"].as_object().unwrap().len(), 2);
        assert!(report["values"]["IsMobile"].is_array());
        assert!(report.get("results").is_none());

        let verbose = results_json(&results, true);
        assert_eq!(verbose["results"].as_array().unwrap().len(), results.len());
    }
}
