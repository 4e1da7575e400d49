use anyhow::Context;
use colored::Colorize;
use mbridge_host::BridgeConfig;
use mbridge_operator::{xor_merge, MergeError};
use serde_json::json;

use crate::cli::*;
use crate::stress::{self, StressPlan, StressReport};

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Xor(args) => cmd_xor(args, cli.format),
        Command::Stress(args) => cmd_stress(args, cli.format),
        Command::Config(args) => cmd_config(args, cli.format),
    }
}

/// Decoded XOR operands; `None` existing means "no prior value".
fn parse_xor(args: &XorArgs) -> anyhow::Result<(Option<Vec<u8>>, Vec<u8>)> {
    let existing = match args.existing.as_str() {
        "-" => None,
        hex => Some(hex::decode(hex).context("existing value is not valid hex")?),
    };
    let incoming = hex::decode(&args.incoming).context("incoming value is not valid hex")?;
    Ok((existing, incoming))
}

fn cmd_xor(args: XorArgs, format: OutputFormat) -> anyhow::Result<()> {
    let (existing, incoming) = parse_xor(&args)?;
    let outcome = xor_merge(existing.as_deref(), &incoming);
    let result = match &outcome {
        Ok(bytes) => Some(hex::encode(bytes)),
        Err(MergeError::NotCombinable) => None,
        Err(e) => return Err(e.clone().into()),
    };

    match format {
        OutputFormat::Json => {
            let out = json!({
                "existing": existing.as_deref().map(hex::encode),
                "incoming": hex::encode(&incoming),
                "combinable": result.is_some(),
                "result": result,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputFormat::Text => match result {
            Some(hex) => println!("{} {}", "✓".green().bold(), hex.bold()),
            None => println!(
                "{} not combinable: lengths {} and {} differ",
                "✗".red().bold(),
                existing.as_ref().map_or(0, Vec::len),
                incoming.len()
            ),
        },
    }
    Ok(())
}

fn cmd_stress(args: StressArgs, format: OutputFormat) -> anyhow::Result<()> {
    let plan = StressPlan {
        threads: args.threads,
        calls: args.calls,
        policy: args.policy,
        zero_copy: args.mode == BufferArg::View,
        retention: args.retention,
    };
    let report = stress::run(plan)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print_stress(&report),
    }
    if report.mismatches() > 0 || report.failures() > 0 {
        anyhow::bail!(
            "{} mismatched and {} failed calls",
            report.mismatches(),
            report.failures()
        );
    }
    Ok(())
}

fn print_stress(report: &StressReport) {
    println!(
        "{} {} x {} calls via {} ({} policy, {} provider)",
        "Stress".bold(),
        report.threads,
        report.calls_per_thread,
        report.operator.cyan(),
        report.policy.yellow(),
        report.retention.yellow()
    );
    for t in &report.per_thread {
        let status = if t.mismatches == 0 && t.failures == 0 {
            "ok".green()
        } else {
            "errors".red()
        };
        println!(
            "  thread {:>3}: attaches {:>6}  detaches {:>6}  mismatches {}  failures {}  {}",
            t.thread, t.attaches, t.detaches_before_exit, t.mismatches, t.failures, status
        );
    }
    println!("  Live local refs: {}", report.live_local_refs.to_string().bold());
    println!(
        "  Attach/detach totals: {}/{}",
        report.total_attaches, report.total_detaches
    );
    println!(
        "  Elapsed: {:.1} ms ({:.0} calls/s)",
        report.elapsed_ms, report.calls_per_sec
    );
}

fn cmd_config(args: ConfigArgs, format: OutputFormat) -> anyhow::Result<()> {
    let config = match &args.file {
        Some(path) => BridgeConfig::from_file(path).with_context(|| format!("reading {}", path.display()))?,
        None => BridgeConfig::default(),
    }
    .apply_env()?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
        OutputFormat::Text => print!("{}", config.to_toml_string()?),
    }
    Ok(())
}
