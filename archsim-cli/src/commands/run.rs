use crate::output;

use scene_engine::{
    record_channel, ExecutionOptions, LogRecord, OrchestrationError, RecordKind, RecordResult,
    RunReport, SimulationDocument,
};

use clap::Args;
use color_eyre::eyre::bail;
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the simulation document (YAML)
    pub document: PathBuf,

    /// Run a single execution instead of all of them
    #[arg(short, long)]
    pub execution: Option<String>,

    /// Simulation speed multiplier; values below 1.0 slow dispatch down
    #[arg(long, default_value_t = 1.0)]
    pub speed: f64,

    /// Keep dispatching after a unit fails
    #[arg(long)]
    pub continue_on_error: bool,

    /// Abort each execution after this many milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Print execution records as JSON lines on stdout
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    if !args.document.exists() {
        bail!("Document not found: {}", args.document.display());
    }

    output::status("Loading", &args.document.display().to_string());

    let document = match SimulationDocument::from_file(&args.document) {
        Ok(document) => document,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };
    if let Err(e) = document.validate() {
        output::error(&e.to_string());
        std::process::exit(1);
    }
    if let Some(name) = &args.execution {
        if !document.executions.iter().any(|e| &e.name == name) {
            bail!(
                "No execution named '{}' in {}",
                name,
                args.document.display()
            );
        }
    }

    let (sender, mut receiver) = record_channel();
    let simulation = document.load(Some(sender))?;
    simulation.controller().set_speed(args.speed)?;

    let options = ExecutionOptions {
        continue_on_error: args.continue_on_error.then_some(true),
        timeout_ms: args.timeout_ms,
        ..Default::default()
    };

    let title = simulation.name().unwrap_or("simulation").to_string();
    output::status("Running", &title);

    let run = async {
        match &args.execution {
            Some(name) => vec![(name.clone(), simulation.run(name, options).await)],
            None => simulation.run_all(options).await,
        }
    };
    tokio::pin!(run);

    // The simulation keeps its senders alive, so the receiver only closes on drop
    let reports = loop {
        tokio::select! {
            reports = &mut run => break reports,
            Some(record) = receiver.recv() => print_record(&record, args.json),
        }
    };
    while let Ok(record) = receiver.try_recv() {
        print_record(&record, args.json);
    }

    eprintln!();
    let mut failed = 0;
    for (name, report) in &reports {
        if !print_summary(name, report) {
            failed += 1;
        }
    }

    eprintln!();
    if failed > 0 {
        output::failure(&format!(
            "{} of {} execution(s) failed",
            failed,
            reports.len()
        ));
        std::process::exit(1);
    }

    output::success(&format!("{} execution(s) completed", reports.len()));
    Ok(())
}

fn print_record(record: &LogRecord, json: bool) {
    if json {
        match serde_json::to_string(record) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::warn!("failed to serialize record: {}", e),
        }
        return;
    }

    let timing = record
        .duration
        .map(|d| format!(" ({})", output::duration(d)))
        .unwrap_or_default();
    let message = record
        .message
        .as_deref()
        .map(|m| format!(": {}", m))
        .unwrap_or_default();

    match (record.kind, record.result) {
        (RecordKind::Execution, RecordResult::Started) => {
            let mode = record
                .metadata
                .get("mode")
                .and_then(|m| m.as_str())
                .unwrap_or("sequential");
            output::header(&format!("{} [{}]", record.name, mode));
        }
        (RecordKind::Execution, _) => {}
        (RecordKind::Unit, RecordResult::Success) => {
            output::outcome(2, true, &format!("\u{2713} {}{}", record.name, timing));
        }
        (RecordKind::Unit, RecordResult::Skipped) => {
            output::dim(&format!("  - {} skipped{}", record.name, message));
        }
        (RecordKind::Unit, _) => {
            output::outcome(
                2,
                false,
                &format!("\u{2717} {}{}{}", record.name, timing, message),
            );
        }
        (RecordKind::Scene | RecordKind::Scenario, result) => {
            let label = if record.kind == RecordKind::Scene {
                "scene"
            } else {
                "scenario"
            };
            let line = format!(
                "    {} {} {:?}{}{}",
                label, record.name, result, timing, message
            );
            output::dim(&line.to_lowercase());
        }
        (RecordKind::Simulation, _) => {
            output::info(&format!("{}{}", record.name, message));
        }
        // Already mirrored into tracing when emitted
        (RecordKind::Phase | RecordKind::Condition, _) => {}
    }
}

fn print_summary(name: &str, report: &Result<RunReport, OrchestrationError>) -> bool {
    match report {
        Ok(report) => {
            let analytics = &report.analytics;
            let line = format!(
                "{}: {} completed, {} failed, {} skipped, {} stopped in {} (peak concurrency {})",
                name,
                analytics.successful,
                analytics.failed,
                analytics.skipped,
                analytics.stopped,
                output::duration(report.duration),
                analytics.peak_concurrency
            );
            if report.success {
                output::check(&line);
            } else {
                output::failure(&line);
                for result in report.results.iter().filter(|r| r.is_failure()) {
                    let reason = result
                        .error
                        .as_ref()
                        .map(|e| e.to_string())
                        .or_else(|| result.reason.clone())
                        .unwrap_or_else(|| format!("{:?}", result.status).to_lowercase());
                    output::outcome(6, false, &format!("{}: {}", result.name, reason));
                }
            }
            report.success
        }
        Err(e) => {
            output::failure(&format!("{}: {}", name, e));
            false
        }
    }
}
