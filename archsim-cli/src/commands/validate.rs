use crate::output;

use scene_engine::orchestrator::DependencyGraph;
use scene_engine::SimulationDocument;

use clap::Args;
use color_eyre::eyre::bail;
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the simulation document (YAML)
    pub document: PathBuf,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    if !args.document.exists() {
        bail!("Document not found: {}", args.document.display());
    }

    output::status("Validating", &args.document.display().to_string());

    let document = match SimulationDocument::from_file(&args.document) {
        Ok(document) => document,
        Err(e) => {
            output::error(&e.to_string());
            std::process::exit(1);
        }
    };

    output::check(&format!(
        "Document parsed: {}",
        document.name.as_deref().unwrap_or("(unnamed)")
    ));
    output::check(&format!(
        "{} scene(s), {} scenario(s), {} responder(s), {} execution(s)",
        document.scenes.len(),
        document.scenarios.len(),
        document.responders.len(),
        document.executions.len()
    ));

    if let Err(e) = document.validate() {
        output::error(&e.to_string());
        std::process::exit(1);
    }
    output::check("Names, targets and conditions resolved");

    for execution in &document.executions {
        // validate() already built every graph
        let Ok(levels) = DependencyGraph::build(execution).and_then(|g| g.levels()) else {
            continue;
        };
        output::info(&format!(
            "{} [{:?}]: {} unit(s) in {} level(s)",
            execution.name,
            execution.execution_mode,
            execution.units.len(),
            levels.len()
        ));
        for (depth, level) in levels.iter().enumerate() {
            output::dim(&format!("      {}: {}", depth, level.join(", ")));
        }
    }

    let conditions = document.condition_dependencies();
    if !conditions.is_empty() {
        eprintln!();
        output::header("Condition dependencies");
    }
    for entry in conditions {
        let keys: Vec<&str> = entry.dependencies.iter().map(String::as_str).collect();
        output::info(&format!("{}: {}", entry.location, entry.expression));
        if keys.is_empty() {
            output::warning("depends on no state keys and never re-evaluates");
        } else {
            output::dim(&format!("      {}", keys.join(", ")));
        }
    }

    eprintln!();
    output::success("Document is valid");
    Ok(())
}
