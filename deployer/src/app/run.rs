//! Command execution

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::app::options::{AppOptions, Command};
use crate::cloud::InMemoryEcs;
use crate::deploy::pipeline::DeployManager;
use crate::filesys::file::File;
use crate::models::manifest::{DeployManifest, TargetFilter, TargetSet};
use crate::report::Reporter;

/// Run one command and return the process exit code
pub async fn run(options: AppOptions, reporter: Reporter) -> anyhow::Result<i32> {
    // build targets first: a bad manifest must fail before any cloud call
    let targets = match &options.command {
        Command::Service { manifest, .. } => Some(load_targets(manifest, &options.filter).await?),
        Command::Delete { .. } => None,
    };

    let state_file = File::new(&options.state_file);
    let ecs = Arc::new(
        InMemoryEcs::load(&state_file)
            .await
            .with_context(|| format!("loading state from {}", state_file.path().display()))?,
    );
    let manager = DeployManager::new(ecs.clone(), reporter, options.pipeline.clone());

    let report = match (&options.command, &targets) {
        (Command::Service { dry_run: true, .. }, Some(targets)) => manager.dry_run(targets).await?,
        (Command::Service { .. }, Some(targets)) => manager.run(targets).await?,
        (Command::Delete { environment, force }, _) => {
            manager.delete(environment, *force, confirm_on_stdin).await?
        }
        (Command::Service { .. }, None) => anyhow::bail!("no deploy targets were loaded"),
    };

    if options.command.mutates() {
        ecs.save(&state_file)
            .await
            .with_context(|| format!("saving state to {}", state_file.path().display()))?;
    }

    if report.succeeded() {
        info!("Run {} succeeded", report.run_id);
    } else {
        warn!("Run {} failed", report.run_id);
    }
    Ok(report.exit_code())
}

/// Read a rendered manifest and build the target set
pub async fn load_targets(path: &Path, filter: &TargetFilter) -> anyhow::Result<TargetSet> {
    let manifest: DeployManifest = File::new(path)
        .read_json()
        .await
        .with_context(|| format!("reading manifest {}", path.display()))?;
    let targets = TargetSet::from_manifest(manifest, filter)?;
    info!(
        "Loaded {} service(s) and {} scheduled task(s), {} to deploy",
        targets.services.len(),
        targets.scheduled_tasks.len(),
        targets.deploy_count()
    );
    Ok(targets)
}

fn confirm_on_stdin(candidates: &[String]) -> bool {
    print!("Delete {} item(s)? [y/N]: ", candidates.len());
    if io::stdout().flush().is_err() {
        return false;
    }
    let mut answer = String::new();
    match io::stdin().lock().read_line(&mut answer) {
        Ok(_) => answer.trim().eq_ignore_ascii_case("y"),
        Err(_) => false,
    }
}
