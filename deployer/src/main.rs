//! ECS Deployer - Entry Point
//!
//! Deploys the services and scheduled tasks of a rendered manifest, or deletes
//! everything managed in one environment.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use ecs_deployer::app::options::{AppOptions, Command};
use ecs_deployer::app::run::run;
use ecs_deployer::filesys::file::File;
use ecs_deployer::logs::{init_logging, LogOptions};
use ecs_deployer::report::Reporter;
use ecs_deployer::storage::settings::Settings;
use ecs_deployer::utils::version_info;

use tracing::{error, info};

const USAGE: &str = "\
Usage:
  ecs-deployer service --manifest=<file> [--dry-run=true] [options]
  ecs-deployer delete --environment=<name> [--force=true] [options]
  ecs-deployer --version

Options:
  --settings=<file>            JSON settings file
  --state-file=<file>          sandbox cluster state
  --threads-count=<n>          worker pool size
  --service-wait-max-attempts=<n>
  --service-wait-delay=<secs>
  --service-zero-keep=<bool>
  --stop-before-deploy=<bool>
  --delete-unused-service=<bool>
  --service-update-only=<bool>
  --task-definition-update-only=<bool>
  --deploy-service-group=<group>
  --template-group=<group>
  --log-level=<level>  --log-json=<bool>  --log-dir=<dir>";

const EXIT_USAGE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();
    let mut positional: Vec<String> = Vec::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        } else {
            positional.push(arg.clone());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(version) => println!("{}", version),
            Err(e) => eprintln!("Failed to render version: {e}"),
        }
        return ExitCode::SUCCESS;
    }

    let command = match parse_command(positional.first().map(String::as_str), &cli_args) {
        Some(command) => command,
        None => {
            eprintln!("{}", USAGE);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    // Retrieve the settings file, then apply command line overrides
    let mut settings = match cli_args.get("settings") {
        Some(path) => match File::new(path).read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file {}: {}", path, e);
                return ExitCode::FAILURE;
            }
        },
        None => Settings::default(),
    };
    if let Err(e) = settings
        .apply_overrides(&cli_args)
        .and_then(|_| settings.validate())
    {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        json_format: settings.log_json,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let state_file = cli_args.get("state-file").map(PathBuf::from);
    let options = AppOptions::new(command, &settings, state_file);
    info!("Running ECS Deployer with options: {:?}", options);

    match run(options, Reporter::stdout()).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            error!("Deploy failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn parse_command(name: Option<&str>, cli_args: &HashMap<String, String>) -> Option<Command> {
    match name? {
        "service" => Some(Command::Service {
            manifest: PathBuf::from(cli_args.get("manifest")?),
            dry_run: is_true(cli_args.get("dry-run")),
        }),
        "delete" => Some(Command::Delete {
            environment: cli_args.get("environment")?.clone(),
            force: is_true(cli_args.get("force")),
        }),
        _ => None,
    }
}

fn is_true(value: Option<&String>) -> bool {
    value.is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "yes" | "1"))
}
