use anyhow::Result;
use std::process::ExitCode;
use taskflow::cli::{Args, ConfigDiscovery, ExecutionMode, Plan, PlanRunner, RunConfig};
use taskflow::env;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let verbose = matches!(&mode, ExecutionMode::Run(config) if config.verbose);
    init_logging(verbose);

    let result = match mode {
        ExecutionMode::Run(config) => run_plan(config).await,
        ExecutionMode::ShowConfig => {
            ConfigDiscovery::show_discovery_info();
            Ok(true)
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: bool) {
    let default_filter = if verbose {
        "taskflow=debug"
    } else {
        env::vars::DEFAULT_LOG_FILTER
    };
    let filter = EnvFilter::try_from_env(env::vars::LOG_FILTER)
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Returns whether every task succeeded
async fn run_plan(config: RunConfig) -> Result<bool> {
    info!("Running plan {:?}", config.plan_file);

    let mut taskflow_config = match &config.config_override {
        Some(path) => ConfigDiscovery::load(path)?,
        None => ConfigDiscovery::discover_config()?,
    };
    if let Some(limit) = config.max_concurrent {
        taskflow_config.queue.max_concurrent_tasks = Some(limit);
    }

    let plan = Plan::from_toml_file(&config.plan_file)?;
    if config.verbose {
        println!("Loaded {} task(s)", plan.tasks.len());
        for (i, task) in plan.tasks.iter().enumerate() {
            println!("  {}: {}", i + 1, task.name);
        }
    }

    let report = PlanRunner::new(taskflow_config)
        .verbose(config.verbose)
        .run(&plan)
        .await?;
    report.print_summary();

    Ok(report.succeeded())
}
