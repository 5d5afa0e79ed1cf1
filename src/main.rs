//! Oobleck entry point.
//!
//! ## Subcommands
//!
//! - `oobleck master` - run the master service for a job
//! - `oobleck agent` - run the per-host agent
//! - `oobleck plan` - build a template catalogue offline and print it

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use oobleck::config::JobConfig;
use oobleck::control::agent::{script_digest, Agent, AgentArgs};
use oobleck::control::{parse_hostfile, run_master, script_worker_entry, CodeInfo, MasterService};
use oobleck::planner::TemplateCatalogue;
use oobleck::profile::LayerExecutionResults;
use oobleck::telemetry::{self, LogFormat};

#[tokio::main(worker_threads = 8)]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();
    let command = args.get(1).map(|s| s.as_str()).unwrap_or("help");

    let format = if flag(&args, "--log-json") {
        LogFormat::Json
    } else {
        LogFormat::Text
    };
    let _ = telemetry::init_logging(format);
    telemetry::init_metrics();

    match command {
        "master" => run_master_command(&args).await,
        "agent" => run_agent_command(&args).await,
        "plan" => run_plan_command(&args),
        "version" | "--version" | "-V" => {
            println!("oobleck {}", env!("CARGO_PKG_VERSION"));
            ExitCode::SUCCESS
        }
        "help" | "--help" | "-h" => {
            print_usage();
            ExitCode::SUCCESS
        }
        _ => {
            eprintln!("Unknown command: {}", command);
            print_usage();
            ExitCode::FAILURE
        }
    }
}

fn print_usage() {
    eprintln!(
        "Oobleck - elastic pipeline-parallel training coordinator v{}

USAGE:
    oobleck [COMMAND] [OPTIONS]

COMMANDS:
    master       Run the master service
    agent        Run the per-host agent
    plan         Build a pipeline-template catalogue offline
    version      Show version information
    help         Show this help message

MASTER OPTIONS:
    --config FILE         Job config file (TOML); flags override it
    --hostfile PATH       Hostfile (<ip> slots=<n> port=<p> per line)
    --script PATH         Training script to distribute
    --script-arg ARG      Argument for the training script (repeatable)
    --port PORT           Listen port (default: 29600)

AGENT OPTIONS:
    --master-ip IP        Master address
    --master-port PORT    Master port
    --agent-index N       This host's index in the hostfile
    --tag TAG             Job tag (default: default)
    --base-dir PATH       Job base directory (default: /tmp/oobleck)

PLAN OPTIONS:
    --profile PATH        Layer profile CSV
    --nodes LIST          Comma-separated candidate node counts (e.g. 1,2,4)
    --gpus-per-node N     GPUs per node (default: 1)
    --microbatches M      Microbatches per step (default: 24)

OPTIONS:
    --log-json            Emit JSON logs
    -h, --help            Show help
    -V, --version         Show version

ENVIRONMENT:
    RUST_LOG              Log level (debug, info, warn, error)

EXIT CODES:
    0  Success
    1  Failure
    2  Configuration error
",
        env!("CARGO_PKG_VERSION")
    );
}

fn flag(args: &[String], name: &str) -> bool {
    args.iter().any(|a| a == name)
}

fn flag_value(args: &[String], name: &str) -> Option<String> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

fn flag_values(args: &[String], name: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == name {
            if let Some(value) = args.get(i + 1) {
                values.push(value.clone());
                i += 1;
            }
        }
        i += 1;
    }
    values
}

async fn run_master_command(args: &[String]) -> ExitCode {
    // Flags override the job config file, which overrides defaults.
    let config = match flag_value(args, "--config") {
        Some(path) => match JobConfig::from_toml(&PathBuf::from(&path)) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("master: {}", e);
                return ExitCode::from(2);
            }
        },
        None => JobConfig::default(),
    };

    let hostfile = flag_value(args, "--hostfile")
        .map(PathBuf::from)
        .unwrap_or_else(|| config.hostfile.clone());
    let script = flag_value(args, "--script")
        .map(PathBuf::from)
        .unwrap_or_else(|| config.script.clone());
    let script_args = {
        let from_flags = flag_values(args, "--script-arg");
        if from_flags.is_empty() {
            config.script_args.clone()
        } else {
            from_flags
        }
    };
    let port: u16 = match flag_value(args, "--port").as_deref() {
        None => 29600,
        Some(value) => match value.parse() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("master: invalid --port value: {}", value);
                return ExitCode::from(2);
            }
        },
    };

    let hosts = match parse_hostfile(&hostfile) {
        Ok(hosts) => hosts,
        Err(e) => {
            eprintln!("master: {}", e);
            return ExitCode::from(2);
        }
    };

    let sha256 = match script_digest(&script) {
        Ok(digest) => digest,
        Err(e) => {
            eprintln!("master: cannot read training script {}: {}", script.display(), e);
            return ExitCode::from(2);
        }
    };
    let code = CodeInfo {
        path: script,
        args: script_args,
        sha256,
    };

    let service = Arc::new(MasterService::new(hosts, code));
    let listener = match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("master: cannot bind port {}: {}", port, e);
            return ExitCode::FAILURE;
        }
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server = tokio::spawn(run_master(listener, service, shutdown_rx));

    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    }

    match server.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            eprintln!("master: {}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("master: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_agent_command(args: &[String]) -> ExitCode {
    let Some(master_ip) = flag_value(args, "--master-ip") else {
        eprintln!("agent: --master-ip is required");
        return ExitCode::from(2);
    };
    let Some(master_port) = flag_value(args, "--master-port").and_then(|v| v.parse().ok()) else {
        eprintln!("agent: --master-port is required");
        return ExitCode::from(2);
    };
    let Some(agent_index) = flag_value(args, "--agent-index").and_then(|v| v.parse().ok()) else {
        eprintln!("agent: --agent-index is required");
        return ExitCode::from(2);
    };

    let agent_args = AgentArgs {
        master_ip,
        master_port,
        agent_index,
        tag: flag_value(args, "--tag").unwrap_or_else(|| "default".into()),
        base_dir: PathBuf::from(
            flag_value(args, "--base-dir").unwrap_or_else(|| "/tmp/oobleck".into()),
        ),
    };

    let agent = match Agent::connect(agent_args).await {
        Ok(agent) => agent,
        Err(e) => {
            eprintln!("agent: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let entry = script_worker_entry(agent.code_info().clone());
    match agent.run(entry).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("agent: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_plan_command(args: &[String]) -> ExitCode {
    let Some(profile_path) = flag_value(args, "--profile") else {
        eprintln!("plan: --profile is required");
        return ExitCode::from(2);
    };
    let gpus_per_node: usize = flag_value(args, "--gpus-per-node")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1);
    let microbatches: usize = flag_value(args, "--microbatches")
        .and_then(|v| v.parse().ok())
        .unwrap_or(24);

    let profile = match LayerExecutionResults::from_csv(&PathBuf::from(&profile_path)) {
        Ok(profile) => profile,
        Err(e) => {
            eprintln!("plan: {}", e);
            return ExitCode::from(2);
        }
    };

    let node_counts: Vec<usize> = match flag_value(args, "--nodes") {
        Some(list) => {
            let parsed: Result<Vec<usize>, _> =
                list.split(',').map(|v| v.trim().parse()).collect();
            match parsed {
                Ok(counts) => counts,
                Err(_) => {
                    eprintln!("plan: invalid --nodes list: {}", list);
                    return ExitCode::from(2);
                }
            }
        }
        None => (1..=profile.len()).collect(),
    };

    let catalogue =
        TemplateCatalogue::build(&profile, &node_counts, gpus_per_node, microbatches);

    for &n in &node_counts {
        match catalogue.get(n) {
            Some(template) => {
                let partition: Vec<String> = template
                    .stages
                    .iter()
                    .map(|s| format!("[{},{})x{}", s.layers.0, s.layers.1, s.num_gpus))
                    .collect();
                println!(
                    "{} node(s): {} stage(s), iteration {:.3} ms, partition {}",
                    n,
                    template.num_stages(),
                    template.iteration_time,
                    partition.join(" ")
                );
            }
            None => {
                let reason = catalogue
                    .failure(n)
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "not requested".into());
                println!("{} node(s): no template ({})", n, reason);
            }
        }
    }

    if catalogue.is_empty() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
