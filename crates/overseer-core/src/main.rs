//! `overseer` command-line interface

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use overseer_core::command::is_protected_target;
use overseer_core::config::GovernanceConfig;
use overseer_kernel::review::GateViolation;
use overseer_kernel::sandbox::{args, CapabilityError, CapabilityMap};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Operations the dry-run map accepts; each logs its arguments and returns null
const DRY_RUN_CAPABILITIES: &[&str] = &[
    "create_role",
    "send_message",
    "send_dm",
    "fetch_messages",
    "add_role",
    "remove_role",
];

fn cli() -> Command {
    Command::new("overseer")
        .version(overseer_core::VERSION)
        .about("Governed execution of generated administrative actions")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Governance configuration file (TOML)"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("review")
                .about("Show the advisory verdict and gate result for an action file")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("simulate")
                .about("Execute an action file against dry-run capabilities")
                .arg(
                    Arg::new("file")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("audit")
                .about("Inspect the audit log")
                .subcommand_required(true)
                .subcommand(
                    Command::new("tail").about("Print the latest records").arg(
                        Arg::new("limit")
                            .long("limit")
                            .default_value("5")
                            .value_parser(value_parser!(usize))
                            .help("Number of records"),
                    ),
                )
                .subcommand(Command::new("verify").about("Verify the hash chain")),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<GovernanceConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => GovernanceConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(GovernanceConfig::default()),
    }
}

fn read_action(args: &ArgMatches) -> anyhow::Result<String> {
    let path = args
        .get_one::<PathBuf>("file")
        .context("missing action file")?;
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn dry_run_capabilities(protected_resource: &str) -> CapabilityMap {
    let mut map = CapabilityMap::new();
    for &name in DRY_RUN_CAPABILITIES {
        map.insert_fn(name, move |call_args| async move {
            info!(capability = name, args = ?call_args, "dry run");
            Ok(serde_json::Value::Null)
        });
    }
    let protected = protected_resource.to_string();
    map.insert_fn("delete_channel", move |call_args| {
        let protected = protected.clone();
        async move {
            let target = args::id(&call_args, 0, "channel_id")?;
            if is_protected_target(&target, &protected) {
                return Err(CapabilityError::ProtectedResource(target));
            }
            info!(capability = "delete_channel", channel = %target, "dry run");
            Ok(serde_json::Value::Null)
        }
    });
    map
}

fn review(config: &GovernanceConfig, args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let text = read_action(args)?;
    let verdict = config.reviewer().review(&text);
    let gate: Result<(), GateViolation> = config.gate().check(&text);

    if args.get_flag("json") {
        let report = serde_json::json!({
            "verdict": verdict,
            "decision": verdict.decision(),
            "gate": gate.as_ref().map_or_else(|v| v.to_string(), |()| "pass".to_string()),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Decision: {:?}", verdict.decision());
        println!("Summary:  {}", verdict.summary);
        if verdict.risks.is_empty() {
            println!("Risks:    (none)");
        } else {
            println!("Risks:");
            for risk in &verdict.risks {
                println!("  - {risk}");
            }
        }
        match &gate {
            Ok(()) => println!("Gate:     pass"),
            Err(v) => println!("Gate:     {v}"),
        }
    }
    Ok(if gate.is_ok() && !verdict.is_rejected() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn simulate(config: &GovernanceConfig, args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let text = read_action(args)?;
    if let Err(v) = config.gate().check(&text) {
        println!("Blocked: {v}");
        return Ok(ExitCode::FAILURE);
    }
    let capabilities = dry_run_capabilities(&config.protected_resource);
    let sandbox = config.sandbox();
    let run = config
        .feedback_loop()
        .run(|_, _| sandbox.execute(&text, &capabilities))
        .await;
    match (run.result, run.last_error) {
        (Some(outcome), _) => {
            println!("Succeeded after {} attempt(s)", run.attempts);
            println!("{}", serde_json::to_string_pretty(&outcome.value())?);
            Ok(ExitCode::SUCCESS)
        }
        (None, error) => {
            let detail = error.map(|e| e.to_string()).unwrap_or_default();
            println!("Failed after {} attempt(s): {detail}", run.attempts);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn audit(config: &GovernanceConfig, args: &ArgMatches) -> anyhow::Result<ExitCode> {
    let log = config.open_audit_log().context("opening audit log")?;
    match args.subcommand() {
        Some(("tail", tail)) => {
            let limit = tail.get_one::<usize>("limit").copied().unwrap_or(5);
            for record in log.tail(limit)? {
                println!("{}", serde_json::to_string(&record)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Some(("verify", _)) => match log.verify_integrity() {
            Ok(count) => {
                println!("Audit chain intact ({count} records)");
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                println!("Audit chain broken: {e}");
                Ok(ExitCode::FAILURE)
            }
        },
        _ => Ok(ExitCode::FAILURE),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let matches = cli().get_matches();
    let config = load_config(&matches)?;

    match matches.subcommand() {
        Some(("review", args)) => review(&config, args),
        Some(("simulate", args)) => simulate(&config, args).await,
        Some(("audit", args)) => audit(&config, args),
        _ => Ok(ExitCode::FAILURE),
    }
}
