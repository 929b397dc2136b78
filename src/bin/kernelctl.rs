//! kernelctl - operator command surface for the module kernel
//!
//! Every command prints one JSON document: the command outcome on success,
//! or `{"error": <kind>, "message": ..., "retryable": ...}` on failure.

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;

use module_kernel::coordinator::{authorize, CommandOutcome};
use module_kernel::launch::render_descriptor;
use module_kernel::{
    Authorizer, GitCli, KernelConfig, KernelError, LifecycleCoordinator, OperatorCommand,
    TokenAuthorizer,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Operator token proving the administrative role.
    #[arg(long, env = "KERNEL_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// Caller id recorded in logs and restart requests.
    #[arg(long, default_value = "kernelctl")]
    caller: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install, remove, update and inspect modules.
    Module {
        #[command(subcommand)]
        action: ModuleAction,
    },
    /// Inspect or self-update the kernel working tree.
    Kernel {
        #[command(subcommand)]
        action: KernelAction,
    },
    /// Diagnostics and restarts.
    Debug {
        #[command(subcommand)]
        action: DebugAction,
    },
    /// Print the rendered sandbox policy document.
    Policy {
        /// Emit JSON instead of directive lines.
        #[arg(long)]
        json: bool,
    },
    /// Print the process-manager descriptor.
    Descriptor,
    /// Generate a fresh operator token.
    Token {
        /// Write the token to this file (mode 0600) instead of stdout.
        #[arg(long)]
        write: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum ModuleAction {
    Load { url: String },
    Unload { name: String },
    Update { name: String },
    Info { name: String },
    List,
}

#[derive(Subcommand, Debug)]
enum KernelAction {
    Info,
    Update,
}

#[derive(Subcommand, Debug)]
enum DebugAction {
    Download,
    Reboot,
    Export,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let operator = match args.command {
        Command::Module { action } => match action {
            ModuleAction::Load { url } => OperatorCommand::ModuleLoad { url },
            ModuleAction::Unload { name } => OperatorCommand::ModuleUnload { name },
            ModuleAction::Update { name } => OperatorCommand::ModuleUpdate { name },
            ModuleAction::Info { name } => OperatorCommand::ModuleInfo { name },
            ModuleAction::List => OperatorCommand::ModuleList,
        },
        Command::Kernel { action } => match action {
            KernelAction::Info => OperatorCommand::KernelInfo,
            KernelAction::Update => OperatorCommand::KernelUpdate,
        },
        Command::Debug { action } => match action {
            DebugAction::Download => OperatorCommand::DebugDownload,
            DebugAction::Reboot => OperatorCommand::DebugReboot,
            DebugAction::Export => OperatorCommand::DebugExport,
        },
        Command::Policy { json } => {
            let cfg = KernelConfig::load()?;
            let document = cfg.render_policy()?.document();
            if json {
                println!("{}", serde_json::to_string_pretty(&document)?);
            } else {
                print!("{document}");
            }
            return Ok(());
        }
        Command::Descriptor => {
            let cfg = KernelConfig::load()?;
            println!("{}", serde_json::to_string_pretty(&render_descriptor(&cfg))?);
            return Ok(());
        }
        Command::Token { write } => {
            let token = TokenAuthorizer::generate_token();
            match write {
                Some(path) => {
                    TokenAuthorizer::write_token_file(&path, &token)?;
                    eprintln!("operator token written to {}", path.display());
                }
                None => println!("{token}"),
            }
            return Ok(());
        }
    };

    match run(&args.caller, args.token.as_deref(), operator) {
        Ok(outcome) => {
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
        Err(err) => {
            let report = json!({
                "error": err.kind(),
                "message": err.to_string(),
                "retryable": err.is_retryable(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            std::process::exit(1);
        }
    }
}

fn run(
    caller_id: &str,
    token: Option<&str>,
    command: OperatorCommand,
) -> std::result::Result<CommandOutcome, KernelError> {
    let cfg = KernelConfig::load()?;
    let authorizer = match &cfg.admin_token_path {
        Some(path) => TokenAuthorizer::from_file(path)?,
        None => {
            log::warn!("no admin token configured; privileged commands are disabled");
            TokenAuthorizer::deny_all()
        }
    };
    let caller = authorizer.authorize(caller_id, token);
    // Nothing on disk is created or locked until the caller and the input pass.
    authorize(&caller, &command)?;
    command.lock_scope()?;

    let coordinator = LifecycleCoordinator::from_config(&cfg, Box::new(GitCli::new()))?;
    coordinator.execute_exclusive(&caller, command)
}
