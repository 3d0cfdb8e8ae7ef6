//! micropod - run OCI container images in Firecracker microVMs.
//!
//! ## Usage
//!
//! ```sh
//! micropod run <image> [-p host:guest]...
//! micropod list
//! micropod stop <vm-id>
//! micropod logs <vm-id>
//! ```
//!
//! Exit code 0 on success; failures print a single diagnostic line on
//! stderr and exit non-zero.

use micropod::Manager;
use std::process::ExitCode;

// =============================================================================
// CLI Parsing
// =============================================================================

#[derive(Debug)]
enum Command {
    Run { image: String, publish: Vec<String> },
    List,
    Stop { vm_id: String },
    Logs { vm_id: String },
    Version,
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "run" => {
            let mut image = None;
            let mut publish = Vec::new();
            let mut i = 2;
            while i < args.len() {
                match args[i].as_str() {
                    "--publish" | "-p" => {
                        if i + 1 < args.len() {
                            publish.push(args[i + 1].clone());
                            i += 2;
                        } else {
                            return Err("--publish requires host:guest".to_string());
                        }
                    }
                    arg if arg.starts_with('-') => {
                        return Err(format!("unknown flag: {arg}"));
                    }
                    arg => {
                        if image.replace(arg.to_string()).is_some() {
                            return Err("run accepts exactly one image".to_string());
                        }
                        i += 1;
                    }
                }
            }
            let image = image.ok_or("run requires <image>")?;
            Ok(Command::Run { image, publish })
        }
        "list" => Ok(Command::List),
        "stop" => {
            let vm_id = args.get(2).cloned().ok_or("stop requires <vm-id>")?;
            Ok(Command::Stop { vm_id })
        }
        "logs" => {
            let vm_id = args.get(2).cloned().ok_or("logs requires <vm-id>")?;
            Ok(Command::Logs { vm_id })
        }
        "version" | "--version" | "-v" => Ok(Command::Version),
        "help" | "--help" | "-h" => Ok(Command::Help),
        unknown => Err(format!("unknown command: {unknown}")),
    }
}

fn print_help() {
    println!("micropod - run OCI container images in Firecracker microVMs");
    println!();
    println!("USAGE:");
    println!("    micropod <COMMAND>");
    println!();
    println!("COMMANDS:");
    println!("    run <image> [-p host:guest]...   Run an image in a new microVM");
    println!("    list                             List running VMs");
    println!("    stop <vm-id>                     Stop and clean up a VM");
    println!("    logs <vm-id>                     Follow a VM's console log");
    println!("    version                          Print version");
    println!("    help                             Print this help");
}

// =============================================================================
// Commands
// =============================================================================

async fn cmd_run(image: String, publish: Vec<String>) -> micropod::Result<()> {
    let manager = Manager::new()?;
    let vm_id = manager.run_vm(&image, &publish).await?;
    println!("VM started successfully with ID: {vm_id}");
    Ok(())
}

async fn cmd_list() -> micropod::Result<()> {
    let manager = Manager::new()?;
    let vms = manager.list_vms().await?;

    if vms.is_empty() {
        println!("No running VMs found");
        return Ok(());
    }

    println!(
        "{:<36} {:<24} {:<10} {:<8} CREATED",
        "VM ID", "IMAGE", "STATE", "PID"
    );
    for vm in vms {
        println!(
            "{:<36} {:<24} {:<10} {:<8} {}",
            vm.id,
            vm.image_ref,
            vm.state,
            vm.firecracker_pid,
            vm.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_stop(vm_id: String) -> micropod::Result<()> {
    let manager = Manager::new()?;
    manager.stop_vm(&vm_id).await?;
    println!("VM {vm_id} stopped successfully");
    Ok(())
}

async fn cmd_logs(vm_id: String) -> micropod::Result<()> {
    let manager = Manager::new()?;
    // Blocking follow loop; runs until the VM is removed or Ctrl-C.
    tokio::task::spawn_blocking(move || {
        let mut stdout = std::io::stdout();
        manager.follow_logs(&vm_id, &mut stdout)
    })
    .await
    .map_err(|e| micropod::Error::Internal(format!("log follower panicked: {e}")))?
}

// =============================================================================
// Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> ExitCode {
    // Progress chatter only when a human is watching stderr.
    let default_filter = if std::io::IsTerminal::is_terminal(&std::io::stderr()) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .init();

    let command = match parse_args() {
        Ok(command) => command,
        Err(message) => {
            eprintln!("Error: {message}");
            return ExitCode::FAILURE;
        }
    };

    let result = match command {
        Command::Run { image, publish } => cmd_run(image, publish).await,
        Command::List => cmd_list().await,
        Command::Stop { vm_id } => cmd_stop(vm_id).await,
        Command::Logs { vm_id } => cmd_logs(vm_id).await,
        Command::Version => {
            println!("micropod {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Help => {
            print_help();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
