use std::fs;
use std::path::PathBuf;
use std::process::exit;

use anyhow::{bail, Context, Result};
use clap::Parser;
use console::style;
use env_logger::Builder;

use vmdriver::machine::{Machine, MachineOpts};
use vmdriver::{Config, MachineConfig, ScriptStartCommand};

#[derive(Parser, Debug)]
#[clap(version)]
struct Args {
    /// Path to config file
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Launch script for a single machine
    #[clap(short, long, conflicts_with = "config")]
    start_script: Option<String>,
    /// Machine name. Defaults to the name encoded in the start script
    /// (`run-<name>-vm`), falling back to `machine`.
    #[clap(short, long, conflicts_with = "config")]
    name: Option<String>,
    /// Preserve VM state across runs
    #[clap(short, long)]
    keep_state: bool,
    /// Permit the guest to reboot without terminating the emulator
    #[clap(long)]
    allow_reboot: bool,
    /// Scratch directory for VM state. Defaults to a fresh temp dir.
    #[clap(long)]
    tmp_dir: Option<PathBuf>,
    /// Command to run in the guest. `-` to get an interactive shell.
    command: Vec<String>,
}

/// Initialize logging through env_logger, configured via `RUST_LOG`.
fn init_logging() -> Result<()> {
    Builder::from_default_env()
        .default_format()
        .try_init()
        .context("Failed to init env_logger")
}

/// Resolve command line arguments into the machine list.
fn config(args: &Args) -> Result<Vec<MachineConfig>> {
    match &args.start_script {
        Some(script) => Ok(vec![MachineConfig {
            name: args.name.clone(),
            start_script: script.clone(),
            keep_state: args.keep_state,
            allow_reboot: args.allow_reboot,
        }]),
        None => {
            let default = PathBuf::from("vmdriver.toml");
            let config_path = args.config.as_ref().unwrap_or(&default);
            let contents = fs::read_to_string(config_path).context("Failed to read config file")?;
            let config: Config = toml::from_str(&contents).context("Failed to parse config")?;
            if config.machine.is_empty() {
                bail!("Config declares no machines");
            }
            Ok(config.machine)
        }
    }
}

fn build_machine(machine_config: &MachineConfig, tmp_dir: &std::path::Path) -> Result<Machine> {
    let start = ScriptStartCommand::new(
        machine_config.start_script.clone(),
        machine_config.allow_reboot,
    );
    let name = machine_config
        .name
        .clone()
        .unwrap_or_else(|| start.machine_name());

    let mut opts = MachineOpts::new(name, tmp_dir);
    opts.keep_state = machine_config.keep_state;

    Machine::new(Box::new(start), opts)
}

/// Run one machine to completion and return the guest command's exit
/// status.
fn run_one(machine: &mut Machine, command: &str) -> Result<i32> {
    if command == "-" {
        machine.shell_interact()?;
        machine.release();
        return Ok(0);
    }

    machine.start()?;
    let (status, output) = machine.execute(command)?;
    print!("{output}");
    machine.shutdown()?;
    Ok(status)
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging()?;
    let machines = config(&args)?;
    let command = if args.command.is_empty() {
        "-".to_string()
    } else {
        args.command.join(" ")
    };
    if command == "-" && machines.len() > 1 {
        bail!("Interactive mode drives a single machine");
    }

    let scratch;
    let tmp_dir = match &args.tmp_dir {
        Some(dir) => dir.clone(),
        None => {
            scratch = tempfile::tempdir().context("Failed to create scratch directory")?;
            scratch.path().to_path_buf()
        }
    };

    let mut failed = 0;
    for machine_config in &machines {
        let mut machine = match build_machine(machine_config, &tmp_dir) {
            Ok(m) => m,
            Err(e) => {
                eprintln!("Failed to set up machine: {:?}", e);
                failed += 1;
                continue;
            }
        };

        let title = format!("Machine '{}' results:", machine.name());
        println!("{}", title);
        println!("{}", "=".repeat(title.len()));

        match run_one(&mut machine, &command) {
            Ok(0) => println!("{}", style("ok").green()),
            Ok(rc) => {
                println!("{}", style(format!("command exited with {rc}")).red());
                failed += 1;
            }
            Err(e) => {
                machine.release();
                // NB: need to use debug formatting to get full error chain
                eprintln!("{}", style(format!("Failed to run: {:?}", e)).red());
                failed += 1;
            }
        }
    }

    if failed > 0 {
        exit(1);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::{Builder as TempBuilder, TempDir};

    fn test_config() -> Result<TempDir> {
        let tmp_dir = TempBuilder::new().tempdir()?;
        let config_path = tmp_dir.path().join("vmdriver.toml");
        fs::write(
            &config_path,
            r#"
        [[machine]]
        name = "node1"
        start_script = "./run-node1-vm"
        [[machine]]
        start_script = "./run-node2-vm"
        keep_state = true
        "#,
        )
        .unwrap();
        Ok(tmp_dir)
    }

    #[test]
    fn test_config_file_lists_machines() {
        let tmp_dir = test_config().expect("Failed to create config");
        let config_path = tmp_dir.path().join("vmdriver.toml");

        let args = Args::parse_from([
            "cliname",
            "-c",
            config_path.to_str().expect("Failed to create config path"),
        ]);
        let machines = config(&args).expect("Failed to parse config");
        assert_eq!(machines.len(), 2);
        assert_eq!(machines[0].name.as_deref(), Some("node1"));
        assert!(machines[1].keep_state);
    }

    #[test]
    fn test_start_script_overrides_config() {
        let args = Args::parse_from(["cliname", "-s", "./run-web-vm", "echo hello"]);
        let machines = config(&args).expect("Failed to resolve machines");
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].start_script, "./run-web-vm");
        assert_eq!(machines[0].name, None);
    }

    #[test]
    fn test_keep_state_flag_is_carried() {
        let args = Args::parse_from(["cliname", "-s", "./run-web-vm", "-k"]);
        let machines = config(&args).expect("Failed to resolve machines");
        assert!(machines[0].keep_state);
    }
}
