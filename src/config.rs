use std::env;
use std::path::PathBuf;

use serde_derive::Deserialize;

/// Config for a single machine in the driver file.
#[derive(Deserialize, Clone)]
pub struct MachineConfig {
    /// Name of the machine, used in log prefixes and for the per-machine
    /// state directory.
    ///
    /// * If not specified, the name is derived from the start script
    ///   (`run-<name>-vm`), falling back to `machine`.
    pub name: Option<String>,
    /// Launch script for the emulator. Dynamically appended flags are
    /// expected to reach the emulator binary via the script's `"${@}"`.
    pub start_script: String,
    /// Preserve the per-machine state directory across restarts.
    ///
    /// Default: false
    #[serde(default)]
    pub keep_state: bool,
    /// Permit the guest to reboot without terminating the emulator.
    ///
    /// Default: false
    #[serde(default)]
    pub allow_reboot: bool,
}

/// Config containing every machine the driver may boot.
#[derive(Deserialize)]
pub struct Config {
    /// List of machines.
    pub machine: Vec<MachineConfig>,
}

/// Host environment captured once at handle construction.
///
/// The core never reads process-wide state at call time; everything it
/// needs from the environment lives here.
#[derive(Clone, Debug)]
pub struct HostEnv {
    /// Whether a graphical display is available (`DISPLAY` or
    /// `WAYLAND_DISPLAY` is set).
    pub display_available: bool,
    /// Extra emulator options sourced from `QEMU_OPTS`.
    pub qemu_opts: Option<String>,
    /// Base directory for screenshots and VM-to-host copies (`$out`),
    /// falling back to the current directory.
    pub out_dir: PathBuf,
}

impl HostEnv {
    /// Snapshot the calling process environment.
    pub fn capture() -> Self {
        let display_available = ["DISPLAY", "WAYLAND_DISPLAY"]
            .iter()
            .any(|var| env::var_os(var).is_some());
        Self {
            display_available,
            qemu_opts: env::var("QEMU_OPTS").ok().filter(|opts| !opts.is_empty()),
            out_dir: env::var_os("out")
                .map(PathBuf::from)
                .or_else(|| env::current_dir().ok())
                .unwrap_or_else(|| ".".into()),
        }
    }
}

impl Default for HostEnv {
    fn default() -> Self {
        Self::capture()
    }
}

#[test]
fn test_machine_defaults() {
    let config: Config = toml::from_str(
        r#"
        [[machine]]
        start_script = "./result/bin/run-node1-vm"
        "#,
    )
    .unwrap();

    let machine = &config.machine[0];
    assert_eq!(machine.name, None);
    assert_eq!(machine.start_script, "./result/bin/run-node1-vm");
    assert!(!machine.keep_state);
    assert!(!machine.allow_reboot);
}

#[test]
fn test_multiple_machines() {
    let config: Config = toml::from_str(
        r#"
        [[machine]]
        name = "server"
        start_script = "./run-server-vm"
        keep_state = true

        [[machine]]
        name = "client"
        start_script = "./run-client-vm"
        allow_reboot = true
        "#,
    )
    .unwrap();

    assert_eq!(config.machine.len(), 2);
    assert_eq!(config.machine[0].name.as_deref(), Some("server"));
    assert!(config.machine[0].keep_state);
    assert!(config.machine[1].allow_reboot);
}
