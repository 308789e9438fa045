use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::process::{Child, Command, Stdio};

use anyhow::{Context, Result};
use log::debug;
use regex::Regex;

use crate::config::HostEnv;

/// Builds and launches the emulator command line for one machine.
///
/// The handle owns the sockets and directories; the start command only
/// decides what gets executed and with which environment.
pub trait StartCommand: Send {
    /// The launcher program or script this start command wraps.
    fn program(&self) -> &str;

    /// Whether the guest may reboot without terminating the emulator.
    fn allow_reboot(&self) -> bool {
        false
    }

    /// Render the full command line.
    ///
    /// The monitor rides a local socket, the root shell a virtconsole
    /// behind a second socket, and the serial console the emulator's
    /// stdio. `-nographic` is appended when the host has a display so the
    /// emulator does not try to open a window on it.
    fn cmd(&self, host: &HostEnv, monitor_path: &Path, shell_path: &Path) -> String {
        let mut parts = vec![
            self.program().to_string(),
            format!("-monitor unix:{}", monitor_path.display()),
            format!("-chardev socket,id=shell,path={}", shell_path.display()),
            "-device virtio-serial".to_string(),
            "-device virtconsole,chardev=shell".to_string(),
            "-serial stdio".to_string(),
        ];
        if !self.allow_reboot() {
            parts.push("-no-reboot".to_string());
        }
        if host.display_available {
            parts.push("-nographic".to_string());
        }
        if let Some(opts) = &host.qemu_opts {
            parts.push(opts.clone());
        }
        parts.join(" ")
    }

    /// Merge the inherited environment with the guest bookkeeping
    /// variables and return the complete map handed to the subprocess.
    fn build_environment(&self, state_dir: &Path, shared_dir: &Path) -> HashMap<String, String> {
        let mut environment: HashMap<String, String> = env::vars().collect();
        environment.insert("TMPDIR".to_string(), state_dir.display().to_string());
        environment.insert("SHARED_DIR".to_string(), shared_dir.display().to_string());
        environment.insert("USE_TMPDIR".to_string(), "1".to_string());
        environment
    }

    /// Spawn the emulator: stdin detached, stderr folded into the
    /// captured stdout, working directory `state_dir`.
    fn spawn(
        &self,
        host: &HostEnv,
        state_dir: &Path,
        shared_dir: &Path,
        monitor_path: &Path,
        shell_path: &Path,
    ) -> Result<Child> {
        let line = self.cmd(host, monitor_path, shell_path);
        debug!("emulator invocation: {line}");

        // The serial reader drains a single pipe; the shell folds stderr
        // into it so emulator diagnostics reach the serial log.
        Command::new("sh")
            .arg("-c")
            .arg(format!("exec 2>&1; {line}"))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .current_dir(state_dir)
            .envs(self.build_environment(state_dir, shared_dir))
            .spawn()
            .with_context(|| format!("Failed to spawn emulator: {line}"))
    }
}

/// A launch script produced by the image build, following the
/// `run-<name>-vm` naming convention.
pub struct ScriptStartCommand {
    script: String,
    allow_reboot: bool,
}

impl ScriptStartCommand {
    /// Wrap a launch script.
    pub fn new<S: Into<String>>(script: S, allow_reboot: bool) -> Self {
        Self {
            script: script.into(),
            allow_reboot,
        }
    }

    /// Machine name derived from the script name, or `machine` when the
    /// script does not follow the naming convention.
    pub fn machine_name(&self) -> String {
        Regex::new("run-(.+)-vm$")
            .unwrap()
            .captures(&self.script)
            .map(|caps| caps[1].to_string())
            .unwrap_or_else(|| "machine".to_string())
    }
}

impl StartCommand for ScriptStartCommand {
    fn program(&self) -> &str {
        &self.script
    }

    fn allow_reboot(&self) -> bool {
        self.allow_reboot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    fn host(display: bool, qemu_opts: Option<&str>) -> HostEnv {
        HostEnv {
            display_available: display,
            qemu_opts: qemu_opts.map(str::to_string),
            out_dir: "/tmp".into(),
        }
    }

    #[rstest]
    #[case("./result/bin/run-node1-vm", "node1")]
    #[case("/nix/store/abc-vm/bin/run-web-server-vm", "web-server")]
    #[case("/usr/bin/qemu-kvm", "machine")]
    fn test_machine_name(#[case] script: &str, #[case] expected: &str) {
        let start = ScriptStartCommand::new(script, false);
        assert_eq!(start.machine_name(), expected);
    }

    #[test]
    fn test_cmd_wires_up_all_three_channels() {
        let start = ScriptStartCommand::new("./run-node1-vm", false);
        let line = start.cmd(
            &host(false, None),
            Path::new("/state/monitor"),
            Path::new("/state/shell"),
        );

        assert!(line.starts_with("./run-node1-vm "));
        assert!(line.contains("-monitor unix:/state/monitor"));
        assert!(line.contains("-chardev socket,id=shell,path=/state/shell"));
        assert!(line.contains("-device virtio-serial"));
        assert!(line.contains("-device virtconsole,chardev=shell"));
        assert!(line.contains("-serial stdio"));
        assert!(line.contains("-no-reboot"));
        assert!(!line.contains("-nographic"));
    }

    #[test]
    fn test_cmd_respects_allow_reboot_and_display() {
        let start = ScriptStartCommand::new("./run-node1-vm", true);
        let line = start.cmd(
            &host(true, None),
            Path::new("/state/monitor"),
            Path::new("/state/shell"),
        );

        assert!(!line.contains("-no-reboot"));
        assert!(line.contains("-nographic"));
    }

    #[test]
    fn test_cmd_appends_extra_options() {
        let start = ScriptStartCommand::new("./run-node1-vm", false);
        let line = start.cmd(
            &host(false, Some("-m 2G -smp 2")),
            Path::new("/state/monitor"),
            Path::new("/state/shell"),
        );

        assert!(line.ends_with("-m 2G -smp 2"));
    }

    #[test]
    fn test_spawn_folds_stderr_into_stdout() {
        use std::io::Read as _;

        let start = ScriptStartCommand::new("echo out; echo err >&2; true", false);
        let dir = tempfile::tempdir().unwrap();
        let mut child = start
            .spawn(
                &host(false, None),
                dir.path(),
                dir.path(),
                Path::new("/state/monitor"),
                Path::new("/state/shell"),
            )
            .unwrap();

        let mut output = String::new();
        // unwrap() never fails b/c stdout is captured
        child
            .stdout
            .take()
            .unwrap()
            .read_to_string(&mut output)
            .unwrap();
        child.wait().unwrap();

        assert!(output.contains("out"));
        assert!(output.contains("err"));
    }

    #[test]
    fn test_build_environment_returns_merged_map() {
        let start = ScriptStartCommand::new("./run-node1-vm", false);
        let environment =
            start.build_environment(Path::new("/tmp/state"), Path::new("/tmp/shared"));

        assert_eq!(environment.get("TMPDIR").unwrap(), "/tmp/state");
        assert_eq!(environment.get("SHARED_DIR").unwrap(), "/tmp/shared");
        assert_eq!(environment.get("USE_TMPDIR").unwrap(), "1");
        // The inherited environment survives the merge.
        assert_eq!(
            environment.get("PATH").cloned(),
            env::var("PATH").ok()
        );
    }
}
