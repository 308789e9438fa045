use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use log::debug;
use regex::Regex;
use scopeguard::ScopeGuard;
use tempfile::{tempdir, tempdir_in};

use crate::config::HostEnv;
use crate::error::Error;
use crate::keys::key_token;
use crate::logger::{LogFacade, NestedRegion, TestLogger};
use crate::monitor::Monitor;
use crate::ocr::Ocr;
use crate::retry::{retry, DEFAULT_TIMEOUT};
use crate::serial;
use crate::shell::Shell;
use crate::start::StartCommand;
use crate::util::{bind_listener, copy_recursive, ensure_private_dir, make_command};

/// Guest-side mount point of the shared exchange directory.
const GUEST_SHARED_DIR: &str = "/tmp/shared";

/// The network link toggled by `block`/`unblock`. The first link stays up
/// so the driver can keep talking to the guest.
const BLOCKED_LINK: &str = "virtio-net-pci.1";

/// Construction parameters for a [`Machine`].
pub struct MachineOpts {
    /// Machine name, used in log prefixes and the state directory name.
    pub name: String,
    /// Scratch directory exclusively owned by this handle.
    pub tmp_dir: PathBuf,
    /// Preserve the state directory across restarts.
    pub keep_state: bool,
    /// Sink for serial console lines.
    pub log_serial: Arc<dyn TestLogger>,
    /// Sink for machine state transitions.
    pub log_state: Arc<dyn TestLogger>,
    /// Host environment snapshot.
    pub host: HostEnv,
    /// The OCR pipeline used by the screen-text operations.
    pub ocr: Ocr,
}

impl MachineOpts {
    /// Options with default sinks: both logs forwarded to the `log`
    /// crate, host environment captured now, OCR probed on the host.
    pub fn new<S: Into<String>, P: Into<PathBuf>>(name: S, tmp_dir: P) -> Self {
        Self {
            name: name.into(),
            tmp_dir: tmp_dir.into(),
            keep_state: false,
            log_serial: Arc::new(LogFacade),
            log_state: Arc::new(LogFacade),
            host: HostEnv::capture(),
            ocr: Ocr::detect(),
        }
    }
}

/// A handle to one virtual machine across its entire lifecycle.
///
/// The handle owns the emulator subprocess and three channels into the
/// guest: the management monitor, the in-guest root shell, and the serial
/// console. The public API is synchronous and single-threaded; the only
/// auxiliary task is the serial reader feeding `wait_for_console_text`.
///
/// Lifecycle: fresh, booted after [`start`](Self::start), connected after
/// [`connect`](Self::connect), shut after [`shutdown`](Self::shutdown) or
/// [`crash`](Self::crash). From shut, `start` boots the machine again,
/// reusing the state directory when `keep_state` was set.
pub struct Machine {
    name: String,
    state_dir: PathBuf,
    shared_dir: PathBuf,
    monitor_path: PathBuf,
    shell_path: PathBuf,
    start_command: Box<dyn StartCommand>,
    host: HostEnv,
    ocr: Ocr,
    log_serial: Arc<dyn TestLogger>,
    log_state: Arc<dyn TestLogger>,
    process: Option<Child>,
    pid: Option<u32>,
    monitor: Option<Monitor>,
    shell: Option<Shell>,
    booted: bool,
    connected: bool,
    last_lines: Option<Receiver<String>>,
}

fn parse_unit_info(output: &str) -> HashMap<String, String> {
    let line_pattern = Regex::new(r"^([^=]+)=(.*)$").unwrap();
    let mut info = HashMap::new();
    for line in output.lines() {
        if let Some(caps) = line_pattern.captures(line) {
            info.insert(caps[1].to_string(), caps[2].to_string());
        }
    }
    info
}

fn user_systemctl_command(query: &str, user: &str) -> String {
    let query = query.replace('\'', "\\'");
    format!(
        "su -l {user} --shell /bin/sh -c \
         $'XDG_RUNTIME_DIR=/run/user/`id -u` systemctl --user {query}'"
    )
}

impl Machine {
    /// Construct a handle and set up its directories.
    ///
    /// Creates `shared-xchg` and `vm-state-<name>` under `tmp_dir` with
    /// mode 0o700. A stale state directory is deleted first unless
    /// `keep_state` asks for it to survive. Nothing is started yet.
    pub fn new(start_command: Box<dyn StartCommand>, opts: MachineOpts) -> Result<Self> {
        let MachineOpts {
            name,
            tmp_dir,
            keep_state,
            log_serial,
            log_state,
            host,
            ocr,
        } = opts;

        let shared_dir = tmp_dir.join("shared-xchg");
        ensure_private_dir(&shared_dir)?;

        let state_dir = tmp_dir.join(format!("vm-state-{name}"));
        if !keep_state && state_dir.exists() {
            fs::remove_dir_all(&state_dir)
                .with_context(|| format!("Failed to delete state at {}", state_dir.display()))?;
            log_state.log(&format!("    -> delete state @ {}", state_dir.display()));
        }
        ensure_private_dir(&state_dir)?;

        let monitor_path = state_dir.join("monitor");
        let shell_path = state_dir.join("shell");

        Ok(Self {
            name,
            state_dir,
            shared_dir,
            monitor_path,
            shell_path,
            start_command,
            host,
            ocr,
            log_serial,
            log_state,
            process: None,
            pid: None,
            monitor: None,
            shell: None,
            booted: false,
            connected: false,
            last_lines: None,
        })
    }

    /// This machine's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Working directory of the emulator subprocess.
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Host directory the guest sees at `/tmp/shared`.
    pub fn shared_dir(&self) -> &Path {
        &self.shared_dir
    }

    /// Pid of the emulator while it is running.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether this machine is booted and its root shell is connected.
    pub fn is_up(&self) -> bool {
        self.booted && self.connected
    }

    fn log(&self, message: &str) {
        self.log_state.log(&format!("[{}] {message}", self.name));
    }

    fn nested(&self, message: &str) -> NestedRegion {
        self.log_state.nested(&format!("[{}] {message}", self.name))
    }

    fn monitor_mut(&mut self) -> Result<&mut Monitor> {
        self.monitor
            .as_mut()
            .context("machine is not booted: no monitor stream")
    }

    fn shell_mut(&mut self) -> Result<&mut Shell> {
        self.shell
            .as_mut()
            .context("machine is not booted: no shell stream")
    }

    /// Boot this machine.
    ///
    /// Idempotent. Binds the monitor and shell listeners, spawns the
    /// emulator, accepts one peer on each listener, starts the serial
    /// reader, and waits for the first monitor prompt as proof of life.
    pub fn start(&mut self) -> Result<()> {
        if self.booted {
            return Ok(());
        }

        self.log("start");

        let monitor_listener = bind_listener(&self.monitor_path)?;
        let shell_listener = bind_listener(&self.shell_path)?;

        let child = self.start_command.spawn(
            &self.host,
            &self.state_dir,
            &self.shared_dir,
            &self.monitor_path,
            &self.shell_path,
        )?;
        // Reap the emulator if anything below fails before boot completes.
        let mut child = scopeguard::guard(child, |mut child| {
            let _ = child.kill();
            let _ = child.wait();
        });

        let (monitor_stream, _) = monitor_listener
            .accept()
            .context(Error::SocketSetup(self.monitor_path.clone()))?;
        let (shell_stream, _) = shell_listener
            .accept()
            .context(Error::SocketSetup(self.shell_path.clone()))?;

        // unwrap() never fails b/c stdout is captured
        let stdout = child.stdout.take().unwrap();
        let (lines, last_lines) = mpsc::channel();
        let _ = serial::spawn(
            stdout,
            lines,
            Arc::clone(&self.log_serial),
            self.name.clone(),
        );
        self.last_lines = Some(last_lines);

        let mut monitor = Monitor::new(monitor_stream);
        monitor
            .wait_for_prompt()
            .context("Failed waiting for the initial monitor prompt")?;

        let child = ScopeGuard::into_inner(child);
        let pid = child.id();
        self.pid = Some(pid);
        self.process = Some(child);
        self.monitor = Some(monitor);
        self.shell = Some(Shell::new(shell_stream));
        self.booted = true;

        self.log(&format!("emulator running (pid {pid})"));
        Ok(())
    }

    /// Connect to this machine's root shell.
    ///
    /// Idempotent. Boots the machine if necessary, then performs one
    /// priming read to consume the banner the in-guest shell emits before
    /// the first command.
    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }

        let _region = self.nested("wait for the VM to finish booting");
        self.start()?;

        self.log("connect to guest root shell");
        let tic = Instant::now();
        self.shell_mut()?.prime()?;
        self.log(&format!("(took {:.2} seconds)", tic.elapsed().as_secs_f64()));
        self.connected = true;
        Ok(())
    }

    fn wait_for_shutdown(&mut self) -> Result<()> {
        if !self.booted {
            return Ok(());
        }

        let _region = self.nested("wait for the VM to power off");
        if let Some(mut process) = self.process.take() {
            let status = process
                .wait()
                .context("Failed to wait for the emulator to exit")?;
            debug!("[{}] emulator exited with {status}", self.name);
        }

        self.pid = None;
        self.booted = false;
        self.connected = false;
        self.monitor = None;
        self.shell = None;
        self.last_lines = None;
        Ok(())
    }

    /// Shut down this machine gracefully via an in-guest `poweroff`.
    ///
    /// No-op when the machine is not booted.
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.booted {
            return Ok(());
        }

        self.log("regular shutdown");
        self.shell_mut()?.send_raw("poweroff\n")?;
        self.wait_for_shutdown()
    }

    /// Terminate the emulator abruptly, modeling a power cut.
    ///
    /// No-op when the machine is not booted.
    pub fn crash(&mut self) -> Result<()> {
        if !self.booted {
            return Ok(());
        }

        self.log("simulate forced crash");
        // The emulator drops the monitor on `quit`; a reply without a
        // prompt is expected here.
        if let Err(e) = self.send_monitor_command("quit") {
            debug!("[{}] monitor closed during quit: {e:#}", self.name);
        }
        self.wait_for_shutdown()
    }

    /// Kill the emulator unconditionally. Best-effort, for fatal cleanup;
    /// never fails.
    pub fn release(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };
        self.log(&format!("kill emulator (pid {pid})"));
        if let Some(child) = self.process.as_mut() {
            if let Err(e) = child.kill() {
                debug!("[{}] failed to kill emulator: {e}", self.name);
            }
            let _ = child.wait();
        }
    }

    /// Send a low level monitor command and return its reply.
    pub fn send_monitor_command(&mut self, command: &str) -> Result<String> {
        self.log(&format!("send monitor command: {command}"));
        self.monitor_mut()?.send(command)
    }

    /// Take down the second network link, making this machine unreachable
    /// from its peers while the driver keeps its own channels.
    pub fn block(&mut self) -> Result<()> {
        self.send_monitor_command(&format!("set_link {BLOCKED_LINK} off"))?;
        Ok(())
    }

    /// Bring the second network link back up.
    pub fn unblock(&mut self) -> Result<()> {
        self.send_monitor_command(&format!("set_link {BLOCKED_LINK} on"))?;
        Ok(())
    }

    /// Execute a shell command, returning `(exit status, output)`.
    ///
    /// Drives [`connect`](Self::connect) first when necessary.
    pub fn execute(&mut self, command: &str) -> Result<(i32, String)> {
        self.connect()?;
        self.shell_mut()?.run(command)
    }

    /// Execute each command and require a zero exit status.
    ///
    /// Returns the concatenated outputs. The first failing command raises
    /// [`Error::CommandFailed`].
    pub fn succeed(&mut self, commands: &[&str]) -> Result<String> {
        let mut output = String::new();
        for &command in commands {
            let _region = self.nested(&format!("must succeed: {command}"));
            let (status, out) = self.execute(command)?;
            if status != 0 {
                self.log(&format!("output: {out}"));
                return Err(Error::CommandFailed {
                    command: command.to_string(),
                    status,
                    output: out,
                }
                .into());
            }
            output.push_str(&out);
        }
        Ok(output)
    }

    /// Execute each command and require a non-zero exit status.
    ///
    /// Returns the concatenated outputs. The first command that succeeds
    /// raises [`Error::CommandUnexpectedlySucceeded`].
    pub fn fail(&mut self, commands: &[&str]) -> Result<String> {
        let mut output = String::new();
        for &command in commands {
            let _region = self.nested(&format!("must fail: {command}"));
            let (status, out) = self.execute(command)?;
            if status == 0 {
                return Err(Error::CommandUnexpectedlySucceeded {
                    command: command.to_string(),
                    output: out,
                }
                .into());
            }
            output.push_str(&out);
        }
        Ok(output)
    }

    /// Repeat a command until it succeeds, returning the output of the
    /// last observation.
    pub fn wait_until_succeeds(&mut self, command: &str) -> Result<String> {
        let _region = self.nested(&format!("wait for success: {command}"));
        let mut output = String::new();
        retry(
            |_| {
                let (status, out) = self.execute(command)?;
                output = out;
                Ok(status == 0)
            },
            DEFAULT_TIMEOUT,
        )?;
        Ok(output)
    }

    /// Repeat a command until it fails, returning the output of the last
    /// observation.
    pub fn wait_until_fails(&mut self, command: &str) -> Result<String> {
        let _region = self.nested(&format!("wait for failure: {command}"));
        let mut output = String::new();
        retry(
            |_| {
                let (status, out) = self.execute(command)?;
                output = out;
                Ok(status != 0)
            },
            DEFAULT_TIMEOUT,
        )?;
        Ok(output)
    }

    /// Wait for a systemd unit to reach state "active".
    ///
    /// A "failed" reading is fatal immediately. An "inactive" reading is
    /// fatal once the job queue is empty and a re-fetch still shows
    /// inactive; otherwise the poll continues.
    pub fn wait_for_unit(&mut self, unit: &str, user: Option<&str>) -> Result<()> {
        retry(
            |_| {
                let info = self.get_unit_info(unit, user)?;
                let state = info
                    .get("ActiveState")
                    .with_context(|| format!("no ActiveState reported for unit \"{unit}\""))?
                    .clone();
                if state == "failed" {
                    return Err(Error::UnitFailed(unit.to_string()).into());
                }
                if state == "inactive" {
                    let (_, jobs) = self.systemctl("list-jobs --full 2>&1", user)?;
                    if jobs.contains("No jobs") {
                        let info = self.get_unit_info(unit, user)?;
                        if info.get("ActiveState") == Some(&state) {
                            return Err(Error::UnitInactiveNoJobs(unit.to_string()).into());
                        }
                    }
                }
                Ok(state == "active")
            },
            DEFAULT_TIMEOUT,
        )
    }

    /// Get the property map for a unit, optionally scoped to a user.
    ///
    /// Later duplicate keys overwrite earlier ones.
    pub fn get_unit_info(
        &mut self,
        unit: &str,
        user: Option<&str>,
    ) -> Result<HashMap<String, String>> {
        let (status, output) = self.systemctl(&format!("--no-pager show \"{unit}\""), user)?;
        if status != 0 {
            let user_str = user.map(|u| format!(" under user \"{u}\"")).unwrap_or_default();
            bail!(
                "retrieving systemctl info for unit \"{unit}\"{user_str} \
                 failed with exit code {status}"
            );
        }
        Ok(parse_unit_info(&output))
    }

    /// Execute a low level systemctl query, optionally within the scope
    /// of a user session.
    pub fn systemctl(&mut self, query: &str, user: Option<&str>) -> Result<(i32, String)> {
        match user {
            Some(user) => {
                let command = user_systemctl_command(query, user);
                self.execute(&command)
            }
            None => self.execute(&format!("systemctl {query}")),
        }
    }

    /// Assert that a unit is in the given state (usually "active") right
    /// now, without retrying.
    pub fn require_unit_state(&mut self, unit: &str, require_state: &str) -> Result<()> {
        let _region = self.nested(&format!(
            "check if unit '{unit}' has reached state '{require_state}'"
        ));
        let info = self.get_unit_info(unit, None)?;
        let state = info
            .get("ActiveState")
            .with_context(|| format!("no ActiveState reported for unit \"{unit}\""))?;
        if state != require_state {
            bail!(
                "expected unit '{unit}' to be in state '{require_state}' \
                 but it is in state '{state}'"
            );
        }
        Ok(())
    }

    /// Start a systemd job, optionally as a user.
    pub fn start_job(&mut self, job: &str, user: Option<&str>) -> Result<(i32, String)> {
        self.systemctl(&format!("start {job}"), user)
    }

    /// Stop a systemd job, optionally as a user.
    pub fn stop_job(&mut self, job: &str, user: Option<&str>) -> Result<(i32, String)> {
        self.systemctl(&format!("stop {job}"), user)
    }

    /// Alias for [`wait_for_unit`](Self::wait_for_unit).
    pub fn wait_for_job(&mut self, job: &str) -> Result<()> {
        self.wait_for_unit(job, None)
    }

    /// Wait until a file exists in the guest.
    pub fn wait_for_file(&mut self, filename: &str) -> Result<()> {
        let _region = self.nested(&format!("wait for file '{filename}'"));
        retry(
            |_| {
                let (status, _) = self.execute(&format!("test -e {filename}"))?;
                Ok(status == 0)
            },
            DEFAULT_TIMEOUT,
        )
    }

    /// Wait until a TCP port is open inside the guest.
    pub fn wait_for_open_port(&mut self, port: u16) -> Result<()> {
        let _region = self.nested(&format!("wait for TCP port {port}"));
        retry(
            |_| {
                let (status, _) = self.execute(&format!("nc -z localhost {port}"))?;
                Ok(status == 0)
            },
            DEFAULT_TIMEOUT,
        )
    }

    /// Wait until a TCP port is closed inside the guest.
    pub fn wait_for_closed_port(&mut self, port: u16) -> Result<()> {
        retry(
            |_| {
                let (status, _) = self.execute(&format!("nc -z localhost {port}"))?;
                Ok(status != 0)
            },
            DEFAULT_TIMEOUT,
        )
    }

    /// Read the visible text of a virtual console, folded to its width.
    pub fn get_tty_text(&mut self, tty: &str) -> Result<String> {
        let (_, output) = self.execute(&format!(
            "fold -w$(stty -F /dev/tty{tty} size | awk '{{print $2}}') /dev/vcs{tty}"
        ))?;
        Ok(output)
    }

    /// Wait until the visible output on a TTY matches the regular
    /// expression.
    pub fn wait_for_tty_matches(&mut self, tty: &str, regexp: &str) -> Result<()> {
        let matcher = Regex::new(regexp).context("Failed to compile regex")?;
        let _region = self.nested(&format!("wait for /{regexp}/ to appear on tty {tty}"));
        retry(
            |last| {
                let text = self.get_tty_text(tty)?;
                if matcher.find(&text).is_some() {
                    return Ok(true);
                }
                if last {
                    self.log(&format!(
                        "Last attempt failed to match /{regexp}/ on TTY{tty}. \
                         Current text was:\n\n{text}"
                    ));
                }
                Ok(false)
            },
            DEFAULT_TIMEOUT,
        )
    }

    /// Debugging aid: dump the contents of a TTY into the guest journal.
    pub fn dump_tty_contents(&mut self, tty: &str) -> Result<()> {
        self.execute(&format!("fold -w 80 /dev/vcs{tty} | systemd-cat"))?;
        Ok(())
    }

    /// Type a string of characters, one key at a time.
    pub fn send_chars(&mut self, chars: &str) -> Result<()> {
        let _region = self.nested(&format!("send keys {chars:?}"));
        for c in chars.chars() {
            self.send_key(&c.to_string())?;
        }
        Ok(())
    }

    /// Send one key to the machine (low level).
    ///
    /// Single characters go through the compatibility table; anything
    /// longer (`ctrl-alt-delete`) is forwarded as-is.
    pub fn send_key(&mut self, key: &str) -> Result<()> {
        let mut chars = key.chars();
        let token = match (chars.next(), chars.next()) {
            (Some(c), None) => key_token(c),
            _ => key.to_string(),
        };
        self.send_monitor_command(&format!("sendkey {token}"))?;
        Ok(())
    }

    /// Take a screenshot and write it as a PNG.
    ///
    /// A bare identifier resolves to `<out>/<name>.png`; anything else is
    /// taken as a path.
    pub fn screenshot(&mut self, filename: &str) -> Result<()> {
        let word_pattern = Regex::new(r"^\w+$").unwrap();
        let filename: PathBuf = if word_pattern.is_match(filename) {
            self.host.out_dir.join(format!("{filename}.png"))
        } else {
            PathBuf::from(filename)
        };
        let tmp = PathBuf::from(format!("{}.ppm", filename.display()));

        let _region = self.nested(&format!("make screenshot {}", filename.display()));
        self.send_monitor_command(&format!("screendump {}", tmp.display()))?;
        let status = Command::new("sh")
            .arg("-c")
            .arg(format!("pnmtopng {} > {}", tmp.display(), filename.display()))
            .status()
            .context("Failed to run pnmtopng")?;
        let _ = fs::remove_file(&tmp);
        if !status.success() {
            return Err(Error::ImageConversionFailed(status.code().unwrap_or(-1)).into());
        }
        Ok(())
    }

    /// Copy a host file into the guest by piping it, base64-encoded,
    /// through the shell. Works without the shared folder; prefer
    /// [`copy_from_host`](Self::copy_from_host) whenever possible.
    pub fn copy_from_host_via_shell(&mut self, source: &Path, target: &str) -> Result<()> {
        let content = fs::read(source)
            .with_context(|| format!("Failed to read {}", source.display()))?;
        let content_b64 = BASE64.encode(content);
        let mkdir = format!("mkdir -p $(dirname {target})");
        let decode = format!("echo -n {content_b64} | base64 -d > {target}");
        self.succeed(&[mkdir.as_str(), decode.as_str()])?;
        Ok(())
    }

    /// Copy a file or directory from the host into the guest, staging it
    /// through the shared directory.
    pub fn copy_from_host(&mut self, source: &Path, target: &Path) -> Result<()> {
        let staging = tempdir_in(&self.shared_dir)
            .context("Failed to create staging directory in the shared directory")?;
        let file_name = source
            .file_name()
            .with_context(|| format!("{} has no file name", source.display()))?;

        let host_intermediate = staging.path().join(file_name);
        // tempdir_in always yields a path with a final component
        let staging_name = staging.path().file_name().unwrap();
        let vm_staging = Path::new(GUEST_SHARED_DIR).join(staging_name);
        let vm_intermediate = vm_staging.join(file_name);

        let target_parent = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let vm_staging_arg = vm_staging.display().to_string();
        let mkdir_staging = make_command(["mkdir", "-p", vm_staging_arg.as_str()])?;
        self.succeed(&[mkdir_staging.as_str()])?;
        copy_recursive(source, &host_intermediate)?;

        let target_parent_arg = target_parent.display().to_string();
        let mkdir_target = make_command(["mkdir", "-p", target_parent_arg.as_str()])?;
        self.succeed(&[mkdir_target.as_str()])?;

        let vm_intermediate_arg = vm_intermediate.display().to_string();
        let target_arg = target.display().to_string();
        let cp = make_command(["cp", "-r", vm_intermediate_arg.as_str(), target_arg.as_str()])?;
        self.succeed(&[cp.as_str()])?;
        Ok(())
    }

    /// Copy a file or directory from the guest to the host, landing in
    /// `<out>/<target_dir>/<basename>`.
    pub fn copy_from_vm(&mut self, source: &Path, target_dir: &str) -> Result<()> {
        let staging = tempdir_in(&self.shared_dir)
            .context("Failed to create staging directory in the shared directory")?;
        let file_name = source
            .file_name()
            .with_context(|| format!("{} has no file name", source.display()))?;

        // tempdir_in always yields a path with a final component
        let staging_name = staging.path().file_name().unwrap();
        let vm_staging = Path::new(GUEST_SHARED_DIR).join(staging_name);
        let vm_intermediate = vm_staging.join(file_name);
        let intermediate = staging.path().join(file_name);

        let vm_staging_arg = vm_staging.display().to_string();
        let mkdir_staging = make_command(["mkdir", "-p", vm_staging_arg.as_str()])?;
        self.succeed(&[mkdir_staging.as_str()])?;

        let source_arg = source.display().to_string();
        let vm_intermediate_arg = vm_intermediate.display().to_string();
        let cp = make_command(["cp", "-r", source_arg.as_str(), vm_intermediate_arg.as_str()])?;
        self.succeed(&[cp.as_str()])?;

        let abs_target = self.host.out_dir.join(target_dir).join(file_name);
        if let Some(parent) = abs_target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        copy_recursive(&intermediate, &abs_target)
    }

    fn screen_text_variants(&mut self, model_ids: &[u32]) -> Result<Vec<String>> {
        let scratch = tempdir().context("Failed to create OCR scratch directory")?;
        let screenshot = scratch.path().join("ppm");
        self.send_monitor_command(&format!("screendump {}", screenshot.display()))?;
        self.ocr.recognize(&screenshot, model_ids)
    }

    /// Recognize the current screen contents with all OCR models,
    /// returning one text candidate per model.
    pub fn get_screen_text_variants(&mut self) -> Result<Vec<String>> {
        self.screen_text_variants(&[0, 1, 2])
    }

    /// Recognize the current screen contents with the default OCR model.
    pub fn get_screen_text(&mut self) -> Result<String> {
        self.screen_text_variants(&[2])?
            .into_iter()
            .next()
            .context("OCR produced no output")
    }

    /// Wait until any OCR reading of the screen matches the regular
    /// expression.
    pub fn wait_for_text(&mut self, regex: &str) -> Result<()> {
        let matcher = Regex::new(regex).context("Failed to compile regex")?;
        let _region = self.nested(&format!("wait for /{regex}/ to appear on screen"));
        retry(
            |last| {
                let variants = self.get_screen_text_variants()?;
                if variants.iter().any(|text| matcher.is_match(text)) {
                    return Ok(true);
                }
                if last {
                    self.log(&format!("Last OCR attempt failed. Text was: {variants:?}"));
                }
                Ok(false)
            },
            DEFAULT_TIMEOUT,
        )
    }

    /// Wait until the serial console output matches the regular
    /// expression. The pattern may span multiple lines.
    ///
    /// Console lines are buffered as they arrive, so text emitted before
    /// this call still matches. The machine must be started.
    pub fn wait_for_console_text(&mut self, regex: &str) -> Result<()> {
        self.log(&format!("wait for /{regex}/ to appear on console"));
        let matcher = Regex::new(regex).context("Failed to compile regex")?;

        let last_lines = self
            .last_lines
            .as_ref()
            .context("machine is not booted: no serial console")?;

        // Buffer the console output to let multiline patterns match.
        let mut console = String::new();
        loop {
            match last_lines.try_recv() {
                Ok(line) => {
                    console.push_str(&line);
                    console.push('\n');
                    if matcher.is_match(&console) {
                        return Ok(());
                    }
                }
                Err(TryRecvError::Empty) => thread::sleep(Duration::from_secs(1)),
                Err(TryRecvError::Disconnected) => {
                    bail!("serial console closed while waiting for /{regex}/")
                }
            }
        }
    }

    /// Wait until the X server accepts connections.
    ///
    /// The existence of the X socket alone is not sufficient; the
    /// graphical target has to be reached as well.
    pub fn wait_for_x(&mut self) -> Result<()> {
        let _region = self.nested("wait for the X11 server");
        retry(
            |_| {
                let (status, _) = self.execute(
                    "journalctl -b SYSLOG_IDENTIFIER=systemd | \
                     grep \"Reached target Current graphical\"",
                )?;
                if status != 0 {
                    return Ok(false);
                }
                let (status, _) = self.execute("[ -e /tmp/.X11-unix/X0 ]")?;
                Ok(status == 0)
            },
            DEFAULT_TIMEOUT,
        )
    }

    /// Titles of the currently open X windows.
    ///
    /// Does not work on wayland guests.
    pub fn get_window_names(&mut self) -> Result<Vec<String>> {
        let output = self.succeed(&[
            r#"xwininfo -root -tree | sed 's/.*0x[0-9a-f]* "\([^"]*\)".*/\1/; t; d'"#,
        ])?;
        Ok(output.lines().map(str::to_string).collect())
    }

    /// Wait until a window whose title matches the regular expression
    /// appears.
    pub fn wait_for_window(&mut self, regexp: &str) -> Result<()> {
        let pattern = Regex::new(regexp).context("Failed to compile regex")?;
        let _region = self.nested(&format!("wait for a window matching /{regexp}/"));
        retry(
            |last| {
                let names = self.get_window_names()?;
                if names.iter().any(|name| pattern.find(name).is_some()) {
                    return Ok(true);
                }
                if last {
                    self.log(&format!(
                        "Last attempt failed to match /{regexp}/ on the window list, \
                         which currently contains: {}",
                        names.join(", ")
                    ));
                }
                Ok(false)
            },
            DEFAULT_TIMEOUT,
        )
    }

    /// Sleep inside the guest. The test clock is the guest clock, so a
    /// host-side sleep would drift under emulation.
    pub fn sleep(&mut self, secs: u64) -> Result<()> {
        self.succeed(&[format!("sleep {secs}").as_str()])?;
        Ok(())
    }

    /// Forward a TCP port on the host to a TCP port on the guest.
    pub fn forward_port(&mut self, host_port: u16, guest_port: u16) -> Result<()> {
        self.send_monitor_command(&format!("hostfwd_add tcp::{host_port}-:{guest_port}"))?;
        Ok(())
    }

    /// Bridge the root shell to the controlling terminal for ad-hoc
    /// debugging. Not intended for automated tests.
    pub fn shell_interact(&mut self) -> Result<()> {
        self.connect()?;
        self.log("entering interactive shell");

        let stream = self
            .shell_mut()?
            .stream()
            .try_clone()
            .context("Failed to clone shell stream")?;
        let mut reader = stream.try_clone().context("Failed to clone shell stream")?;
        thread::spawn(move || {
            let mut stdout = io::stdout();
            let _ = io::copy(&mut reader, &mut stdout);
        });

        let mut writer = stream;
        io::copy(&mut io::stdin().lock(), &mut writer)
            .context("Failed to forward stdin to the guest shell")?;
        Ok(())
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.release();
        let _ = fs::remove_file(&self.monitor_path);
        let _ = fs::remove_file(&self.shell_path);
    }
}
