//! Request/response dialogue with the emulator's management channel.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use anyhow::{Context, Result};

use crate::error::Error;

/// Prompt marker terminating every monitor reply.
const PROMPT: &str = "(qemu) ";

/// The emulator's line-oriented management channel.
///
/// One request is in flight at a time; callers serialize on the handle.
pub(crate) struct Monitor {
    stream: UnixStream,
}

impl Monitor {
    pub(crate) fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Consume output until the prompt marker shows up.
    ///
    /// Returns the accumulated text, prompt included. Bytes are decoded
    /// as UTF-8 with a lossy policy. A stream that closes before the
    /// prompt is a protocol failure.
    pub(crate) fn wait_for_prompt(&mut self) -> Result<String> {
        let mut answer = String::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = self
                .stream
                .read(&mut buf)
                .context("Failed to read from monitor")?;
            if n == 0 {
                return Err(Error::MonitorProtocol.into());
            }
            answer.push_str(&String::from_utf8_lossy(&buf[..n]));
            if answer.ends_with(PROMPT) {
                return Ok(answer);
            }
        }
    }

    /// Send one command and read the reply up to the next prompt.
    pub(crate) fn send(&mut self, command: &str) -> Result<String> {
        self.stream
            .write_all(format!("{command}\n").as_bytes())
            .with_context(|| format!("Failed to send monitor command `{command}`"))?;
        self.wait_for_prompt()
    }
}
