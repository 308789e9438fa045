//! The in-guest root shell channel.
//!
//! Commands run in-band on one shared stream. The end of a command's
//! output is marked by a sentinel the shell itself echoes, followed by the
//! exit status. The sentinel is chosen to be vanishingly unlikely in
//! ordinary output; a collision is a test bug, not something we recover
//! from.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use anyhow::{bail, Context, Result};
use regex::Regex;

/// Matches the sentinel frame and the exit status that follows it.
const SENTINEL_PATTERN: &str = r"(?s)(.*)\|!=EOF\s+(\d+)";

/// The root shell behind the virtio console.
///
/// One command is in flight at a time; callers serialize on the handle.
pub(crate) struct Shell {
    stream: UnixStream,
}

impl Shell {
    pub(crate) fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub(crate) fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Consume whatever banner the shell emits before the first command.
    pub(crate) fn prime(&mut self) -> Result<()> {
        let mut buf = [0u8; 1024];
        self.stream
            .read(&mut buf)
            .context("Failed to read shell banner")?;
        Ok(())
    }

    /// Write raw bytes to the shell, bypassing the command frame.
    pub(crate) fn send_raw(&mut self, data: &str) -> Result<()> {
        self.stream
            .write_all(data.as_bytes())
            .context("Failed to write to shell")
    }

    /// Run one command, returning its exit status and combined output.
    ///
    /// The command is wrapped in a subshell so the sentinel echo runs even
    /// when the command exits non-zero. Chunks are decoded as UTF-8 with a
    /// lossy policy and accumulated until one chunk carries the sentinel.
    pub(crate) fn run(&mut self, command: &str) -> Result<(i32, String)> {
        let frame = format!("( {command} ); echo '|!=EOF' $?\n");
        self.stream
            .write_all(frame.as_bytes())
            .with_context(|| format!("Failed to send command `{command}`"))?;

        let sentinel = Regex::new(SENTINEL_PATTERN).unwrap();
        let mut output = String::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self
                .stream
                .read(&mut buf)
                .with_context(|| format!("Failed to read output of `{command}`"))?;
            if n == 0 {
                bail!("shell closed while `{command}` was running");
            }
            let chunk = String::from_utf8_lossy(&buf[..n]);
            if let Some(caps) = sentinel.captures(&chunk) {
                output.push_str(&caps[1]);
                let status = caps[2]
                    .parse()
                    .with_context(|| format!("Bad exit status in `{}`", &caps[0]))?;
                return Ok((status, output));
            }
            output.push_str(&chunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{BufRead, BufReader};
    use std::thread;
    use std::time::Duration;

    fn pair() -> (Shell, UnixStream) {
        let (ours, theirs) = UnixStream::pair().expect("Failed to create stream pair");
        (Shell::new(ours), theirs)
    }

    // Reads one frame off the peer end and returns it.
    fn read_frame(peer: &UnixStream) -> String {
        let mut reader = BufReader::new(peer.try_clone().unwrap());
        let mut frame = String::new();
        reader.read_line(&mut frame).unwrap();
        frame
    }

    #[test]
    fn test_run_frames_command_and_parses_status() {
        let (mut shell, peer) = pair();

        let guest = thread::spawn(move || {
            let frame = read_frame(&peer);
            let mut peer = peer;
            peer.write_all(b"hi|!=EOF 0").unwrap();
            frame
        });

        let (status, output) = shell.run("printf hi").unwrap();
        assert_eq!(guest.join().unwrap(), "( printf hi ); echo '|!=EOF' $?\n");
        assert_eq!(status, 0);
        assert_eq!(output, "hi");
    }

    #[test]
    fn test_run_accumulates_chunks_before_sentinel() {
        let (mut shell, peer) = pair();

        let guest = thread::spawn(move || {
            read_frame(&peer);
            let mut peer = peer;
            peer.write_all(b"line1\n").unwrap();
            // Give the reader a chance to observe a separate chunk.
            thread::sleep(Duration::from_millis(50));
            peer.write_all(b"line2\n|!=EOF 7").unwrap();
        });

        let (status, output) = shell.run("printf 'line1\\nline2\\n'; exit 7").unwrap();
        guest.join().unwrap();
        assert_eq!(status, 7);
        assert_eq!(output, "line1\nline2\n");
    }

    #[test]
    fn test_run_with_empty_output() {
        let (mut shell, peer) = pair();

        let guest = thread::spawn(move || {
            read_frame(&peer);
            let mut peer = peer;
            peer.write_all(b"|!=EOF 1").unwrap();
        });

        let (status, output) = shell.run("false").unwrap();
        guest.join().unwrap();
        assert_eq!(status, 1);
        assert_eq!(output, "");
    }

    #[test]
    fn test_closed_stream_is_an_error() {
        let (mut shell, peer) = pair();

        let guest = thread::spawn(move || {
            read_frame(&peer);
            // Dropping the peer before the sentinel closes the stream.
        });

        let err = shell.run("true").unwrap_err();
        guest.join().unwrap();
        assert!(err.to_string().contains("shell closed"));
    }

    #[test]
    fn test_prime_consumes_banner() {
        let (mut shell, mut peer) = pair();
        peer.write_all(b"# ").unwrap();
        shell.prime().unwrap();
    }
}
