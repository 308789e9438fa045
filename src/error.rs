use std::path::PathBuf;

use thiserror::Error;

/// Failure kinds surfaced by machine operations.
///
/// Public operations return [`anyhow::Result`]; these kinds ride on the error
/// chain so callers can pick them back out with
/// [`downcast_ref`](anyhow::Error::downcast_ref).
#[derive(Error, Debug)]
pub enum Error {
    /// The retry budget was exhausted.
    #[error("action timed out after {0} seconds")]
    Timeout(u64),

    /// A command that was required to succeed exited non-zero.
    #[error("command `{command}` failed (exit code {status})")]
    CommandFailed {
        /// The command text as sent to the guest shell.
        command: String,
        /// Its exit status.
        status: i32,
        /// Everything the command printed before the status.
        output: String,
    },

    /// A command that was required to fail exited zero.
    #[error("command `{command}` unexpectedly succeeded")]
    CommandUnexpectedlySucceeded {
        /// The command text as sent to the guest shell.
        command: String,
        /// Everything the command printed before the status.
        output: String,
    },

    /// A systemd unit reached state "failed".
    #[error("unit \"{0}\" reached state \"failed\"")]
    UnitFailed(String),

    /// A systemd unit is inactive and the job queue is empty.
    #[error("unit \"{0}\" is inactive and there are no pending jobs")]
    UnitInactiveNoJobs(String),

    /// The monitor stream closed before the prompt marker arrived.
    #[error("monitor closed before prompt")]
    MonitorProtocol,

    /// OCR was requested while the external pipeline is unavailable.
    #[error("OCR requested but tesseract is not available")]
    OcrUnavailable,

    /// The external screenshot converter exited non-zero.
    #[error("cannot convert screenshot (exit code {0})")]
    ImageConversionFailed(i32),

    /// Failed to bind or accept on a control socket.
    #[error("socket setup failed at {}", .0.display())]
    SocketSetup(PathBuf),
}
