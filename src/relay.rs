//! Byte relay between a task's streams and an upstream channel.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::context::TaskIo;
use crate::error::Error;
use crate::upstream::{UpstreamChannel, UpstreamEvent};

const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// SSH_EXTENDED_DATA_STDERR
const EXTENDED_DATA_STDERR: u32 = 1;

/// How the upstream side ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Exited(u32),
    Signaled(String),
    /// The channel closed without reporting an exit status or signal.
    Missing,
}

impl Completion {
    /// Exit status of the remote process. A process killed by a signal reports
    /// 128 plus the signal number. `None` when nothing was reported.
    pub fn exit_status(&self) -> Option<u32> {
        match self {
            Self::Exited(status) => Some(*status),
            Self::Signaled(name) => Some(128 + signal_number(name).unwrap_or(0)),
            Self::Missing => None,
        }
    }
}

fn signal_number(name: &str) -> Option<u32> {
    let number = match name.trim_start_matches("SIG") {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ILL" => 4,
        "ABRT" => 6,
        "FPE" => 8,
        "KILL" => 9,
        "USR1" => 10,
        "SEGV" => 11,
        "USR2" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        _ => return None,
    };
    Some(number)
}

/// Pump bytes both ways until the upstream channel closes.
///
/// Client stdin is forwarded as it arrives; its EOF becomes an upstream EOF.
/// Upstream stdout and stderr are written to the task's streams.
pub async fn relay(
    channel: &mut dyn UpstreamChannel,
    io: &mut TaskIo,
) -> Result<Completion, Error> {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut stdin_open = true;
    let mut exit_status = None;
    let mut exit_signal = None;

    loop {
        tokio::select! {
            event = channel.wait() => match event {
                Some(UpstreamEvent::Data(data)) => {
                    io.stdout
                        .write_all(&data)
                        .await
                        .map_err(|e| Error::transport("cannot write to session", e))?;
                    io.stdout
                        .flush()
                        .await
                        .map_err(|e| Error::transport("cannot write to session", e))?;
                }
                Some(UpstreamEvent::ExtendedData { ext, data }) => {
                    let out = if ext == EXTENDED_DATA_STDERR {
                        &mut io.stderr
                    } else {
                        &mut io.stdout
                    };
                    out.write_all(&data)
                        .await
                        .map_err(|e| Error::transport("cannot write to session", e))?;
                    out.flush()
                        .await
                        .map_err(|e| Error::transport("cannot write to session", e))?;
                }
                Some(UpstreamEvent::Eof) => {
                    debug!("upstream sent EOF");
                }
                Some(UpstreamEvent::ExitStatus(status)) => {
                    exit_status = Some(status);
                }
                Some(UpstreamEvent::ExitSignal(name)) => {
                    exit_signal = Some(name);
                }
                Some(UpstreamEvent::Close) | None => break,
            },
            read = io.stdin.read(&mut buf), if stdin_open => match read {
                Ok(0) => {
                    stdin_open = false;
                    channel.send_eof().await?;
                }
                Ok(n) => channel.send(&buf[..n]).await?,
                Err(e) => {
                    debug!("session input failed: {}", e);
                    stdin_open = false;
                    channel.send_eof().await?;
                }
            },
        }
    }

    let completion = match (exit_status, exit_signal) {
        (Some(status), _) => Completion::Exited(status),
        (None, Some(name)) => Completion::Signaled(name),
        (None, None) => Completion::Missing,
    };
    Ok(completion)
}
