//! Pod child-process supervision: spawn, stderr drain, graceful shutdown.

use crate::transport::{Connection, TransportKind};
use crate::Error;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// How long a pod has to exit after `shutdown` before it is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bound on the recent-stderr excerpt attached to failure errors.
const STDERR_RING_CAPACITY: usize = 8192;

/// Where pod stderr lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StderrSink {
    /// Drop stderr output (the ring excerpt is still kept).
    #[default]
    Discard,
    /// Forward each line through `tracing` at warn level.
    Log,
}

pub struct Supervisor {
    child: tokio::process::Child,
    pid: u32,
    transport: TransportKind,
    /// The tail of the pod's stderr, for error messages.
    recent_stderr: Arc<Mutex<String>>,
}

/// Spawn the pod process. Stream transport yields the child's piped stdio as
/// the connection; socket transport leaves the connection to the port-file
/// rendezvous.
pub fn spawn(
    command: &[String],
    transport: TransportKind,
    stderr_sink: StderrSink,
) -> Result<(Supervisor, Option<Connection>), Error> {
    let (binary, args) = command.split_first().ok_or_else(|| Error::PodSpawn {
        detail: "pod command is empty".to_string(),
    })?;

    let mut builder = tokio::process::Command::new(binary);
    builder
        .args(args)
        .env("BABASHKA_POD", "true")
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match transport {
        TransportKind::Stdio => {
            builder.stdin(Stdio::piped()).stdout(Stdio::piped());
        }
        TransportKind::Socket => {
            builder
                .env("BABASHKA_POD_TRANSPORT", "socket")
                .stdin(Stdio::null())
                .stdout(Stdio::null());
        }
    }

    tracing::debug!(?binary, ?args, ?transport, "spawning pod");
    let mut child = builder.spawn().map_err(|err| Error::PodSpawn {
        detail: format!("could not start {binary:?}: {err}"),
    })?;
    let pid = child.id().unwrap_or_default();

    let recent_stderr = Arc::new(Mutex::new(String::new()));
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(drain_stderr(stderr, stderr_sink, recent_stderr.clone()));
    }

    let connection = match transport {
        TransportKind::Stdio => {
            let stdin = child.stdin.take().expect("stdin is piped");
            let stdout = child.stdout.take().expect("stdout is piped");
            Some(Connection::new(stdout, stdin))
        }
        TransportKind::Socket => None,
    };

    Ok((
        Supervisor {
            child,
            pid,
            transport,
            recent_stderr,
        },
        connection,
    ))
}

impl Supervisor {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The tail of the pod's stderr output so far.
    pub fn recent_stderr(&self) -> String {
        self.recent_stderr.lock().expect("not poisoned").clone()
    }

    /// Shared handle to the stderr tail, for attaching to reader errors.
    pub fn stderr_handle(&self) -> Arc<Mutex<String>> {
        self.recent_stderr.clone()
    }

    /// Wait out the shutdown grace, then kill; always reaps the child and
    /// removes a lingering rendezvous file.
    pub async fn reap(mut self) {
        let status = match tokio::time::timeout(SHUTDOWN_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(err)) => {
                tracing::warn!(pid = self.pid, %err, "failed to wait for pod process");
                None
            }
            Err(_elapsed) => {
                tracing::warn!(
                    pid = self.pid,
                    "pod did not exit within {SHUTDOWN_GRACE:?}; killing"
                );
                let _ = self.child.start_kill();
                self.child.wait().await.ok()
            }
        };
        tracing::debug!(pid = self.pid, ?status, "reaped pod process");

        if self.transport == TransportKind::Socket {
            // The pod removes its own port file on a clean exit; clean up
            // after one that didn't.
            let _ = std::fs::remove_file(crate::transport::port_file_path(self.pid));
        }
    }
}

async fn drain_stderr(
    stderr: tokio::process::ChildStderr,
    sink: StderrSink,
    recent: Arc<Mutex<String>>,
) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if sink == StderrSink::Log {
                    tracing::warn!(target: "pod_stderr", "{line}");
                }
                let mut ring = recent.lock().expect("not poisoned");
                ring.push_str(&line);
                ring.push('\n');
                // Drop whole lines from the head while over capacity.
                while ring.len() > STDERR_RING_CAPACITY {
                    match ring.find('\n') {
                        Some(ind) => ring.drain(..ind + 1),
                        None => break,
                    };
                }
            }
            Ok(None) => break, // Clean EOF.
            Err(err) => {
                tracing::debug!(%err, "failed to read pod stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::{spawn, StderrSink};
    use crate::transport::TransportKind;

    #[tokio::test]
    async fn test_spawn_failure_is_pod_spawn() {
        let err = spawn(
            &["/does/not/exist".to_string()],
            TransportKind::Stdio,
            StderrSink::Discard,
        )
        .err()
        .expect("spawn must fail");
        assert!(err.to_string().starts_with("failed to start pod process"));
    }

    #[tokio::test]
    async fn test_stderr_ring_keeps_the_tail() {
        let (supervisor, _conn) = spawn(
            &[
                "sh".to_string(),
                "-c".to_string(),
                "echo one >&2; echo two >&2".to_string(),
            ],
            TransportKind::Stdio,
            StderrSink::Discard,
        )
        .unwrap();

        // Give the drain task a moment to observe both lines and the EOF.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(supervisor.recent_stderr(), "one\ntwo\n");
        supervisor.reap().await;
    }

    #[tokio::test]
    async fn test_reap_kills_a_lingering_child() {
        let (supervisor, _conn) = spawn(
            &["sleep".to_string(), "600".to_string()],
            TransportKind::Stdio,
            StderrSink::Discard,
        )
        .unwrap();
        let pid = supervisor.pid();

        // `sleep` ignores the grace period; reap must kill and collect it.
        tokio::time::timeout(
            std::time::Duration::from_secs(10),
            supervisor.reap(),
        )
        .await
        .expect("reap completes once the child is killed");

        // The process is gone: signal 0 delivery fails.
        #[cfg(unix)]
        {
            let alive = std::process::Command::new("kill")
                .args(["-0", &pid.to_string()])
                .status()
                .map(|status| status.success())
                .unwrap_or(false);
            assert!(!alive, "pid {pid} still alive after reap");
        }
    }
}
