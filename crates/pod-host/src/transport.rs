//! Byte transports between the host and a pod.
//!
//! Both variants yield the same thing: a bidirectional byte channel carrying
//! envelope values. Stream transport uses the child's piped stdin/stdout;
//! socket transport rendezvouses over a port file the pod writes into the
//! working directory, then swaps the stdio streams for a TCP connection.

use crate::Error;
use pod_envelope as envelope;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

pub const PORT_FILE_TIMEOUT: Duration = Duration::from_secs(10);
const PORT_FILE_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransportKind {
    #[default]
    Stdio,
    Socket,
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// A connected transport: one read side, one write side.
pub struct Connection {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
}

impl Connection {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Connection {
        Connection {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// The rendezvous file a socket-transport pod writes its port into.
pub fn port_file_path(pid: u32) -> PathBuf {
    PathBuf::from(format!(".babashka-pod-{pid}.port"))
}

/// Poll the port file until the pod publishes its listening port, then dial
/// it. The file holds one decimal port followed by a newline; a partial
/// write without the newline is re-polled.
pub async fn connect_socket(pid: u32) -> Result<Connection, Error> {
    let port = poll_port_file(&port_file_path(pid), PORT_FILE_TIMEOUT).await?;

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .map_err(|err| Error::PodHandshake {
            detail: format!("failed to dial pod socket on port {port}: {err}"),
        })?;
    tracing::debug!(port, "connected to pod socket");

    let (reader, writer) = stream.into_split();
    Ok(Connection::new(reader, writer))
}

async fn poll_port_file(path: &std::path::Path, timeout: Duration) -> Result<u16, Error> {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            if let Some((line, _)) = contents.split_once('\n') {
                match line.trim().parse::<u16>() {
                    Ok(port) => return Ok(port),
                    Err(_) => {
                        return Err(Error::PodHandshake {
                            detail: format!("port file {path:?} holds {line:?}, not a port"),
                        })
                    }
                }
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::PodHandshake {
                detail: format!("pod did not publish a port in {path:?} within {timeout:?}"),
            });
        }
        tokio::time::sleep(PORT_FILE_POLL).await;
    }
}

/// Read one complete envelope value, buffering partial input in `buf`.
/// Returns `None` on a clean EOF at an envelope boundary.
pub async fn read_value<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> Result<Option<envelope::Value>, Error>
where
    R: AsyncRead + Unpin,
{
    loop {
        if !buf.is_empty() {
            match envelope::decode(buf) {
                Ok((value, consumed)) => {
                    buf.drain(..consumed);
                    return Ok(Some(value));
                }
                Err(envelope::Error::Truncated) => (),
                Err(err) => return Err(err.into()),
            }
        }

        if buf.len() == buf.capacity() {
            buf.reserve(1); // Quadratic growth.
        }
        let n = reader
            .read_buf(buf)
            .await
            .map_err(|err| Error::PodTerminated {
                detail: format!("transport read failed: {err}"),
            })?;

        if n == 0 && buf.is_empty() {
            return Ok(None); // Graceful EOF.
        } else if n == 0 {
            return Err(Error::PodTerminated {
                detail: "pod closed the transport mid-envelope".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::{poll_port_file, read_value};
    use pod_envelope::Value;
    use std::time::Duration;

    #[tokio::test]
    async fn test_port_file_rendezvous() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".babashka-pod-1234.port");

        // The pod publishes its port a little after spawn; a partial write
        // without the trailing newline is not trusted yet.
        let publish = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                tokio::fs::write(&path, "153").await.unwrap();
                tokio::time::sleep(Duration::from_millis(30)).await;
                tokio::fs::write(&path, "15399\n").await.unwrap();
            })
        };

        let port = poll_port_file(&path, Duration::from_secs(5)).await.unwrap();
        assert_eq!(port, 15399);
        publish.await.unwrap();
    }

    #[tokio::test]
    async fn test_port_file_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".babashka-pod-1234.port");
        let err = poll_port_file(&path, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("did not publish a port"));
    }

    #[tokio::test]
    async fn test_port_file_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".babashka-pod-1234.port");
        tokio::fs::write(&path, "not-a-port\n").await.unwrap();
        let err = poll_port_file(&path, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a port"));
    }

    #[tokio::test]
    async fn test_read_value_across_split_reads() {
        let fixture = Value::dict(vec![
            ("op", Value::from("invoke")),
            ("id", Value::from("1")),
        ]);
        let bytes = fixture.to_bytes();

        // Feed the reader a stream of three back-to-back envelopes.
        let stream = bytes.repeat(3);
        let mut reader = stream.as_slice();
        let mut buf = Vec::new();
        for _ in 0..3 {
            let value = read_value(&mut reader, &mut buf).await.unwrap();
            assert_eq!(value, Some(fixture.clone()));
        }
        assert_eq!(read_value(&mut reader, &mut buf).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_value_mid_envelope_eof() {
        let bytes = Value::from("hello").to_bytes();
        let mut reader = &bytes[..bytes.len() - 1];
        let mut buf = Vec::new();

        let err = read_value(&mut reader, &mut buf).await.unwrap_err();
        insta::assert_snapshot!(
            err,
            @"pod terminated unexpectedly: pod closed the transport mid-envelope"
        );
    }

    #[tokio::test]
    async fn test_read_value_malformed() {
        let mut reader = &b"x_garbage"[..];
        let mut buf = Vec::new();
        let err = read_value(&mut reader, &mut buf).await.unwrap_err();
        assert!(err.to_string().contains("malformed envelope"));
    }
}
