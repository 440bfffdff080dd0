//! Test support: a scripted pod on the far side of an in-memory transport.

use crate::dispatch::Pod;
use crate::transport::{self, Connection};
use pod_envelope as envelope;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// The pod's side of an in-memory transport, driven directly by tests.
pub struct FakePod {
    reader: tokio::io::ReadHalf<tokio::io::DuplexStream>,
    writer: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    buf: Vec<u8>,
}

impl FakePod {
    pub fn connect() -> (FakePod, Connection) {
        let (host_side, pod_side) = tokio::io::duplex(1 << 16);
        let (host_read, host_write) = tokio::io::split(host_side);
        let (pod_read, pod_write) = tokio::io::split(pod_side);
        (
            FakePod {
                reader: pod_read,
                writer: pod_write,
                buf: Vec::new(),
            },
            Connection::new(host_read, host_write),
        )
    }

    pub async fn recv(&mut self) -> envelope::Value {
        transport::read_value(&mut self.reader, &mut self.buf)
            .await
            .unwrap()
            .expect("host closed the transport")
    }

    pub async fn send(&mut self, value: envelope::Value) {
        self.writer.write_all(&value.to_bytes()).await.unwrap();
        self.writer.flush().await.unwrap();
    }

    /// Answer the describe op with the standard `pod.test-pod` fixture.
    pub async fn handle_describe(&mut self, format: &str) {
        let request = self.recv().await;
        assert_eq!(
            request.expect_field("op").unwrap().as_str().unwrap(),
            "describe"
        );
        self.send(describe_reply(format)).await;
    }
}

fn var(fields: Vec<(&str, &str)>) -> envelope::Value {
    envelope::Value::dict(
        fields
            .into_iter()
            .map(|(k, v)| (k, envelope::Value::from(v)))
            .collect::<Vec<_>>(),
    )
}

/// A describe reply with one eager namespace (`pod.test-pod`) and one
/// deferred one (`pod.test-pod.extras`).
pub fn describe_reply(format: &str) -> envelope::Value {
    envelope::Value::dict(vec![
        ("format", envelope::Value::from(format)),
        (
            "namespaces",
            envelope::Value::List(vec![envelope::Value::dict(vec![
                ("name", envelope::Value::from("pod.test-pod")),
                (
                    "vars",
                    envelope::Value::List(vec![
                        var(vec![("name", "add-one")]),
                        var(vec![
                            ("name", "async-countdown"),
                            ("async", "true"),
                            ("doc", "Counts down, one reply per tick."),
                        ]),
                        var(vec![("name", "echo-meta"), ("arg-meta", "true")]),
                        var(vec![("name", "helper"), ("code", "(defn helper [x] x)")]),
                    ]),
                ),
            ])]),
        ),
        (
            "defer",
            envelope::Value::List(vec![envelope::Value::from("pod.test-pod.extras")]),
        ),
        (
            "ops",
            envelope::Value::dict(vec![("shutdown", envelope::Value::dict::<&str, _>(vec![]))]),
        ),
    ])
}

/// A reply envelope for `id` with the given payload text and statuses.
pub fn reply(id: &envelope::Value, value: Option<&str>, statuses: &[&str]) -> envelope::Value {
    let mut fields = vec![
        ("id", id.clone()),
        (
            "status",
            envelope::Value::List(statuses.iter().map(|s| envelope::Value::from(*s)).collect()),
        ),
    ];
    if let Some(value) = value {
        fields.push(("value", envelope::Value::from(value)));
    }
    envelope::Value::dict(fields)
}

/// Start a pod over an in-memory transport; the fake finishes its describe
/// exchange on the returned join handle.
pub async fn start_pod(format: &'static str) -> (tokio::task::JoinHandle<FakePod>, Arc<Pod>) {
    let (mut fake, conn) = FakePod::connect();
    let script = tokio::spawn(async move {
        fake.handle_describe(format).await;
        fake
    });
    let pod = Pod::start("test-pod".to_string(), conn, None)
        .await
        .unwrap();
    (script, pod)
}
