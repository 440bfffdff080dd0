//! The per-pod dispatch engine.
//!
//! One reader task owns the read side of a pod's transport and routes every
//! reply by its request id. Callers serialize envelope writes through the
//! pod's writer lock and block on a completion slot. Streaming requests
//! dispatch intermediate replies to caller-supplied callbacks; every other
//! request resolves exactly once.

use crate::describe::{self, DescribeReply, NamespaceDecl};
use crate::process::Supervisor;
use crate::transport::{self, BoxedWriter, Connection};
use crate::Error;
use pod_codec::{Format, Handlers, Value};
use pod_envelope as envelope;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

pub type SuccessFn = Arc<dyn Fn(Value) + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(Error) + Send + Sync>;
pub type DoneFn = Arc<dyn Fn() + Send + Sync>;

/// Callbacks for a streaming invoke. Zero or more `success`/`error` calls
/// are followed by exactly one `done`.
#[derive(Clone, Default)]
pub struct StreamHandlers {
    pub success: Option<SuccessFn>,
    pub error: Option<ErrorFn>,
    pub done: Option<DoneFn>,
}

#[derive(Clone, Default)]
pub struct InvokeOpts {
    /// Registers the request as streaming and returns immediately after the
    /// invoke envelope is written.
    pub handlers: Option<StreamHandlers>,
    /// Local deadline. On expiry the call fails with `PodTimeout`; the id
    /// stays reserved and late replies are dropped.
    pub deadline: Option<Duration>,
}

enum Pending {
    Unary {
        tx: oneshot::Sender<Result<Value, Error>>,
        /// Stream replies to a synchronous caller accumulate here and
        /// resolve as one vector on `done`.
        buffered: Vec<Value>,
    },
    /// A `load-ns` request; resolves with the whole describe-shaped reply.
    LoadNs {
        tx: oneshot::Sender<Result<envelope::Value, Error>>,
    },
    Streaming(StreamHandlers),
    /// Deadline expired locally. The slot stays reserved until the pod
    /// stops so the id is never reused for a different request.
    Expired,
}

struct Shared {
    pod_id: String,
    stopping: AtomicBool,
    pending: Mutex<HashMap<u64, Pending>>,
}

impl Shared {
    /// Fail every live request. Used on unload and on reader-fatal errors.
    fn fail_all(&self, make_err: impl Fn() -> Error) {
        let drained: Vec<Pending> = {
            let mut pending = self.pending.lock().expect("not poisoned");
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            match entry {
                Pending::Unary { tx, .. } => {
                    let _ = tx.send(Err(make_err()));
                }
                Pending::LoadNs { tx } => {
                    let _ = tx.send(Err(make_err()));
                }
                Pending::Streaming(handlers) => {
                    if let Some(error) = &handlers.error {
                        error(make_err());
                    }
                    if let Some(done) = &handlers.done {
                        done();
                    }
                }
                Pending::Expired => (),
            }
        }
    }
}

/// A loaded pod: its negotiated format, handler tables, writer lock, and the
/// dispatch state its reader task routes into.
pub struct Pod {
    id: String,
    format: Format,
    handlers: Arc<RwLock<Handlers>>,
    describe: DescribeReply,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    supervisor: tokio::sync::Mutex<Option<Supervisor>>,
    pid: Option<u32>,
    next_id: AtomicU64,
    deferred: Mutex<HashSet<String>>,
}

impl std::fmt::Debug for Pod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pod")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Pod {
    /// Run the describe handshake over `conn`, then hand the read side to a
    /// dedicated reader task.
    pub(crate) async fn start(
        id: String,
        mut conn: Connection,
        supervisor: Option<Supervisor>,
    ) -> Result<Arc<Pod>, Error> {
        let describe_op = envelope::Value::dict(vec![("op", envelope::Value::from("describe"))]);
        write_all(&mut conn.writer, &describe_op)
            .await
            .map_err(|err| Error::PodHandshake {
                detail: format!("failed to send describe: {err}"),
            })?;

        let mut buf = Vec::new();
        let reply = tokio::time::timeout(
            DESCRIBE_TIMEOUT,
            transport::read_value(&mut conn.reader, &mut buf),
        )
        .await
        .map_err(|_| Error::PodHandshake {
            detail: format!("describe reply did not arrive within {DESCRIBE_TIMEOUT:?}"),
        })?
        .map_err(|err| Error::PodHandshake {
            detail: format!("while reading describe reply: {err}"),
        })?
        .ok_or_else(|| Error::PodHandshake {
            detail: "pod closed the transport before describing itself".to_string(),
        })?;

        let parsed = DescribeReply::parse(&reply)?;
        tracing::debug!(
            pod = %id,
            format = %parsed.format,
            namespaces = parsed.namespaces.len(),
            "pod described itself"
        );

        let shared = Arc::new(Shared {
            pod_id: id.clone(),
            stopping: AtomicBool::new(false),
            pending: Mutex::new(HashMap::new()),
        });
        let handlers = Arc::new(RwLock::new(Handlers::default()));
        let recent_stderr = supervisor
            .as_ref()
            .map(Supervisor::stderr_handle)
            .unwrap_or_default();

        let pod = Arc::new(Pod {
            deferred: Mutex::new(parsed.defer.clone()),
            format: parsed.format,
            handlers: handlers.clone(),
            describe: parsed,
            shared: shared.clone(),
            writer: tokio::sync::Mutex::new(Some(conn.writer)),
            pid: supervisor.as_ref().map(Supervisor::pid),
            supervisor: tokio::sync::Mutex::new(supervisor),
            next_id: AtomicU64::new(1),
            id,
        });

        tokio::spawn(read_loop(
            conn.reader,
            buf,
            shared,
            pod.format,
            handlers,
            recent_stderr,
        ));
        Ok(pod)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// The child's pid, when this pod runs a supervised process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub(crate) fn describe(&self) -> &DescribeReply {
        &self.describe
    }

    pub(crate) fn handlers(&self) -> &RwLock<Handlers> {
        &self.handlers
    }

    pub(crate) fn deferred(&self) -> &Mutex<HashSet<String>> {
        &self.deferred
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::Acquire)
    }

    /// Invoke `var` with `args`. Blocks on the completion slot unless
    /// `opts.handlers` registers the request as streaming, in which case it
    /// returns `Value::Nil` right after the envelope is written.
    pub async fn invoke(
        &self,
        var: &str,
        args: Vec<Value>,
        opts: InvokeOpts,
    ) -> Result<Value, Error> {
        if self.is_stopping() {
            return Err(Error::PodCancelled);
        }

        let payload = {
            let handlers = self.handlers.read().expect("not poisoned");
            self.format.encode_args(&args, &handlers)?
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let invoke_op = envelope::Value::dict(vec![
            ("op", envelope::Value::from("invoke")),
            ("id", envelope::Value::from(id.to_string())),
            ("var", envelope::Value::from(var)),
            ("args", envelope::Value::Bytes(payload)),
        ]);

        // Register the slot before writing so the reply cannot race it.
        let rx = {
            let mut pending = self.shared.pending.lock().expect("not poisoned");
            match opts.handlers {
                Some(handlers) => {
                    pending.insert(id, Pending::Streaming(handlers));
                    None
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    pending.insert(
                        id,
                        Pending::Unary {
                            tx,
                            buffered: Vec::new(),
                        },
                    );
                    Some(rx)
                }
            }
        };

        if let Err(err) = self.write_envelope(&invoke_op).await {
            self.shared
                .pending
                .lock()
                .expect("not poisoned")
                .remove(&id);
            return Err(err);
        }

        let Some(rx) = rx else {
            return Ok(Value::Nil);
        };

        match opts.deadline {
            None => rx.await.unwrap_or(Err(Error::PodCancelled)),
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(result) => result.unwrap_or(Err(Error::PodCancelled)),
                Err(_elapsed) => {
                    let mut pending = self.shared.pending.lock().expect("not poisoned");
                    if let Some(entry) = pending.get_mut(&id) {
                        *entry = Pending::Expired;
                    }
                    tracing::debug!(pod = %self.shared.pod_id, id, "pod call deadline expired");
                    Err(Error::PodTimeout)
                }
            },
        }
    }

    /// Send `load-ns` and return the namespaces of its describe-shaped reply.
    pub(crate) async fn load_ns(&self, namespace: &str) -> Result<Vec<NamespaceDecl>, Error> {
        if self.is_stopping() {
            return Err(Error::PodCancelled);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let load_op = envelope::Value::dict(vec![
            ("op", envelope::Value::from("load-ns")),
            ("id", envelope::Value::from(id.to_string())),
            ("ns", envelope::Value::from(namespace)),
        ]);

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .expect("not poisoned")
            .insert(id, Pending::LoadNs { tx });

        if let Err(err) = self.write_envelope(&load_op).await {
            self.shared
                .pending
                .lock()
                .expect("not poisoned")
                .remove(&id);
            return Err(err);
        }

        let reply = rx.await.unwrap_or(Err(Error::PodCancelled))?;
        describe::parse_namespaces(&reply)
    }

    async fn write_envelope(&self, env: &envelope::Value) -> Result<(), Error> {
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(Error::PodCancelled);
        };
        write_all(writer, env).await.map_err(|err| Error::PodTerminated {
            detail: format!("transport write failed: {err}"),
        })
    }

    /// Graceful stop: flip the stopping flag, send `shutdown`, close the
    /// write side, fail all live requests, then reap the child. Idempotent.
    pub async fn unload(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(pod = %self.id, "unloading pod");

        {
            let mut writer = self.writer.lock().await;
            if let Some(w) = writer.as_mut() {
                let shutdown_op =
                    envelope::Value::dict(vec![("op", envelope::Value::from("shutdown"))]);
                // Best effort: the pod may already be gone.
                let _ = write_all(w, &shutdown_op).await;
                let _ = w.shutdown().await;
            }
            *writer = None;
        }

        self.shared.fail_all(|| Error::PodCancelled);

        if let Some(supervisor) = self.supervisor.lock().await.take() {
            supervisor.reap().await;
        }
    }
}

async fn write_all(writer: &mut BoxedWriter, env: &envelope::Value) -> std::io::Result<()> {
    writer.write_all(&env.to_bytes()).await?;
    writer.flush().await
}

/// The reader task. Owns the read side exclusively; `buf` carries any bytes
/// already read past the describe reply.
async fn read_loop(
    mut reader: transport::BoxedReader,
    mut buf: Vec<u8>,
    shared: Arc<Shared>,
    format: Format,
    handlers: Arc<RwLock<Handlers>>,
    recent_stderr: Arc<Mutex<String>>,
) {
    let fatal = loop {
        match transport::read_value(&mut reader, &mut buf).await {
            Ok(Some(reply)) => handle_reply(&shared, format, &handlers, reply),
            Ok(None) => break None,
            Err(err) => break Some(err),
        }
    };

    // During unload the transport closing is the expected end of the
    // conversation, and unload already failed whatever was pending.
    if shared.stopping.swap(true, Ordering::AcqRel) {
        return;
    }

    let mut detail = match fatal {
        Some(err) => err.to_string(),
        None => "pod closed the transport".to_string(),
    };
    let stderr = recent_stderr.lock().expect("not poisoned");
    if !stderr.is_empty() {
        detail = format!("{detail}; recent stderr:\n{stderr}");
    }
    drop(stderr);

    tracing::warn!(pod = %shared.pod_id, %detail, "pod reader stopped; failing live requests");
    shared.fail_all(|| Error::PodTerminated {
        detail: detail.clone(),
    });
}

/// Dispatch actions resolved under the pending lock but run outside it.
enum Deferred {
    Success(SuccessFn, Value),
    Error(ErrorFn, Error),
    Done(DoneFn),
}

fn handle_reply(
    shared: &Shared,
    format: Format,
    handlers: &RwLock<Handlers>,
    reply: envelope::Value,
) {
    // The id is a decimal byte-string. Messages without one (or with one the
    // host never issued) are not addressed to any caller.
    let id: u64 = match reply
        .field("id")
        .ok()
        .flatten()
        .and_then(|id| id.as_str().ok())
        .and_then(|id| id.parse().ok())
    {
        Some(id) => id,
        None => {
            tracing::debug!(pod = %shared.pod_id, "ignoring message without a usable id");
            return;
        }
    };

    let statuses: HashSet<String> = match reply.field("status") {
        Ok(Some(list)) => match list.as_list() {
            Ok(items) => items
                .iter()
                .filter_map(|s| s.as_str().ok().map(str::to_string))
                .collect(),
            Err(err) => {
                tracing::warn!(pod = %shared.pod_id, id, %err, "reply status is not a list");
                return;
            }
        },
        _ => HashSet::new(),
    };
    let done = statuses.contains("done");
    let is_error = statuses.contains("error");

    // Decode payload fields before taking the pending lock.
    let value: Option<Result<Value, Error>> = match reply.field("value") {
        Ok(Some(bytes)) => Some(decode_payload(format, handlers, bytes)),
        _ => None,
    };
    let pod_error = is_error.then(|| {
        let message = reply
            .field("ex-message")
            .ok()
            .flatten()
            .and_then(|m| m.as_str().ok())
            .unwrap_or("")
            .to_string();
        let data = match reply.field("ex-data") {
            Ok(Some(bytes)) => decode_payload(format, handlers, bytes).unwrap_or_else(|err| {
                tracing::warn!(pod = %shared.pod_id, id, %err, "failed to decode ex-data");
                Value::Nil
            }),
            _ => Value::Nil,
        };
        Error::PodError { message, data }
    });

    let mut deferred: Vec<Deferred> = Vec::new();
    {
        let mut pending = shared.pending.lock().expect("not poisoned");
        match pending.get_mut(&id) {
            None => {
                tracing::debug!(pod = %shared.pod_id, id, "dropping reply with no live request");
            }
            Some(Pending::Expired) => {
                tracing::debug!(pod = %shared.pod_id, id, "dropping reply for expired request");
            }
            Some(Pending::LoadNs { .. }) => {
                if done || is_error {
                    let Some(Pending::LoadNs { tx }) = pending.remove(&id) else {
                        unreachable!("entry kind checked above");
                    };
                    let outcome = match pod_error {
                        Some(err) => Err(err),
                        None => Ok(reply.clone()),
                    };
                    let _ = tx.send(outcome);
                }
            }
            Some(Pending::Streaming(stream)) => {
                if let Some(err) = pod_error {
                    if let Some(cb) = &stream.error {
                        deferred.push(Deferred::Error(cb.clone(), err));
                    }
                } else {
                    match value {
                        Some(Ok(v)) => {
                            if let Some(cb) = &stream.success {
                                deferred.push(Deferred::Success(cb.clone(), v));
                            }
                        }
                        Some(Err(err)) => {
                            if let Some(cb) = &stream.error {
                                deferred.push(Deferred::Error(cb.clone(), err));
                            }
                        }
                        None => (),
                    }
                }
                if done {
                    let Some(Pending::Streaming(stream)) = pending.remove(&id) else {
                        unreachable!("entry kind checked above");
                    };
                    if let Some(cb) = stream.done {
                        deferred.push(Deferred::Done(cb));
                    }
                }
            }
            Some(Pending::Unary { buffered, .. }) => {
                if done || is_error {
                    let Some(Pending::Unary { tx, mut buffered }) = pending.remove(&id) else {
                        unreachable!("entry kind checked above");
                    };
                    let outcome = match (pod_error, value) {
                        (Some(err), _) => Err(err),
                        (None, Some(Err(err))) => Err(err),
                        (None, Some(Ok(v))) => {
                            if buffered.is_empty() {
                                Ok(v)
                            } else {
                                buffered.push(v);
                                Ok(Value::Vector(buffered))
                            }
                        }
                        (None, None) => {
                            if buffered.is_empty() {
                                // A bare done: synchronous void return.
                                Ok(Value::Nil)
                            } else {
                                Ok(Value::Vector(buffered))
                            }
                        }
                    };
                    let _ = tx.send(outcome);
                } else {
                    match value {
                        Some(Ok(v)) => buffered.push(v),
                        Some(Err(err)) => {
                            let Some(Pending::Unary { tx, .. }) = pending.remove(&id) else {
                                unreachable!("entry kind checked above");
                            };
                            let _ = tx.send(Err(err));
                        }
                        None => (),
                    }
                }
            }
        }
    }

    // Callbacks run outside the pending lock.
    for action in deferred {
        match action {
            Deferred::Success(cb, v) => cb(v),
            Deferred::Error(cb, err) => cb(err),
            Deferred::Done(cb) => cb(),
        }
    }
}

fn decode_payload(
    format: Format,
    handlers: &RwLock<Handlers>,
    bytes: &envelope::Value,
) -> Result<Value, Error> {
    let bytes = bytes.as_bytes()?;
    let handlers = handlers.read().expect("not poisoned");
    Ok(format.decode(bytes, &handlers)?)
}
