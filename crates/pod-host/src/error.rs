//! The host-side error taxonomy.
//!
//! Every failure a caller can observe is one of these kinds. The dispatch
//! engine never swallows an error: each is surfaced on the completion slot of
//! the request it belongs to, and reader-fatal conditions fail every live
//! request of the affected pod.

use pod_codec::Value;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to start pod process: {detail}")]
    PodSpawn { detail: String },

    #[error("pod handshake failed: {detail}")]
    PodHandshake { detail: String },

    #[error("pod terminated unexpectedly: {detail}")]
    PodTerminated { detail: String },

    #[error("pod call deadline expired")]
    PodTimeout,

    #[error("pod was unloaded while the call was pending")]
    PodCancelled,

    /// The pod replied with an error status. `data` is the decoded `ex-data`
    /// payload.
    #[error("pod error: {message}")]
    PodError { message: String, data: Value },

    #[error(transparent)]
    Envelope(#[from] pod_envelope::Error),

    #[error(transparent)]
    Format(#[from] pod_codec::Error),

    #[error(transparent)]
    Registry(#[from] pod_registry::Error),

    #[error("no active pod; handler registration requires a loaded pod")]
    NoActivePod,

    #[error("pod payload format is {actual}, not {requested}")]
    WrongFormat {
        requested: &'static str,
        actual: &'static str,
    },

    #[error("pod {0:?} is not loaded")]
    NoSuchPod(String),

    #[error("var {0:?} is not exposed by any loaded namespace")]
    NoSuchVar(String),

    #[error("namespace {0:?} was not declared by the pod")]
    NoSuchNamespace(String),

    /// A pod-supplied code fragment could not be evaluated by the embedder.
    #[error("host evaluation failed: {0}")]
    HostEval(String),

    #[error("invalid pod declaration: {0}")]
    Config(String),
}
