//! Namespace exposure: described vars become host-side callables.
//!
//! Each var yields either a remote callable (calling it produces an `invoke`)
//! or, when the pod supplied inline source, a host-evaluation task handed to
//! the embedder's [`CodeEval`] capability. Patches replace a remote callable
//! with a user closure that can still reach the original.

use crate::describe::NamespaceDecl;
use crate::dispatch::{InvokeOpts, Pod, StreamHandlers};
use crate::Error;
use futures::future::BoxFuture;
use futures::FutureExt;
use pod_codec::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Delegates to the remote var a patch replaced.
pub type OriginalFn =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync>;

/// A user override installed in place of a remote callable. It receives the
/// original callable and the call's arguments.
pub type PatchFn = Arc<
    dyn Fn(OriginalFn, Vec<Value>) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync,
>;

#[derive(Clone)]
pub struct Patch {
    pub namespace: String,
    pub var: String,
    pub f: PatchFn,
}

/// Embedder capability for pod-supplied code. The core stores and routes
/// source fragments; it never evaluates them itself.
pub trait CodeEval: Send + Sync {
    /// Evaluate a var's source. The scope already contains the other exposed
    /// vars of `namespace`.
    fn eval(&self, namespace: &str, var: &str, source: &str) -> anyhow::Result<()>;

    /// Compile a tag reader function from `describe.readers` source.
    fn reader(&self, tag: &str, source: &str) -> Option<pod_codec::ReadHandler> {
        let _ = (tag, source);
        None
    }

    /// The `describe.readers` dialect this evaluator understands.
    fn dialect(&self) -> &str {
        "rust"
    }
}

/// One exposed var.
pub struct PodVar {
    pub name: String,
    /// Fully qualified `namespace/name` symbol sent on the wire.
    pub symbol: String,
    pub doc: Option<String>,
    pub is_async: bool,
    /// Whether the pod wants argument metadata preserved. When unset,
    /// top-level `WithMeta` wrappers are stripped from outgoing args.
    pub arg_meta: bool,
    /// Source of a host-evaluated var; `None` for remote vars.
    pub code: Option<String>,
    pod: Weak<Pod>,
    patch: Option<PatchFn>,
}

impl PodVar {
    /// Call the var synchronously.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value, Error> {
        self.call_with(args, InvokeOpts::default()).await
    }

    /// Call the var as a streaming request with explicit callbacks.
    pub async fn call_streaming(
        &self,
        args: Vec<Value>,
        handlers: StreamHandlers,
    ) -> Result<(), Error> {
        self.call_with(
            args,
            InvokeOpts {
                handlers: Some(handlers),
                deadline: None,
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn call_with(&self, args: Vec<Value>, opts: InvokeOpts) -> Result<Value, Error> {
        if self.code.is_some() {
            return Err(Error::HostEval(format!(
                "var {} is host-evaluated code; it has no remote implementation",
                self.symbol
            )));
        }
        let args = self.prepare_args(args);
        match (&self.patch, opts.handlers.is_some()) {
            // Patches intercept plain calls; explicit streaming goes direct.
            (Some(patch), false) => patch(self.original(), args).await,
            _ => self.remote(args, opts).await,
        }
    }

    /// The unpatched remote callable.
    pub fn original(&self) -> OriginalFn {
        let pod = self.pod.clone();
        let symbol = self.symbol.clone();
        Arc::new(move |args| {
            let pod = pod.clone();
            let symbol = symbol.clone();
            async move {
                let pod = pod.upgrade().ok_or(Error::PodCancelled)?;
                pod.invoke(&symbol, args, InvokeOpts::default()).await
            }
            .boxed()
        })
    }

    async fn remote(&self, args: Vec<Value>, opts: InvokeOpts) -> Result<Value, Error> {
        let pod = self.pod.upgrade().ok_or(Error::PodCancelled)?;
        pod.invoke(&self.symbol, args, opts).await
    }

    fn prepare_args(&self, args: Vec<Value>) -> Vec<Value> {
        if self.arg_meta {
            return args;
        }
        args.into_iter()
            .map(|arg| match arg {
                Value::WithMeta(wm) => wm.value,
                other => other,
            })
            .collect()
    }
}

/// A namespace's exposed vars. Var names resolve both verbatim and in
/// underscore style; both aliases share one callable.
pub struct Namespace {
    pub name: String,
    pub pod_id: String,
    vars: HashMap<String, Arc<PodVar>>,
}

impl Namespace {
    pub fn var(&self, name: &str) -> Option<&Arc<PodVar>> {
        self.vars.get(name)
    }

    /// Var names as described by the pod (aliases excluded).
    pub fn var_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .vars
            .iter()
            .filter(|(key, var)| **key == var.name)
            .map(|(key, _)| key.as_str())
            .collect();
        names.sort_unstable();
        names
    }
}

/// Build the exposed namespace for `decl`. Code vars are evaluated through
/// `code_eval` when one is installed; patches are applied before exposure.
pub(crate) fn expose(
    pod: &Arc<Pod>,
    decl: &NamespaceDecl,
    patches: &[Patch],
    code_eval: Option<&Arc<dyn CodeEval>>,
) -> Result<Namespace, Error> {
    let mut vars = HashMap::new();

    for var in &decl.vars {
        let symbol = format!("{}/{}", decl.name, var.name);

        if let Some(code) = &var.code {
            if let Some(eval) = code_eval {
                eval.eval(&decl.name, &var.name, code)
                    .map_err(|err| Error::HostEval(format!("{err:#}")))?;
            } else {
                tracing::debug!(
                    %symbol,
                    "storing host-evaluated var source; no code evaluator installed"
                );
            }
        }

        let patch = patches
            .iter()
            .find(|p| p.namespace == decl.name && p.var == var.name)
            .map(|p| p.f.clone());

        let exposed = Arc::new(PodVar {
            name: var.name.clone(),
            symbol,
            doc: var.doc.clone(),
            is_async: var.is_async,
            arg_meta: var.arg_meta,
            code: var.code.clone(),
            pod: Arc::downgrade(pod),
            patch,
        });

        let alias = var.name.replace('-', "_");
        if alias != var.name {
            vars.entry(alias).or_insert_with(|| exposed.clone());
        }
        vars.insert(var.name.clone(), exposed);
    }

    Ok(Namespace {
        name: decl.name.clone(),
        pod_id: pod.id().to_string(),
        vars,
    })
}
