//! Host runtime for pods: external processes exposing named operations over
//! a framed, language-agnostic protocol.
//!
//! A pod is spawned (or resolved from the registry and then spawned),
//! describes its namespaces over a bencode envelope transport, and each
//! described var becomes a host-side callable. See [`Host`] for the full
//! surface; [`load_pod`] and friends operate on a process-global host.

mod config;
mod describe;
mod dispatch;
mod error;
pub mod logging;
mod namespace;
mod process;
#[cfg(test)]
mod testutil;
mod transport;

pub use config::{PodEntry, PodEntryOpts};
pub use describe::{DescribeReply, NamespaceDecl, VarDecl};
pub use dispatch::{DoneFn, ErrorFn, InvokeOpts, Pod, StreamHandlers, SuccessFn};
pub use error::Error;
pub use namespace::{CodeEval, Namespace, OriginalFn, Patch, PatchFn, PodVar};
pub use pod_codec::{Format, Handlers, ReadHandler, TagRep, Tagged, Value, WithMeta};
pub use process::{StderrSink, SHUTDOWN_GRACE};
pub use transport::TransportKind;

use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// What to load: a command vector, a local binary, or a registry coordinate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodSpec {
    Command(Vec<String>),
    Path(PathBuf),
    Registry(String),
}

impl PodSpec {
    /// Interpret a spec string: an existing file is a path; otherwise a
    /// `qualifier/name` string is a registry coordinate.
    pub fn parse(spec: &str) -> PodSpec {
        let path = Path::new(spec);
        if path.exists() {
            return PodSpec::Path(path.to_path_buf());
        }
        if spec.contains('/') && !spec.starts_with('.') && !spec.starts_with('/') {
            return PodSpec::Registry(spec.to_string());
        }
        PodSpec::Path(path.to_path_buf())
    }
}

impl From<&str> for PodSpec {
    fn from(spec: &str) -> PodSpec {
        PodSpec::parse(spec)
    }
}

impl From<Vec<String>> for PodSpec {
    fn from(command: Vec<String>) -> PodSpec {
        PodSpec::Command(command)
    }
}

#[derive(Clone, Default)]
pub struct LoadOpts {
    pub transport: TransportKind,
    /// Registry version; required for `PodSpec::Registry`.
    pub version: Option<String>,
    /// Reload an already-loaded coordinate and re-download its artifact.
    pub force: bool,
    pub stderr: StderrSink,
    /// Var overrides, applied post-describe and pre-exposure.
    pub patches: Vec<Patch>,
}

/// The pod host: loaded pods, the global namespace registry, and the
/// active-pod stack that scopes handler registration.
pub struct Host {
    resolver: pod_registry::Resolver,
    pods: Mutex<HashMap<String, Arc<Pod>>>,
    namespaces: Mutex<HashMap<String, Namespace>>,
    /// Patches by pod id, kept for namespaces that load later.
    patches: Mutex<HashMap<String, Vec<Patch>>>,
    /// Pod ids in load order; the top is the current pod for handler
    /// registration.
    active: Mutex<Vec<String>>,
    code_eval: Mutex<Option<Arc<dyn CodeEval>>>,
}

impl Default for Host {
    fn default() -> Self {
        Host::new()
    }
}

impl Host {
    pub fn new() -> Host {
        Host {
            resolver: pod_registry::Resolver::default(),
            pods: Mutex::new(HashMap::new()),
            namespaces: Mutex::new(HashMap::new()),
            patches: Mutex::new(HashMap::new()),
            active: Mutex::new(Vec::new()),
            code_eval: Mutex::new(None),
        }
    }

    /// Install the embedder capability that evaluates pod-supplied code.
    pub fn set_code_eval(&self, eval: Arc<dyn CodeEval>) {
        *self.code_eval.lock().expect("not poisoned") = Some(eval);
    }

    /// Load a pod and expose its eager namespaces. Loading the same registry
    /// coordinate twice returns the existing handle unless `opts.force`.
    pub async fn load_pod(
        &self,
        spec: impl Into<PodSpec>,
        opts: LoadOpts,
    ) -> Result<Arc<Pod>, Error> {
        let spec = spec.into();
        let (id, command) = match &spec {
            PodSpec::Command(argv) => (argv.join(" "), argv.clone()),
            PodSpec::Path(path) => (
                path.display().to_string(),
                vec![path.to_string_lossy().into_owned()],
            ),
            PodSpec::Registry(coordinate) => {
                if let Some(existing) = self.lookup_pod(coordinate) {
                    if !opts.force {
                        tracing::debug!(pod = %coordinate, "pod already loaded");
                        return Ok(existing);
                    }
                    self.unload_pod(coordinate).await?;
                }
                let version = opts.version.as_deref().ok_or_else(|| {
                    Error::Config(format!(
                        "registry coordinate {coordinate:?} requires a version"
                    ))
                })?;
                let entrypoint = self.resolver.resolve(coordinate, version, opts.force).await?;
                (
                    coordinate.clone(),
                    vec![entrypoint.to_string_lossy().into_owned()],
                )
            }
        };

        if let Some(existing) = self.lookup_pod(&id) {
            if !opts.force {
                return Ok(existing);
            }
            self.unload_pod(&id).await?;
        }

        let (supervisor, connection) = process::spawn(&command, opts.transport, opts.stderr)?;
        let connection = match connection {
            Some(connection) => connection,
            // Socket transport: rendezvous over the port file. A failed
            // rendezvous drops the supervisor, which kills the child.
            None => transport::connect_socket(supervisor.pid()).await?,
        };

        let pod = Pod::start(id.clone(), connection, Some(supervisor)).await?;
        if let Err(err) = self.register(&pod, &opts) {
            pod.unload().await;
            return Err(err);
        }
        tracing::info!(pod = %id, format = %pod.format(), "pod loaded");
        Ok(pod)
    }

    /// Expose namespaces and record the pod. On error the caller unloads.
    fn register(&self, pod: &Arc<Pod>, opts: &LoadOpts) -> Result<(), Error> {
        self.install_describe_readers(pod);

        let code_eval = self.code_eval.lock().expect("not poisoned").clone();
        let describe = pod.describe();
        let mut exposed = Vec::new();
        for decl in &describe.namespaces {
            if describe.defer.contains(&decl.name) {
                continue;
            }
            exposed.push(namespace::expose(
                pod,
                decl,
                &opts.patches,
                code_eval.as_ref(),
            )?);
        }

        let id = pod.id().to_string();
        self.patches
            .lock()
            .expect("not poisoned")
            .insert(id.clone(), opts.patches.clone());
        self.pods
            .lock()
            .expect("not poisoned")
            .insert(id.clone(), pod.clone());
        {
            let mut namespaces = self.namespaces.lock().expect("not poisoned");
            for ns in exposed {
                if let Some(previous) = namespaces.insert(ns.name.clone(), ns) {
                    tracing::warn!(
                        namespace = %previous.name,
                        previous_pod = %previous.pod_id,
                        "namespace re-exposed by a newer pod"
                    );
                }
            }
        }
        self.active.lock().expect("not poisoned").push(id);
        Ok(())
    }

    /// Compile `describe.readers` sources through the code evaluator. These
    /// install first, so runtime handler registration shadows them.
    fn install_describe_readers(&self, pod: &Arc<Pod>) {
        let Some(eval) = self.code_eval.lock().expect("not poisoned").clone() else {
            return;
        };
        let Some(table) = pod.describe().readers.get(eval.dialect()) else {
            return;
        };
        let mut handlers = pod.handlers().write().expect("not poisoned");
        for (tag, source) in table {
            let Some(handler) = eval.reader(tag, source) else {
                tracing::debug!(%tag, "no compiled reader for describe-supplied tag");
                continue;
            };
            match pod.format() {
                Format::Edn => handlers.add_edn_read(tag.clone(), handler),
                Format::TransitJson => handlers.add_transit_read(tag.clone(), handler),
                Format::Json => (),
            }
        }
    }

    /// Gracefully stop a pod and drop its namespace registrations.
    pub async fn unload_pod(&self, id: &str) -> Result<(), Error> {
        let pod = self
            .pods
            .lock()
            .expect("not poisoned")
            .remove(id)
            .ok_or_else(|| Error::NoSuchPod(id.to_string()))?;
        self.active.lock().expect("not poisoned").retain(|p| p != id);
        self.patches.lock().expect("not poisoned").remove(id);
        self.namespaces
            .lock()
            .expect("not poisoned")
            .retain(|_, ns| ns.pod_id != id);

        pod.unload().await;
        tracing::info!(pod = %id, "pod unloaded");
        Ok(())
    }

    /// The process-exit hook: unload every live pod.
    pub async fn unload_all(&self) {
        let ids: Vec<String> = self.pods.lock().expect("not poisoned").keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.unload_pod(&id).await {
                tracing::warn!(pod = %id, %err, "failed to unload pod at exit");
            }
        }
    }

    /// Invoke `var` (a qualified `namespace/name` symbol) on a pod. Exposed
    /// vars go through the namespace registry so patches and arg-meta apply;
    /// anything else is sent to the pod verbatim.
    pub async fn invoke(
        &self,
        pod_id: &str,
        var: &str,
        args: Vec<Value>,
        opts: InvokeOpts,
    ) -> Result<Value, Error> {
        let pod = self.get_pod(pod_id)?;

        if let Some((ns_name, var_name)) = var.split_once('/') {
            let exposed = {
                let namespaces = self.namespaces.lock().expect("not poisoned");
                namespaces
                    .get(ns_name)
                    .filter(|ns| ns.pod_id == pod_id)
                    .and_then(|ns| ns.var(var_name))
                    .cloned()
            };
            if let Some(exposed) = exposed {
                return exposed.call_with(args, opts).await;
            }
        }
        pod.invoke(var, args, opts).await
    }

    /// Look up an exposed var.
    pub fn find_var(&self, namespace: &str, name: &str) -> Result<Arc<PodVar>, Error> {
        self.namespaces
            .lock()
            .expect("not poisoned")
            .get(namespace)
            .and_then(|ns| ns.var(name))
            .cloned()
            .ok_or_else(|| Error::NoSuchVar(format!("{namespace}/{name}")))
    }

    /// Exposed namespaces with their originating pod ids.
    pub fn list_pod_modules(&self) -> Vec<(String, String)> {
        let namespaces = self.namespaces.lock().expect("not poisoned");
        let mut modules: Vec<(String, String)> = namespaces
            .values()
            .map(|ns| (ns.name.clone(), ns.pod_id.clone()))
            .collect();
        modules.sort();
        modules
    }

    /// Declared-but-unloaded namespaces, optionally restricted to one pod.
    pub fn list_deferred_namespaces(&self, pod_id: Option<&str>) -> Vec<String> {
        let pods = self.pods.lock().expect("not poisoned");
        let mut deferred: Vec<String> = pods
            .values()
            .filter(|pod| pod_id.map_or(true, |id| pod.id() == id))
            .flat_map(|pod| {
                pod.deferred()
                    .lock()
                    .expect("not poisoned")
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        deferred.sort();
        deferred
    }

    /// Force-load a deferred namespace and expose it.
    pub async fn load_and_expose_namespace(
        &self,
        pod_id: &str,
        namespace: &str,
    ) -> Result<(), Error> {
        let pod = self.get_pod(pod_id)?;
        if !pod
            .deferred()
            .lock()
            .expect("not poisoned")
            .contains(namespace)
        {
            return Err(Error::NoSuchNamespace(namespace.to_string()));
        }

        let decls = pod.load_ns(namespace).await?;
        pod.deferred().lock().expect("not poisoned").remove(namespace);

        let code_eval = self.code_eval.lock().expect("not poisoned").clone();
        let patches = self
            .patches
            .lock()
            .expect("not poisoned")
            .get(pod_id)
            .cloned()
            .unwrap_or_default();

        let mut namespaces = Vec::new();
        for decl in &decls {
            namespaces.push(namespace::expose(&pod, decl, &patches, code_eval.as_ref())?);
        }
        let mut registry = self.namespaces.lock().expect("not poisoned");
        for ns in namespaces {
            registry.insert(ns.name.clone(), ns);
        }
        Ok(())
    }

    /// Run `f` with `pod_id` as the current pod, for handler registration
    /// outside a `load_pod` call.
    pub fn with_active_pod<R>(&self, pod_id: &str, f: impl FnOnce() -> R) -> Result<R, Error> {
        let _ = self.get_pod(pod_id)?;
        self.active
            .lock()
            .expect("not poisoned")
            .push(pod_id.to_string());
        let result = f();
        let mut active = self.active.lock().expect("not poisoned");
        if let Some(position) = active.iter().rposition(|id| id == pod_id) {
            active.remove(position);
        }
        Ok(result)
    }

    pub fn add_edn_read_handler(&self, tag: &str, handler: ReadHandler) -> Result<(), Error> {
        let pod = self.current_pod()?;
        require_format(&pod, Format::Edn)?;
        pod.handlers()
            .write()
            .expect("not poisoned")
            .add_edn_read(tag, handler);
        Ok(())
    }

    pub fn add_edn_write_handler<T: Any + Send + Sync>(
        &self,
        handler: impl Fn(&T) -> Result<Value, pod_codec::Error> + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let pod = self.current_pod()?;
        require_format(&pod, Format::Edn)?;
        pod.handlers()
            .write()
            .expect("not poisoned")
            .add_edn_write(handler);
        Ok(())
    }

    pub fn add_transit_read_handler(&self, tag: &str, handler: ReadHandler) -> Result<(), Error> {
        let pod = self.current_pod()?;
        require_format(&pod, Format::TransitJson)?;
        pod.handlers()
            .write()
            .expect("not poisoned")
            .add_transit_read(tag, handler);
        Ok(())
    }

    pub fn add_transit_write_handler<T: Any + Send + Sync>(
        &self,
        handler: impl Fn(&T) -> Result<TagRep, pod_codec::Error> + Send + Sync + 'static,
    ) -> Result<(), Error> {
        let pod = self.current_pod()?;
        require_format(&pod, Format::TransitJson)?;
        pod.handlers()
            .write()
            .expect("not poisoned")
            .add_transit_write(handler);
        Ok(())
    }

    pub fn set_default_transit_write_handler(
        &self,
        handler: pod_codec::TransitWriteHandler,
    ) -> Result<(), Error> {
        let pod = self.current_pod()?;
        require_format(&pod, Format::TransitJson)?;
        pod.handlers()
            .write()
            .expect("not poisoned")
            .set_transit_write_default(handler);
        Ok(())
    }

    /// Load every pod declared in a pyproject-style TOML file, honoring
    /// per-pod opts. `selectors` restricts loading to the named pods.
    pub async fn load_pods_from_pyproject(
        &self,
        file: Option<&Path>,
        selectors: &[&str],
    ) -> Result<Vec<Arc<Pod>>, Error> {
        let path = file.unwrap_or_else(|| Path::new("pyproject.toml"));
        let entries = config::read_file(path)?;
        let selected = config::select(&entries, selectors);

        let mut pods = Vec::with_capacity(selected.len());
        for entry in selected {
            entry.validate()?;
            let (spec, opts) = entry.to_spec();
            pods.push(self.load_pod(spec, opts).await?);
        }
        Ok(pods)
    }

    fn lookup_pod(&self, id: &str) -> Option<Arc<Pod>> {
        self.pods.lock().expect("not poisoned").get(id).cloned()
    }

    fn get_pod(&self, id: &str) -> Result<Arc<Pod>, Error> {
        self.lookup_pod(id)
            .ok_or_else(|| Error::NoSuchPod(id.to_string()))
    }

    /// The current pod: the most recent active frame that is still loaded.
    fn current_pod(&self) -> Result<Arc<Pod>, Error> {
        let active = self.active.lock().expect("not poisoned");
        let pods = self.pods.lock().expect("not poisoned");
        active
            .iter()
            .rev()
            .find_map(|id| pods.get(id))
            .cloned()
            .ok_or(Error::NoActivePod)
    }
}

fn require_format(pod: &Pod, requested: Format) -> Result<(), Error> {
    if pod.format() == requested {
        Ok(())
    } else {
        Err(Error::WrongFormat {
            requested: requested.wire_name(),
            actual: pod.format().wire_name(),
        })
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL: Host = Host::new();
}

/// The process-global host used by the free-function API.
pub fn global() -> &'static Host {
    &GLOBAL
}

pub async fn load_pod(spec: impl Into<PodSpec>, opts: LoadOpts) -> Result<Arc<Pod>, Error> {
    global().load_pod(spec, opts).await
}

pub async fn unload_pod(id: &str) -> Result<(), Error> {
    global().unload_pod(id).await
}

pub async fn unload_all() {
    global().unload_all().await
}

pub async fn invoke(
    pod_id: &str,
    var: &str,
    args: Vec<Value>,
    opts: InvokeOpts,
) -> Result<Value, Error> {
    global().invoke(pod_id, var, args, opts).await
}

pub fn list_pod_modules() -> Vec<(String, String)> {
    global().list_pod_modules()
}

pub fn list_deferred_namespaces(pod_id: Option<&str>) -> Vec<String> {
    global().list_deferred_namespaces(pod_id)
}

pub async fn load_and_expose_namespace(pod_id: &str, namespace: &str) -> Result<(), Error> {
    global().load_and_expose_namespace(pod_id, namespace).await
}

pub async fn load_pods_from_pyproject(
    file: Option<&Path>,
    selectors: &[&str],
) -> Result<Vec<Arc<Pod>>, Error> {
    global().load_pods_from_pyproject(file, selectors).await
}

pub fn add_edn_read_handler(tag: &str, handler: ReadHandler) -> Result<(), Error> {
    global().add_edn_read_handler(tag, handler)
}

pub fn add_edn_write_handler<T: Any + Send + Sync>(
    handler: impl Fn(&T) -> Result<Value, pod_codec::Error> + Send + Sync + 'static,
) -> Result<(), Error> {
    global().add_edn_write_handler(handler)
}

pub fn add_transit_read_handler(tag: &str, handler: ReadHandler) -> Result<(), Error> {
    global().add_transit_read_handler(tag, handler)
}

pub fn add_transit_write_handler<T: Any + Send + Sync>(
    handler: impl Fn(&T) -> Result<TagRep, pod_codec::Error> + Send + Sync + 'static,
) -> Result<(), Error> {
    global().add_transit_write_handler(handler)
}

pub fn set_default_transit_write_handler(
    handler: pod_codec::TransitWriteHandler,
) -> Result<(), Error> {
    global().set_default_transit_write_handler(handler)
}

#[cfg(test)]
mod test {
    use super::{Error, Format, Host, InvokeOpts, LoadOpts, Patch, PodSpec, Value};
    use crate::testutil::{reply, start_pod};
    use futures::FutureExt;
    use pod_envelope as envelope;
    use std::sync::Arc;

    /// Wire a testutil pod into a fresh host, as load_pod would.
    async fn host_with_fake_pod(
        format: &'static str,
    ) -> (
        Host,
        tokio::task::JoinHandle<crate::testutil::FakePod>,
        Arc<crate::dispatch::Pod>,
    ) {
        let host = Host::new();
        let (fake, pod) = start_pod(format).await;
        host.register(&pod, &LoadOpts::default()).unwrap();
        (host, fake, pod)
    }

    #[test]
    fn test_pod_spec_parse() {
        assert_eq!(
            PodSpec::parse("org.babashka/instaparse"),
            PodSpec::Registry("org.babashka/instaparse".to_string())
        );
        assert_eq!(
            PodSpec::parse("./bin/my-pod"),
            PodSpec::Path("./bin/my-pod".into())
        );
        assert_eq!(
            PodSpec::parse("/usr/bin/my-pod"),
            PodSpec::Path("/usr/bin/my-pod".into())
        );
        // An existing file wins over the coordinate interpretation.
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("qualifier").join("name");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "").unwrap();
        assert_eq!(
            PodSpec::parse(file.to_str().unwrap()),
            PodSpec::Path(file.clone())
        );
    }

    #[tokio::test]
    async fn test_registration_exposes_namespaces() {
        let (host, fake, pod) = host_with_fake_pod("edn").await;
        let _fake = fake.await.unwrap();

        assert_eq!(
            host.list_pod_modules(),
            vec![("pod.test-pod".to_string(), "test-pod".to_string())]
        );
        // The deferred namespace is declared but not exposed.
        assert_eq!(
            host.list_deferred_namespaces(None),
            vec!["pod.test-pod.extras".to_string()]
        );
        assert!(host.find_var("pod.test-pod", "add-one").is_ok());
        assert!(host.find_var("pod.test-pod.extras", "anything").is_err());

        host.unload_pod(pod.id()).await.unwrap();
        assert!(host.list_pod_modules().is_empty());
        assert!(host.list_deferred_namespaces(None).is_empty());
        assert!(matches!(
            host.invoke("test-pod", "pod.test-pod/add-one", vec![], InvokeOpts::default()).await,
            Err(Error::NoSuchPod(_))
        ));
    }

    #[tokio::test]
    async fn test_invoke_routes_through_exposed_vars() {
        let (host, fake, _pod) = host_with_fake_pod("edn").await;

        let script = tokio::spawn(async move {
            let mut fake = fake.await.unwrap();
            let request = fake.recv().await;
            assert_eq!(
                request.expect_field("var").unwrap().as_str().unwrap(),
                "pod.test-pod/add-one"
            );
            let id = request.expect_field("id").unwrap().clone();
            fake.send(reply(&id, Some("42"), &["done"])).await;
            fake
        });

        let result = host
            .invoke(
                "test-pod",
                "pod.test-pod/add-one",
                vec![Value::Int(41)],
                InvokeOpts::default(),
            )
            .await
            .unwrap();
        assert_eq!(result, Value::Int(42));
        let _fake = script.await.unwrap();
    }

    #[tokio::test]
    async fn test_load_and_expose_deferred_namespace() {
        let (host, fake, _pod) = host_with_fake_pod("edn").await;

        let script = tokio::spawn(async move {
            let mut fake = fake.await.unwrap();
            let request = fake.recv().await;
            assert_eq!(
                request.expect_field("op").unwrap().as_str().unwrap(),
                "load-ns"
            );
            assert_eq!(
                request.expect_field("ns").unwrap().as_str().unwrap(),
                "pod.test-pod.extras"
            );
            let id = request.expect_field("id").unwrap().clone();
            fake.send(envelope::Value::dict(vec![
                ("id", id),
                (
                    "status",
                    envelope::Value::List(vec![envelope::Value::from("done")]),
                ),
                (
                    "namespaces",
                    envelope::Value::List(vec![envelope::Value::dict(vec![
                        ("name", envelope::Value::from("pod.test-pod.extras")),
                        (
                            "vars",
                            envelope::Value::List(vec![envelope::Value::dict(vec![(
                                "name",
                                envelope::Value::from("extra-fn"),
                            )])]),
                        ),
                    ])]),
                ),
            ]))
            .await;
            fake
        });

        // Unknown namespaces are refused outright.
        assert!(matches!(
            host.load_and_expose_namespace("test-pod", "no.such.ns").await,
            Err(Error::NoSuchNamespace(_))
        ));

        host.load_and_expose_namespace("test-pod", "pod.test-pod.extras")
            .await
            .unwrap();
        assert!(host.list_deferred_namespaces(None).is_empty());
        assert!(host.find_var("pod.test-pod.extras", "extra_fn").is_ok());
        let _fake = script.await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_registration_requires_active_pod() {
        let host = Host::new();
        let err = host
            .add_edn_read_handler("person", Arc::new(|value| Ok(value)))
            .unwrap_err();
        assert!(matches!(err, Error::NoActivePod));
    }

    #[tokio::test]
    async fn test_handler_registration_checks_format() {
        let (host, fake, pod) = host_with_fake_pod("edn").await;
        let _fake = fake.await.unwrap();

        // The loaded pod is current; EDN registration lands in its tables.
        host.add_edn_read_handler("person", Arc::new(|value| Ok(value))).unwrap();
        assert!(pod
            .handlers()
            .read()
            .unwrap()
            .edn_read
            .contains_key("person"));

        // Transit registration against an EDN pod is refused.
        let err = host
            .add_transit_read_handler("person", Arc::new(|value| Ok(value)))
            .unwrap_err();
        match err {
            Error::WrongFormat { requested, actual } => {
                assert_eq!((requested, actual), ("transit+json", "edn"));
            }
            other => panic!("expected WrongFormat, got {other:?}"),
        }

        assert_eq!(pod.format(), Format::Edn);
    }

    #[tokio::test]
    async fn test_registered_edn_reader_transforms_replies() {
        let (host, fake, _pod) = host_with_fake_pod("edn").await;

        host.add_edn_read_handler(
            "person",
            Arc::new(|value| {
                let name = value.get_kw("name").cloned().unwrap_or(Value::Nil);
                let age = value.get_kw("age").cloned().unwrap_or(Value::Nil);
                let description = match (&name, &age) {
                    (Value::String(n), Value::Int(a)) => format!("{n} is {a} years old"),
                    _ => String::new(),
                };
                Ok(Value::Map(vec![
                    (Value::string("type"), Value::string("Person")),
                    (Value::string("name"), name),
                    (Value::string("age"), age),
                    (Value::string("description"), Value::string(description)),
                ]))
            }),
        )
        .unwrap();

        let script = tokio::spawn(async move {
            let mut fake = fake.await.unwrap();
            let request = fake.recv().await;
            let id = request.expect_field("id").unwrap().clone();
            fake.send(reply(&id, Some("#person {:name \"A\" :age 30}"), &["done"]))
                .await;
            fake
        });

        let result = host
            .invoke("test-pod", "pod.test-pod/echo", vec![], InvokeOpts::default())
            .await
            .unwrap();
        assert_eq!(
            result,
            Value::Map(vec![
                (Value::string("type"), Value::string("Person")),
                (Value::string("name"), Value::string("A")),
                (Value::string("age"), Value::Int(30)),
                (Value::string("description"), Value::string("A is 30 years old")),
            ])
        );
        let _fake = script.await.unwrap();
    }

    #[tokio::test]
    async fn test_patches_apply_on_invoke_through_host() {
        let host = Host::new();
        let (fake, pod) = start_pod("edn").await;

        let opts = LoadOpts {
            patches: vec![Patch {
                namespace: "pod.test-pod".to_string(),
                var: "add-one".to_string(),
                f: Arc::new(|_original, _args| {
                    // Short-circuit without consulting the pod.
                    async { Ok(Value::string("patched")) }.boxed()
                }),
            }],
            ..LoadOpts::default()
        };
        host.register(&pod, &opts).unwrap();
        let _fake = fake.await.unwrap();

        let result = host
            .invoke(
                "test-pod",
                "pod.test-pod/add-one",
                vec![Value::Int(1)],
                InvokeOpts::default(),
            )
            .await
            .unwrap();
        assert_eq!(result, Value::string("patched"));
    }
}
