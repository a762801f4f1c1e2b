//! `Case`: owns a storage root and a spec, enumerates instances, drives them through the
//! pipeline, and materializes a columnar result store (§3 Ownership; §4.10). Grounded on
//! `bench-harness::config::Config`'s load/merge glue for `CaseSpec`, and on the `csv` crate
//! usage in `bench-harness::tasks::append_csv` for the dataframe snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use fd_lock::RwLock as FileLock;
use tracing::{info, warn};

use crate::capture::ResultCollector;
use crate::command::Command;
use crate::context::{Context as Ctx, ContextProvider, Evaluable, EvaluableValue};
use crate::filemap::FileMap;
use crate::instance::{Instance, Status};
use crate::parameters::{Parameter, ParameterSpace};
use crate::pipeline::{run_pipeline, CancelFlag, PipelineReport};
use crate::script::Script;
use crate::template;
use crate::types::{Stage, Type, TypeManager, Value};
use crate::workspace::{LocalWorkspace, LocalWorkspaceCollection, TempWorkspaceCollection, Workspace, WorkspaceCollection};

fn infer_scalar(value: &Value) -> crate::types::Scalar {
    use crate::types::Scalar;
    match value {
        Value::Int(_) => Scalar::Integer,
        Value::Float(_) => Scalar::Float,
        Value::Str(_) => Scalar::String,
        Value::Bool(_) => Scalar::Boolean,
        Value::DateTime(_) => Scalar::DateTime,
        Value::List(items) => items.first().map(infer_scalar).unwrap_or(Scalar::String),
    }
}

/// A validated spec ready to drive a `Case`: the in-memory form of `grevling.toml` after
/// `src/config.rs` deserializes and resolves it.
pub struct CaseSpec {
    pub parameters: ParameterSpace,
    pub constants: Vec<(String, Value)>,
    pub evaluables: Vec<Evaluable>,
    pub wheres: Vec<String>,
    pub premap: FileMap,
    pub postmap: FileMap,
    pub script: Script,
    pub storagedir: PathBuf,
    pub sourcedir: PathBuf,
    pub logdir_template: String,
    pub ignore_missing: bool,
}

impl Default for CaseSpec {
    fn default() -> Self {
        Self {
            parameters: ParameterSpace::new(),
            constants: vec![],
            evaluables: vec![],
            wheres: vec![],
            premap: FileMap::new(),
            postmap: FileMap::new(),
            script: Script::new(vec![]),
            storagedir: PathBuf::from("."),
            sourcedir: PathBuf::from("."),
            logdir_template: "${g_index}".to_string(),
            ignore_missing: false,
        }
    }
}

/// The experiment runtime: owns the storage root workspace and type manager derived from the
/// spec, and drives instance enumeration, pipeline execution, and result collection.
pub struct Case {
    spec: CaseSpec,
    storage: LocalWorkspace,
    types: TypeManager,
    provider: ContextProvider,
}

impl Case {
    pub fn new(spec: CaseSpec) -> Result<Self> {
        let storage = LocalWorkspace::new(&spec.storagedir)?;
        let mut provider = ContextProvider::new(spec.parameters.clone());
        for (name, value) in &spec.constants {
            provider.add_constant(name.clone(), value.clone());
        }
        for evaluable in &spec.evaluables {
            provider.add_evaluable(evaluable.clone());
        }
        for predicate in &spec.wheres {
            provider.add_where(predicate.clone());
        }
        provider.infer_types()?;

        let mut types = TypeManager::new();
        for name in spec.parameters.names() {
            if let Some(parameter) = spec.parameters.get(name) {
                let sample = parameter.values();
                let scalar = sample.first().map(infer_scalar).unwrap_or(crate::types::Scalar::String);
                types.declare(name.to_string(), Type::scalar(scalar), Stage::Pre);
            }
        }
        for (name, value) in &spec.constants {
            if !types.contains(name) {
                types.declare(name.clone(), Type::scalar(infer_scalar(value)), Stage::Pre);
            }
        }
        for name in provider.types().names() {
            if let Some(ty) = provider.types().get(name) {
                types.declare(name.to_string(), ty.clone(), Stage::Pre);
            }
        }
        types.declare("g_index", Type::scalar(crate::types::Scalar::Integer), Stage::Pre);
        types.declare("g_logdir", Type::scalar(crate::types::Scalar::String), Stage::Pre);
        types.declare("g_started", Type::scalar(crate::types::Scalar::DateTime), Stage::Post);
        types.declare("g_finished", Type::scalar(crate::types::Scalar::DateTime), Stage::Post);
        types.declare("g_success", Type::scalar(crate::types::Scalar::Boolean), Stage::Post);
        for command in &spec.script.commands {
            types.declare(format!("g_walltime_{}", command.name()), Type::scalar(crate::types::Scalar::Float), Stage::Post);
            for capture in &command.captures {
                for name in &capture.group_names {
                    let scalar = capture.type_hint.unwrap_or(crate::types::Scalar::String);
                    types.declare(name.clone(), capture.declared_type(scalar), Stage::Post);
                }
            }
        }

        Ok(Self { spec, storage, types, provider })
    }

    pub fn types(&self) -> &TypeManager {
        &self.types
    }

    fn lock_path(&self) -> PathBuf {
        self.spec.storagedir.join("lockfile")
    }

    fn with_storage_lock<F: FnOnce() -> Result<T>, T>(&self, f: F) -> Result<T> {
        std::fs::create_dir_all(&self.spec.storagedir)?;
        let file = std::fs::OpenOptions::new().create(true).write(true).open(self.lock_path())?;
        let mut lock = FileLock::new(file);
        let _guard = lock.write().context("acquiring storage root lock")?;
        f()
    }

    /// Enumerates every instance context (post-filter, `g_index`-assigned), resolving
    /// `g_logdir` via the logdir template and creating (or reopening) its persistent storage
    /// subtree.
    pub fn instances(&self) -> Result<Vec<Instance>> {
        let contexts = self.provider.enumerate()?;
        let mut out = vec![];
        for mut ctx in contexts {
            let logdir = template::render(&self.spec.logdir_template, &ctx)?;
            ctx.insert("g_logdir", Value::Str(logdir.clone()));
            let instance = if self.storage.exists(&format!("{logdir}/.grevling/status.txt")) {
                Instance::reopen(&self.storage, &logdir, &self.types)?
            } else {
                Instance::create(&self.storage, &logdir, ctx, &self.types)?
            };
            out.push(instance);
        }
        Ok(out)
    }

    /// Drives every not-yet-downloaded instance through `Prepare → Run(nprocs) → Download`.
    /// Instances already at `Downloaded` are skipped untouched (crash-recovery invariant).
    pub fn run(&self, nprocs: usize, cancel: &CancelFlag) -> Result<PipelineReport> {
        self.with_storage_lock(|| {
            let instances = self.instances()?;
            let pending: Vec<Arc<Instance>> = instances
                .into_iter()
                .filter(|i| !matches!(i.status(), Ok(Status::Downloaded)))
                .map(Arc::new)
                .collect();
            info!(n = pending.len(), "running pending instances");

            let remotes = Arc::new(TempWorkspaceCollection::new()?);
            let source = Arc::new(LocalWorkspace::at(self.spec.sourcedir.clone()));
            let premap = Arc::new(self.spec.premap.clone());
            let postmap = Arc::new(self.spec.postmap.clone());
            let script = Arc::new(self.spec.script.clone());
            let types = Arc::new(self.types.clone());
            let ignore_missing = self.spec.ignore_missing;

            let stop_predicate = cancel.as_predicate();

            let prepare_fn = {
                let remotes = Arc::clone(&remotes);
                let source = Arc::clone(&source);
                let premap = Arc::clone(&premap);
                move |instance: &Arc<Instance>| -> Result<bool> {
                    let remote = remotes.new_workspace(Some(instance.logdir()))?;
                    instance.prepare(&premap, source.as_ref(), &remote, ignore_missing)?;
                    Ok(true)
                }
            };

            let run_fn = {
                let remotes = Arc::clone(&remotes);
                let script = Arc::clone(&script);
                let stop_predicate = Arc::clone(&stop_predicate);
                move |instance: &Arc<Instance>| -> Result<bool> {
                    let remote = remotes.open(instance.logdir())?;
                    instance.run(&script, &remote, stop_predicate.as_ref())?;
                    Ok(true)
                }
            };

            let download_fn = {
                let remotes = Arc::clone(&remotes);
                let postmap = Arc::clone(&postmap);
                let script = Arc::clone(&script);
                let types = Arc::clone(&types);
                move |instance: &Arc<Instance>| -> Result<bool> {
                    let remote = remotes.open(instance.logdir())?;
                    instance.download(&script, &postmap, &remote, &types, ignore_missing)?;
                    remotes.destroy_named(instance.logdir())?;
                    Ok(true)
                }
            };

            Ok(run_pipeline(pending, 1, nprocs.max(1), 1, prepare_fn, run_fn, download_fn, stop_predicate))
        })
    }

    /// Walks every downloaded instance and materializes a CSV snapshot ordered by `g_index`,
    /// using `TypeManager::tabular_schema()` for column order.
    pub fn collect(&self, dataframe_path: &Path) -> Result<usize> {
        self.with_storage_lock(|| {
            let mut rows: Vec<(i64, Vec<String>)> = vec![];
            let schema = self.types.tabular_schema();
            for name in self.storage.files()? {
                if !name.ends_with(".grevling/status.txt") {
                    continue;
                }
                let logdir = name.trim_end_matches("/.grevling/status.txt");
                let instance = match Instance::reopen(&self.storage, logdir, &self.types) {
                    Ok(i) => i,
                    Err(e) => {
                        warn!(logdir, error = %e, "skipping unreadable instance during collect");
                        continue;
                    }
                };
                if !matches!(instance.status(), Ok(Status::Downloaded)) {
                    continue;
                }
                let ctx = instance.context();
                let index = ctx.index().unwrap_or(-1);
                let row = schema
                    .iter()
                    .map(|(col, _)| ctx.get(col).map(Value::render).unwrap_or_default())
                    .collect::<Vec<_>>();
                rows.push((index, row));
            }
            rows.sort_by_key(|(index, _)| *index);

            let mut writer = csv::Writer::from_path(dataframe_path).with_context(|| format!("creating {}", dataframe_path.display()))?;
            writer.write_record(schema.iter().map(|(name, _)| name.as_str()))?;
            for (_, row) in &rows {
                writer.write_record(row)?;
            }
            writer.flush()?;
            Ok(rows.len())
        })
    }

    /// Re-runs capture over all downloaded instances without re-executing scripts. Safe to
    /// call repeatedly.
    pub fn capture(&self) -> Result<usize> {
        self.with_storage_lock(|| {
            let mut n = 0;
            for name in self.storage.files()? {
                if !name.ends_with(".grevling/status.txt") {
                    continue;
                }
                let logdir = name.trim_end_matches("/.grevling/status.txt");
                let instance = Instance::reopen(&self.storage, logdir, &self.types)?;
                if !matches!(instance.status(), Ok(Status::Downloaded)) {
                    continue;
                }
                let bookkeeping = self.storage.subspace(logdir)?.subspace(".grevling")?;
                let mut collector = ResultCollector::new();
                self.spec.script.capture(&bookkeeping, &mut collector)?;
                let mut captured_json = serde_json::Map::new();
                for (key, value) in collector.iter() {
                    if let Some(ty) = self.types.get(key) {
                        captured_json.insert(key.to_string(), ty.encode_json(value)?);
                    }
                }
                bookkeeping.write_all("captured.json", &serde_json::to_vec_pretty(&serde_json::Value::Object(captured_json))?)?;
                n += 1;
            }
            Ok(n)
        })
    }
}

/// Convenience constructor for the echo-sweep-style spec used in integration tests: a single
/// listed-parameter space with one constant evaluable and one command.
#[cfg(test)]
fn test_spec(storagedir: PathBuf, sourcedir: PathBuf) -> CaseSpec {
    let mut parameters = ParameterSpace::new();
    parameters.insert("alpha", Parameter::listed(vec![Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap());
    parameters.insert(
        "bravo",
        Parameter::listed(vec![Value::Str("a".into()), Value::Str("b".into()), Value::Str("c".into())]).unwrap(),
    );
    let evaluables = vec![Evaluable {
        name: "charlie".into(),
        value: EvaluableValue::Expr("2*alpha-1".into()),
        type_hint: None,
    }];
    let capture_a = crate::capture::Capture::new(r"a=(?P<a>\S+)", crate::capture::CaptureMode::First, Some(crate::types::Scalar::Integer)).unwrap();
    let capture_b = crate::capture::Capture::new(r"b=(?P<b>\S+)", crate::capture::CaptureMode::First, Some(crate::types::Scalar::String)).unwrap();
    let capture_c = crate::capture::Capture::new(r"c=(?P<c>\S+)", crate::capture::CaptureMode::First, Some(crate::types::Scalar::Float)).unwrap();
    let script = Script::new(vec![Command {
        shell: Some("echo a=${alpha} b=${bravo} c=${charlie}".into()),
        name: Some("echo".into()),
        captures: vec![capture_a, capture_b, capture_c],
        ..Default::default()
    }]);
    CaseSpec { parameters, evaluables, script, storagedir, sourcedir, ..Default::default() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_sweep_runs_and_collects_nine_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = test_spec(tmp.path().join("storage"), tmp.path().join("source"));
        std::fs::create_dir_all(tmp.path().join("source")).unwrap();
        let case = Case::new(spec).unwrap();

        let cancel = CancelFlag::new();
        let report = case.run(2, &cancel).unwrap();
        assert_eq!(report.submitted, 9);
        assert_eq!(report.downloaded, 9);
        assert_eq!(report.failed, 0);

        let dataframe = tmp.path().join("results.csv");
        let n = case.collect(&dataframe).unwrap();
        assert_eq!(n, 9);

        let mut reader = csv::Reader::from_path(&dataframe).unwrap();
        let headers: Vec<String> = reader.headers().unwrap().iter().map(String::from).collect();
        assert!(headers.contains(&"a".to_string()));
        assert!(headers.contains(&"g_success".to_string()));

        let a_idx = headers.iter().position(|h| h == "a").unwrap();
        let alpha_idx = headers.iter().position(|h| h == "alpha").unwrap();
        let charlie_idx = headers.iter().position(|h| h == "charlie").unwrap();
        let c_idx = headers.iter().position(|h| h == "c").unwrap();
        for record in reader.records() {
            let record = record.unwrap();
            assert_eq!(record.get(a_idx), record.get(alpha_idx));
            assert_eq!(record.get(charlie_idx), record.get(c_idx));
        }
    }

    #[test]
    fn collect_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = test_spec(tmp.path().join("storage"), tmp.path().join("source"));
        std::fs::create_dir_all(tmp.path().join("source")).unwrap();
        let case = Case::new(spec).unwrap();
        let cancel = CancelFlag::new();
        case.run(1, &cancel).unwrap();

        let dataframe = tmp.path().join("results.csv");
        case.collect(&dataframe).unwrap();
        let first = std::fs::read(&dataframe).unwrap();
        case.collect(&dataframe).unwrap();
        let second = std::fs::read(&dataframe).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rerunning_skips_downloaded_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let spec = test_spec(tmp.path().join("storage"), tmp.path().join("source"));
        std::fs::create_dir_all(tmp.path().join("source")).unwrap();
        let case = Case::new(spec).unwrap();
        let cancel = CancelFlag::new();
        let first = case.run(1, &cancel).unwrap();
        assert_eq!(first.submitted, 9);
        let second = case.run(1, &cancel).unwrap();
        assert_eq!(second.submitted, 0, "already-downloaded instances must be skipped");
    }
}
