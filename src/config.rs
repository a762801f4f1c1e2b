//! On-disk `grevling.toml` schema and its resolution into a runtime [`CaseSpec`] (§6 External
//! Interfaces, CaseSpec input contract). Grounded on `bench-harness::config`'s
//! `toml_from_path`/`KeyValue` pattern; schema field names follow
//! `examples/original_source/grevling/schema/raw.py` (`CaseSchema`, `CommandSchema`,
//! `FileMapSchema`, `UniformParameterSchema`, `GradedParameterSchema`).

use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use indexmap::IndexMap;
use serde::Deserialize;

use crate::capture::{Capture, CaptureMode};
use crate::case::CaseSpec;
use crate::command::Command;
use crate::context::{Evaluable, EvaluableValue};
use crate::filemap::{FileMap, SingleFileMap};
use crate::parameters::{Parameter, ParameterSpace};
use crate::types::{Scalar, Value};

pub fn toml_from_path<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read: {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("failed to parse: {}", path.display()))
}

/// A `KEY=VALUE` pair, as accepted for `env` entries in TOML (teacher precedent:
/// `bench-harness::config::KeyValue`).
#[derive(Debug, Clone)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn from_str(input: &str) -> Option<Self> {
        let (key, value) = input.split_once('=')?;
        Some(Self { key: key.trim().to_owned(), value: value.trim().to_owned() })
    }
}

impl<'de> Deserialize<'de> for KeyValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text: String = Deserialize::deserialize(deserializer)?;
        Self::from_str(&text).ok_or_else(|| serde::de::Error::custom("expected KEY=VALUE"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawParameter {
    Listed(Vec<RawScalar>),
    Generated { #[serde(rename = "type")] kind: String, lo: f64, hi: f64, num: usize, #[serde(default = "default_grading")] grading: f64 },
}

fn default_grading() -> f64 {
    1.0
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl From<&RawScalar> for Value {
    fn from(raw: &RawScalar) -> Self {
        match raw {
            RawScalar::Int(v) => Value::Int(*v),
            RawScalar::Float(v) => Value::Float(*v),
            RawScalar::Str(v) => Value::Str(v.clone()),
            RawScalar::Bool(v) => Value::Bool(*v),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawEvaluable {
    Expr(String),
    Typed { #[serde(rename = "expr")] expr: String, #[serde(rename = "type")] ty: Option<String> },
}

#[derive(Debug, Deserialize)]
struct RawFileMapEntry {
    source: String,
    target: String,
    #[serde(default)]
    template: bool,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCapture {
    regex: String,
    #[serde(default = "default_capture_mode")]
    mode: String,
    #[serde(rename = "type")]
    type_hint: Option<String>,
}

fn default_capture_mode() -> String {
    "first".to_string()
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    name: Option<String>,
    argv: Option<Vec<String>>,
    shell: Option<String>,
    #[serde(default)]
    env: Vec<KeyValue>,
    workdir: Option<String>,
    container: Option<String>,
    #[serde(default)]
    container_args: Vec<String>,
    #[serde(default)]
    retry_on_fail: bool,
    #[serde(default)]
    allow_failure: bool,
    #[serde(default)]
    captures: Vec<RawCapture>,
}

#[derive(Debug, Deserialize)]
pub struct RawCaseSchema {
    pub storagedir: PathBuf,
    #[serde(default = "default_sourcedir")]
    pub sourcedir: PathBuf,
    #[serde(default = "default_logdir")]
    pub logdir: String,
    #[serde(default)]
    pub ignore_missing: bool,
    #[serde(default)]
    parameters: IndexMap<String, RawParameter>,
    #[serde(default)]
    constants: IndexMap<String, RawScalar>,
    #[serde(default)]
    evaluables: IndexMap<String, RawEvaluable>,
    #[serde(default)]
    r#where: Vec<String>,
    #[serde(default)]
    premap: Vec<RawFileMapEntry>,
    #[serde(default)]
    postmap: Vec<RawFileMapEntry>,
    #[serde(default)]
    script: Vec<RawCommand>,
}

fn default_sourcedir() -> PathBuf {
    PathBuf::from(".")
}

fn default_logdir() -> String {
    "${g_index}".to_string()
}

fn parse_scalar(name: &str) -> Result<Scalar> {
    Ok(match name {
        "int" | "integer" => Scalar::Integer,
        "float" => Scalar::Float,
        "str" | "string" => Scalar::String,
        "bool" | "boolean" => Scalar::Boolean,
        "datetime" => Scalar::DateTime,
        other => anyhow::bail!("unknown type: {other}"),
    })
}

fn parse_mode(name: &str) -> Result<CaptureMode> {
    Ok(match name {
        "first" => CaptureMode::First,
        "last" => CaptureMode::Last,
        "all" => CaptureMode::All,
        other => anyhow::bail!("unknown capture mode: {other}"),
    })
}

fn build_filemap(entries: &[RawFileMapEntry]) -> Result<FileMap> {
    let mut map = FileMap::new();
    for entry in entries {
        let mode = entry.mode.as_deref().unwrap_or("simple");
        let single = match (entry.template, mode) {
            (true, _) => SingleFileMap::templated(entry.source.clone(), entry.target.clone()),
            (false, "glob") => SingleFileMap::glob(entry.source.clone(), entry.target.clone()),
            (false, "simple") => SingleFileMap::simple(entry.source.clone(), entry.target.clone()),
            (false, other) => anyhow::bail!("unknown file map mode: {other}"),
        };
        map.push(single);
    }
    Ok(map)
}

fn build_command(raw: &RawCommand) -> Result<Command> {
    let mut captures = vec![];
    for c in &raw.captures {
        let hint = c.type_hint.as_deref().map(parse_scalar).transpose()?;
        let mode = parse_mode(&c.mode)?;
        captures.push(Capture::new(&c.regex, mode, hint)?);
    }
    Ok(Command {
        name: raw.name.clone(),
        argv: raw.argv.clone().unwrap_or_default(),
        shell: raw.shell.clone(),
        env: raw.env.iter().map(|kv| (kv.key.clone(), kv.value.clone())).collect(),
        workdir: raw.workdir.clone(),
        container: raw.container.clone(),
        container_args: raw.container_args.clone(),
        retry_on_fail: raw.retry_on_fail,
        allow_failure: raw.allow_failure,
        captures,
    })
}

impl RawCaseSchema {
    pub fn into_spec(self) -> Result<CaseSpec> {
        let mut parameters = ParameterSpace::new();
        for (name, raw) in &self.parameters {
            let parameter = match raw {
                RawParameter::Listed(values) => Parameter::listed(values.iter().map(Value::from).collect())?,
                RawParameter::Generated { kind, lo, hi, num, grading } => match kind.as_str() {
                    "uniform" => Parameter::uniform(*lo, *hi, *num)?,
                    "graded" => Parameter::graded(*lo, *hi, *num, *grading)?,
                    other => anyhow::bail!("unknown parameter kind: {other}"),
                },
            };
            parameters.insert(name.clone(), parameter);
        }

        let constants = self.constants.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect();

        let mut evaluables = vec![];
        for (name, raw) in &self.evaluables {
            let (expr, ty) = match raw {
                RawEvaluable::Expr(e) => (e.clone(), None),
                RawEvaluable::Typed { expr, ty } => (expr.clone(), ty.clone()),
            };
            let type_hint = ty.as_deref().map(parse_scalar).transpose()?.map(crate::types::Type::scalar);
            evaluables.push(Evaluable { name: name.clone(), value: EvaluableValue::Expr(expr), type_hint });
        }

        let premap = build_filemap(&self.premap)?;
        let postmap = build_filemap(&self.postmap)?;
        let commands = self.script.iter().map(build_command).collect::<Result<Vec<_>>>()?;

        Ok(CaseSpec {
            parameters,
            constants,
            evaluables,
            wheres: self.r#where,
            premap,
            postmap,
            script: crate::script::Script::new(commands),
            storagedir: self.storagedir,
            sourcedir: self.sourcedir,
            logdir_template: self.logdir,
            ignore_missing: self.ignore_missing,
        })
    }
}

pub fn load_case_spec(path: &Path) -> Result<CaseSpec> {
    let raw: RawCaseSchema = toml_from_path(path)?;
    raw.into_spec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_echo_sweep_toml() {
        let toml_text = r#"
            storagedir = "out"

            [parameters]
            alpha = [1, 2, 3]
            bravo = ["a", "b", "c"]

            [evaluables]
            charlie = "2*alpha-1"

            [[script]]
            name = "echo"
            shell = "echo a=${alpha} b=${bravo} c=${charlie}"

            [[script.captures]]
            regex = "a=(?P<a>\\S+)"
            mode = "first"
            type = "int"
        "#;
        let raw: RawCaseSchema = toml::from_str(toml_text).unwrap();
        let spec = raw.into_spec().unwrap();
        assert_eq!(spec.parameters.names().count(), 2);
        assert_eq!(spec.script.commands.len(), 1);
        assert_eq!(spec.logdir_template, "${g_index}");
    }
}
