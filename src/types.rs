//! Typed value model and the [`TypeManager`] that maps context/capture names to declared types.
//!
//! Mirrors the dynamically-typed-dict-plus-schema design in the source: storage is a plain
//! `Value` enum, validated against a declared [`Type`] on every read and write.

use std::fmt;

use anyhow::{bail, Context as _};
use indexmap::IndexMap;

const DATETIME_FORMAT: &[time::format_description::FormatItem<'static>] = time::macros::format_description!(
    "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
);

/// A typed runtime value. Lists are homogeneous in their declared element type but that
/// constraint is enforced by [`Type::List`], not by this enum.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    DateTime(time::PrimitiveDateTime),
    List(Vec<Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Truthiness used by `where` predicates: numbers are truthy if non-zero, strings if
    /// non-empty, lists if non-empty, bools as themselves.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Int(v) => *v != 0,
            Value::Float(v) => *v != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::DateTime(_) => true,
            Value::List(l) => !l.is_empty(),
        }
    }

    /// Render as the plain-text form used in templates, `grevling.txt`, and logdir patterns.
    pub fn render(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Float(v) => format!("{v}"),
            Value::Str(s) => s.clone(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::DateTime(dt) => dt.format(DATETIME_FORMAT).expect("valid datetime format"),
            Value::List(items) => {
                items.iter().map(Value::render).collect::<Vec<_>>().join(",")
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// A type tag, as declared via [`TypeManager::declare`] or inferred during context probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scalar {
    Integer,
    Float,
    String,
    Boolean,
    DateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    Scalar(Scalar),
    List(Scalar),
}

impl Type {
    pub fn scalar(s: Scalar) -> Self {
        Type::Scalar(s)
    }

    pub fn list(s: Scalar) -> Self {
        Type::List(s)
    }

    fn eltype(&self) -> Scalar {
        match self {
            Type::Scalar(s) | Type::List(s) => *s,
        }
    }

    fn is_list(&self) -> bool {
        matches!(self, Type::List(_))
    }

    fn coerce_scalar(scalar: Scalar, value: &Value) -> anyhow::Result<Value> {
        Ok(match scalar {
            Scalar::Integer => Value::Int(match value {
                Value::Int(v) => *v,
                Value::Float(v) => *v as i64,
                Value::Str(s) => s.trim().parse().with_context(|| format!("not an integer: {s:?}"))?,
                Value::Bool(b) => *b as i64,
                other => bail!("cannot coerce {other:?} to integer"),
            }),
            Scalar::Float => Value::Float(match value {
                Value::Int(v) => *v as f64,
                Value::Float(v) => *v,
                Value::Str(s) => s.trim().parse().with_context(|| format!("not a float: {s:?}"))?,
                other => bail!("cannot coerce {other:?} to float"),
            }),
            Scalar::String => Value::Str(match value {
                Value::Str(s) => s.clone(),
                other => other.render(),
            }),
            Scalar::Boolean => Value::Bool(match value {
                Value::Bool(b) => *b,
                Value::Str(s) => match s.trim() {
                    "0" => false,
                    "1" => true,
                    other => bail!("not a boolean (expected 0/1): {other:?}"),
                },
                Value::Int(v) => *v != 0,
                other => bail!("cannot coerce {other:?} to boolean"),
            }),
            Scalar::DateTime => Value::DateTime(match value {
                Value::DateTime(dt) => *dt,
                Value::Str(s) => time::PrimitiveDateTime::parse(s.trim(), DATETIME_FORMAT)
                    .with_context(|| format!("not a datetime (expected YYYY-MM-DD HH:MM:SS.ffffff): {s:?}"))?,
                other => bail!("cannot coerce {other:?} to datetime"),
            }),
        })
    }

    /// Coerce an arbitrary value into this type. A scalar value coerced into a `List<T>` type
    /// becomes a singleton list.
    pub fn coerce(&self, value: &Value) -> anyhow::Result<Value> {
        match self {
            Type::Scalar(s) => Self::coerce_scalar(*s, value),
            Type::List(s) => match value {
                Value::List(items) => {
                    items.iter().map(|v| Self::coerce_scalar(*s, v)).collect::<anyhow::Result<_>>().map(Value::List)
                }
                other => Ok(Value::List(vec![Self::coerce_scalar(*s, other)?])),
            },
        }
    }

    /// Coerce `new` in the context of an `existing` prior value for the same name. For list
    /// types this appends rather than replaces (used by repeated `all`-mode captures and by
    /// re-running `capture` against accumulated state).
    pub fn coerce_into(&self, new: &Value, existing: Option<&Value>) -> anyhow::Result<Value> {
        match (self, existing) {
            (Type::List(s), Some(Value::List(existing))) => {
                let mut out = existing.clone();
                match new {
                    Value::List(items) => {
                        for item in items {
                            out.push(Self::coerce_scalar(*s, item)?);
                        }
                    }
                    other => out.push(Self::coerce_scalar(*s, other)?),
                }
                Ok(Value::List(out))
            }
            _ => self.coerce(new),
        }
    }

    pub fn encode_json(&self, value: &Value) -> anyhow::Result<serde_json::Value> {
        let value = self.coerce(value)?;
        Ok(match value {
            Value::Int(v) => serde_json::Value::from(v),
            Value::Float(v) => serde_json::Value::from(v),
            Value::Str(v) => serde_json::Value::from(v),
            Value::Bool(v) => serde_json::Value::from(v),
            Value::DateTime(dt) => serde_json::Value::from(dt.format(DATETIME_FORMAT)?),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(|v| self.element_encode_json(&v)).collect::<anyhow::Result<_>>()?)
            }
        })
    }

    fn element_encode_json(&self, value: &Value) -> anyhow::Result<serde_json::Value> {
        let scalar = self.eltype();
        Type::Scalar(scalar).encode_json(value)
    }

    pub fn decode_json(&self, value: &serde_json::Value) -> anyhow::Result<Value> {
        let raw = Self::json_to_value(value)?;
        self.coerce(&raw)
    }

    fn json_to_value(value: &serde_json::Value) -> anyhow::Result<Value> {
        Ok(match value {
            serde_json::Value::Null => bail!("null is not a representable value"),
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().context("non-finite number")?)
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Self::json_to_value).collect::<anyhow::Result<_>>()?)
            }
            serde_json::Value::Object(_) => bail!("objects are not a representable value"),
        })
    }

    /// The tabular dtype name used in the CSV schema header, e.g. `int`, `list<float>`.
    pub fn tabular_dtype(&self) -> String {
        let name = match self.eltype() {
            Scalar::Integer => "int",
            Scalar::Float => "float",
            Scalar::String => "str",
            Scalar::Boolean => "bool",
            Scalar::DateTime => "datetime",
        };
        if self.is_list() {
            format!("list<{name}>")
        } else {
            name.to_string()
        }
    }
}

/// When a name's type was populated: `Pre` types exist before script execution (parameters,
/// constants, evaluables, reserved `g_index`/`g_logdir`); `Post` types only exist after a
/// command has run (captures, `g_success`, `g_started`, `g_finished`, `g_walltime_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Pre,
    Post,
}

/// Keyed collection of type declarations. Declaration order is preserved (via `IndexMap`) so
/// [`TypeManager::tabular_schema`] produces a stable, predictable column order.
#[derive(Debug, Clone, Default)]
pub struct TypeManager {
    types: IndexMap<String, (Type, Stage)>,
}

impl TypeManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, name: impl Into<String>, ty: Type, stage: Stage) {
        self.types.insert(name.into(), (ty, stage));
    }

    pub fn get(&self, name: &str) -> Option<&Type> {
        self.types.get(name).map(|(ty, _)| ty)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn coerce(&self, name: &str, value: &Value) -> anyhow::Result<Value> {
        let ty = self.get(name).with_context(|| format!("no declared type for {name:?}"))?;
        ty.coerce(value)
    }

    pub fn coerce_into(&self, name: &str, new: &Value, existing: Option<&Value>) -> anyhow::Result<Value> {
        let ty = self.get(name).with_context(|| format!("no declared type for {name:?}"))?;
        ty.coerce_into(new, existing)
    }

    pub fn encode_json(&self, name: &str, value: &Value) -> anyhow::Result<serde_json::Value> {
        let ty = self.get(name).with_context(|| format!("no declared type for {name:?}"))?;
        ty.encode_json(value)
    }

    pub fn decode_json(&self, name: &str, value: &serde_json::Value) -> anyhow::Result<Value> {
        let ty = self.get(name).with_context(|| format!("no declared type for {name:?}"))?;
        ty.decode_json(value)
    }

    /// Ordered `(name, dtype)` pairs for every `Pre` and `Post` declared name, in declaration
    /// order — used as the CSV header when `Case::collect` snapshots the result store.
    pub fn tabular_schema(&self) -> Vec<(String, String)> {
        self.types.iter().map(|(name, (ty, _))| (name.clone(), ty.tabular_dtype())).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_round_trips_through_json() {
        let mut mgr = TypeManager::new();
        mgr.declare("a", Type::scalar(Scalar::Integer), Stage::Pre);
        mgr.declare("b", Type::scalar(Scalar::Float), Stage::Pre);
        mgr.declare("c", Type::list(Scalar::Float), Stage::Post);
        mgr.declare("d", Type::scalar(Scalar::Boolean), Stage::Pre);

        for (name, value) in [
            ("a", Value::Str("42".into())),
            ("b", Value::Str("2.5".into())),
            ("c", Value::List(vec![Value::Float(1.0), Value::Int(2)])),
            ("d", Value::Str("1".into())),
        ] {
            let coerced = mgr.coerce(name, &value).unwrap();
            let json = mgr.encode_json(name, &coerced).unwrap();
            let decoded = mgr.decode_json(name, &json).unwrap();
            assert_eq!(decoded, coerced, "round trip mismatch for {name}");
        }
    }

    #[test]
    fn list_coerce_into_appends() {
        let ty = Type::list(Scalar::Float);
        let existing = Value::List(vec![Value::Float(1.0)]);
        let appended = ty.coerce_into(&Value::Float(2.0), Some(&existing)).unwrap();
        assert_eq!(appended, Value::List(vec![Value::Float(1.0), Value::Float(2.0)]));
    }

    #[test]
    fn scalar_into_list_is_singleton() {
        let ty = Type::list(Scalar::Integer);
        let coerced = ty.coerce(&Value::Int(7)).unwrap();
        assert_eq!(coerced, Value::List(vec![Value::Int(7)]));
    }

    #[test]
    fn boolean_accepts_numeric_strings() {
        let ty = Type::scalar(Scalar::Boolean);
        assert_eq!(ty.coerce(&Value::Str("0".into())).unwrap(), Value::Bool(false));
        assert_eq!(ty.coerce(&Value::Str("1".into())).unwrap(), Value::Bool(true));
        assert!(ty.coerce(&Value::Str("2".into())).is_err());
    }

    #[test]
    fn tabular_schema_preserves_declaration_order() {
        let mut mgr = TypeManager::new();
        mgr.declare("g_index", Type::scalar(Scalar::Integer), Stage::Pre);
        mgr.declare("alpha", Type::scalar(Scalar::Float), Stage::Pre);
        mgr.declare("g_success", Type::scalar(Scalar::Boolean), Stage::Post);
        let schema = mgr.tabular_schema();
        assert_eq!(schema, vec![
            ("g_index".into(), "int".into()),
            ("alpha".into(), "float".into()),
            ("g_success".into(), "bool".into()),
        ]);
    }
}
