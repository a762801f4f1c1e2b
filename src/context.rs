//! Context construction: merges a parameter tuple with constants and evaluables, then filters
//! by `where` predicates (§3 Context; §4.1 ParameterSpace & ContextProvider). Grounded on
//! `examples/original_source/grevling/context.py` (`ContextProvider`, `_guess_eltype`) and
//! `grevling/parameters.py`'s tuple-to-context merge order.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Context as _, Result};
use indexmap::IndexMap;

use crate::expr::{self, EvalError, NameResolver};
use crate::parameters::ParameterSpace;
use crate::types::{Scalar, Stage, Type, TypeManager, Value};

/// A fully realized context for a single instance: an ordered name→value mapping.
#[derive(Debug, Clone, Default)]
pub struct Context {
    values: IndexMap<String, Value>,
}

impl Context {
    pub fn new() -> Self {
        Self { values: IndexMap::new() }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn index(&self) -> Option<i64> {
        match self.values.get("g_index") {
            Some(Value::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn logdir(&self) -> Option<&str> {
        match self.values.get("g_logdir") {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn to_map(&self) -> HashMap<String, Value> {
        self.values.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
    }
}

impl NameResolver for Context {
    fn resolve(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }
}

/// An evaluable's right-hand side: either a literal value or a source expression in the
/// shared mini-language (§4.5).
#[derive(Debug, Clone)]
pub enum EvaluableValue {
    Literal(Value),
    Expr(String),
}

#[derive(Debug, Clone)]
pub struct Evaluable {
    pub name: String,
    pub value: EvaluableValue,
    pub type_hint: Option<Type>,
}

/// Builds and enumerates contexts for a case: a parameter space, constants, evaluables
/// (evaluated in declaration order), and `where` filter predicates.
#[derive(Debug, Clone, Default)]
pub struct ContextProvider {
    pub space: ParameterSpace,
    constants: IndexMap<String, Value>,
    evaluables: Vec<Evaluable>,
    wheres: Vec<String>,
    types: TypeManager,
    inferred: bool,
}

impl ContextProvider {
    pub fn new(space: ParameterSpace) -> Self {
        Self { space, ..Default::default() }
    }

    pub fn add_constant(&mut self, name: impl Into<String>, value: Value) {
        self.constants.insert(name.into(), value);
    }

    pub fn add_evaluable(&mut self, evaluable: Evaluable) {
        if let Some(ty) = evaluable.type_hint {
            self.types.declare(evaluable.name.clone(), ty, Stage::Pre);
        }
        self.evaluables.push(evaluable);
    }

    pub fn add_where(&mut self, predicate: impl Into<String>) {
        self.wheres.push(predicate.into());
    }

    pub fn types(&self) -> &TypeManager {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeManager {
        &mut self.types
    }

    /// Builds a context from one parameter tuple: merges constants (non-overriding), then
    /// evaluates evaluables in declaration order. With `allowed_missing`, an evaluable whose
    /// expression references an undefined name is silently skipped instead of failing the
    /// whole build — used by [`Self::infer_types`]'s cold probe pass.
    pub fn evaluate(&self, tuple: &[(String, Value)], allowed_missing: bool) -> Result<Context> {
        let mut ctx = Context::new();
        for (name, value) in tuple {
            ctx.insert(name.clone(), value.clone());
        }
        for (name, value) in &self.constants {
            if !ctx.contains(name) {
                ctx.insert(name.clone(), value.clone());
            }
        }
        for evaluable in &self.evaluables {
            let raw = match &evaluable.value {
                EvaluableValue::Literal(v) => v.clone(),
                EvaluableValue::Expr(source) => match expr::eval(source, &ctx) {
                    Ok(v) => v,
                    Err(EvalError::UndefinedName(_)) if allowed_missing => continue,
                    Err(e) => {
                        return Err(anyhow!(e.to_string()))
                            .with_context(|| format!("evaluating `{}` = `{}`", evaluable.name, source))
                    }
                },
            };
            let coerced = if self.types.contains(&evaluable.name) {
                self.types.coerce(&evaluable.name, &raw)?
            } else {
                raw
            };
            ctx.insert(evaluable.name.clone(), coerced);
        }
        Ok(ctx)
    }

    fn passes_where(&self, ctx: &Context) -> Result<bool> {
        for predicate in &self.wheres {
            let value = expr::eval(predicate, ctx).with_context(|| format!("evaluating where-predicate `{predicate}`"))?;
            if !value.truthy() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Cold pre-pass: probes every tuple once to pick the narrowest fit
    /// (`Integer` < `Float` < `String`) for each evaluable without a declared type. Must run
    /// before [`Self::enumerate`] if any evaluable lacks an explicit type hint.
    pub fn infer_types(&mut self) -> Result<()> {
        if self.inferred {
            return Ok(());
        }
        let names_needing_inference: Vec<String> =
            self.evaluables.iter().filter(|e| !self.types.contains(&e.name)).map(|e| e.name.clone()).collect();

        if !names_needing_inference.is_empty() {
            let mut samples: HashMap<String, Vec<Value>> = names_needing_inference.iter().map(|n| (n.clone(), vec![])).collect();
            for tuple in self.space.fullspace() {
                let ctx = self.evaluate(&tuple, true)?;
                for name in &names_needing_inference {
                    if let Some(v) = ctx.get(name) {
                        samples.get_mut(name).unwrap().push(v.clone());
                    }
                }
            }
            for name in &names_needing_inference {
                let fit = guess_scalar_type(&samples[name]);
                self.types.declare(name.clone(), Type::scalar(fit), Stage::Pre);
            }
        }
        self.inferred = true;
        Ok(())
    }

    /// The Cartesian product of the full parameter space, evaluated and filtered, with
    /// `g_index` assigned as a contiguous 0-based counter over post-filter instances.
    pub fn enumerate(&self) -> Result<Vec<Context>> {
        if !self.inferred && self.evaluables.iter().any(|e| e.type_hint.is_none()) {
            bail!("infer_types() must run before enumerate() when evaluables lack declared types");
        }
        let mut out = vec![];
        let mut index = 0i64;
        for tuple in self.space.fullspace() {
            let mut ctx = self.evaluate(&tuple, false)?;
            if !self.passes_where(&ctx)? {
                continue;
            }
            ctx.insert("g_index", Value::Int(index));
            index += 1;
            out.push(ctx);
        }
        Ok(out)
    }
}

fn guess_scalar_type(samples: &[Value]) -> Scalar {
    if samples.is_empty() {
        return Scalar::String;
    }
    if samples.iter().all(|v| matches!(v, Value::Int(_))) {
        return Scalar::Integer;
    }
    if samples.iter().all(|v| matches!(v, Value::Int(_) | Value::Float(_))) {
        return Scalar::Float;
    }
    if samples.iter().all(|v| matches!(v, Value::Bool(_))) {
        return Scalar::Boolean;
    }
    Scalar::String
}
