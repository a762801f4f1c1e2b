//! Named, finite, ordered parameter sequences and their Cartesian product (§3 Parameter,
//! ParameterSpace; §4.1). Grounded on `examples/original_source/grevling/parameters.py`'s
//! `UniformParameter`/`GradedParameter` generation formulas.

use anyhow::{bail, Result};
use indexmap::IndexMap;

use crate::types::Value;

/// A named finite ordered sequence of scalar values.
#[derive(Debug, Clone, PartialEq)]
pub enum Parameter {
    /// Explicit values, in the given order.
    Listed(Vec<Value>),
    /// `num` equally spaced floats in `[lo, hi]`.
    Uniform { lo: f64, hi: f64, num: usize },
    /// `num` geometrically graded floats in `[lo, hi]` with common ratio `grading`.
    Graded { lo: f64, hi: f64, num: usize, grading: f64 },
}

impl Parameter {
    pub fn listed(values: Vec<Value>) -> Result<Self> {
        if values.is_empty() {
            bail!("listed parameter must have at least one value");
        }
        Ok(Parameter::Listed(values))
    }

    pub fn uniform(lo: f64, hi: f64, num: usize) -> Result<Self> {
        if num == 0 {
            bail!("uniform parameter must have at least one value");
        }
        Ok(Parameter::Uniform { lo, hi, num })
    }

    pub fn graded(lo: f64, hi: f64, num: usize, grading: f64) -> Result<Self> {
        if num == 0 {
            bail!("graded parameter must have at least one value");
        }
        Ok(Parameter::Graded { lo, hi, num, grading })
    }

    pub fn len(&self) -> usize {
        match self {
            Parameter::Listed(values) => values.len(),
            Parameter::Uniform { num, .. } => *num,
            Parameter::Graded { num, .. } => *num,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materializes the parameter's values in order.
    pub fn values(&self) -> Vec<Value> {
        match self {
            Parameter::Listed(values) => values.clone(),
            Parameter::Uniform { lo, hi, num } => {
                if *num == 1 {
                    return vec![Value::Float(*lo)];
                }
                let step = (hi - lo) / (*num as f64 - 1.0);
                (0..*num).map(|i| Value::Float(lo + step * i as f64)).collect()
            }
            Parameter::Graded { lo, hi, num, grading } => {
                if *num == 1 {
                    return vec![Value::Float(*lo)];
                }
                if (*grading - 1.0).abs() < f64::EPSILON {
                    return Parameter::Uniform { lo: *lo, hi: *hi, num: *num }.values();
                }
                let n = *num as i32;
                let step0 = (hi - lo) * (1.0 - grading) / (1.0 - grading.powi(n - 1));
                let mut out = Vec::with_capacity(*num);
                let mut acc = *lo;
                let mut step = step0;
                out.push(Value::Float(acc));
                for _ in 1..*num {
                    acc += step;
                    out.push(Value::Float(acc));
                    step *= grading;
                }
                out
            }
        }
    }
}

/// Ordered mapping from parameter name to [`Parameter`].
#[derive(Debug, Clone, Default)]
pub struct ParameterSpace {
    params: IndexMap<String, Parameter>,
}

impl ParameterSpace {
    pub fn new() -> Self {
        Self { params: IndexMap::new() }
    }

    pub fn insert(&mut self, name: impl Into<String>, parameter: Parameter) {
        self.params.insert(name.into(), parameter);
    }

    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Total number of tuples over every declared parameter.
    pub fn size_fullspace(&self) -> usize {
        self.params.values().map(Parameter::len).product()
    }

    /// The Cartesian product restricted to `names`, in insertion order over `names` and
    /// index-ascending order within each parameter. Each tuple is a `Vec<(String, Value)>`
    /// parallel to `names`.
    pub fn subspace(&self, names: &[String]) -> Result<Vec<Vec<(String, Value)>>> {
        let mut axes = Vec::with_capacity(names.len());
        for name in names {
            let param = self.params.get(name).ok_or_else(|| anyhow::anyhow!("unknown parameter: {name}"))?;
            axes.push((name.clone(), param.values()));
        }
        Ok(cartesian_product(&axes))
    }

    /// The full Cartesian product over every declared parameter, insertion order,
    /// last-axis-fastest.
    pub fn fullspace(&self) -> Vec<Vec<(String, Value)>> {
        let axes: Vec<(String, Vec<Value>)> = self.params.iter().map(|(k, v)| (k.clone(), v.values())).collect();
        cartesian_product(&axes)
    }
}

/// Builds the Cartesian product over `axes` with the last axis varying fastest, matching
/// the original source's nested-loop `dict_product` order.
fn cartesian_product(axes: &[(String, Vec<Value>)]) -> Vec<Vec<(String, Value)>> {
    if axes.is_empty() {
        return vec![vec![]];
    }
    let mut tuples: Vec<Vec<(String, Value)>> = vec![vec![]];
    for (name, values) in axes {
        let mut next = Vec::with_capacity(tuples.len() * values.len());
        for existing in &tuples {
            for value in values {
                let mut entry = existing.clone();
                entry.push((name.clone(), value.clone()));
                next.push(entry);
            }
        }
        tuples = next;
    }
    tuples
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_f64(v: &Value) -> f64 {
        v.as_f64().unwrap()
    }

    #[test]
    fn uniform_endpoints_are_exact() {
        let p = Parameter::uniform(0.0, 10.0, 5).unwrap();
        let values = p.values();
        assert_eq!(values.len(), 5);
        assert_eq!(as_f64(&values[0]), 0.0);
        assert_eq!(as_f64(&values[4]), 10.0);
        assert_eq!(as_f64(&values[2]), 5.0);
    }

    #[test]
    fn graded_endpoints_are_exact() {
        let p = Parameter::graded(1.0, 100.0, 4, 2.0).unwrap();
        let values = p.values();
        assert_eq!(values.len(), 4);
        assert!((as_f64(&values[0]) - 1.0).abs() < 1e-9);
        assert!((as_f64(&values[3]) - 100.0).abs() < 1e-9);
        // strictly monotonic since grading != 1
        let fs: Vec<f64> = values.iter().map(as_f64).collect();
        assert!(fs.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn listed_rejects_empty() {
        assert!(Parameter::listed(vec![]).is_err());
    }

    #[test]
    fn subspace_is_insertion_major_last_axis_fastest() {
        let mut space = ParameterSpace::new();
        space.insert("a", Parameter::listed(vec![Value::Int(1), Value::Int(2)]).unwrap());
        space.insert("b", Parameter::listed(vec![Value::Int(10), Value::Int(20)]).unwrap());
        let names = vec!["a".to_string(), "b".to_string()];
        let tuples = space.subspace(&names).unwrap();
        let rendered: Vec<(i64, i64)> = tuples
            .iter()
            .map(|t| {
                let a = t.iter().find(|(k, _)| k == "a").unwrap().1.as_f64().unwrap() as i64;
                let b = t.iter().find(|(k, _)| k == "b").unwrap().1.as_f64().unwrap() as i64;
                (a, b)
            })
            .collect();
        assert_eq!(rendered, vec![(1, 10), (1, 20), (2, 10), (2, 20)]);
    }

    #[test]
    fn empty_space_yields_one_empty_tuple() {
        let space = ParameterSpace::new();
        assert_eq!(space.fullspace(), vec![vec![]]);
    }
}
