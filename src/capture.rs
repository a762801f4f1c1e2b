//! Regex-based typed extraction from command stdout (§3 Capture; §4.6). Grounded on
//! `examples/original_source/grevling/capture.py`'s numeric-prefix regex construction
//! (`Capture.find_all`, `_NUM_PATTERN`-style prefix builder).

use std::collections::HashMap;

use anyhow::{bail, Context as _, Result};
use regex::Regex;

use crate::types::{Scalar, Type};

/// Matches an integer or floating-point literal, including scientific notation.
static NUM_PATTERN: &str = r"[-+]?(?:\d+\.\d*|\.\d+|\d+)(?:[eE][-+]?\d+)?";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    First,
    Last,
    All,
}

/// A single `(regex, mode, typeHint)` specification. The regex must contain at least one
/// named group.
#[derive(Debug, Clone)]
pub struct Capture {
    pub regex: Regex,
    pub mode: CaptureMode,
    pub type_hint: Option<Scalar>,
    pub group_names: Vec<String>,
}

impl Capture {
    pub fn new(pattern: &str, mode: CaptureMode, type_hint: Option<Scalar>) -> Result<Self> {
        let regex = Regex::new(pattern).with_context(|| format!("invalid capture regex: {pattern}"))?;
        let group_names: Vec<String> = regex.capture_names().flatten().map(str::to_string).collect();
        if group_names.is_empty() {
            bail!("capture regex must have at least one named group: {pattern}");
        }
        Ok(Self { regex, mode, type_hint, group_names })
    }

    /// Builds a capture matching a `prefix` followed by `skip_words` whitespace-delimited
    /// tokens and then a captured numeric value named `name`. When `flexible_prefix` is set,
    /// internal whitespace in `prefix` matches one-or-more whitespace instead of literally.
    pub fn numeric_prefix(prefix: &str, name: &str, skip_words: usize, flexible_prefix: bool, mode: CaptureMode, type_hint: Option<Scalar>) -> Result<Self> {
        let escaped_prefix = if flexible_prefix {
            prefix.split_whitespace().map(regex::escape).collect::<Vec<_>>().join(r"\s+")
        } else {
            regex::escape(prefix)
        };
        let pattern = format!(r"{escaped_prefix}\s*[:=]?\s*(?:\S+\s+){{{skip_words}}}(?P<{name}>{NUM_PATTERN})");
        Self::new(&pattern, mode, type_hint)
    }

    /// The per-group type used to declare names in the `TypeManager`: the hint if present,
    /// otherwise `String`; `all` mode upgrades every group to a list of that scalar.
    pub fn declared_type(&self, hint_or_default: Scalar) -> Type {
        if self.mode == CaptureMode::All {
            Type::list(hint_or_default)
        } else {
            Type::scalar(hint_or_default)
        }
    }

    fn hint_or_string(&self) -> Scalar {
        self.type_hint.unwrap_or(Scalar::String)
    }

    /// Applies this capture to `stdout`, feeding matched groups into `collector`.
    pub fn apply(&self, stdout: &str, collector: &mut ResultCollector) -> Result<()> {
        match self.mode {
            CaptureMode::First => {
                if let Some(caps) = self.regex.captures(stdout) {
                    self.collect_one(&caps, collector)?;
                }
            }
            CaptureMode::Last => {
                if let Some(caps) = self.regex.captures_iter(stdout).last() {
                    self.collect_one(&caps, collector)?;
                }
            }
            CaptureMode::All => {
                for caps in self.regex.captures_iter(stdout) {
                    self.collect_one(&caps, collector)?;
                }
            }
        }
        Ok(())
    }

    fn collect_one(&self, caps: &regex::Captures, collector: &mut ResultCollector) -> Result<()> {
        let scalar = self.hint_or_string();
        for name in &self.group_names {
            if let Some(m) = caps.name(name) {
                let raw = crate::types::Value::Str(m.as_str().to_string());
                let coerced = Type::scalar(scalar).coerce(&raw).with_context(|| format!("coercing capture group {name}"))?;
                collector.push(name, coerced, self.mode == CaptureMode::All, scalar);
            }
        }
        Ok(())
    }
}

/// Accumulates captured values across one or more commands, honoring `all`-mode's
/// list-append semantics (§4.6).
#[derive(Debug, Clone, Default)]
pub struct ResultCollector {
    values: HashMap<String, crate::types::Value>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: &str, value: crate::types::Value, is_list: bool, scalar: Scalar) {
        if is_list {
            let ty = Type::list(scalar);
            let existing = self.values.get(name).cloned();
            let updated = ty.coerce_into(&value, existing.as_ref()).expect("scalar already coerced to declared type");
            self.values.insert(name.to_string(), updated);
        } else {
            self.values.insert(name.to_string(), value);
        }
    }

    pub fn get(&self, name: &str) -> Option<&crate::types::Value> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &crate::types::Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn into_map(self) -> HashMap<String, crate::types::Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    #[test]
    fn capture_modes_first_last_all() {
        let stdout = "alpha=1.234\nalpha=2.468\nalpha=3.702\nalpha=4.936\n";

        let first = Capture::new(r"alpha=(?P<alpha>[\d.]+)", CaptureMode::First, Some(Scalar::Float)).unwrap();
        let mut collector = ResultCollector::new();
        first.apply(stdout, &mut collector).unwrap();
        assert_eq!(collector.get("alpha"), Some(&Value::Float(1.234)));

        let last = Capture::new(r"alpha=(?P<alpha>[\d.]+)", CaptureMode::Last, Some(Scalar::Float)).unwrap();
        let mut collector = ResultCollector::new();
        last.apply(stdout, &mut collector).unwrap();
        assert_eq!(collector.get("alpha"), Some(&Value::Float(4.936)));

        let all = Capture::new(r"alpha=(?P<alpha>[\d.]+)", CaptureMode::All, Some(Scalar::Float)).unwrap();
        let mut collector = ResultCollector::new();
        all.apply(stdout, &mut collector).unwrap();
        assert_eq!(
            collector.get("alpha"),
            Some(&Value::List(vec![Value::Float(1.234), Value::Float(2.468), Value::Float(3.702), Value::Float(4.936)]))
        );
    }

    #[test]
    fn no_match_yields_nothing() {
        let capture = Capture::new(r"alpha=(?P<alpha>[\d.]+)", CaptureMode::First, Some(Scalar::Float)).unwrap();
        let mut collector = ResultCollector::new();
        capture.apply("nothing here", &mut collector).unwrap();
        assert_eq!(collector.get("alpha"), None);
    }

    #[test]
    fn rejects_regex_without_named_group() {
        assert!(Capture::new(r"\d+", CaptureMode::First, None).is_err());
    }

    #[test]
    fn numeric_prefix_with_skip_words() {
        let capture = Capture::numeric_prefix("elapsed time", "seconds", 1, false, CaptureMode::First, Some(Scalar::Float)).unwrap();
        let mut collector = ResultCollector::new();
        capture.apply("elapsed time: about 3.5 units", &mut collector).unwrap();
        assert_eq!(collector.get("seconds"), Some(&Value::Float(3.5)));
    }

    #[test]
    fn flexible_prefix_tolerates_extra_whitespace() {
        let capture = Capture::numeric_prefix("total count", "n", 0, true, CaptureMode::First, Some(Scalar::Integer)).unwrap();
        let mut collector = ResultCollector::new();
        capture.apply("total    count=42", &mut collector).unwrap();
        assert_eq!(collector.get("n"), Some(&Value::Int(42)));
    }
}
