//! `${expr}` template substitution over a [`Context`] (§4.5). A thin wrapper around
//! `src/expr.rs`: finds each `${...}` span, evaluates its contents against the context, and
//! substitutes the rendered text. Grounded on `examples/original_source/grevling/util.py`'s
//! `format_arg` / the original's second expression dialect, unified here behind one evaluator
//! per the spec's design note (§9) that the two dialects should collapse into one.

use anyhow::{anyhow, Context as _, Result};

use crate::context::Context;
use crate::expr;
use crate::types::Value;

/// Renders every `${...}` occurrence in `source` against `ctx`.
pub fn render(source: &str, ctx: &Context) -> Result<String> {
    render_impl(source, ctx, false)
}

/// Renders every `${...}` occurrence in `source` against `ctx`, shell-quoting each evaluated
/// substitution individually so literal template text (spaces, operators) is left alone while a
/// multi-word or metacharacter-bearing substituted value stays a single shell argument.
fn render_impl(source: &str, ctx: &Context, quote_substitutions: bool) -> Result<String> {
    let mut out = String::with_capacity(source.len());
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == '$' && chars.get(i + 1) == Some(&'{') {
            let start = i + 2;
            let mut depth = 1;
            let mut j = start;
            while j < chars.len() && depth > 0 {
                match chars[j] {
                    '{' => depth += 1,
                    '}' => depth -= 1,
                    _ => {}
                }
                if depth == 0 {
                    break;
                }
                j += 1;
            }
            if depth != 0 {
                return Err(anyhow!("unterminated ${{...}} in template: {source:?}"));
            }
            let expr_src: String = chars[start..j].iter().collect();
            let value = expr::eval(&expr_src, ctx)
                .map_err(|e| anyhow!(e.to_string()))
                .with_context(|| format!("evaluating template expression `{expr_src}`"))?;
            let rendered = value.render();
            if quote_substitutions {
                out.push_str(&shell_quote(&rendered));
            } else {
                out.push_str(&rendered);
            }
            i = j + 1;
        } else {
            out.push(chars[i]);
            i += 1;
        }
    }
    Ok(out)
}

/// Renders every element of `values` as a template.
pub fn render_list(values: &[String], ctx: &Context) -> Result<Vec<String>> {
    values.iter().map(|v| render(v, ctx)).collect()
}

/// Quotes `s` for safe inclusion as a single argument to a POSIX shell, applied automatically
/// when a rendered value is interpolated into a `shellString` command.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.' | b'/' | b':' | b'=')) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Renders `source` for use as a `shellString` command template, shell-quoting each `${...}`
/// substitution individually so e.g. `bravo="hello world"` in `"b=${bravo}"` renders to
/// `b='hello world'` rather than splicing an unquoted multi-word value into the shell string.
pub fn render_shell(source: &str, ctx: &Context) -> Result<String> {
    render_impl(source, ctx, true)
}

pub fn render_value(source: &str, ctx: &Context) -> Result<Value> {
    expr::eval(source, ctx).map_err(|e| anyhow!(e.to_string())).with_context(|| format!("evaluating `{source}`"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Value;

    fn ctx_with(pairs: &[(&str, Value)]) -> Context {
        let mut ctx = Context::new();
        for (k, v) in pairs {
            ctx.insert(*k, v.clone());
        }
        ctx
    }

    #[test]
    fn templated_file_substitution() {
        let ctx = ctx_with(&[("alpha", Value::Int(2)), ("bravo", Value::Str("b".into())), ("charlie", Value::Int(3))]);
        let rendered = render("a=${alpha} b=${bravo} c=${charlie}", &ctx).unwrap();
        assert_eq!(rendered, "a=2 b=b c=3");
    }

    #[test]
    fn rnd_and_sci_formatting_helpers() {
        let ctx = Context::new();
        assert_eq!(render("${rnd(3.14159, 2)}", &ctx).unwrap(), "3.14");
        assert_eq!(render("${sci(12345.0, 2)}", &ctx).unwrap(), "1.23e4");
    }

    #[test]
    fn shell_quoting_handles_special_characters() {
        assert_eq!(shell_quote("plain"), "plain");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn render_shell_quotes_substitutions_not_literal_text() {
        let ctx = ctx_with(&[("alpha", Value::Int(2)), ("bravo", Value::Str("hello world".into()))]);
        let rendered = render_shell("echo a=${alpha} b=${bravo}", &ctx).unwrap();
        assert_eq!(rendered, "echo a=2 b='hello world'");
    }

    #[test]
    fn unterminated_expression_is_an_error() {
        let ctx = Context::new();
        assert!(render("a=${alpha", &ctx).is_err());
    }
}
