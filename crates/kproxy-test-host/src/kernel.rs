//! Scripted sub-kernels.
//!
//! Each kernel understands just enough of its language to be useful in
//! tests: string/integer assignment, identifiers, literals, and printing.
//!
//! | syntax | assign             | print                    |
//! |--------|--------------------|--------------------------|
//! | C#     | `var x = "text";`  | `Console.WriteLine(x);`  |
//! | F#     | `let x = "text"`   | `printfn "%s" x`         |
//!
//! A bare expression as the last statement becomes the return value.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use kproxy_core::{FormattedValue, KernelEvent, KernelInfo};

use crate::host::EventSink;

/// Why a submission did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// Reported to the caller as `CommandFailed`.
    #[error("{0}")]
    Failed(String),
    /// Our stdout is gone; the host should stop.
    #[error("failed to write event: {0}")]
    Write(#[from] std::io::Error),
}

/// A sub-kernel living inside the test host.
#[async_trait]
pub trait Kernel: Send + Sync {
    fn name(&self) -> &str;

    fn info(&self) -> KernelInfo;

    /// Run `code`, emitting produced values through `sink`.
    async fn submit_code(&self, code: &str, sink: &EventSink<'_>) -> Result<(), SubmitError>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn Kernel) {}
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    CSharp,
    FSharp,
}

impl Syntax {
    fn assign_keyword(self) -> &'static str {
        match self {
            Syntax::CSharp => "var ",
            Syntax::FSharp => "let ",
        }
    }

    /// C# also splits statements on `;`.
    fn splits_on_semicolon(self) -> bool {
        matches!(self, Syntax::CSharp)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Statement {
    Assign { name: String, expr: String },
    Print(String),
    Expr(String),
}

/// What running a piece of code produced.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub stdout: Vec<String>,
    pub value: Option<String>,
}

pub struct ScriptKernel {
    name: String,
    syntax: Syntax,
    language_name: String,
    language_version: String,
    variables: Mutex<HashMap<String, String>>,
}

impl ScriptKernel {
    pub fn csharp() -> Self {
        Self::new("csharp", Syntax::CSharp, "C#", "12.0")
    }

    pub fn fsharp() -> Self {
        Self::new("fsharp", Syntax::FSharp, "F#", "8.0")
    }

    fn new(name: &str, syntax: Syntax, language_name: &str, language_version: &str) -> Self {
        Self {
            name: name.to_string(),
            syntax,
            language_name: language_name.to_string(),
            language_version: language_version.to_string(),
            variables: Mutex::new(HashMap::new()),
        }
    }

    /// Run every statement in `code`. Variables persist across calls.
    pub fn evaluate(&self, code: &str) -> Result<Evaluation, String> {
        let statements = split_statements(code, self.syntax.splits_on_semicolon())
            .into_iter()
            .map(|s| self.parse(&s))
            .collect::<Result<Vec<_>, _>>()?;

        let mut variables = self
            .variables
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut evaluation = Evaluation::default();
        let last = statements.len().saturating_sub(1);
        for (i, statement) in statements.into_iter().enumerate() {
            match statement {
                Statement::Assign { name, expr } => {
                    let value = eval_expr(&expr, &variables)?;
                    variables.insert(name, value);
                }
                Statement::Print(expr) => {
                    let value = eval_expr(&expr, &variables)?;
                    evaluation.stdout.push(format!("{value}\n"));
                }
                Statement::Expr(expr) => {
                    let value = eval_expr(&expr, &variables)?;
                    if i == last {
                        evaluation.value = Some(value);
                    }
                }
            }
        }
        Ok(evaluation)
    }

    fn parse(&self, statement: &str) -> Result<Statement, String> {
        if let Some(rest) = statement.strip_prefix(self.syntax.assign_keyword()) {
            let (name, expr) = rest
                .split_once('=')
                .ok_or_else(|| format!("expected '=' in: {statement}"))?;
            let name = name.trim();
            if !is_identifier(name) {
                return Err(format!("invalid variable name: {name}"));
            }
            return Ok(Statement::Assign {
                name: name.to_string(),
                expr: expr.trim().to_string(),
            });
        }

        let print = match self.syntax {
            Syntax::CSharp => statement
                .strip_prefix("Console.WriteLine(")
                .and_then(|s| s.strip_suffix(')'))
                .map(str::trim),
            Syntax::FSharp => statement.strip_prefix("printfn ").map(|s| {
                let s = s.trim();
                s.strip_prefix("\"%s\"").map(str::trim).unwrap_or(s)
            }),
        };
        Ok(match print {
            Some(expr) => Statement::Print(expr.to_string()),
            None => Statement::Expr(statement.to_string()),
        })
    }
}

#[async_trait]
impl Kernel for ScriptKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn info(&self) -> KernelInfo {
        KernelInfo::new(&self.name)
            .with_language(&self.language_name, &self.language_version)
            .with_remote_uri(format!("kernel://test-host/{}", self.name))
            .with_commands(["SubmitCode", "RequestKernelInfo"])
    }

    async fn submit_code(&self, code: &str, sink: &EventSink<'_>) -> Result<(), SubmitError> {
        let evaluation = self.evaluate(code).map_err(SubmitError::Failed)?;
        for line in evaluation.stdout {
            sink.emit(KernelEvent::StandardOutputValueProduced {
                formatted_values: vec![FormattedValue::plain_text(line)],
            })
            .await?;
        }
        if let Some(value) = evaluation.value {
            sink.emit(KernelEvent::ReturnValueProduced {
                formatted_values: vec![FormattedValue::plain_text(value)],
            })
            .await?;
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Split on newlines (and `;` if asked), ignoring separators inside string
/// literals. Empty statements are dropped.
fn split_statements(code: &str, on_semicolon: bool) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in code.chars() {
        if in_string {
            current.push(c);
            match (escaped, c) {
                (true, _) => escaped = false,
                (false, '\\') => escaped = true,
                (false, '"') => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                current.push(c);
            }
            '\n' => statements.push(std::mem::take(&mut current)),
            ';' if on_semicolon => statements.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    statements.push(current);

    statements
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn eval_expr(expr: &str, variables: &HashMap<String, String>) -> Result<String, String> {
    if let Some(body) = expr.strip_prefix('"') {
        return parse_string_literal(body);
    }
    if let Ok(n) = expr.parse::<i64>() {
        return Ok(n.to_string());
    }
    if is_identifier(expr) {
        return variables
            .get(expr)
            .cloned()
            .ok_or_else(|| format!("The name '{expr}' does not exist in the current context"));
    }
    Err(format!("unsupported expression: {expr}"))
}

/// `body` is everything after the opening quote.
fn parse_string_literal(body: &str) -> Result<String, String> {
    let mut out = String::new();
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                let trailing: String = chars.collect();
                if !trailing.trim().is_empty() {
                    return Err(format!("unexpected text after string literal: {trailing}"));
                }
                return Ok(out);
            }
            '\\' => match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => break,
            },
            c => out.push(c),
        }
    }
    Err("unterminated string literal".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csharp_assignment_and_identifier() {
        let kernel = ScriptKernel::csharp();
        let evaluation = kernel
            .evaluate("var x = \"abáéíőúűóüÁÉÍŐÚŰÓÜ\";\nx")
            .unwrap();
        assert_eq!(evaluation.value.as_deref(), Some("abáéíőúűóüÁÉÍŐÚŰÓÜ"));
        assert!(evaluation.stdout.is_empty());
    }

    #[test]
    fn variables_persist_across_submissions() {
        let kernel = ScriptKernel::fsharp();
        assert_eq!(kernel.evaluate("let answer = 42").unwrap().value, None);
        assert_eq!(
            kernel.evaluate("answer").unwrap().value.as_deref(),
            Some("42")
        );
    }

    #[test]
    fn printing_goes_to_stdout() {
        let csharp = ScriptKernel::csharp();
        let evaluation = csharp
            .evaluate("var s = \"hi\"; Console.WriteLine(s); Console.WriteLine(\"a;b\")")
            .unwrap();
        assert_eq!(evaluation.stdout, vec!["hi\n", "a;b\n"]);
        assert_eq!(evaluation.value, None);

        let fsharp = ScriptKernel::fsharp();
        let evaluation = fsharp.evaluate("printfn \"%s\" \"hello\"").unwrap();
        assert_eq!(evaluation.stdout, vec!["hello\n"]);
    }

    #[test]
    fn only_the_last_expression_is_returned() {
        let kernel = ScriptKernel::csharp();
        let evaluation = kernel.evaluate("1\n2").unwrap();
        assert_eq!(evaluation.value.as_deref(), Some("2"));
    }

    #[test]
    fn unknown_identifier_fails() {
        let kernel = ScriptKernel::csharp();
        let err = kernel.evaluate("nope").unwrap_err();
        assert!(err.contains("'nope' does not exist"), "unexpected error: {err}");
    }

    #[test]
    fn escapes_in_string_literals() {
        assert_eq!(parse_string_literal(r#"a\"b\\c\n""#).unwrap(), "a\"b\\c\n");
        assert!(parse_string_literal("open").is_err());
        assert!(parse_string_literal("a\" trailing").is_err());
    }

    #[test]
    fn fsharp_does_not_split_on_semicolons() {
        assert_eq!(split_statements("a; b", false), vec!["a; b"]);
        assert_eq!(split_statements("a; b\n\n c ", true), vec!["a", "b", "c"]);
    }

    #[test]
    fn info_describes_the_language() {
        let info = ScriptKernel::fsharp().info();
        assert_eq!(info.local_name, "fsharp");
        assert_eq!(info.language_name.as_deref(), Some("F#"));
        assert!(!info.is_composite);
        assert!(info.supported_kernel_commands.contains("SubmitCode"));
    }
}
