//! Prompt templates with `{{name}}` placeholders.

use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;

use novelkb_shared::{NovelKbError, Result};

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder regex compiles")
});

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Var(String),
}

/// A parsed prompt template.
///
/// Only names from the allow-list given to [`PromptTemplate::parse`] may
/// appear; anything else is rejected before a single request is made.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn parse(source: &str, allowed: &[&str]) -> Result<Self> {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in PLACEHOLDER_RE.captures_iter(source) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let name = name.as_str();
            if !allowed.contains(&name) {
                return Err(NovelKbError::config(format!(
                    "unknown prompt placeholder {{{{{name}}}}} (allowed: {})",
                    allowed.join(", ")
                )));
            }
            if whole.start() > last {
                segments.push(Segment::Text(source[last..whole.start()].to_string()));
            }
            segments.push(Segment::Var(name.to_string()));
            last = whole.end();
        }
        if last < source.len() {
            segments.push(Segment::Text(source[last..].to_string()));
        }

        Ok(Self { segments })
    }

    /// Load a template file. A path that was asked for but does not exist is
    /// a configuration error.
    pub fn from_file(path: &Path, allowed: &[&str]) -> Result<Self> {
        if !path.is_file() {
            return Err(NovelKbError::config(format!(
                "prompt file not found: {}",
                path.display()
            )));
        }
        let source = std::fs::read_to_string(path).map_err(|e| NovelKbError::io(path, e))?;
        Self::parse(&source, allowed)
    }

    /// Whether the template references `name`.
    pub fn uses(&self, name: &str) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Var(v) if v == name))
    }

    /// Substitute `vars`. Placeholders without a value render as empty.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Var(name) => {
                    if let Some((_, value)) = vars.iter().find(|(k, _)| k == name) {
                        out.push_str(value);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALLOWED: &[&str] = &["chunk_id", "chunk_text"];

    #[test]
    fn renders_placeholders() {
        let tpl = PromptTemplate::parse("片段 {{ chunk_id }}：\n{{chunk_text}}\n完", ALLOWED).unwrap();
        assert!(tpl.uses("chunk_text"));
        let out = tpl.render(&[("chunk_id", "000004"), ("chunk_text", "王林")]);
        assert_eq!(out, "片段 000004：\n王林\n完");
    }

    #[test]
    fn unknown_placeholder_is_config_error() {
        let err = PromptTemplate::parse("{{chunk_txt}}", ALLOWED).unwrap_err();
        assert!(matches!(err, NovelKbError::Config { .. }));
        assert!(err.to_string().contains("chunk_txt"));
    }

    #[test]
    fn json_braces_are_literal() {
        let src = r#"输出 {"entities": []} {{chunk_text}}"#;
        let tpl = PromptTemplate::parse(src, ALLOWED).unwrap();
        assert_eq!(tpl.render(&[("chunk_text", "x")]), r#"输出 {"entities": []} x"#);
        assert!(!tpl.uses("chunk_id"));
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = PromptTemplate::from_file(Path::new("/nonexistent/prompt.txt"), ALLOWED)
            .unwrap_err();
        assert!(matches!(err, NovelKbError::Config { .. }));
    }
}
