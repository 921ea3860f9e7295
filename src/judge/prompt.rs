use std::fmt::Write as _;

use anyhow::{Context, Result};
use regex::{Captures, Regex};

use crate::model::{Query, QueryResult};
use crate::util::{condense_whitespace, truncate_chars};

pub const DEFAULT_PROMPT_TEMPLATE: &str = r#"You are an impartial judge comparing retrieval systems for the domain "{domain}".

Question:
{query}

Reference answer:
{reference}

Each system below retrieved evidence for the question. Decide which system's evidence best supports a correct and complete answer. Weigh relevance to the question, coverage of the reference answer, and how much irrelevant material was returned. Do not reward length.

{systems}

Respond with JSON only, in exactly this shape:
{"winner": "<one of: {system_names}, or tie>", "scores": {"<system name>": <integer 0-100>}, "analysis": "<two or three sentences>"}
"#;

pub struct PromptLimits {
    pub max_chunks_per_system: usize,
    pub max_chunk_chars: usize,
}

/// Substitutes `{domain}`, `{query}`, `{reference}`, `{system_names}` and
/// `{systems}` in a single pass, so placeholder-like text inside queries or
/// retrieved content is never expanded.
pub struct PromptRenderer {
    template: String,
    limits: PromptLimits,
    placeholder: Regex,
}

impl PromptRenderer {
    pub fn new(template: &str, limits: PromptLimits) -> Result<Self> {
        let placeholder = Regex::new(r"\{(domain|query|reference|system_names|systems)\}")
            .context("failed to compile prompt placeholder regex")?;
        Ok(Self {
            template: template.to_string(),
            limits,
            placeholder,
        })
    }

    pub fn render(&self, domain: &str, query: &Query, systems: &[(&str, &QueryResult)]) -> String {
        let system_names = systems
            .iter()
            .map(|(label, _)| *label)
            .collect::<Vec<&str>>()
            .join(", ");
        let evidence = render_evidence(systems, &self.limits);

        self.placeholder
            .replace_all(&self.template, |captures: &Captures<'_>| match &captures[1] {
                "domain" => domain.to_string(),
                "query" => query.text().to_string(),
                "reference" => query
                    .reference()
                    .map(str::to_string)
                    .unwrap_or_else(|| "(none provided)".to_string()),
                "system_names" => system_names.clone(),
                _ => evidence.clone(),
            })
            .into_owned()
    }
}

fn render_evidence(systems: &[(&str, &QueryResult)], limits: &PromptLimits) -> String {
    let mut out = String::new();
    for (label, result) in systems {
        let _ = writeln!(out, "### System: {label}");
        if let Some(error) = result.error.as_deref().filter(|_| result.is_error()) {
            let _ = writeln!(out, "(retrieval failed: {})", condense_whitespace(error));
        } else if result.retrieved.is_empty() {
            let _ = writeln!(out, "(no chunks retrieved)");
        } else {
            for (rank, chunk) in result
                .retrieved
                .iter()
                .take(limits.max_chunks_per_system)
                .enumerate()
            {
                let _ = writeln!(
                    out,
                    "[{}] (score {:.4}) {}",
                    rank + 1,
                    chunk.score,
                    truncate_chars(&condense_whitespace(&chunk.content), limits.max_chunk_chars)
                );
            }
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}
