//! Judge output is untrusted text. Every path here returns a usable verdict;
//! nothing in this module is allowed to fail the comparison.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::Regex;
use serde_json::{Map, Value};

use crate::model::Winner;
use crate::util::truncate_chars;

const TIE_WORDS: &[&str] = &["tie", "draw", "equal", "none", "neither", "both", "no preference"];
const WINNER_KEYS: &[&str] = &["winner", "best", "preferred", "best_system"];
const ANALYSIS_KEYS: &[&str] = &["analysis", "reasoning", "explanation", "rationale"];
const MAX_JSON_CANDIDATES: usize = 16;
const RAW_EXCERPT_CHARS: usize = 400;

#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub winner: Winner,
    pub scores: BTreeMap<String, f64>,
    pub analysis: String,
}

impl Verdict {
    fn tie(scores: BTreeMap<String, f64>, analysis: String) -> Self {
        Self {
            winner: Winner::Tie,
            scores,
            analysis,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    /// A clear winner, or a tie the judge stated explicitly.
    Parsed(Verdict),
    /// Unusable or ambiguous answer; the verdict is always a tie.
    Degraded { verdict: Verdict, reason: String },
    /// Nothing to parse at all.
    Rejected { reason: String },
}

impl ParseOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Parsed(_) => "parsed",
            Self::Degraded { .. } => "degraded",
            Self::Rejected { .. } => "rejected",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Parsed(_) => None,
            Self::Degraded { reason, .. } | Self::Rejected { reason } => Some(reason),
        }
    }

    pub fn into_verdict(self) -> Verdict {
        match self {
            Self::Parsed(verdict) | Self::Degraded { verdict, .. } => verdict,
            Self::Rejected { reason } => Verdict::tie(BTreeMap::new(), reason),
        }
    }
}

/// Turns raw judge output into a verdict; build once per comparison.
pub struct VerdictParser {
    winner_line: Regex,
}

impl VerdictParser {
    pub fn new() -> Result<Self> {
        let winner_line = Regex::new(r"(?im)^[\s*_#>-]*winner[\s*_]*[:=-]\s*(.+?)\s*$")
            .context("failed to compile winner line regex")?;
        Ok(Self { winner_line })
    }

    pub fn parse(&self, raw: &str, systems: &[String]) -> ParseOutcome {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return ParseOutcome::Rejected {
                reason: "judge returned an empty response".to_string(),
            };
        }

        if let Some(object) = find_json_object(trimmed) {
            return parse_object(&object, systems, trimmed);
        }

        self.parse_text(trimmed, systems)
    }

    fn parse_text(&self, raw: &str, systems: &[String]) -> ParseOutcome {
        let analysis = truncate_chars(raw, RAW_EXCERPT_CHARS);
        let winner_line = self
            .winner_line
            .captures(raw)
            .and_then(|captures| captures.get(1))
            .map(|found| found.as_str().to_string());

        let Some(winner_line) = winner_line else {
            return degraded(
                "judge response is neither json nor a 'Winner:' line",
                BTreeMap::new(),
                analysis,
            );
        };

        match resolve_winner_text(&winner_line, systems) {
            Some(winner) => ParseOutcome::Parsed(Verdict {
                winner,
                scores: BTreeMap::new(),
                analysis,
            }),
            None => degraded(
                &format!(
                    "winner line '{}' does not name a compared system",
                    truncate_chars(&winner_line, 80)
                ),
                BTreeMap::new(),
                analysis,
            ),
        }
    }
}

fn parse_object(object: &Map<String, Value>, systems: &[String], raw: &str) -> ParseOutcome {
    let scores = object
        .get("scores")
        .and_then(Value::as_object)
        .map(|scores| parse_scores(scores, systems))
        .unwrap_or_default();
    let analysis = ANALYSIS_KEYS
        .iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| truncate_chars(raw, RAW_EXCERPT_CHARS));

    let winner_value = WINNER_KEYS
        .iter()
        .find_map(|key| object.get(*key))
        .filter(|value| !value.is_null());
    let Some(winner_value) = winner_value else {
        return degraded("judge json has no winner field", scores, analysis);
    };

    let resolved = match winner_value {
        Value::String(text) => resolve_winner_text(text, systems),
        Value::Array(items) => resolve_winner_list(items, systems),
        _ => None,
    };

    match resolved {
        Some(winner) => ParseOutcome::Parsed(Verdict {
            winner,
            scores,
            analysis,
        }),
        None => degraded(
            &format!(
                "winner {} does not name a compared system",
                truncate_chars(&winner_value.to_string(), 80)
            ),
            scores,
            analysis,
        ),
    }
}

fn degraded(reason: &str, scores: BTreeMap<String, f64>, analysis: String) -> ParseOutcome {
    ParseOutcome::Degraded {
        verdict: Verdict::tie(scores, analysis),
        reason: reason.to_string(),
    }
}

fn parse_scores(raw: &Map<String, Value>, systems: &[String]) -> BTreeMap<String, f64> {
    let mut scores = BTreeMap::new();
    for (key, value) in raw {
        let Some(label) = match_system(key, systems) else {
            continue;
        };
        let number = match value {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse::<f64>().ok(),
            _ => None,
        };
        if let Some(number) = number.filter(|number| number.is_finite()) {
            scores.insert(label.to_string(), number);
        }
    }
    scores
}

fn resolve_winner_text(text: &str, systems: &[String]) -> Option<Winner> {
    let cleaned = clean_token(text);
    if cleaned.is_empty() {
        return None;
    }
    if TIE_WORDS.contains(&cleaned.as_str()) {
        return Some(Winner::Tie);
    }
    match_system(&cleaned, systems).map(Winner::system)
}

fn resolve_winner_list(items: &[Value], systems: &[String]) -> Option<Winner> {
    let mut winners = Vec::<String>::new();
    for item in items {
        let label = match_system(item.as_str()?, systems)?;
        if !winners.iter().any(|existing| existing == label) {
            winners.push(label.to_string());
        }
    }

    if winners.is_empty() {
        return None;
    }
    if winners.len() == systems.len() && systems.len() > 1 {
        return Some(Winner::Tie);
    }
    winners.sort_by_key(|name| systems.iter().position(|system| system == name));
    Some(Winner::Systems(winners))
}

fn match_system<'a>(candidate: &str, systems: &'a [String]) -> Option<&'a str> {
    let cleaned = clean_token(candidate);
    let stripped = cleaned
        .strip_prefix("system ")
        .map(str::trim)
        .unwrap_or(&cleaned);

    systems
        .iter()
        .find(|system| {
            let system = system.to_lowercase();
            system == cleaned || system == stripped
        })
        .map(String::as_str)
}

fn clean_token(text: &str) -> String {
    text.trim()
        .trim_matches(|ch: char| matches!(ch, '"' | '\'' | '`' | '*' | '.' | '!' | ','))
        .trim()
        .to_lowercase()
}

/// Finds the first balanced `{...}` span that parses as a json object, skipping
/// prose, code fences, and brace fragments that are not json.
fn find_json_object(raw: &str) -> Option<Map<String, Value>> {
    raw.char_indices()
        .filter(|(_, ch)| *ch == '{')
        .take(MAX_JSON_CANDIDATES)
        .find_map(|(start, _)| {
            let candidate = &raw[start..];
            let end = find_matching_brace(candidate)?;
            match serde_json::from_str::<Value>(&candidate[..end]) {
                Ok(Value::Object(object)) => Some(object),
                _ => None,
            }
        })
}

fn find_matching_brace(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;

    for (index, ch) in s.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if ch == '\\' && in_string {
            escape = true;
            continue;
        }
        if ch == '"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(index + 1);
                }
            }
            _ => {}
        }
    }
    None
}
