use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::fact::Polarity;
use crate::plan::{MathOp, PlanAction, PlanStep};

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s']").unwrap());
static APOSTROPHE_TRIM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^'+|'+$").unwrap());
static FACT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<neg>(?i:not)\s+|!\s*|¬\s*)?(?P<pred>[A-Za-z_][\w-]*)\s*\((?P<args>[^()]*)\)\s*(?:@\s*(?P<conf>[0-9]*\.?[0-9]+))?$",
    )
    .unwrap()
});
static MATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?P<op>solve|differentiate|integrate|simplify|factor|expand)\s+(?P<expr>.+?)(?:\s+(?:for|wrt)\s+(?P<var>[A-Za-z_]\w*))?$",
    )
    .unwrap()
});
static SEARCH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^search\s+(?P<q>.+)$").unwrap());
static RESOLVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^resolve\s+(?P<gap>.+)$").unwrap());

const QUESTION_WORDS: &[&str] = &[
    "what", "who", "where", "when", "why", "how", "which", "is", "are", "does", "do", "can",
];

const STOP_WORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from",
    "how", "i", "in", "is", "me", "of", "on", "or", "tell", "the", "to", "was", "what", "when",
    "where", "which", "who", "why", "with", "you",
];

/// Tokenize text into lowercase words.
/// Preserves apostrophes within words (e.g., "don't").
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned = NON_WORD.replace_all(text, " ");
    cleaned
        .to_lowercase()
        .split_whitespace()
        .map(|t| APOSTROPHE_TRIM.replace_all(t, "").to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Deduplicated term set.
pub fn term_set(text: &str) -> BTreeSet<String> {
    tokenize(text).into_iter().collect()
}

pub fn is_stop_word(term: &str) -> bool {
    STOP_WORDS.contains(&term)
}

/// Term set without stop words.
pub fn content_terms(text: &str) -> BTreeSet<String> {
    tokenize(text)
        .into_iter()
        .filter(|t| !is_stop_word(t))
        .collect()
}

/// A fact parsed from input, before it is stamped with source and time.
#[derive(Clone, Debug, PartialEq)]
pub struct Assertion {
    pub predicate: String,
    pub args: Vec<String>,
    pub polarity: Polarity,
    pub confidence: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub text: String,
    pub terms: BTreeSet<String>,
    pub is_question: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    Assertion,
    Command,
    Query,
    Empty,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParsedInput {
    pub kind: InputKind,
    pub assertions: Vec<Assertion>,
    pub steps: Vec<PlanStep>,
    /// Gap descriptions the user marked as resolved.
    pub resolutions: Vec<String>,
    pub query: Option<Query>,
}

impl ParsedInput {
    pub fn is_empty(&self) -> bool {
        self.kind == InputKind::Empty
    }
}

/// Split input on `;` and newlines and classify each clause as a fact,
/// a math / search / resolve command, or free query text.
pub fn parse_input(input: &str) -> ParsedInput {
    let mut assertions = Vec::new();
    let mut steps = Vec::new();
    let mut resolutions = Vec::new();
    let mut query_parts: Vec<&str> = Vec::new();

    for clause in input.split([';', '\n']).map(str::trim).filter(|c| !c.is_empty()) {
        if let Some(caps) = MATH.captures(clause) {
            let op = MathOp::parse(&caps["op"]).unwrap_or(MathOp::Simplify);
            let mut step = PlanStep::new(PlanAction::Compute(op), caps["expr"].trim());
            if let Some(var) = caps.name("var") {
                step = step.with_param("variable", var.as_str());
            }
            steps.push(step);
        } else if let Some(assertion) = parse_fact(clause) {
            assertions.push(assertion);
        } else if let Some(caps) = SEARCH.captures(clause) {
            steps.push(PlanStep::new(PlanAction::Retrieve, caps["q"].trim()));
        } else if let Some(caps) = RESOLVE.captures(clause) {
            resolutions.push(caps["gap"].trim().to_string());
        } else {
            query_parts.push(clause);
        }
    }

    let query = if query_parts.is_empty() {
        None
    } else {
        let text = query_parts.join(" ");
        let terms = term_set(&text);
        if terms.is_empty() {
            None
        } else {
            let is_question = text.ends_with('?')
                || tokenize(&text)
                    .first()
                    .is_some_and(|w| QUESTION_WORDS.contains(&w.as_str()));
            Some(Query {
                text,
                terms,
                is_question,
            })
        }
    };

    let kind = if !steps.is_empty() || !resolutions.is_empty() {
        InputKind::Command
    } else if query.is_some() {
        InputKind::Query
    } else if !assertions.is_empty() {
        InputKind::Assertion
    } else {
        InputKind::Empty
    };

    ParsedInput {
        kind,
        assertions,
        steps,
        resolutions,
        query,
    }
}

fn parse_fact(clause: &str) -> Option<Assertion> {
    let caps = FACT.captures(clause)?;
    let polarity = if caps.name("neg").is_some() {
        Polarity::Negative
    } else {
        Polarity::Positive
    };
    let args = caps["args"]
        .split(',')
        .map(|a| a.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_lowercase())
        .filter(|a| !a.is_empty())
        .collect();
    let confidence = caps
        .name("conf")
        .and_then(|c| c.as_str().parse::<f64>().ok())
        .unwrap_or(1.0);
    Some(Assertion {
        predicate: caps["pred"].to_lowercase(),
        args,
        polarity,
        confidence,
    })
}
