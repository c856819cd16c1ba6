//! Label selector queries, e.g. `env=prod,tier!=db,region in (eu,us),!legacy`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("empty requirement in selector '{0}'")]
    EmptyRequirement(String),
    #[error("invalid label key '{0}'")]
    InvalidKey(String),
    #[error("invalid label value '{0}'")]
    InvalidValue(String),
    #[error("unknown set operator '{0}' (expected 'in' or 'notin')")]
    UnknownOperator(String),
    #[error("unbalanced parentheses in '{0}'")]
    Unbalanced(String),
    #[error("set requirement '{0}' must list at least one value")]
    EmptySet(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: Vec<String>,
}

impl Requirement {
    fn matches(&self, labels: &dyn LabelSource) -> bool {
        let value = labels.label(&self.key);
        match self.operator {
            Operator::Equals | Operator::In => {
                value.is_some_and(|v| self.values.iter().any(|w| w == v))
            }
            Operator::NotEquals | Operator::NotIn => {
                value.is_none_or(|v| self.values.iter().all(|w| w != v))
            }
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Equals => write!(f, "{}={}", self.key, self.values[0]),
            Operator::NotEquals => write!(f, "{}!={}", self.key, self.values[0]),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// Anything labels can be looked up on.
pub trait LabelSource {
    fn label(&self, key: &str) -> Option<&str>;
}

impl LabelSource for HashMap<String, String> {
    fn label(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

impl LabelSource for BTreeMap<String, String> {
    fn label(&self, key: &str) -> Option<&str> {
        self.get(key).map(String::as_str)
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &dyn LabelSource) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for LabelSelector {
    type Err = SelectorError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.trim().is_empty() {
            return Ok(Self::default());
        }
        let requirements = split_terms(input)?
            .into_iter()
            .map(parse_requirement)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { requirements })
    }
}

/// Split on commas that are not inside a `(...)` value set.
fn split_terms(input: &str) -> Result<Vec<&str>, SelectorError> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| SelectorError::Unbalanced(input.to_string()))?;
            }
            ',' if depth == 0 => {
                terms.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::Unbalanced(input.to_string()));
    }
    terms.push(&input[start..]);
    Ok(terms)
}

fn parse_requirement(term: &str) -> Result<Requirement, SelectorError> {
    let term = term.trim();
    if term.is_empty() {
        return Err(SelectorError::EmptyRequirement(term.to_string()));
    }

    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement {
            key: validate_key(key.trim())?,
            operator: Operator::DoesNotExist,
            values: vec![],
        });
    }

    if let Some((head, rest)) = term.split_once('(') {
        let inner = rest
            .strip_suffix(')')
            .ok_or_else(|| SelectorError::Unbalanced(term.to_string()))?;
        let mut words = head.split_whitespace();
        let key = words
            .next()
            .ok_or_else(|| SelectorError::InvalidKey(head.to_string()))?;
        let operator = match words.next() {
            Some("in") => Operator::In,
            Some("notin") => Operator::NotIn,
            Some(other) => return Err(SelectorError::UnknownOperator(other.to_string())),
            None => return Err(SelectorError::UnknownOperator(String::new())),
        };
        if let Some(extra) = words.next() {
            return Err(SelectorError::UnknownOperator(extra.to_string()));
        }
        let values = inner
            .split(',')
            .map(|v| validate_value(v.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        if values.iter().all(String::is_empty) {
            return Err(SelectorError::EmptySet(term.to_string()));
        }
        return Ok(Requirement {
            key: validate_key(key)?,
            operator,
            values,
        });
    }

    let (key, operator, value) = if let Some((k, v)) = term.split_once("!=") {
        (k, Operator::NotEquals, Some(v))
    } else if let Some((k, v)) = term.split_once("==") {
        (k, Operator::Equals, Some(v))
    } else if let Some((k, v)) = term.split_once('=') {
        (k, Operator::Equals, Some(v))
    } else {
        (term, Operator::Exists, None)
    };

    Ok(Requirement {
        key: validate_key(key.trim())?,
        operator,
        values: value
            .map(|v| validate_value(v.trim()))
            .transpose()?
            .into_iter()
            .collect(),
    })
}

fn validate_key(key: &str) -> Result<String, SelectorError> {
    let valid = !key.is_empty()
        && key.len() <= 253
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if valid {
        Ok(key.to_string())
    } else {
        Err(SelectorError::InvalidKey(key.to_string()))
    }
}

fn validate_value(value: &str) -> Result<String, SelectorError> {
    let valid = value.len() <= 63
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(value.to_string())
    } else {
        Err(SelectorError::InvalidValue(value.to_string()))
    }
}
