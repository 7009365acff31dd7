//! Core domain model for VACMON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "vacmon-core";

/// Set of lowercase technology tokens.
///
/// Iteration order is first-insertion order so rankings built from it are
/// deterministic. Tokens are trimmed and lowercased on the way in; blanks and
/// repeats are dropped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct TechStack {
    tokens: Vec<String>,
}

impl TechStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the token was not present yet.
    pub fn insert(&mut self, token: &str) -> bool {
        let token = token.trim().to_lowercase();
        if token.is_empty() || self.tokens.contains(&token) {
            return false;
        }
        self.tokens.push(token);
        true
    }

    pub fn contains(&self, token: &str) -> bool {
        let token = token.trim().to_lowercase();
        self.tokens.contains(&token)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

// Set semantics: insertion order does not take part in equality.
impl PartialEq for TechStack {
    fn eq(&self, other: &Self) -> bool {
        self.tokens.len() == other.tokens.len()
            && self.tokens.iter().all(|t| other.tokens.contains(t))
    }
}

impl Eq for TechStack {}

impl<S: AsRef<str>> FromIterator<S> for TechStack {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut stack = TechStack::new();
        for token in iter {
            stack.insert(token.as_ref());
        }
        stack
    }
}

impl From<Vec<String>> for TechStack {
    fn from(tokens: Vec<String>) -> Self {
        tokens.into_iter().collect()
    }
}

impl From<TechStack> for Vec<String> {
    fn from(stack: TechStack) -> Self {
        stack.tokens
    }
}

/// Canonical record produced by a source adapter, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VacancyDraft {
    pub source: String,
    pub url: String,
    pub title: String,
    pub company: String,
    pub city: Option<String>,
    pub tech_stack: TechStack,
    pub salary_from: Option<f64>,
    pub salary_to: Option<f64>,
    pub currency: Option<String>,
}

/// Persisted vacancy row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vacancy {
    pub id: i64,
    pub source: String,
    pub url: String,
    pub title: String,
    pub company: String,
    pub city: Option<String>,
    pub tech_stack: TechStack,
    pub salary_from: Option<f64>,
    pub salary_to: Option<f64>,
    pub currency: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Vacancy {
    /// Names of the mutable fields whose stored value differs from `draft`.
    pub fn changed_fields(&self, draft: &VacancyDraft) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.title != draft.title {
            changed.push("title");
        }
        if self.company != draft.company {
            changed.push("company");
        }
        if self.city != draft.city {
            changed.push("city");
        }
        if self.tech_stack != draft.tech_stack {
            changed.push("tech_stack");
        }
        if self.salary_from != draft.salary_from {
            changed.push("salary_from");
        }
        if self.salary_to != draft.salary_to {
            changed.push("salary_to");
        }
        if self.currency != draft.currency {
            changed.push("currency");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> VacancyDraft {
        VacancyDraft {
            source: "hh.ru".into(),
            url: "https://hh.ru/vacancy/1".into(),
            title: "Python developer".into(),
            company: "Acme".into(),
            city: Some("Moscow".into()),
            tech_stack: ["python", "docker"].into_iter().collect(),
            salary_from: Some(1000.0),
            salary_to: None,
            currency: Some("RUR".into()),
        }
    }

    fn stored(draft: &VacancyDraft) -> Vacancy {
        let now = Utc::now();
        Vacancy {
            id: 1,
            source: draft.source.clone(),
            url: draft.url.clone(),
            title: draft.title.clone(),
            company: draft.company.clone(),
            city: draft.city.clone(),
            tech_stack: draft.tech_stack.clone(),
            salary_from: draft.salary_from,
            salary_to: draft.salary_to,
            currency: draft.currency.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn tech_stack_lowercases_and_deduplicates() {
        let stack: TechStack = [" Python", "DOCKER", "python", "", "docker "].into_iter().collect();
        assert_eq!(stack.iter().collect::<Vec<_>>(), vec!["python", "docker"]);
        assert!(stack.contains("PYTHON"));
    }

    #[test]
    fn tech_stack_equality_ignores_order() {
        let a: TechStack = ["python", "react"].into_iter().collect();
        let b: TechStack = ["react", "python"].into_iter().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn tech_stack_serializes_as_list() {
        let stack: TechStack = ["rust", "go"].into_iter().collect();
        let json = serde_json::to_string(&stack).unwrap();
        assert_eq!(json, r#"["rust","go"]"#);
        let back: TechStack = serde_json::from_str(r#"["Rust","rust","GO"]"#).unwrap();
        assert_eq!(back, stack);
    }

    #[test]
    fn identical_draft_has_no_changed_fields() {
        let d = draft();
        assert!(stored(&d).changed_fields(&d).is_empty());
    }

    #[test]
    fn changed_salary_is_reported() {
        let d = draft();
        let row = stored(&d);
        let mut incoming = d.clone();
        incoming.salary_to = Some(2000.0);
        assert_eq!(row.changed_fields(&incoming), vec!["salary_to"]);
    }
}
