//! Structured questions and decisions for human checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of human decision being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
    /// The work item is ambiguous and needs clarification.
    Clarification,
    /// Validation keeps failing and several fixes look viable.
    SolutionChoice,
    /// The generated change needs sign-off before publishing.
    Approval,
}

impl std::fmt::Display for QuestionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuestionType::Clarification => write!(f, "clarification"),
            QuestionType::SolutionChoice => write!(f, "solution_choice"),
            QuestionType::Approval => write!(f, "approval"),
        }
    }
}

/// One selectable answer to a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionOption {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub pros: Vec<String>,
    #[serde(default)]
    pub cons: Vec<String>,
    #[serde(default)]
    pub recommended: bool,
}

impl QuestionOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: String::new(),
            pros: Vec::new(),
            cons: Vec::new(),
            recommended: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn recommended(mut self) -> Self {
        self.recommended = true;
        self
    }
}

/// A question posted to the external channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    pub id: Uuid,
    pub question_type: QuestionType,
    pub prompt: String,
    pub options: Vec<QuestionOption>,
}

impl Question {
    pub fn new(question_type: QuestionType, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            question_type,
            prompt: prompt.into(),
            options: Vec::new(),
        }
    }

    pub fn with_option(mut self, option: QuestionOption) -> Self {
        self.options.push(option);
        self
    }

    /// The option id a timeout resolves to under the given policy.
    ///
    /// Returns `None` when the policy (or an empty option list) says the
    /// run should take no action and abort instead.
    pub fn timeout_default(&self, policy: TimeoutPolicy) -> Option<&str> {
        match policy {
            TimeoutPolicy::AlwaysAbort => None,
            TimeoutPolicy::PreferRecommended => self
                .options
                .iter()
                .find(|o| o.recommended)
                .or_else(|| self.options.first())
                .map(|o| o.id.as_str()),
            TimeoutPolicy::FirstOption => self.options.first().map(|o| o.id.as_str()),
        }
    }
}

/// A posted question waiting for its response or timeout.
///
/// Checkpointed alongside the run while it is suspended, so a resumed
/// process can reattach to the question instead of posting a duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub question: Question,
    /// Id the tracker assigned at posting time; response signals carry
    /// this id.
    pub posted_id: Uuid,
    pub posted_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// How an unanswered question resolves when its timeout fires.
///
/// This is product policy rather than a derived rule, so it is
/// configurable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Pick the recommended option, falling back to the first.
    #[default]
    PreferRecommended,
    /// Always pick the first option.
    FirstOption,
    /// Never pick silently; resolve to "no action".
    AlwaysAbort,
}

impl std::str::FromStr for TimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prefer_recommended" | "recommended" => Ok(TimeoutPolicy::PreferRecommended),
            "first_option" | "first" => Ok(TimeoutPolicy::FirstOption),
            "always_abort" | "abort" => Ok(TimeoutPolicy::AlwaysAbort),
            other => Err(format!("unknown timeout policy '{other}'")),
        }
    }
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// A response signal arrived before the deadline.
    Human,
    /// The deadline fired and the default rule applied.
    TimeoutDefault,
}

/// The resolution of a posted question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub question_id: Uuid,
    /// Chosen option id; `None` means "no action", which aborts
    /// approval-gated work.
    pub option_id: Option<String>,
    pub source: DecisionSource,
}

impl Decision {
    /// Whether the decision declined to pick any option.
    pub fn is_no_action(&self) -> bool {
        self.option_id.is_none()
    }
}
