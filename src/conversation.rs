//! Roles, transcripts and the pre-recorded conversation script that seeds
//! every simulation.

use std::fmt;

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("start index {index} is out of range for a script of {len} steps")]
    OutOfRange { index: usize, len: usize },
    #[error("script needs at least 2 steps to continue a conversation, found {0}")]
    TooShort(usize),
    #[error("unknown speaker `{0}` in script")]
    UnknownSpeaker(String),
}

/// The two seats of a simulated conversation. `Agent` is the seat whose
/// prompt is being optimized in the default setup (sales or support rep).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Agent,
    Customer,
}

impl Role {
    pub const ALL: [Role; 2] = [Role::Agent, Role::Customer];

    pub fn other(self) -> Role {
        match self {
            Role::Agent => Role::Customer,
            Role::Customer => Role::Agent,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Agent => f.write_str("agent"),
            Role::Customer => f.write_str("customer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleLabel {
    /// Identifier used by recorded scripts and persisted artifacts, e.g. `sales_agent`.
    pub id: String,
    /// Human label used when rendering a transcript, e.g. `Sales Agent`.
    pub display: String,
}

impl RoleLabel {
    pub fn new(id: impl Into<String>, display: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display: display.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleLabels {
    pub agent: RoleLabel,
    pub customer: RoleLabel,
}

impl RoleLabels {
    pub fn sales() -> Self {
        Self {
            agent: RoleLabel::new("sales_agent", "Sales Agent"),
            customer: RoleLabel::new("customer_agent", "Customer"),
        }
    }

    pub fn support() -> Self {
        Self {
            agent: RoleLabel::new("support_agent", "Support Agent"),
            customer: RoleLabel::new("customer_agent", "Customer"),
        }
    }

    pub fn get(&self, role: Role) -> &RoleLabel {
        match role {
            Role::Agent => &self.agent,
            Role::Customer => &self.customer,
        }
    }

    /// Resolves a speaker name from a recorded script. Accepts the label id,
    /// the display label (case-insensitive) or the bare role name.
    pub fn resolve(&self, speaker: &str) -> Option<Role> {
        let wanted = speaker.trim();
        Role::ALL.into_iter().find(|role| {
            let label = self.get(*role);
            label.id == wanted
                || label.display.eq_ignore_ascii_case(wanted)
                || role.to_string().eq_ignore_ascii_case(wanted)
        })
    }
}

impl Default for RoleLabels {
    fn default() -> Self {
        Self::sales()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationStep {
    pub role: Role,
    pub text: String,
}

impl ConversationStep {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    steps: Vec<ConversationStep>,
}

impl Transcript {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn from_steps(steps: Vec<ConversationStep>) -> Self {
        Self { steps }
    }

    pub fn push(&mut self, step: ConversationStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[ConversationStep] {
        &self.steps
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ConversationStep> {
        self.steps.iter()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn last(&self) -> Option<&ConversationStep> {
        self.steps.last()
    }

    /// True when every step from `from` onward alternates speakers with the
    /// step before it. Steps before `from` are not checked.
    pub fn alternates_from(&self, from: usize) -> bool {
        let start = from.max(1);
        (start..self.steps.len()).all(|i| self.steps[i].role != self.steps[i - 1].role)
    }

    /// `Label: text` lines separated by blank lines.
    pub fn render(&self, labels: &RoleLabels) -> String {
        self.steps
            .iter()
            .map(|step| format!("{}: {}", labels.get(step.role).display, step.text))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl<'a> IntoIterator for &'a Transcript {
    type Item = &'a ConversationStep;
    type IntoIter = std::slice::Iter<'a, ConversationStep>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

/// A step as it appears in recorded script files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptEntry {
    #[serde(alias = "role", alias = "speaker")]
    pub agent: String,
    #[serde(alias = "text")]
    pub message: String,
}

/// Source of start offsets for simulation prefixes.
pub trait StartPicker: Send {
    /// Returns a value in `0..upper_exclusive`. `upper_exclusive` is never 0.
    fn pick(&mut self, upper_exclusive: usize) -> usize;
}

#[derive(Debug)]
pub struct RandomStartPicker {
    rng: StdRng,
}

impl RandomStartPicker {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomStartPicker {
    fn default() -> Self {
        Self::new()
    }
}

impl StartPicker for RandomStartPicker {
    fn pick(&mut self, upper_exclusive: usize) -> usize {
        self.rng.gen_range(0..upper_exclusive.max(1))
    }
}

/// Replays a fixed list of offsets, wrapping around. Values past the bound are
/// reduced modulo the bound.
#[derive(Debug, Clone)]
pub struct SequenceStartPicker {
    values: Vec<usize>,
    cursor: usize,
}

impl SequenceStartPicker {
    pub fn new(values: impl Into<Vec<usize>>) -> Self {
        Self {
            values: values.into(),
            cursor: 0,
        }
    }
}

impl StartPicker for SequenceStartPicker {
    fn pick(&mut self, upper_exclusive: usize) -> usize {
        if self.values.is_empty() {
            return 0;
        }
        let value = self.values[self.cursor % self.values.len()];
        self.cursor += 1;
        value % upper_exclusive.max(1)
    }
}

/// The canonical recorded conversation simulations are seeded from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationScript {
    steps: Vec<ConversationStep>,
}

impl ConversationScript {
    pub fn new(steps: Vec<ConversationStep>) -> Self {
        Self { steps }
    }

    pub fn from_entries(entries: &[ScriptEntry], labels: &RoleLabels) -> Result<Self, ScriptError> {
        let steps = entries
            .iter()
            .map(|entry| {
                labels
                    .resolve(&entry.agent)
                    .map(|role| ConversationStep::new(role, entry.message.clone()))
                    .ok_or_else(|| ScriptError::UnknownSpeaker(entry.agent.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn steps(&self) -> &[ConversationStep] {
        &self.steps
    }

    /// Up to `length` steps starting at `start_index`. Shorter when the script
    /// runs out; never padded.
    pub fn slice(&self, start_index: usize, length: usize) -> Result<Transcript, ScriptError> {
        if start_index >= self.steps.len() {
            return Err(ScriptError::OutOfRange {
                index: start_index,
                len: self.steps.len(),
            });
        }

        let end = start_index.saturating_add(length).min(self.steps.len());
        Ok(Transcript::from_steps(self.steps[start_index..end].to_vec()))
    }

    /// A start offset in `[0, len - 2]`, so at least one recorded step follows it.
    pub fn random_start_index(&self, picker: &mut dyn StartPicker) -> Result<usize, ScriptError> {
        if self.steps.len() < 2 {
            return Err(ScriptError::TooShort(self.steps.len()));
        }
        let upper = self.steps.len() - 1;
        Ok(picker.pick(upper).min(upper - 1))
    }
}
