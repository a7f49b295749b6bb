//! Rubric-driven grading of finished transcripts.

use std::{collections::BTreeMap, sync::Arc};

use jsonschema::{Draft, JSONSchema};
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::{
    conversation::{Role, RoleLabels, Transcript},
    models::{StructuredModel, StructuredRequest},
    prompts, LLMError,
};

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("judge response violated the verdict schema: {0}")]
    SchemaViolation(String),
    #[error("invalid rubric: {0}")]
    InvalidRubric(String),
    #[error("template render error: {0}")]
    TemplateRender(#[from] handlebars::RenderError),
    #[error(transparent)]
    Model(LLMError),
}

impl From<LLMError> for JudgeError {
    fn from(error: LLMError) -> Self {
        match error {
            LLMError::SchemaMismatch(reason) => JudgeError::SchemaViolation(reason),
            other => JudgeError::Model(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Sales,
    Support,
}

impl ConversationKind {
    pub fn participants(self) -> &'static str {
        match self {
            ConversationKind::Sales => "a sales agent and a potential customer",
            ConversationKind::Support => "a customer support agent and an upset customer",
        }
    }
}

fn default_version() -> String {
    "1".to_string()
}

fn default_roles() -> Vec<Role> {
    Role::ALL.to_vec()
}

/// Versioned pass/fail criteria for one conversation type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rubric {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub kind: ConversationKind,
    /// Replaces the default judge persona when set.
    #[serde(default)]
    pub system_prompt: Option<String>,
    pub criteria: String,
    #[serde(default = "default_roles")]
    pub evaluated_roles: Vec<Role>,
}

impl Rubric {
    pub fn new(id: impl Into<String>, kind: ConversationKind, criteria: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            kind,
            system_prompt: None,
            criteria: criteria.into(),
            evaluated_roles: default_roles(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_evaluated_roles(mut self, roles: Vec<Role>) -> Self {
        self.evaluated_roles = roles;
        self
    }

    pub fn validate(&self) -> Result<(), JudgeError> {
        if self.criteria.trim().is_empty() {
            return Err(JudgeError::InvalidRubric(format!("rubric {} has no criteria", self.id)));
        }
        if self.evaluated_roles.is_empty() {
            return Err(JudgeError::InvalidRubric(format!(
                "rubric {} evaluates no roles",
                self.id
            )));
        }
        Ok(())
    }
}

/// What the judge returns for each evaluated participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RoleVerdict {
    /// True when the participant met every criterion that applies to it.
    pub passed: bool,
    /// Brief justification of the verdict.
    pub feedback: String,
}

/// Per-role verdicts for one simulation. `overall_passed` is always the
/// conjunction of the per-role results.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    role_passed: BTreeMap<Role, bool>,
    feedback: BTreeMap<Role, String>,
    overall_passed: bool,
}

impl EvaluationResult {
    pub fn from_verdicts<I>(verdicts: I) -> Self
    where
        I: IntoIterator<Item = (Role, RoleVerdict)>,
    {
        let mut role_passed = BTreeMap::new();
        let mut feedback = BTreeMap::new();
        for (role, verdict) in verdicts {
            role_passed.insert(role, verdict.passed);
            feedback.insert(role, verdict.feedback);
        }
        let overall_passed = role_passed.values().all(|passed| *passed);

        Self {
            role_passed,
            feedback,
            overall_passed,
        }
    }

    /// Sentinel for a simulation that never reached a verdict: every role
    /// fails and carries the error text as feedback.
    pub fn failed(roles: &[Role], reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::from_verdicts(roles.iter().map(|role| {
            (
                *role,
                RoleVerdict {
                    passed: false,
                    feedback: reason.clone(),
                },
            )
        }))
    }

    pub fn overall_passed(&self) -> bool {
        self.overall_passed
    }

    pub fn passed(&self, role: Role) -> Option<bool> {
        self.role_passed.get(&role).copied()
    }

    pub fn feedback(&self, role: Role) -> Option<&str> {
        self.feedback.get(&role).map(String::as_str)
    }

    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.role_passed.keys().copied()
    }

    pub fn role_passed(&self) -> &BTreeMap<Role, bool> {
        &self.role_passed
    }
}

#[derive(Serialize)]
struct RoleEntry {
    key: String,
    display: String,
}

#[derive(Serialize)]
struct JudgePromptData<'a> {
    kind: &'a str,
    transcript: String,
    rubric_id: &'a str,
    rubric_version: &'a str,
    criteria: &'a str,
    roles: Vec<RoleEntry>,
}

#[derive(Clone)]
pub struct Judge {
    model: Arc<dyn StructuredModel>,
    labels: RoleLabels,
}

impl Judge {
    pub fn new(model: Arc<dyn StructuredModel>) -> Self {
        Self {
            model,
            labels: RoleLabels::default(),
        }
    }

    pub fn with_labels(mut self, labels: RoleLabels) -> Self {
        self.labels = labels;
        self
    }

    pub fn labels(&self) -> &RoleLabels {
        &self.labels
    }

    pub async fn evaluate(
        &self,
        transcript: &Transcript,
        rubric: &Rubric,
    ) -> Result<EvaluationResult, JudgeError> {
        rubric.validate()?;

        let request = StructuredRequest {
            system: Some(
                rubric
                    .system_prompt
                    .clone()
                    .unwrap_or_else(|| prompts::JUDGE_SYSTEM.to_string()),
            ),
            prompt: self.render_prompt(transcript, rubric)?,
            schema_name: "conversation_evaluation".to_string(),
            schema: self.verdict_schema(&rubric.evaluated_roles)?,
        };

        let response = self.model.complete_structured(&request).await?;
        self.parse_verdicts(&request.schema, &response, &rubric.evaluated_roles)
    }

    pub fn render_prompt(&self, transcript: &Transcript, rubric: &Rubric) -> Result<String, JudgeError> {
        let data = JudgePromptData {
            kind: rubric.kind.participants(),
            transcript: transcript.render(&self.labels),
            rubric_id: &rubric.id,
            rubric_version: &rubric.version,
            criteria: &rubric.criteria,
            roles: rubric
                .evaluated_roles
                .iter()
                .map(|role| {
                    let label = self.labels.get(*role);
                    RoleEntry {
                        key: label.id.clone(),
                        display: label.display.clone(),
                    }
                })
                .collect(),
        };
        Ok(prompts::render(prompts::JUDGE_TEMPLATE, &data)?)
    }

    /// One required `{passed, feedback}` object per evaluated role, keyed by
    /// the role's label id.
    pub fn verdict_schema(&self, roles: &[Role]) -> Result<Value, JudgeError> {
        let mut verdict = serde_json::to_value(schema_for!(RoleVerdict))
            .map_err(|error| JudgeError::Model(LLMError::Serialization(error)))?;
        if let Some(object) = verdict.as_object_mut() {
            object.remove("$schema");
            object.remove("title");
        }

        let mut properties = Map::new();
        let mut required = Vec::new();
        for role in roles {
            let key = self.labels.get(*role).id.clone();
            properties.insert(key.clone(), verdict.clone());
            required.push(Value::String(key));
        }

        Ok(json!({
            "type": "object",
            "properties": properties,
            "required": required,
            "additionalProperties": false,
        }))
    }

    fn parse_verdicts(
        &self,
        schema: &Value,
        response: &Value,
        roles: &[Role],
    ) -> Result<EvaluationResult, JudgeError> {
        let compiled = JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(schema)
            .map_err(|error| JudgeError::SchemaViolation(format!("verdict schema did not compile: {error}")))?;

        if let Err(errors) = compiled.validate(response) {
            let details = errors.take(5).map(|e| e.to_string()).collect::<Vec<_>>();
            return Err(JudgeError::SchemaViolation(details.join("; ")));
        }

        let mut verdicts = Vec::with_capacity(roles.len());
        for role in roles {
            let key = &self.labels.get(*role).id;
            let raw = response
                .get(key)
                .cloned()
                .ok_or_else(|| JudgeError::SchemaViolation(format!("missing verdict for {key}")))?;
            let verdict: RoleVerdict = serde_json::from_value(raw)
                .map_err(|error| JudgeError::SchemaViolation(format!("{key}: {error}")))?;
            verdicts.push((*role, verdict));
        }

        Ok(EvaluationResult::from_verdicts(verdicts))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use crate::{
        conversation::{ConversationStep, Role, RoleLabels, Transcript},
        models::{StructuredModel, StructuredRequest},
        LLMError,
    };

    use super::*;

    struct CannedJudge {
        response: Value,
        seen: Mutex<Vec<StructuredRequest>>,
    }

    #[async_trait]
    impl StructuredModel for CannedJudge {
        async fn complete_structured(&self, request: &StructuredRequest) -> Result<Value, LLMError> {
            self.seen.lock().unwrap().push(request.clone());
            Ok(self.response.clone())
        }
    }

    fn transcript() -> Transcript {
        Transcript::from_steps(vec![
            ConversationStep::new(Role::Agent, "Hi, Alex from Truss Payments."),
            ConversationStep::new(Role::Customer, "We're paying 3.5% with PayPal."),
        ])
    }

    fn rubric() -> Rubric {
        Rubric::new(
            "sales-grader",
            ConversationKind::Sales,
            "1. Did the sales agent introduce Truss Payments?",
        )
        .with_version("3")
    }

    #[tokio::test]
    async fn parses_per_role_verdicts() {
        let model = Arc::new(CannedJudge {
            response: json!({
                "sales_agent": {"passed": true, "feedback": "clear intro"},
                "customer_agent": {"passed": false, "feedback": "too agreeable"}
            }),
            seen: Mutex::new(Vec::new()),
        });
        let judge = Judge::new(model.clone()).with_labels(RoleLabels::sales());

        let result = judge.evaluate(&transcript(), &rubric()).await.unwrap();
        assert_eq!(result.passed(Role::Agent), Some(true));
        assert_eq!(result.passed(Role::Customer), Some(false));
        assert_eq!(result.feedback(Role::Customer), Some("too agreeable"));
        assert!(!result.overall_passed());

        let request = model.seen.lock().unwrap().remove(0);
        assert!(request.prompt.contains("Sales Agent: Hi, Alex from Truss Payments."));
        assert!(request.prompt.contains("rubric sales-grader v3"));
        assert_eq!(request.schema["required"], json!(["sales_agent", "customer_agent"]));
    }

    #[tokio::test]
    async fn malformed_response_is_schema_violation() {
        let model = Arc::new(CannedJudge {
            response: json!({"sales_agent": {"passed": "yes"}}),
            seen: Mutex::new(Vec::new()),
        });
        let judge = Judge::new(model).with_labels(RoleLabels::sales());

        let err = judge.evaluate(&transcript(), &rubric()).await.unwrap_err();
        assert!(matches!(err, JudgeError::SchemaViolation(_)));
    }

    #[tokio::test]
    async fn single_role_rubric_only_requires_that_role() {
        let model = Arc::new(CannedJudge {
            response: json!({"support_agent": {"passed": true, "feedback": "empathetic"}}),
            seen: Mutex::new(Vec::new()),
        });
        let judge = Judge::new(model).with_labels(RoleLabels::support());
        let rubric = Rubric::new("support", ConversationKind::Support, "De-escalate.")
            .with_evaluated_roles(vec![Role::Agent]);

        let result = judge.evaluate(&transcript(), &rubric).await.unwrap();
        assert!(result.overall_passed());
        assert_eq!(result.roles().collect::<Vec<_>>(), vec![Role::Agent]);
    }

    #[test]
    fn overall_is_conjunction() {
        let pass = RoleVerdict { passed: true, feedback: String::new() };
        let fail = RoleVerdict { passed: false, feedback: String::new() };

        assert!(EvaluationResult::from_verdicts([(Role::Agent, pass.clone()), (Role::Customer, pass.clone())])
            .overall_passed());
        assert!(!EvaluationResult::from_verdicts([(Role::Agent, pass), (Role::Customer, fail)])
            .overall_passed());

        let sentinel = EvaluationResult::failed(&Role::ALL, "timed out");
        assert!(!sentinel.overall_passed());
        assert_eq!(sentinel.feedback(Role::Agent), Some("timed out"));
    }

    #[test]
    fn empty_criteria_is_rejected() {
        let rubric = Rubric::new("empty", ConversationKind::Sales, "  ");
        assert!(matches!(rubric.validate(), Err(JudgeError::InvalidRubric(_))));
    }

    #[test]
    fn serialized_evaluation_uses_camel_case() {
        let result = EvaluationResult::failed(&[Role::Agent], "boom");
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["overallPassed"], json!(false));
        assert_eq!(value["rolePassed"]["agent"], json!(false));
    }
}
