//! Scenario files: the recorded script, starting prompts and rubric for one
//! conversation type. Files are YAML or JSON.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    conversation::{ConversationScript, Role, RoleLabels, ScriptEntry, ScriptError},
    judge::{ConversationKind, Rubric},
    simulation::RolePrompts,
};

const EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("no scenario `{id}` in {dir} (looked for .yaml, .yml and .json)")]
    NotFound { id: String, dir: PathBuf },
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("invalid scenario {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
    #[error("script of {path}: {source}")]
    Script {
        path: PathBuf,
        #[source]
        source: ScriptError,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScenarioFile {
    id: String,
    #[serde(default)]
    description: Option<String>,
    kind: ConversationKind,
    #[serde(default)]
    labels: Option<RoleLabels>,
    #[serde(default)]
    script: Vec<ScriptEntry>,
    #[serde(default)]
    script_path: Option<PathBuf>,
    prompts: RolePrompts,
    rubric: Rubric,
    #[serde(default)]
    max_turns: Option<usize>,
    #[serde(default)]
    prefix_length: Option<usize>,
    #[serde(default)]
    opener: Option<Role>,
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub id: String,
    pub description: Option<String>,
    pub kind: ConversationKind,
    pub labels: RoleLabels,
    pub script: ConversationScript,
    pub prompts: RolePrompts,
    pub rubric: Rubric,
    pub max_turns: Option<usize>,
    pub prefix_length: Option<usize>,
    pub opener: Option<Role>,
    pub source: PathBuf,
}

pub fn default_labels(kind: ConversationKind) -> RoleLabels {
    match kind {
        ConversationKind::Sales => RoleLabels::sales(),
        ConversationKind::Support => RoleLabels::support(),
    }
}

/// Finds `<dir>/<id>.yaml`, `.yml` or `.json`, in that order.
pub fn resolve(dir: impl AsRef<Path>, id: &str) -> Result<PathBuf, ScenarioError> {
    let dir = dir.as_ref();
    EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{id}.{ext}")))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| ScenarioError::NotFound {
            id: id.to_string(),
            dir: dir.to_path_buf(),
        })
}

pub fn load_scenario(path: impl AsRef<Path>) -> Result<Scenario, ScenarioError> {
    let path = path.as_ref();
    let file: ScenarioFile = read_structured(path)?;

    let labels = file.labels.unwrap_or_else(|| default_labels(file.kind));
    let entries = match (&file.script_path, file.script.is_empty()) {
        (Some(_), false) => {
            return Err(invalid(path, "set either `script` or `script_path`, not both"));
        }
        (Some(script_path), true) => {
            let base = path.parent().unwrap_or_else(|| Path::new("."));
            read_structured::<Vec<ScriptEntry>>(&base.join(script_path))?
        }
        (None, _) => file.script,
    };
    let script = ConversationScript::from_entries(&entries, &labels).map_err(|source| {
        ScenarioError::Script {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let scenario = Scenario {
        id: file.id,
        description: file.description,
        kind: file.kind,
        labels,
        script,
        prompts: file.prompts,
        rubric: file.rubric,
        max_turns: file.max_turns,
        prefix_length: file.prefix_length,
        opener: file.opener,
        source: path.to_path_buf(),
    };
    scenario.validate()?;
    Ok(scenario)
}

/// Loads every scenario file in `dir`, sorted by id.
pub fn load_scenarios(dir: impl AsRef<Path>) -> Result<Vec<Scenario>, ScenarioError> {
    let dir = dir.as_ref();
    let io_error = |source| ScenarioError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut scenarios = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
        if path.is_file() && EXTENSIONS.contains(&ext) {
            scenarios.push(load_scenario(&path)?);
        }
    }
    scenarios.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(scenarios)
}

impl Scenario {
    fn validate(&self) -> Result<(), ScenarioError> {
        if self.id.trim().is_empty() {
            return Err(invalid(&self.source, "id is empty"));
        }
        if self.script.len() < 2 {
            return Err(ScenarioError::Script {
                path: self.source.clone(),
                source: ScriptError::TooShort(self.script.len()),
            });
        }
        if self.labels.agent.id == self.labels.customer.id {
            return Err(invalid(&self.source, "both roles share the same label id"));
        }
        for role in Role::ALL {
            if self.prompts.get(role).trim().is_empty() {
                return Err(invalid(&self.source, &format!("{role} prompt is empty")));
            }
        }
        if self.rubric.kind != self.kind {
            return Err(invalid(&self.source, "rubric kind does not match scenario kind"));
        }
        self.rubric
            .validate()
            .map_err(|error| invalid(&self.source, &error.to_string()))?;
        if self.prefix_length == Some(0) {
            return Err(invalid(&self.source, "prefix_length must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(path: &Path, reason: &str) -> ScenarioError {
    ScenarioError::Invalid {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn read_structured<T: DeserializeOwned>(path: &Path) -> Result<T, ScenarioError> {
    let bytes = fs::read(path).map_err(|source| ScenarioError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let parsed = if ext == "json" {
        serde_json::from_slice(&bytes).map_err(|e| e.to_string())
    } else {
        serde_yaml::from_slice(&bytes).map_err(|e| e.to_string())
    };
    parsed.map_err(|message| ScenarioError::Parse {
        path: path.to_path_buf(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    const MINIMAL: &str = r#"
id: refund
kind: support
script:
  - agent: customer_agent
    message: Where is my refund?
  - agent: support_agent
    message: Let me check.
prompts:
  agent: Be helpful.
  customer: Be upset.
rubric:
  id: refund-grader
  kind: support
  criteria: Did the agent resolve the refund?
"#;

    #[test]
    fn loads_inline_script_with_default_labels() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("refund.yaml"), MINIMAL).unwrap();

        let path = resolve(dir.path(), "refund").unwrap();
        let scenario = load_scenario(path).unwrap();
        assert_eq!(scenario.labels, RoleLabels::support());
        assert_eq!(scenario.script.len(), 2);
        assert_eq!(scenario.script.steps()[0].role, Role::Customer);
        assert_eq!(scenario.rubric.version, "1");
        assert_eq!(scenario.rubric.evaluated_roles, Role::ALL.to_vec());
    }

    #[test]
    fn script_path_is_relative_to_the_scenario() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("scripts")).unwrap();
        fs::write(
            dir.path().join("scripts/call.json"),
            r#"[{"agent": "sales_agent", "message": "Hi"}, {"role": "customer", "text": "Hello"}]"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("call.json"),
            r#"{
                "id": "call", "kind": "sales", "script_path": "scripts/call.json",
                "prompts": {"agent": "sell", "customer": "resist"},
                "rubric": {"id": "r", "kind": "sales", "criteria": "c"}
            }"#,
        )
        .unwrap();

        let scenario = load_scenario(resolve(dir.path(), "call").unwrap()).unwrap();
        assert_eq!(scenario.script.steps()[1].role, Role::Customer);
        assert_eq!(scenario.script.steps()[1].text, "Hello");
    }

    #[test]
    fn missing_scenario_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            resolve(dir.path(), "nope"),
            Err(ScenarioError::NotFound { .. })
        ));
    }

    #[test]
    fn unknown_speaker_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let body = MINIMAL.replace("agent: support_agent", "agent: manager");
        fs::write(dir.path().join("refund.yaml"), body).unwrap();

        let err = load_scenario(dir.path().join("refund.yaml")).unwrap_err();
        assert!(matches!(
            err,
            ScenarioError::Script {
                source: ScriptError::UnknownSpeaker(_),
                ..
            }
        ));
    }

    #[test]
    fn shipped_scenarios_load() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("scenarios");
        let scenarios = load_scenarios(dir).unwrap();
        let ids = scenarios.iter().map(|s| s.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["sales-call", "support-call"]);
        assert!(scenarios[0].script.len() > 100);
        assert_eq!(scenarios[1].opener, Some(Role::Customer));
    }
}
