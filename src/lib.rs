pub mod error;
pub mod providers;
pub mod types;
pub mod models;
pub mod conversation;
pub mod turns;
pub mod simulation;
pub mod judge;
pub mod optimizer;
pub mod record;
pub mod sink;
pub mod optimization;
pub mod scenario;
pub mod calibration;
pub mod config;
mod prompts;

pub use error::LLMError;
pub use providers::LLMProvider;
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};
pub use models::{ConversationModel, DialogueMessage, ProviderModel, Speaker, StructuredModel, StructuredRequest};
pub use conversation::{
    ConversationScript,
    ConversationStep,
    RandomStartPicker,
    Role,
    RoleLabel,
    RoleLabels,
    ScriptEntry,
    ScriptError,
    SequenceStartPicker,
    StartPicker,
    Transcript,
};
pub use turns::{GeneratedTurn, TurnGenerator, DEFAULT_TERMINATION_TOKEN};
pub use simulation::{RolePrompts, SimulationError, SimulationOutcome, SimulationRunner, SimulationState};
pub use judge::{ConversationKind, EvaluationResult, Judge, JudgeError, RoleVerdict, Rubric};
pub use optimizer::{OptimizeError, Optimizer, PromptRevision};
pub use record::{IterationSummary, OptimizationRun, SimulationRecord, StopReason};
pub use sink::{JsonFileSink, MemorySink, ResultsSink, SinkError};
pub use optimization::{LoopError, OptimizationLoop};
pub use scenario::{Scenario, ScenarioError};
pub use calibration::{CalibrationReport, Calibrator, LabeledTranscript, RubricRefiner, RubricRevision};
pub use config::{ConfigError, FailurePolicy, LoopConfig, ModelSettings, StopPolicy};
