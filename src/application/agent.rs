use crate::application::tooling::ToolRegistry;
use crate::application::validation::{self, SchemaSpec, Verdict};
use crate::domain::types::{ChatMessage, ToolCall, Transcript};
use crate::infrastructure::model::{ModelError, ModelProvider, ModelRequest};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_TURNS: usize = 10;

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub model: String,
    pub max_turns: usize,
}

impl AgentOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_max_turns(mut self, max_turns: usize) -> Self {
        self.max_turns = max_turns;
        self
    }
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Provider(#[from] ModelError),
    #[error("assistant returned an empty final reply")]
    EmptyReply,
    #[error("no schema-conformant answer after {turns} turns")]
    TurnBudgetExhausted { turns: usize },
}

/// One dispatched tool call, recorded for the caller's benefit.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStep {
    pub tool: String,
    pub arguments: String,
    pub output: Value,
}

#[derive(Debug, Clone)]
pub struct ExtractionOutcome {
    /// The accepted, schema-conformant record.
    pub record: Value,
    /// Validation attempts consumed (tool turns excluded).
    pub turns: usize,
    pub steps: Vec<ToolStep>,
}

/// Conversation states. Tool dispatch never consumes a validation turn;
/// only `Validating` advances the counter toward `Exhausted`.
enum TurnState {
    AwaitingReply,
    ToolDispatch {
        content: String,
        calls: Vec<ToolCall>,
    },
    Validating {
        content: String,
    },
    CorrectionAppended,
    Exhausted,
}

/// Drives a bounded tool-calling conversation until the model produces a
/// schema-conformant JSON record or the turn budget runs out. Run state is
/// created per invocation and discarded on return; the provider and registry
/// are the only shared pieces.
pub struct Agent<P: ModelProvider> {
    provider: Arc<P>,
    registry: Arc<ToolRegistry>,
    options: AgentOptions,
}

impl<P: ModelProvider> Agent<P> {
    pub fn new(provider: Arc<P>, registry: Arc<ToolRegistry>, options: AgentOptions) -> Self {
        Self {
            provider,
            registry,
            options,
        }
    }

    pub async fn run(
        &self,
        seed_text: &str,
        schema: &SchemaSpec,
    ) -> Result<ExtractionOutcome, AgentError> {
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            max_turns = self.options.max_turns,
            "Extraction run started"
        );

        let mut transcript = Transcript::new();
        transcript.append(ChatMessage::system(self.system_instruction(schema)));
        transcript.append(ChatMessage::user(seed_text));

        let mut turn = 0usize;
        let mut steps = Vec::new();
        let mut state = TurnState::AwaitingReply;

        loop {
            state = match state {
                TurnState::AwaitingReply => {
                    debug!(%run_id, turn, messages = transcript.len(), "Submitting turn to provider");
                    let reply = self
                        .provider
                        .complete(ModelRequest {
                            model: self.options.model.clone(),
                            messages: transcript.messages().to_vec(),
                            tools: self.registry.definitions(),
                        })
                        .await?;

                    if !reply.tool_calls.is_empty() {
                        // Content alongside tool calls is recorded but does
                        // not terminate the run.
                        TurnState::ToolDispatch {
                            content: reply.content.unwrap_or_default(),
                            calls: reply.tool_calls,
                        }
                    } else {
                        let content = reply.content.unwrap_or_default();
                        if content.trim().is_empty() {
                            warn!(%run_id, "Provider produced no answer at all");
                            return Err(AgentError::EmptyReply);
                        }
                        TurnState::Validating { content }
                    }
                }
                TurnState::ToolDispatch { content, calls } => {
                    info!(%run_id, calls = calls.len(), "Assistant requested tool execution");
                    transcript.append(ChatMessage::assistant(content, calls.clone()));
                    // Results are appended in the provider's request order so
                    // tool_call_id correlation stays deterministic.
                    for call in &calls {
                        let output = self.registry.dispatch(&call.name, &call.arguments).await;
                        steps.push(ToolStep {
                            tool: call.name.clone(),
                            arguments: call.arguments.clone(),
                            output: output.clone(),
                        });
                        transcript.append(ChatMessage::tool_result(call, output.to_string()));
                    }
                    TurnState::AwaitingReply
                }
                TurnState::Validating { content } => {
                    turn += 1;
                    match validation::accept(&content, schema) {
                        Verdict::Accepted(record) => {
                            info!(%run_id, turn, "Extraction accepted");
                            return Ok(ExtractionOutcome {
                                record,
                                turns: turn,
                                steps,
                            });
                        }
                        Verdict::Unparsable => {
                            warn!(%run_id, turn, "Final reply was not parseable");
                            transcript.append(ChatMessage::assistant(content, Vec::new()));
                            if turn >= self.options.max_turns {
                                TurnState::Exhausted
                            } else {
                                transcript.append(ChatMessage::user(self.parse_correction(schema)));
                                TurnState::CorrectionAppended
                            }
                        }
                        Verdict::Mismatch(problems) => {
                            warn!(%run_id, turn, ?problems, "Final reply failed schema check");
                            transcript.append(ChatMessage::assistant(content, Vec::new()));
                            if turn >= self.options.max_turns {
                                TurnState::Exhausted
                            } else {
                                transcript.append(ChatMessage::user(
                                    self.mismatch_correction(schema, &problems),
                                ));
                                TurnState::CorrectionAppended
                            }
                        }
                    }
                }
                TurnState::CorrectionAppended => TurnState::AwaitingReply,
                TurnState::Exhausted => {
                    warn!(%run_id, turn, "Turn budget exhausted without acceptance");
                    return Err(AgentError::TurnBudgetExhausted { turns: turn });
                }
            };
        }
    }

    fn system_instruction(&self, schema: &SchemaSpec) -> String {
        let mut lines = vec![
            "You extract structured production call sheet data from raw text.".to_string(),
            format!(
                "Reply with a single JSON object containing exactly these fields: {}.",
                schema.describe()
            ),
            "Output raw JSON only, with no commentary and no code fences.".to_string(),
        ];
        if !self.registry.is_empty() {
            lines.push(
                "Use the provided tools to normalize and geocode shooting locations when that improves the result."
                    .to_string(),
            );
        }
        lines.join(" ")
    }

    fn parse_correction(&self, schema: &SchemaSpec) -> String {
        format!(
            "Your last reply was not valid JSON. Respond with a single JSON object containing the fields {} and nothing else: no commentary, no code fences.",
            schema.describe()
        )
    }

    fn mismatch_correction(&self, schema: &SchemaSpec, problems: &[String]) -> String {
        format!(
            "Your last reply had missing or mistyped fields: {}. Respond with a single JSON object containing the fields {} and nothing else.",
            problems.join(", "),
            schema.describe()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::tooling::address::NormalizeAddress;
    use crate::application::validation::{FieldKind, FieldSpec};
    use crate::domain::types::MessageRole;
    use crate::infrastructure::model::ModelReply;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Clone)]
    struct ScriptedProvider {
        replies: Arc<Mutex<Vec<ModelReply>>>,
        recordings: Arc<Mutex<Vec<ModelRequest>>>,
    }

    impl ScriptedProvider {
        fn new(replies: Vec<ModelReply>) -> Self {
            Self {
                replies: Arc::new(Mutex::new(replies)),
                recordings: Arc::new(Mutex::new(Vec::new())),
            }
        }

        async fn requests(&self) -> Vec<ModelRequest> {
            self.recordings.lock().await.clone()
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        async fn complete(&self, request: ModelRequest) -> Result<ModelReply, ModelError> {
            self.recordings.lock().await.push(request);
            let mut replies = self.replies.lock().await;
            Ok(replies.remove(0))
        }
    }

    struct FailingProvider;

    #[async_trait]
    impl ModelProvider for FailingProvider {
        async fn complete(&self, _request: ModelRequest) -> Result<ModelReply, ModelError> {
            Err(ModelError::InvalidResponse("missing choices[0].message".into()))
        }
    }

    fn final_reply(content: &str) -> ModelReply {
        ModelReply {
            content: Some(content.to_string()),
            tool_calls: Vec::new(),
        }
    }

    fn tool_reply(content: Option<&str>, calls: Vec<(&str, &str, &str)>) -> ModelReply {
        ModelReply {
            content: content.map(String::from),
            tool_calls: calls
                .into_iter()
                .map(|(id, name, arguments)| ToolCall {
                    id: id.into(),
                    name: name.into(),
                    arguments: arguments.into(),
                })
                .collect(),
        }
    }

    fn schema() -> SchemaSpec {
        SchemaSpec::new(vec![
            FieldSpec {
                name: "date".into(),
                kind: FieldKind::String,
            },
            FieldSpec {
                name: "projectName".into(),
                kind: FieldKind::String,
            },
            FieldSpec {
                name: "locations".into(),
                kind: FieldKind::Array,
            },
        ])
    }

    fn registry() -> Arc<ToolRegistry> {
        Arc::new(ToolRegistry::new().register(Arc::new(NormalizeAddress)))
    }

    fn agent(provider: ScriptedProvider, max_turns: usize) -> Agent<ScriptedProvider> {
        Agent::new(
            Arc::new(provider),
            registry(),
            AgentOptions::new("test-model").with_max_turns(max_turns),
        )
    }

    const CONFORMANT: &str = r#"{"date":"2024-05-01","projectName":"Night Shift","locations":["stage 4"]}"#;

    #[tokio::test]
    async fn returns_parsed_record_on_first_conformant_reply() {
        let provider = ScriptedProvider::new(vec![final_reply(CONFORMANT)]);
        let outcome = agent(provider.clone(), 10)
            .run("CALL SHEET …", &schema())
            .await
            .expect("run succeeds");

        assert_eq!(outcome.record["projectName"], "Night Shift");
        assert_eq!(outcome.turns, 1);
        assert!(outcome.steps.is_empty());

        let records = provider.requests().await;
        assert_eq!(records.len(), 1);
        let first = &records[0];
        assert_eq!(first.messages[0].role, MessageRole::System);
        assert!(first.messages[0].content.contains("projectName (string)"));
        assert!(first.messages[1].content.contains("CALL SHEET"));
        assert_eq!(first.tools.len(), 1);
    }

    #[tokio::test]
    async fn tool_round_trip_appends_ordered_tool_messages() {
        let provider = ScriptedProvider::new(vec![
            tool_reply(
                None,
                vec![("call_1", "normalize_address", r#"{"address":"1 Main st"}"#)],
            ),
            final_reply(CONFORMANT),
        ]);
        let outcome = agent(provider.clone(), 10)
            .run("raw text", &schema())
            .await
            .expect("run succeeds");

        assert_eq!(outcome.steps.len(), 1);
        assert_eq!(outcome.steps[0].tool, "normalize_address");

        let records = provider.requests().await;
        assert_eq!(records.len(), 2);
        let second = &records[1];
        // seed system + user, then assistant w/ tool_calls, then tool result
        assert_eq!(second.messages[2].role, MessageRole::Assistant);
        assert_eq!(second.messages[2].tool_calls[0].id, "call_1");
        assert_eq!(second.messages[3].role, MessageRole::Tool);
        assert_eq!(second.messages[3].tool_call_id.as_deref(), Some("call_1"));
        assert!(second.messages[3].content.contains("Main Street"));
    }

    #[tokio::test]
    async fn multiple_tool_calls_keep_provider_order() {
        let provider = ScriptedProvider::new(vec![
            tool_reply(
                None,
                vec![
                    ("call_a", "normalize_address", r#"{"address":"2 Oak ave"}"#),
                    ("call_b", "normalize_address", r#"{"address":"3 Elm rd"}"#),
                ],
            ),
            final_reply(CONFORMANT),
        ]);
        agent(provider.clone(), 10)
            .run("raw text", &schema())
            .await
            .expect("run succeeds");

        let second = &provider.requests().await[1];
        let ids: Vec<_> = second
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Tool)
            .map(|m| m.tool_call_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["call_a", "call_b"]);
    }

    #[tokio::test]
    async fn unknown_tool_feeds_error_back_and_continues() {
        let provider = ScriptedProvider::new(vec![
            tool_reply(None, vec![("call_1", "reverse_geocode", "{}")]),
            final_reply(CONFORMANT),
        ]);
        let outcome = agent(provider.clone(), 10)
            .run("raw text", &schema())
            .await
            .expect("run continues past the tool failure");

        assert!(outcome.steps[0].output.get("error").is_some());

        let second = &provider.requests().await[1];
        let tool_message = second
            .messages
            .iter()
            .find(|m| m.role == MessageRole::Tool)
            .expect("tool message present");
        let decoded: Value = serde_json::from_str(&tool_message.content).expect("valid JSON");
        assert!(decoded.get("error").is_some());
    }

    #[tokio::test]
    async fn tool_turn_content_is_recorded_but_not_validated() {
        let provider = ScriptedProvider::new(vec![
            tool_reply(
                Some("Let me check that address."),
                vec![("call_1", "normalize_address", r#"{"address":"1 Main st"}"#)],
            ),
            final_reply(CONFORMANT),
        ]);
        let outcome = agent(provider.clone(), 10)
            .run("raw text", &schema())
            .await
            .expect("run succeeds");
        assert_eq!(outcome.turns, 1);

        let second = &provider.requests().await[1];
        assert_eq!(second.messages[2].content, "Let me check that address.");
        assert!(!second.messages[2].tool_calls.is_empty());
    }

    #[tokio::test]
    async fn corrective_instruction_follows_unparsable_reply() {
        let provider = ScriptedProvider::new(vec![
            final_reply("Sure! The shoot is on May 1st."),
            final_reply(CONFORMANT),
        ]);
        let outcome = agent(provider.clone(), 10)
            .run("raw text", &schema())
            .await
            .expect("run succeeds");
        assert_eq!(outcome.turns, 2);

        let second = &provider.requests().await[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.role, MessageRole::User);
        assert!(last.content.contains("not valid JSON"));
        // raw assistant content is preserved right before the corrective
        assert!(second.messages[second.messages.len() - 2]
            .content
            .contains("May 1st"));
    }

    #[tokio::test]
    async fn mismatch_corrective_names_the_field() {
        let variant = SchemaSpec::new(vec![
            FieldSpec {
                name: "date".into(),
                kind: FieldKind::String,
            },
            FieldSpec {
                name: "projectName".into(),
                kind: FieldKind::String,
            },
            FieldSpec {
                name: "productionCompany".into(),
                kind: FieldKind::String,
            },
            FieldSpec {
                name: "locations".into(),
                kind: FieldKind::Array,
            },
        ]);
        let provider = ScriptedProvider::new(vec![
            final_reply(CONFORMANT),
            final_reply(
                r#"{"date":"x","projectName":"y","productionCompany":"z","locations":[]}"#,
            ),
        ]);
        let outcome = agent(provider.clone(), 10)
            .run("raw text", &variant)
            .await
            .expect("run succeeds");
        assert_eq!(outcome.turns, 2);

        let second = &provider.requests().await[1];
        let last = second.messages.last().unwrap();
        assert_eq!(last.role, MessageRole::User);
        assert!(last.content.contains("productionCompany"));
    }

    #[tokio::test]
    async fn exhausts_after_exactly_max_turns() {
        let replies = (0..12).map(|_| final_reply("not json")).collect();
        let provider = ScriptedProvider::new(replies);
        let err = agent(provider.clone(), 10)
            .run("raw text", &schema())
            .await
            .expect_err("budget must run out");

        assert!(matches!(err, AgentError::TurnBudgetExhausted { turns: 10 }));

        let records = provider.requests().await;
        assert_eq!(records.len(), 10);
        // the final request carries one corrective per prior failure
        let correctives = records[9]
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::User && m.content.contains("not valid JSON"))
            .count();
        assert_eq!(correctives, 9);
    }

    #[tokio::test]
    async fn empty_final_content_is_fatal() {
        let provider = ScriptedProvider::new(vec![final_reply("")]);
        let err = agent(provider.clone(), 10)
            .run("raw text", &schema())
            .await
            .expect_err("empty reply must abort");
        assert!(matches!(err, AgentError::EmptyReply));
        assert_eq!(provider.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn provider_failure_aborts_the_run() {
        let agent = Agent::new(
            Arc::new(FailingProvider),
            registry(),
            AgentOptions::new("test-model"),
        );
        let err = agent
            .run("raw text", &schema())
            .await
            .expect_err("protocol violation is fatal");
        assert!(matches!(err, AgentError::Provider(_)));
    }
}
