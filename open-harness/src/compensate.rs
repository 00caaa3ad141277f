//! Compensation pipeline: turn a weak model's unusable reply into a usable
//! turn without user intervention.
//!
//! The pipeline wraps one LM turn. Per failure class it applies the
//! cheapest applicable repair first — often none at all, because the parser
//! already ran its aggressive repair pass. Repairs that need an LM roundtrip
//! are drawn from a strategy stack `refine_prompt → add_examples →
//! escalate_model`; each strategy is an idempotent request adjuster applied
//! at most once per attempt chain. Once the stack and the retry budget are
//! both consumed the pipeline yields the terminal failure.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{Failure, FailureClass, classify_lm_error, classify_response};
use crate::config::Tier;
use crate::error::HarnessError;
use crate::events::{Event, EventBus};
use crate::llm::{ChatBackend, ChatRequest, LmError, LmResponse};
use crate::message::{Message, ToolCall};
use crate::parser::{ParseOutcome, ResponseParser};
use crate::tools::ToolRegistry;

/// Base transport backoff.
const BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Transport backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(4);
/// Transport/timeout retries before the failure is terminal.
const TRANSPORT_RETRIES: usize = 3;
/// Longest endpoint cooldown the pipeline will sit out in-line.
const MAX_INLINE_COOLDOWN: Duration = Duration::from_secs(60);

/// LM-roundtrip repair strategies, in stacking order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    RefinePrompt,
    AddExamples,
    EscalateModel,
}

impl Strategy {
    const STACK: [Self; 3] = [Self::RefinePrompt, Self::AddExamples, Self::EscalateModel];

    const fn name(self) -> &'static str {
        match self {
            Self::RefinePrompt => "refine_prompt",
            Self::AddExamples => "add_examples",
            Self::EscalateModel => "escalate_model",
        }
    }

    /// Pure request adjustment. Idempotent: applying the same strategy to
    /// its own output changes nothing further (the pipeline also guards by
    /// consuming each strategy at most once).
    fn adjust(self, request: &ChatRequest, failure: &Failure, registry: &ToolRegistry) -> ChatRequest {
        let mut next = request.clone();
        match self {
            Self::RefinePrompt => {
                let instruction = refine_instruction(failure, registry);
                if !already_appended(&next, &instruction) {
                    next.messages.push(Message::user(instruction));
                }
            }
            Self::AddExamples => {
                let example = example_instruction(failure, registry);
                if !already_appended(&next, &example) {
                    next.messages.push(Message::user(example));
                }
            }
            Self::EscalateModel => {
                if let Some(tier) = next.tier.escalated() {
                    next.tier = tier;
                }
            }
        }
        next
    }
}

fn already_appended(request: &ChatRequest, text: &str) -> bool {
    request.messages.last().is_some_and(|m| m.content == text)
}

/// The repair instruction for a refine-prompt pass.
fn refine_instruction(failure: &Failure, registry: &ToolRegistry) -> String {
    match failure.class {
        FailureClass::MalformedJson => format!(
            "Your last tool call could not be decoded ({}). Reply again with a single \
             valid JSON tool call of the form {{\"tool\": <name>, \"arguments\": {{...}}}} \
             and nothing else.",
            failure.detail
        ),
        FailureClass::WrongToolName => {
            let names = registry.names().join(", ");
            format!(
                "{} is not a registered tool. Available tools: {names}. \
                 Reply with a JSON tool call using one of these exact names.",
                failure.detail
            )
        }
        FailureClass::MissingArgs => {
            let signatures = failure
                .detail
                .split('\'')
                .nth(1)
                .and_then(|tool| registry.descriptor(tool))
                .map_or_else(String::new, |d| format!(" Signature: {}.", d.signature()));
            format!(
                "Your tool call was incomplete: {}.{signatures} Reply with the full \
                 JSON tool call including every required argument.",
                failure.detail
            )
        }
        FailureClass::ProseWrapped => {
            "Reply with the tool call as JSON only — no surrounding prose.".to_string()
        }
        _ => format!(
            "The previous attempt failed ({}). Reply with a valid JSON tool call or a \
             plain final answer.",
            failure.detail
        ),
    }
}

/// A concrete example call for the add-examples pass.
fn example_instruction(failure: &Failure, registry: &ToolRegistry) -> String {
    let tool = failure
        .detail
        .split('\'')
        .nth(1)
        .and_then(|name| registry.descriptor(name));
    let example = tool.map_or_else(
        || "{\"tool\": \"read_file\", \"arguments\": {\"path\": \"src/main.rs\"}}".to_string(),
        |d| {
            let args: Vec<String> = d
                .args
                .iter()
                .filter(|a| a.required)
                .map(|a| format!("\"{}\": \"...\"", a.name))
                .collect();
            format!(
                "{{\"tool\": \"{}\", \"arguments\": {{{}}}}}",
                d.name,
                args.join(", ")
            )
        },
    );
    format!("For example, a well-formed call looks like this:\n```json\n{example}\n```")
}

/// One applied repair, recorded for the goal summary.
#[derive(Debug, Clone)]
pub struct CompensationRecord {
    /// The failure class that was repaired.
    pub class: FailureClass,
    /// The repair applied.
    pub strategy: String,
}

/// A usable turn produced by the pipeline.
#[derive(Debug)]
pub struct CompensatedTurn {
    /// The accepted response.
    pub response: LmResponse,
    /// Validated tool calls, fuzzy-resolved, in declaration order.
    pub calls: Vec<ToolCall>,
    /// Residual assistant narrative.
    pub narrative: String,
    /// Repairs applied along the way.
    pub compensations: Vec<CompensationRecord>,
    /// The tier that finally produced the turn.
    pub tier: Tier,
}

/// The pipeline. Cheap to clone per goal.
#[derive(Clone)]
pub struct CompensationPipeline {
    backend: Arc<dyn ChatBackend>,
    parser: ResponseParser,
    bus: EventBus,
    max_retries: usize,
}

impl std::fmt::Debug for CompensationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompensationPipeline")
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}

impl CompensationPipeline {
    /// Build a pipeline over a chat backend.
    #[must_use]
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        parser: ResponseParser,
        bus: EventBus,
        max_retries: usize,
    ) -> Self {
        Self {
            backend,
            parser,
            bus,
            max_retries,
        }
    }

    /// Run one turn to a usable outcome or a terminal failure.
    pub async fn run(
        &self,
        registry: &ToolRegistry,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<CompensatedTurn, HarnessError> {
        let mut request = request;
        let mut consumed: Vec<Strategy> = Vec::new();
        let mut compensations: Vec<CompensationRecord> = Vec::new();
        let mut transport_retries = 0usize;
        let mut attempts = 0usize;
        let mut last_failure = Failure::new(FailureClass::EmptyResponse, "no attempt made");

        while attempts <= self.max_retries {
            if cancel.is_cancelled() {
                return Err(HarnessError::Cancelled);
            }
            attempts += 1;

            let response = match self.backend.chat(&request, cancel).await {
                Ok(response) => response,
                Err(e) => {
                    let failure = classify_lm_error(&e);
                    last_failure = failure.clone();
                    match &e {
                        LmError::Transport { .. } | LmError::Timeout { .. } => {
                            transport_retries += 1;
                            if transport_retries > TRANSPORT_RETRIES {
                                break;
                            }
                            let delay = backoff_delay(transport_retries - 1);
                            debug!(retry = transport_retries, ?delay, "transport backoff");
                            self.record(&mut compensations, failure.class, "backoff_retry");
                            // Backoff does not consume an attempt from the chain.
                            attempts -= 1;
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        LmError::RateLimited { cooldown, .. } => {
                            if *cooldown <= MAX_INLINE_COOLDOWN {
                                info!(secs = cooldown.as_secs(), "endpoint cooldown, waiting");
                                self.record(&mut compensations, failure.class, "cooldown_wait");
                                tokio::time::sleep(*cooldown).await;
                                continue;
                            }
                            warn!(secs = cooldown.as_secs(), "endpoint cooldown exceeds inline cap");
                            break;
                        }
                        LmError::Protocol { .. } => {
                            transport_retries += 1;
                            if transport_retries > TRANSPORT_RETRIES {
                                break;
                            }
                            self.record(&mut compensations, failure.class, "backoff_retry");
                            tokio::time::sleep(backoff_delay(transport_retries - 1)).await;
                            continue;
                        }
                    }
                }
            };

            let outcome = self.parser.parse(&response);
            let (calls, outcome) = self.settle_calls(registry, outcome, &mut compensations);

            if !calls.is_empty() {
                return Ok(CompensatedTurn {
                    narrative: outcome.narrative,
                    calls,
                    compensations,
                    tier: request.tier,
                    response,
                });
            }

            match classify_response(&response.assistant_text, &outcome) {
                None => {
                    // Plain final answer.
                    return Ok(CompensatedTurn {
                        narrative: outcome.narrative,
                        calls: Vec::new(),
                        compensations,
                        tier: request.tier,
                        response,
                    });
                }
                Some(failure) => {
                    debug!(class = %failure.class, detail = %failure.detail, "turn failed");
                    last_failure = failure.clone();
                    let Some(strategy) = self.pick_strategy(&failure, &consumed, request.tier)
                    else {
                        break;
                    };
                    consumed.push(strategy);
                    self.record(&mut compensations, failure.class, strategy.name());
                    request = strategy.adjust(&request, &failure, registry);
                }
            }
        }

        warn!(attempts, failure = %last_failure, "compensation exhausted");
        Err(HarnessError::CompensationExhausted {
            attempts,
            failure: last_failure,
        })
    }

    /// Validate parsed calls and decide fuzzy candidates.
    ///
    /// A fuzzy candidate is auto-accepted only when its arguments validate
    /// against the matched tool's schema; otherwise it is folded back into
    /// the outcome as a `wrong_tool_name` failure.
    fn settle_calls(
        &self,
        registry: &ToolRegistry,
        mut outcome: ParseOutcome,
        compensations: &mut Vec<CompensationRecord>,
    ) -> (Vec<ToolCall>, ParseOutcome) {
        let mut valid = Vec::new();

        for call in std::mem::take(&mut outcome.calls) {
            match registry.validate_call(&call) {
                Ok(()) => valid.push(call),
                Err(e) => {
                    debug!(tool = %call.name, error = %e, "call failed validation");
                    let detail = match &e {
                        crate::tools::ArgError::Missing { missing } => missing.clone(),
                        other => vec![other.to_string()],
                    };
                    outcome.missing_args.push((call.name.clone(), detail));
                }
            }
        }

        for candidate in std::mem::take(&mut outcome.fuzzy) {
            if registry.validate_call(&candidate.call).is_ok() {
                info!(
                    original = %candidate.original,
                    accepted = %candidate.call.name,
                    "fuzzy tool name auto-accepted"
                );
                self.record(compensations, FailureClass::WrongToolName, "auto_fuzzy");
                valid.push(candidate.call);
            } else {
                outcome.unknown_names.push(candidate.original);
            }
        }

        (valid, outcome)
    }

    /// The next applicable strategy for a failure class, or `None` when the
    /// chain is exhausted for that class.
    fn pick_strategy(
        &self,
        failure: &Failure,
        consumed: &[Strategy],
        tier: Tier,
    ) -> Option<Strategy> {
        let escalation_possible = tier.escalated().is_some();
        match failure.class {
            // Empty responses skip straight to a stronger model.
            FailureClass::EmptyResponse => {
                let strategy = Strategy::EscalateModel;
                (escalation_possible && !consumed.contains(&strategy)).then_some(strategy)
            }
            FailureClass::MalformedJson
            | FailureClass::WrongToolName
            | FailureClass::MissingArgs
            | FailureClass::ProseWrapped => Strategy::STACK.into_iter().find(|s| {
                !consumed.contains(s) && (*s != Strategy::EscalateModel || escalation_possible)
            }),
            // Execution, policy and transport classes are not repaired by
            // prompt adjustment; the loop or the retry arms own them.
            _ => None,
        }
    }

    fn record(&self, compensations: &mut Vec<CompensationRecord>, class: FailureClass, strategy: &str) {
        self.bus.emit(Event::Compensation {
            class,
            strategy: strategy.to_string(),
        });
        compensations.push(CompensationRecord {
            class,
            strategy: strategy.to_string(),
        });
    }
}

/// Exponential backoff with ±25% jitter: 100 ms × 2^k, capped at 4 s.
fn backoff_delay(retry: usize) -> Duration {
    let exp = BACKOFF_BASE.saturating_mul(1u32 << retry.min(6) as u32);
    let capped = exp.min(BACKOFF_CAP);
    let jitter = 0.75 + fastrand::f64() * 0.5;
    capped.mul_f64(jitter)
}
