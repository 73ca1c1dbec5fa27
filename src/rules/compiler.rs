//! Natural-language rule compiler.
//!
//! Turns an instruction like "archive newsletters from substack and label
//! them Reading" into a structured [`Rule`]. The model emits JSON in the
//! same tagged shape the rule store persists, so a successful compile is
//! already a valid rule; everything else is rejected with a precise
//! [`CompileError`] rather than silently repaired.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::error::CompileError;
use crate::llm::{CompletionRequest, LlmCapability, LlmContext};
use crate::rules::model::{Action, Condition, Rule};

const KNOWN_CONDITIONS: &[&str] = &["from", "subject", "body", "category", "ai_match"];
const KNOWN_ACTIONS: &[&str] = &[
    "archive",
    "label",
    "draft",
    "send",
    "forward",
    "mark_spam",
    "mark_read",
    "webhook",
    "track_thread",
];

pub struct RuleCompiler {
    llm: Arc<dyn LlmCapability>,
}

impl RuleCompiler {
    pub fn new(llm: Arc<dyn LlmCapability>) -> Self {
        Self { llm }
    }

    /// Compile one instruction into a disabled-by-default draft the caller
    /// persists after user confirmation.
    pub async fn compile(
        &self,
        instruction: &str,
        owner: &str,
        llm_ctx: &LlmContext,
    ) -> Result<Rule, CompileError> {
        let request = CompletionRequest::new(build_compile_prompt(instruction))
            .with_system(COMPILE_SYSTEM_PROMPT)
            .with_max_tokens(1024)
            .with_context(llm_ctx.clone());

        let raw = self.llm.complete(request).await?;
        let rule = parse_rule_response(&raw, owner, instruction)?;

        info!(
            rule_id = %rule.id,
            owner,
            conditions = rule.conditions.len(),
            actions = rule.actions.len(),
            "Compiled rule from instruction"
        );
        Ok(rule)
    }
}

const COMPILE_SYSTEM_PROMPT: &str = "\
You convert a user's email automation instruction into a JSON rule.

Respond with ONLY a JSON object of this shape:
{
  \"name\": \"<short rule name>\",
  \"priority\": <integer, 0 unless the user implies urgency>,
  \"conditions\": [<condition>, ...],
  \"actions\": [<action>, ...]
}

Condition shapes (patterns use mode exact, contains, or regex):
  {\"type\": \"from\", \"pattern\": {\"value\": \"...\", \"mode\": \"contains\"}}
  {\"type\": \"subject\", \"pattern\": {\"value\": \"...\", \"mode\": \"contains\"}}
  {\"type\": \"body\", \"pattern\": {\"value\": \"...\", \"mode\": \"contains\"}}
  {\"type\": \"category\", \"name\": \"...\"}
  {\"type\": \"ai_match\", \"instruction\": \"...\"}

Action shapes (executed in order):
  {\"type\": \"archive\"}
  {\"type\": \"label\", \"name\": \"...\"}
  {\"type\": \"draft\", \"content\": \"...\"}
  {\"type\": \"send\", \"content\": \"...\", \"track\": false}
  {\"type\": \"forward\", \"to\": \"...\"}
  {\"type\": \"mark_spam\"}
  {\"type\": \"mark_read\"}
  {\"type\": \"webhook\", \"url\": \"...\"}
  {\"type\": \"track_thread\"}

Use ai_match only for criteria that cannot be expressed as a pattern.
Text parameters may reference email facts as {{sender}}, {{sender_name}},
{{subject}}, {{reply_to}}, {{recipient}}, or {{thread_id}}.
If the instruction is not an email automation rule, respond with
{\"error\": \"not_a_rule\"}.";

fn build_compile_prompt(instruction: &str) -> String {
    format!("Instruction: {instruction}")
}

fn parse_rule_response(
    raw: &str,
    owner: &str,
    instruction: &str,
) -> Result<Rule, CompileError> {
    let cleaned = crate::llm::json::extract_json_object(raw);
    let value: Value = serde_json::from_str(&cleaned)
        .map_err(|e| CompileError::NotARule(format!("{e}: {cleaned}")))?;

    if value.get("error").is_some() {
        return Err(CompileError::NotARule(instruction.to_string()));
    }

    let obj = value
        .as_object()
        .ok_or_else(|| CompileError::NotARule(cleaned.clone()))?;

    let name = obj
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(instruction)
        .to_string();
    let priority = obj.get("priority").and_then(Value::as_i64).unwrap_or(0) as i32;

    let conditions = obj
        .get("conditions")
        .and_then(Value::as_array)
        .ok_or_else(|| CompileError::NotARule("missing conditions array".into()))?
        .iter()
        .map(parse_condition)
        .collect::<Result<Vec<_>, _>>()?;

    let actions = obj
        .get("actions")
        .and_then(Value::as_array)
        .ok_or_else(|| CompileError::NotARule("missing actions array".into()))?
        .iter()
        .map(parse_action)
        .collect::<Result<Vec<_>, _>>()?;

    if actions.is_empty() {
        return Err(CompileError::NoActions);
    }

    debug!(name, priority, "Parsed rule response");

    let mut rule = Rule::new(owner, name).with_priority(priority);
    rule.conditions = conditions;
    rule.actions = actions;
    // Compiled rules start disabled; the caller enables after the user
    // confirms the structured form.
    rule.enabled = false;
    Ok(rule)
}

fn parse_condition(value: &Value) -> Result<Condition, CompileError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CompileError::UnknownCondition(value.to_string()))?;
    if !KNOWN_CONDITIONS.contains(&kind) {
        return Err(CompileError::UnknownCondition(kind.to_string()));
    }
    serde_json::from_value(value.clone())
        .map_err(|e| CompileError::UnknownCondition(format!("{kind}: {e}")))
}

fn parse_action(value: &Value) -> Result<Action, CompileError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| CompileError::UnknownAction(value.to_string()))?;
    if !KNOWN_ACTIONS.contains(&kind) {
        return Err(CompileError::UnknownAction(kind.to_string()));
    }
    serde_json::from_value(value.clone())
        .map_err(|e| CompileError::UnknownAction(format!("{kind}: {e}")))
}
