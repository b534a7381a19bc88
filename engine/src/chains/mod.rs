//! Chains
//!
//! A chain is a fixed sequence of prompt steps producing one derived result.
//! The set of chains is closed: [`ChainName`] enumerates them and
//! [`definition`] maps each to its steps, so an unknown name is a parse error
//! rather than a dispatch failure at call time.
//!
//! Templates use these placeholders:
//!
//! - `{inputs}`: the normalized chain inputs as JSON
//! - `{context}`: recent working memories of the owner, one per line
//! - `{previous}`: output of the step before
//! - `{steps.<name>}`: output of an earlier named step

use sdk::errors::ChainExecutionError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

pub mod executor;

pub use executor::{ChainExecutor, ChainOutput, ChainSettings};

/// Every chain the engine can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainName {
    TaskDecomposition,
    TaskAnalysis,
    TaskValidation,
    MotivationalMessage,
    MoodInsight,
    DailyOptimization,
}

impl ChainName {
    pub const ALL: [ChainName; 6] = [
        ChainName::TaskDecomposition,
        ChainName::TaskAnalysis,
        ChainName::TaskValidation,
        ChainName::MotivationalMessage,
        ChainName::MoodInsight,
        ChainName::DailyOptimization,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainName::TaskDecomposition => "task_decomposition",
            ChainName::TaskAnalysis => "task_analysis",
            ChainName::TaskValidation => "task_validation",
            ChainName::MotivationalMessage => "motivational_message",
            ChainName::MoodInsight => "mood_insight",
            ChainName::DailyOptimization => "daily_optimization",
        }
    }
}

impl fmt::Display for ChainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChainName {
    type Err = ChainExecutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|chain| chain.as_str() == s)
            .ok_or_else(|| ChainExecutionError::UnknownChain(s.to_string()))
    }
}

/// One prompt step
#[derive(Debug)]
pub struct ChainStep {
    pub name: &'static str,
    pub template: &'static str,
}

/// Static description of a chain
#[derive(Debug)]
pub struct ChainDefinition {
    pub name: ChainName,
    pub system: &'static str,
    /// Input fields that must be present and non-null
    pub required_inputs: &'static [&'static str],
    pub steps: &'static [ChainStep],
}

const JSON_ONLY: &str = "Respond with a single JSON object and nothing else.";

static TASK_DECOMPOSITION: ChainDefinition = ChainDefinition {
    name: ChainName::TaskDecomposition,
    system: "You help people break work into small, concrete steps.",
    required_inputs: &["title"],
    steps: &[
        ChainStep {
            name: "outline",
            template: "Task: {inputs}\nRecent context:\n{context}\n\
                       List the main phases needed to finish this task, one per line.",
        },
        ChainStep {
            name: "subtasks",
            template: "Task: {inputs}\nPhases:\n{steps.outline}\n\
                       Turn the phases into at most 7 subtasks. Respond with JSON \
                       {\"subtasks\": [{\"title\": string, \"estimate_minutes\": number}]}.",
        },
    ],
};

static TASK_ANALYSIS: ChainDefinition = ChainDefinition {
    name: ChainName::TaskAnalysis,
    system: "You estimate effort and priority of tasks.",
    required_inputs: &["title"],
    steps: &[ChainStep {
        name: "analysis",
        template: "Task: {inputs}\nRecent context:\n{context}\n\
                   Estimate complexity (low|medium|high), priority (1-5) and minutes needed. \
                   Respond with JSON {\"complexity\": string, \"priority\": number, \
                   \"estimate_minutes\": number}.",
    }],
};

static TASK_VALIDATION: ChainDefinition = ChainDefinition {
    name: ChainName::TaskValidation,
    system: "You check that task descriptions are actionable.",
    required_inputs: &["title"],
    steps: &[ChainStep {
        name: "validation",
        template: "Task: {inputs}\n\
                   Decide whether the task is specific and actionable. Respond with JSON \
                   {\"valid\": boolean, \"issues\": [string]}.",
    }],
};

static MOTIVATIONAL_MESSAGE: ChainDefinition = ChainDefinition {
    name: ChainName::MotivationalMessage,
    system: "You write short, warm encouragement.",
    required_inputs: &[],
    steps: &[ChainStep {
        name: "message",
        template: "Situation: {inputs}\nRecent context:\n{context}\n\
                   Write one or two encouraging sentences. Respond with JSON {\"message\": string}.",
    }],
};

static MOOD_INSIGHT: ChainDefinition = ChainDefinition {
    name: ChainName::MoodInsight,
    system: "You reflect on mood check-ins without giving medical advice.",
    required_inputs: &["score"],
    steps: &[ChainStep {
        name: "insight",
        template: "Mood check-in: {inputs}\nRecent context:\n{context}\n\
                   Give one observation and one gentle suggestion. Respond with JSON \
                   {\"insight\": string, \"suggestion\": string}.",
    }],
};

static DAILY_OPTIMIZATION: ChainDefinition = ChainDefinition {
    name: ChainName::DailyOptimization,
    system: "You plan realistic days around energy and priorities.",
    required_inputs: &[],
    steps: &[
        ChainStep {
            name: "review",
            template: "Today's inputs: {inputs}\nRecent context:\n{context}\n\
                       Summarize what matters most today in three lines.",
        },
        ChainStep {
            name: "schedule",
            template: "Priorities:\n{previous}\n\
                       Propose an ordered plan for the day. Respond with JSON \
                       {\"focus\": string, \"blocks\": [{\"title\": string, \"minutes\": number}]}.",
        },
    ],
};

/// The step sequence of a chain
pub fn definition(chain: ChainName) -> &'static ChainDefinition {
    match chain {
        ChainName::TaskDecomposition => &TASK_DECOMPOSITION,
        ChainName::TaskAnalysis => &TASK_ANALYSIS,
        ChainName::TaskValidation => &TASK_VALIDATION,
        ChainName::MotivationalMessage => &MOTIVATIONAL_MESSAGE,
        ChainName::MoodInsight => &MOOD_INSIGHT,
        ChainName::DailyOptimization => &DAILY_OPTIMIZATION,
    }
}

/// Parses configured chain names, failing on the first unknown one
pub fn validate_names<S: AsRef<str>>(names: &[S]) -> Result<Vec<ChainName>, ChainExecutionError> {
    names.iter().map(|name| name.as_ref().parse()).collect()
}

impl ChainDefinition {
    /// Check required inputs
    pub fn check_inputs(&self, inputs: &Value) -> Result<(), ChainExecutionError> {
        let invalid = |reason: String| ChainExecutionError::InvalidInput {
            chain: self.name.to_string(),
            reason,
        };

        let object = inputs
            .as_object()
            .ok_or_else(|| invalid("inputs must be a JSON object".to_string()))?;
        for field in self.required_inputs {
            match object.get(*field) {
                None | Some(Value::Null) => {
                    return Err(invalid(format!("missing field '{}'", field)));
                }
                Some(Value::String(s)) if s.trim().is_empty() => {
                    return Err(invalid(format!("field '{}' is empty", field)));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Fill a step template
pub fn render(
    template: &str,
    inputs: &Value,
    context: &[String],
    outputs: &HashMap<&'static str, String>,
    previous: Option<&str>,
) -> String {
    let context_text = if context.is_empty() {
        "(none)".to_string()
    } else {
        context.join("\n")
    };

    let mut rendered = template
        .replace("{inputs}", &inputs.to_string())
        .replace("{context}", &context_text)
        .replace("{previous}", previous.unwrap_or(""));
    for (name, output) in outputs {
        rendered = rendered.replace(&format!("{{steps.{}}}", name), output);
    }
    rendered
}

/// System prompt for a chain
pub fn system_prompt(chain: &ChainDefinition, last_step: bool) -> String {
    if last_step {
        format!("{} {}", chain.system, JSON_ONLY)
    } else {
        chain.system.to_string()
    }
}

/// Interpret the final step output as JSON, falling back to `{"text": ..}`
pub fn parse_output(raw: &str) -> Value {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    match serde_json::from_str::<Value>(body) {
        Ok(value @ Value::Object(_)) => value,
        _ => json!({ "text": trimmed }),
    }
}

/// Template result used when a degradable chain cannot reach the model
pub fn fallback(chain: ChainName, inputs: &Value) -> Value {
    let title = inputs
        .get("title")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("your task");

    match chain {
        ChainName::TaskDecomposition => json!({
            "subtasks": [
                {"title": format!("Define the outcome of {}", title), "estimate_minutes": 10},
                {"title": format!("Do the first piece of {}", title), "estimate_minutes": 25},
                {"title": format!("Review {}", title), "estimate_minutes": 10},
            ]
        }),
        ChainName::TaskAnalysis => json!({
            "complexity": "medium",
            "priority": 3,
            "estimate_minutes": 30,
        }),
        ChainName::TaskValidation => json!({ "valid": true, "issues": [] }),
        ChainName::MotivationalMessage => json!({
            "message": "Small steps add up. Pick one thing and start it now.",
        }),
        ChainName::MoodInsight => json!({
            "insight": "Thanks for checking in.",
            "suggestion": "Take a short break and notice how you feel afterwards.",
        }),
        ChainName::DailyOptimization => json!({
            "focus": "Start with the most important task while energy is high.",
            "blocks": [],
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_chain_has_steps() {
        for chain in ChainName::ALL {
            let def = definition(chain);
            assert_eq!(def.name, chain);
            assert!(!def.steps.is_empty());
            assert_eq!(chain.as_str().parse::<ChainName>().unwrap(), chain);
        }
    }

    #[test]
    fn test_unknown_name_fails() {
        let err = "summarize_everything".parse::<ChainName>().unwrap_err();
        assert_eq!(
            err,
            ChainExecutionError::UnknownChain("summarize_everything".to_string())
        );
        assert!(validate_names(&["task_analysis", "nope"]).is_err());
        assert_eq!(
            validate_names(&["mood_insight"]).unwrap(),
            vec![ChainName::MoodInsight]
        );
    }

    #[test]
    fn test_task_analysis_is_single_step() {
        assert_eq!(definition(ChainName::TaskAnalysis).steps.len(), 1);
    }

    #[test]
    fn test_check_inputs() {
        let def = definition(ChainName::TaskAnalysis);
        assert!(def.check_inputs(&json!({"title": "Write report"})).is_ok());
        assert!(def.check_inputs(&json!({"title": "  "})).is_err());
        assert!(def.check_inputs(&json!({})).is_err());
        assert!(def.check_inputs(&json!("Write report")).is_err());
        assert!(definition(ChainName::MotivationalMessage)
            .check_inputs(&json!({}))
            .is_ok());
    }

    #[test]
    fn test_render_placeholders() {
        let mut outputs = HashMap::new();
        outputs.insert("outline", "phase one".to_string());
        let rendered = render(
            "{inputs} | {context} | {previous} | {steps.outline}",
            &json!({"title": "x"}),
            &[],
            &outputs,
            Some("prev"),
        );
        assert_eq!(rendered, "{\"title\":\"x\"} | (none) | prev | phase one");
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output("{\"a\": 1}"), json!({"a": 1}));
        assert_eq!(parse_output("```json\n{\"a\": 1}\n```"), json!({"a": 1}));
        assert_eq!(parse_output(" hello "), json!({"text": "hello"}));
        assert_eq!(parse_output("[1,2]"), json!({"text": "[1,2]"}));
    }

    #[test]
    fn test_fallback_uses_title() {
        let value = fallback(ChainName::TaskDecomposition, &json!({"title": "Taxes"}));
        assert_eq!(value["subtasks"][0]["title"], "Define the outcome of Taxes");
    }
}
