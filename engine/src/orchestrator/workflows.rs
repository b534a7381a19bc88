//! Plan shapes of the built-in workflows
//!
//! Pure functions from a request to the action specs the planner persists.
//! Actions with the highest priority and no dependencies form the first
//! batch that runs while the caller waits.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::chains::ChainName;
use crate::memory::RetentionClass;
use crate::planner::{ActionKind, ActionSpec};
use crate::tools::names;

pub const CREATE_TASK: &str = "create_task";
pub const DAILY_OPTIMIZATION: &str = "daily_optimization";
pub const MOOD_CHECKIN: &str = "mood_checkin";

const FIRST: i32 = 10;
const FOLLOW_UP: i32 = 0;
const NICE_TO_HAVE: i32 = -5;

/// A task to create
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl TaskRequest {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: None,
            due: None,
            tags: Vec::new(),
        }
    }
}

/// A mood check-in, scored 1 (low) to 10 (high)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodEntry {
    pub score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl MoodEntry {
    pub const MIN_SCORE: u8 = 1;
    pub const MAX_SCORE: u8 = 10;

    pub fn new(score: u8) -> Self {
        Self {
            score,
            note: None,
            tags: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        (Self::MIN_SCORE..=Self::MAX_SCORE).contains(&self.score)
    }
}

/// Analyze and validate, create the task, then break it down and schedule it
///
/// ```text
/// analyze ─┐
///          ├─> create ─┬─> decompose ─> schedule
/// validate ┘           └─> motivate
/// ```
pub fn create_task_plan(request: &TaskRequest, preferences: Option<&Value>) -> Vec<ActionSpec> {
    let task = json!({
        "title": request.title.trim(),
        "description": request.description,
        "due": request.due,
        "tags": request.tags,
    });
    let mut analysis_inputs = task.clone();
    if let Some(preferences) = preferences {
        analysis_inputs["preferences"] = preferences.clone();
    }

    vec![
        ActionSpec::new("analyze", ActionKind::chain(ChainName::TaskAnalysis), analysis_inputs)
            .with_priority(FIRST),
        ActionSpec::new("validate", ActionKind::chain(ChainName::TaskValidation), task.clone())
            .with_priority(FIRST),
        ActionSpec::new("create", ActionKind::tool(names::TASKS_CREATE), task.clone())
            .after(["analyze", "validate"])
            .with_priority(FOLLOW_UP),
        ActionSpec::new(
            "decompose",
            ActionKind::chain(ChainName::TaskDecomposition),
            task.clone(),
        )
        .after(["create"])
        .with_priority(FOLLOW_UP),
        ActionSpec::new(
            "schedule",
            ActionKind::tool(names::CALENDAR_SCHEDULE),
            json!({ "title": request.title.trim(), "due": request.due }),
        )
        .after(["decompose"])
        .with_priority(FOLLOW_UP),
        ActionSpec::new(
            "motivate",
            ActionKind::chain(ChainName::MotivationalMessage),
            json!({ "event": "task_created", "title": request.title.trim() }),
        )
        .after(["create"])
        .with_priority(NICE_TO_HAVE),
    ]
}

/// Plan the day, then put it on the calendar and cheer the owner on
pub fn daily_optimization_plan(date: NaiveDate, recent: Vec<Value>) -> Vec<ActionSpec> {
    vec![
        ActionSpec::new(
            "optimize",
            ActionKind::chain(ChainName::DailyOptimization),
            json!({ "date": date.to_string(), "recent": recent }),
        )
        .with_priority(FIRST),
        ActionSpec::new(
            "schedule",
            ActionKind::tool(names::CALENDAR_SCHEDULE),
            json!({ "date": date.to_string() }),
        )
        .after(["optimize"])
        .with_priority(FOLLOW_UP),
        ActionSpec::new(
            "motivate",
            ActionKind::chain(ChainName::MotivationalMessage),
            json!({ "event": "day_planned", "date": date.to_string() }),
        )
        .after(["optimize"])
        .with_priority(NICE_TO_HAVE),
    ]
}

/// Record the mood, then reflect on it, keep it and reward the check-in
pub fn mood_checkin_plan(entry: &MoodEntry, previous: Option<&Value>) -> Vec<ActionSpec> {
    let mood = json!({
        "score": entry.score,
        "note": entry.note,
        "tags": entry.tags,
    });
    let mut insight_inputs = mood.clone();
    if let Some(previous) = previous {
        insight_inputs["previous"] = previous.clone();
    }

    vec![
        ActionSpec::new("record", ActionKind::tool(names::MOOD_RECORD), mood.clone())
            .with_priority(FIRST),
        ActionSpec::new("insight", ActionKind::chain(ChainName::MoodInsight), insight_inputs)
            .after(["record"])
            .with_priority(FOLLOW_UP),
        ActionSpec::new(
            "keep",
            ActionKind::remember(RetentionClass::Working, "mood:last"),
            mood,
        )
        .after(["record"])
        .with_priority(FOLLOW_UP),
        ActionSpec::new(
            "reward",
            ActionKind::tool(names::REWARDS_GRANT),
            json!({ "reason": MOOD_CHECKIN, "points": 5 }),
        )
        .after(["record"])
        .with_priority(NICE_TO_HAVE),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn first_batch(specs: &[ActionSpec]) -> Vec<&str> {
        specs
            .iter()
            .filter(|s| s.depends_on.is_empty())
            .map(|s| s.key.as_str())
            .collect()
    }

    #[test]
    fn test_create_task_first_batch() {
        let specs = create_task_plan(&TaskRequest::new("  Write report "), None);
        assert_eq!(first_batch(&specs), vec!["analyze", "validate"]);
        assert_eq!(specs[0].payload["title"], "Write report");
        assert!(specs[0].payload.get("preferences").is_none());
    }

    #[test]
    fn test_create_task_passes_preferences_to_analysis() {
        let prefs = json!({"focus_hours": "morning"});
        let specs = create_task_plan(&TaskRequest::new("Write"), Some(&prefs));
        assert_eq!(specs[0].payload["preferences"], prefs);
        assert!(specs[1].payload.get("preferences").is_none());
    }

    #[test]
    fn test_mood_plan_keeps_entry_after_record() {
        let entry = MoodEntry::new(7);
        let specs = mood_checkin_plan(&entry, Some(&json!({"score": 4})));
        assert_eq!(first_batch(&specs), vec!["record"]);

        let keep = specs.iter().find(|s| s.key == "keep").unwrap();
        assert_eq!(keep.kind, ActionKind::remember(RetentionClass::Working, "mood:last"));
        assert_eq!(specs[1].payload["previous"]["score"], 4);
    }

    #[test]
    fn test_mood_score_bounds() {
        assert!(MoodEntry::new(1).is_valid());
        assert!(MoodEntry::new(10).is_valid());
        assert!(!MoodEntry::new(0).is_valid());
        assert!(!MoodEntry::new(11).is_valid());
    }

    #[test]
    fn test_daily_plan() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let specs = daily_optimization_plan(date, vec![json!({"key": "mood:last"})]);
        assert_eq!(first_batch(&specs), vec!["optimize"]);
        assert_eq!(specs[0].payload["date"], "2026-03-02");
    }
}
