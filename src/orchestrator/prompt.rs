//! §4.7.3: the prompt contract handed to the agent CLI on every session.

use crate::models::{Phase, Task};
use crate::quality_gate::{rubric_for, scoring_rubric_text};

/// Previously-recorded evaluation for this task/phase, if any.
#[derive(Debug, Clone, Default)]
pub struct PreviousEvaluation {
    pub score: u32,
    pub passed: bool,
    pub improvements: Vec<String>,
}

pub fn build_prompt(phase: Phase, iteration: u32, prev: &PreviousEvaluation, task: &Task) -> String {
    let rubric = rubric_for(phase);
    let mut out = String::new();

    out.push_str(&format!("# Task {}\n", task.id));
    out.push_str(&format!("Phase: {} (iteration {})\n\n", phase.as_str(), iteration));

    out.push_str(&format!("## {}\n\n{}\n\n", task.title, task.description));

    out.push_str("## Acceptance criteria\n");
    for (i, criterion) in task.acceptance_criteria.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", i + 1, criterion));
    }
    out.push('\n');

    if prev.score > 0 && !prev.passed {
        out.push_str("## Previous attempt\n");
        out.push_str(&format!("Scored {} against a minimum of {}. Required improvements:\n", prev.score, rubric.min_score));
        for improvement in &prev.improvements {
            out.push_str(&format!("- {improvement}\n"));
        }
        out.push('\n');
    }

    out.push_str("## Instructions\n");
    out.push_str("1. Read the project summary file in the repository root before starting.\n");
    out.push_str("2. Work through every acceptance criterion listed above in order.\n");
    out.push_str("3. On completion, write the two artifact files described below.\n\n");

    out.push_str("## Completion protocol\n");
    out.push_str("Write `task-completion.json`:\n```json\n");
    out.push_str("{\n");
    out.push_str(&format!("  \"task_id\": \"{}\",\n", task.id));
    out.push_str("  \"status\": \"completed\" | \"failed\",\n");
    out.push_str(&format!(
        "  \"acceptance_met\": [{}],  // exactly {} booleans, one per criterion above, in order\n",
        vec!["true|false"; task.acceptance_criteria.len()].join(", "),
        task.acceptance_criteria.len()
    ));
    out.push_str("  \"deliverables\": [\"...\"],\n");
    out.push_str("  \"notes\": \"...\",\n");
    out.push_str("  \"completed_at\": \"<ISO-8601 timestamp>\"\n");
    out.push_str("}\n```\n\n");

    out.push_str("Write `quality-scores.json`, one integer 0-100 per criterion id below:\n```json\n{\n");
    for (i, c) in rubric.criteria.iter().enumerate() {
        let comma = if i + 1 == rubric.criteria.len() { "" } else { "," };
        out.push_str(&format!("  \"{}\": 0-100{}\n", c.id, comma));
    }
    out.push_str("}\n```\n\n");

    out.push_str(&scoring_rubric_text(phase));
    out.push_str(&format!("\nThe minimum passing score for this phase is {}.\n", rubric.min_score));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Phase, Priority};

    #[test]
    fn prompt_includes_task_header_and_criteria() {
        let mut task = Task::new("Build widget", "Make a widget", Phase::Implement, Priority::High, "4h");
        task.acceptance_criteria = vec!["It compiles".to_string(), "It has tests".to_string()];

        let prompt = build_prompt(Phase::Implement, 1, &PreviousEvaluation::default(), &task);
        assert!(prompt.contains(&task.id));
        assert!(prompt.contains("It compiles"));
        assert!(prompt.contains("It has tests"));
        assert!(!prompt.contains("Previous attempt"));
    }

    #[test]
    fn prompt_includes_previous_attempt_block_when_score_recorded_and_failed() {
        let task = Task::new("Build widget", "Make a widget", Phase::Implement, Priority::High, "4h");
        let prev = PreviousEvaluation { score: 70, passed: false, improvements: vec!["Add tests".to_string()] };
        let prompt = build_prompt(Phase::Implement, 2, &prev, &task);
        assert!(prompt.contains("Previous attempt"));
        assert!(prompt.contains("Add tests"));
    }
}
