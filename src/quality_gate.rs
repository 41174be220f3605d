//! C1: Quality-gate evaluator.
//!
//! Weighted per-phase scoring with hardcoded criteria tables, encoding
//! authoritative constants directly in code (see `constants.rs`) rather
//! than loading them from a config file.

use std::collections::HashMap;

use crate::models::{Phase, Recommendation};

#[derive(Debug, Clone, Copy)]
pub struct Criterion {
    pub id: &'static str,
    pub description: &'static str,
    pub weight: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct PhaseRubric {
    pub phase: Phase,
    pub min_score: u32,
    pub criteria: &'static [Criterion],
}

const RESEARCH_CRITERIA: &[Criterion] = &[
    Criterion { id: "requirements", description: "Requirements are captured completely and unambiguously", weight: 30 },
    Criterion { id: "analysis", description: "Problem space analysis is thorough", weight: 25 },
    Criterion { id: "risks", description: "Risks are identified with mitigations", weight: 20 },
    Criterion { id: "feasibility", description: "Feasibility is substantiated", weight: 15 },
    Criterion { id: "alternatives", description: "Alternative approaches are considered", weight: 10 },
];

const DESIGN_CRITERIA: &[Criterion] = &[
    Criterion { id: "architecture", description: "Architecture is coherent and fit for purpose", weight: 30 },
    Criterion { id: "apis", description: "API/interface surface is well specified", weight: 25 },
    Criterion { id: "dataModel", description: "Data model captures all required state", weight: 20 },
    Criterion { id: "failureModel", description: "Failure modes are addressed", weight: 15 },
    Criterion { id: "tradeoffs", description: "Tradeoffs are explicit", weight: 10 },
];

const IMPLEMENT_CRITERIA: &[Criterion] = &[
    Criterion { id: "correctness", description: "Implementation is correct", weight: 35 },
    Criterion { id: "robustness", description: "Implementation handles edge cases", weight: 25 },
    Criterion { id: "clarity", description: "Code is clear and maintainable", weight: 20 },
    Criterion { id: "tests", description: "Tests accompany the implementation", weight: 15 },
    Criterion { id: "perf", description: "Performance is acceptable", weight: 5 },
];

const TEST_CRITERIA: &[Criterion] = &[
    Criterion { id: "coverage", description: "Test coverage is adequate", weight: 30 },
    Criterion { id: "correctness", description: "Tests assert correct behavior", weight: 30 },
    Criterion { id: "edgeCases", description: "Edge cases are exercised", weight: 20 },
    Criterion { id: "regression", description: "Regression risk is covered", weight: 10 },
    Criterion { id: "perf", description: "Performance-sensitive paths are exercised", weight: 10 },
];

/// Authoritative phase table (§4.1). Weights and minima are hardcoded, not configurable.
pub const PHASE_TABLE: &[PhaseRubric] = &[
    PhaseRubric { phase: Phase::Research, min_score: 80, criteria: RESEARCH_CRITERIA },
    PhaseRubric { phase: Phase::Design, min_score: 85, criteria: DESIGN_CRITERIA },
    PhaseRubric { phase: Phase::Implement, min_score: 90, criteria: IMPLEMENT_CRITERIA },
    PhaseRubric { phase: Phase::Test, min_score: 90, criteria: TEST_CRITERIA },
];

pub fn rubric_for(phase: Phase) -> &'static PhaseRubric {
    PHASE_TABLE
        .iter()
        .find(|r| r.phase == phase)
        .expect("PHASE_TABLE covers every Phase variant")
}

#[derive(Debug, Clone)]
pub struct PhaseEvaluation {
    pub score: u32,
    pub passed: bool,
    pub reason: String,
    pub improvements: Vec<String>,
}

/// Weighted phase score: round(Σ(s_i·weight_i) / Σ(weight_i)), missing criteria = 0 (P8).
///
/// §3 glosses this with a ceiling bracket but §8's boundary scenario 2 and
/// P8's formula both round to nearest, which is what this function does;
/// see DESIGN.md for the resolution of that inconsistency.
pub fn phase_score(phase: Phase, reported: &HashMap<String, u32>) -> u32 {
    let rubric = rubric_for(phase);
    let total_weight: u32 = rubric.criteria.iter().map(|c| c.weight).sum();
    let weighted_sum: f64 = rubric
        .criteria
        .iter()
        .map(|c| f64::from(reported.get(c.id).copied().unwrap_or(0) * c.weight))
        .sum();
    (weighted_sum / f64::from(total_weight)).round() as u32
}

/// `evaluatePhase(phase, reportedScores)` from §4.1.
pub fn evaluate_phase(
    phase: Phase,
    reported: &HashMap<String, u32>,
    recommendation: Recommendation,
) -> PhaseEvaluation {
    let rubric = rubric_for(phase);
    let score = phase_score(phase, reported);
    let passed = score >= rubric.min_score && recommendation == Recommendation::Proceed;

    let improvements: Vec<String> = rubric
        .criteria
        .iter()
        .filter(|c| reported.get(c.id).copied().unwrap_or(0) < rubric.min_score)
        .map(|c| format!("Improve '{}': {} (currently below the {} threshold)", c.id, c.description, rubric.min_score))
        .collect();

    let reason = if passed {
        format!("phase {} passed with score {}", phase.as_str(), score)
    } else if score < rubric.min_score {
        format!(
            "phase {} scored {} which is below the minimum {}",
            phase.as_str(),
            score,
            rubric.min_score
        )
    } else {
        format!("phase {} scored {} but recommendation was 'iterate'", phase.as_str(), score)
    };

    PhaseEvaluation { score, passed, reason, improvements }
}

/// `scoringRubric(phase)` — text the orchestrator embeds in the prompt.
pub fn scoring_rubric_text(phase: Phase) -> String {
    let rubric = rubric_for(phase);
    let mut out = format!(
        "Phase: {} (minimum passing score: {})\nCriteria:\n",
        phase.as_str(),
        rubric.min_score
    );
    for c in rubric.criteria {
        out.push_str(&format!("  - {} (weight {}): {}\n", c.id, c.weight, c.description));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_scenario_2_quality_gate_iterate() {
        let mut reported = HashMap::new();
        reported.insert("correctness".to_string(), 95);
        reported.insert("robustness".to_string(), 90);
        reported.insert("clarity".to_string(), 90);
        reported.insert("tests".to_string(), 40);
        reported.insert("perf".to_string(), 50);

        let score = phase_score(Phase::Implement, &reported);
        assert_eq!(score, 82); // round(8225/100) = round(82.25) = 82

        let eval = evaluate_phase(Phase::Implement, &reported, Recommendation::Proceed);
        assert!(!eval.passed);
        assert!(eval.improvements.iter().any(|i| i.contains("tests")));
        assert!(eval.improvements.iter().any(|i| i.contains("perf")));
    }

    #[test]
    fn p3_phase_score_monotonicity() {
        let mut a = HashMap::new();
        let mut b = HashMap::new();
        for c in rubric_for(Phase::Research).criteria {
            a.insert(c.id.to_string(), 80);
            b.insert(c.id.to_string(), 60);
        }
        assert!(phase_score(Phase::Research, &a) >= phase_score(Phase::Research, &b));
    }

    #[test]
    fn p8_missing_criteria_score_zero() {
        let reported = HashMap::new();
        assert_eq!(phase_score(Phase::Research, &reported), 0);
    }

    #[test]
    fn evaluate_phase_fails_without_proceed_recommendation() {
        let mut reported = HashMap::new();
        for c in rubric_for(Phase::Design).criteria {
            reported.insert(c.id.to_string(), 100);
        }
        let eval = evaluate_phase(Phase::Design, &reported, Recommendation::Iterate);
        assert_eq!(eval.score, 100);
        assert!(!eval.passed);
    }
}
