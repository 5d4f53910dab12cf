//! Self-refinement loop: confidence scoring and the pass state machine.

use tracing::debug;

use rag_core::{ConfidenceScorer, Decision, IterationRecord, RagError, RankedResult, Result};

/// Default confidence estimate.
///
/// Combines the agreement of the top result (its fused score divided by the
/// number of fused lists), the gap to the runner-up, and how full the result
/// list is. Pure and bounded to `[0, 1]`.
///
/// Fused scores are min-max normalized per list, so the estimate measures the
/// shape of the ranking, not absolute similarity. With a single list the top
/// term is always 1.0 and only spread and coverage discriminate; uniformly
/// weak and uniformly strong lists of the same shape score alike. Raw scores
/// are not comparable across backends, so they are not consulted. Supply a
/// custom [`ConfidenceScorer`] when absolute relevance matters.
#[derive(Debug, Clone)]
pub struct HeuristicConfidence {
    pub top_weight: f32,
    pub spread_weight: f32,
    pub coverage_weight: f32,
    /// Result count at which coverage saturates.
    pub saturation: usize,
}

impl Default for HeuristicConfidence {
    fn default() -> Self {
        Self {
            top_weight: 0.4,
            spread_weight: 0.4,
            coverage_weight: 0.2,
            saturation: 3,
        }
    }
}

impl ConfidenceScorer for HeuristicConfidence {
    fn score(&self, results: &[RankedResult], list_count: usize) -> f32 {
        let Some(first) = results.first() else {
            return 0.0;
        };
        if list_count == 0 {
            return 0.0;
        }

        let lists = list_count as f32;
        let top = (first.fused_score / lists).clamp(0.0, 1.0);
        let second = results
            .get(1)
            .map(|r| (r.fused_score / lists).clamp(0.0, 1.0))
            .unwrap_or(0.0);
        let spread = (top - second).clamp(0.0, 1.0);
        let coverage = (results.len() as f32 / self.saturation.max(1) as f32).min(1.0);

        let total = self.top_weight + self.spread_weight + self.coverage_weight;
        if total <= 0.0 {
            return 0.0;
        }
        let score = (self.top_weight * top
            + self.spread_weight * spread
            + self.coverage_weight * coverage)
            / total;
        clamp_confidence(score)
    }
}

/// Map NaN to 0 and clamp to `[0, 1]`.
pub fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// States of the refinement loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Start,
    Retrieving { iteration: u32 },
    Assessing { iteration: u32 },
    Accepted,
    BudgetExhausted,
}

/// Bounded retrieve/assess loop.
///
/// Drive it with [`RefineLoop::next_pass`] and [`RefineLoop::assess`]. Each
/// assessment appends exactly one [`IterationRecord`]; at most
/// `max_iterations` records are produced and the last one is terminal.
#[derive(Debug)]
pub struct RefineLoop {
    max_iterations: u32,
    threshold: f32,
    floor: f32,
    state: LoopState,
    records: Vec<IterationRecord>,
}

impl RefineLoop {
    /// `max_iterations` below 1 is treated as 1.
    pub fn new(max_iterations: u32, threshold: f32, floor: f32) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
            threshold,
            floor,
            state: LoopState::Start,
            records: Vec::new(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn records(&self) -> &[IterationRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<IterationRecord> {
        self.records
    }

    /// Index of the pass to run next, or `None` once the loop is terminal.
    pub fn next_pass(&mut self) -> Option<u32> {
        match self.state {
            LoopState::Start => {
                self.state = LoopState::Retrieving { iteration: 0 };
                Some(0)
            }
            LoopState::Retrieving { iteration } => Some(iteration),
            LoopState::Assessing { .. } | LoopState::Accepted | LoopState::BudgetExhausted => {
                None
            }
        }
    }

    /// Decision for a pass with the given confidence.
    pub fn decide(&self, iteration: u32, confidence: f32) -> Decision {
        if confidence >= self.threshold {
            Decision::Accept
        } else if iteration + 1 >= self.max_iterations {
            if confidence > self.floor {
                Decision::Accept
            } else {
                Decision::AbortBudget
            }
        } else {
            Decision::RetrieveAgain
        }
    }

    /// Record the outcome of the current pass and move to the next state.
    pub fn assess(&mut self, ranked_results: Vec<RankedResult>, confidence: f32) -> Result<Decision> {
        let LoopState::Retrieving { iteration } = self.state else {
            return Err(RagError::internal(format!(
                "assess called in state {:?}",
                self.state
            )));
        };
        self.state = LoopState::Assessing { iteration };

        let confidence = clamp_confidence(confidence);
        let decision = self.decide(iteration, confidence);
        debug!(
            "Refinement pass {} confidence {:.3} -> {:?}",
            iteration, confidence, decision
        );

        self.records.push(IterationRecord {
            iteration_index: iteration,
            ranked_results,
            confidence,
            decision,
        });

        self.state = match decision {
            Decision::Accept => LoopState::Accepted,
            Decision::AbortBudget => LoopState::BudgetExhausted,
            Decision::RetrieveAgain => LoopState::Retrieving {
                iteration: iteration + 1,
            },
        };
        Ok(decision)
    }

    /// The pass whose results the run returns: the accepted pass, or on
    /// budget exhaustion the highest-confidence pass (later passes win ties).
    pub fn selected(&self) -> Option<&IterationRecord> {
        match self.state {
            LoopState::Accepted => self.records.last(),
            _ => self.records.iter().fold(None, |best, record| match best {
                Some(b) if b.confidence > record.confidence => Some(b),
                _ => Some(record),
            }),
        }
    }
}
