//! Per-system tallies derived from a Comparison's evaluations. Nothing here is
//! persisted; the evaluations stay the single source of truth.

use std::cmp::Ordering;

use serde::Serialize;

use crate::model::{Comparison, Winner};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemTally {
    pub system: String,
    pub wins: usize,
    pub ties: usize,
    pub losses: usize,
    pub errors: usize,
    pub win_pct: f64,
    pub tie_pct: f64,
    pub loss_pct: f64,
    pub error_pct: f64,
    /// Mean of the judge's scores for this system, over evaluations that scored it.
    pub mean_score: Option<f64>,
    pub scored: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Scorecard {
    pub comparison_id: String,
    pub domain: String,
    pub total: usize,
    /// Best first: most wins, then highest mean score.
    pub ranking: Vec<SystemTally>,
}

impl Scorecard {
    pub fn from_comparison(comparison: &Comparison) -> Self {
        let total = comparison.evaluations.len();
        let mut ranking = comparison
            .systems
            .iter()
            .map(|system| tally_system(comparison, system, total))
            .collect::<Vec<SystemTally>>();

        ranking.sort_by(|left, right| {
            right
                .wins
                .cmp(&left.wins)
                .then_with(|| compare_scores(right.mean_score, left.mean_score))
        });

        Self {
            comparison_id: comparison.id.clone(),
            domain: comparison.domain.clone(),
            total,
            ranking,
        }
    }

    #[cfg(test)]
    pub fn tally(&self, system: &str) -> Option<&SystemTally> {
        self.ranking.iter().find(|tally| tally.system == system)
    }
}

fn tally_system(comparison: &Comparison, system: &str, total: usize) -> SystemTally {
    let mut tally = SystemTally {
        system: system.to_string(),
        wins: 0,
        ties: 0,
        losses: 0,
        errors: 0,
        win_pct: 0.0,
        tie_pct: 0.0,
        loss_pct: 0.0,
        error_pct: 0.0,
        mean_score: None,
        scored: 0,
    };
    let mut score_sum = 0.0;

    for evaluation in &comparison.evaluations {
        match &evaluation.winner {
            Winner::Error => tally.errors += 1,
            Winner::Tie => tally.ties += 1,
            winner if winner.includes(system) => tally.wins += 1,
            Winner::Systems(_) => tally.losses += 1,
        }
        if let Some(score) = evaluation.scores.get(system) {
            score_sum += score;
            tally.scored += 1;
        }
    }

    tally.win_pct = percent(tally.wins, total);
    tally.tie_pct = percent(tally.ties, total);
    tally.loss_pct = percent(tally.losses, total);
    tally.error_pct = percent(tally.errors, total);
    if tally.scored > 0 {
        tally.mean_score = Some(score_sum / tally.scored as f64);
    }
    tally
}

fn percent(count: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    count as f64 * 100.0 / total as f64
}

// Unscored systems sort after scored ones.
fn compare_scores(left: Option<f64>, right: Option<f64>) -> Ordering {
    match (left, right) {
        (Some(left), Some(right)) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}
