//! Elo ratings from team results
//!
//! A group of `2n` cars is split by position into two teams: even positions
//! form team 1, odd positions team 2. The team score is the sum of its members'
//! episode rewards. The single team result is then applied as independent 1v1
//! Elo updates to the position pairs `(p0, p1), (p2, p3), ...`, so an agent's
//! rating also reacts to its partner's contribution.

use anyhow::{Result, anyhow};

use super::population::{AgentId, Population};

/// Ratings never drop below this floor
pub const MIN_RATING: f64 = 1.0;

/// Expected score of a player rated `rating` against `opponent`
pub fn expected_score(rating: f64, opponent: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((opponent - rating) / 400.0))
}

/// Result of a contest from the first player's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    Win,
    Draw,
    Loss,
}

impl MatchResult {
    pub fn score(self) -> f64 {
        match self {
            Self::Win => 1.0,
            Self::Draw => 0.5,
            Self::Loss => 0.0,
        }
    }

    /// The same contest seen from the other side
    pub fn reversed(self) -> Self {
        match self {
            Self::Win => Self::Loss,
            Self::Draw => Self::Draw,
            Self::Loss => Self::Win,
        }
    }
}

/// Rating change of player A; player B changes by the negation
pub fn elo_delta(rating_a: f64, rating_b: f64, result: MatchResult, k_factor: f64) -> f64 {
    k_factor * (result.score() - expected_score(rating_a, rating_b))
}

/// Outcome of a team race
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeamOutcome {
    Team1Wins,
    Team2Wins,
    Draw,
}

impl TeamOutcome {
    /// Classify per-position rewards; equal team scores are a draw
    pub fn classify(rewards: &[f64]) -> Self {
        let team1: f64 = rewards.iter().step_by(2).sum();
        let team2: f64 = rewards.iter().skip(1).step_by(2).sum();

        if team1 > team2 {
            Self::Team1Wins
        } else if team1 < team2 {
            Self::Team2Wins
        } else {
            Self::Draw
        }
    }

    /// Result for the team-1 member of each Elo pair
    pub fn team1_result(self) -> MatchResult {
        match self {
            Self::Team1Wins => MatchResult::Win,
            Self::Team2Wins => MatchResult::Loss,
            Self::Draw => MatchResult::Draw,
        }
    }
}

/// Elo bookkeeping for scheduled groups
#[derive(Debug, Clone, Copy)]
pub struct RatingSystem {
    k_factor: f64,
}

impl RatingSystem {
    pub fn new(k_factor: f64) -> Self {
        Self { k_factor }
    }

    /// Apply one 1v1 update in place
    ///
    /// The update is zero-sum unless the loser hits [`MIN_RATING`].
    pub fn update_pair(&self, rating_a: &mut f64, rating_b: &mut f64, result: MatchResult) {
        let delta = elo_delta(*rating_a, *rating_b, result, self.k_factor);
        *rating_a = (*rating_a + delta).max(MIN_RATING);
        *rating_b = (*rating_b - delta).max(MIN_RATING);
    }

    /// Rate one finished group
    ///
    /// `group` lists agents by car slot, `rewards` holds each slot's episode
    /// reward. Returns the team outcome that was applied.
    pub fn rate_group<P>(
        &self,
        population: &mut Population<P>,
        group: &[AgentId],
        rewards: &[f64],
    ) -> Result<TeamOutcome> {
        if group.len() != rewards.len() || group.len() % 2 != 0 {
            return Err(anyhow!(
                "cannot rate a group of {} agents with {} rewards",
                group.len(),
                rewards.len()
            ));
        }

        let outcome = TeamOutcome::classify(rewards);
        let result = outcome.team1_result();
        for pair in group.chunks(2) {
            let (a, b) = population.pair_mut(pair[0], pair[1])?;
            self.update_pair(&mut a.rating, &mut b.rating, result);
        }

        tracing::debug!(?group, ?rewards, ?outcome, "rated group");
        Ok(outcome)
    }
}
