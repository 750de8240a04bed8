use chrono::{DateTime, Utc};
use overseer_shared::{KnobSet, Policy, PolicyParameters, SimMetrics};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::canary::CanaryRun;
use crate::config::SearchConfig;
use crate::scoring::ScoreWeights;

/// Narrow mutations use this fraction of the configured delta.
const NARROW_DELTA_FACTOR: f64 = 0.09 / 0.16;

/// A tracked, simulated policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub policy_id: String,
    pub parameters: PolicyParameters,
    pub metrics: SimMetrics,
    pub score: f64,
    pub created_at: DateTime<Utc>,
    pub rank: usize,
}

impl Member {
    #[must_use]
    pub fn from_policy(policy: &Policy, metrics: SimMetrics, score: f64) -> Self {
        Self {
            policy_id: policy.policy_id.clone(),
            parameters: policy.parameters.clone(),
            metrics,
            score,
            created_at: policy.created_at,
            rank: 0,
        }
    }
}

/// Fitness order, best first: score descending, then lower variance, then newer.
#[must_use]
pub fn compare_fitness(a: &Member, b: &Member) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.metrics.variance.total_cmp(&b.metrics.variance))
        .then_with(|| b.created_at.cmp(&a.created_at))
}

/// Ranked, bounded set of policies the search breeds from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Population {
    members: Vec<Member>,
}

impl Population {
    #[must_use]
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    #[must_use]
    pub fn best(&self) -> Option<&Member> {
        self.members.first()
    }

    #[must_use]
    pub fn contains(&self, policy_id: &str) -> bool {
        self.members.iter().any(|m| m.policy_id == policy_id)
    }

    pub fn remove(&mut self, policy_id: &str) -> Option<Member> {
        let idx = self.members.iter().position(|m| m.policy_id == policy_id)?;
        let member = self.members.remove(idx);
        self.rerank();
        Some(member)
    }

    /// Recomputes every score under `weights` and re-sorts.
    pub fn rescore(&mut self, weights: &ScoreWeights) {
        for m in &mut self.members {
            m.score = weights.score(&m.metrics);
        }
        self.rerank();
    }

    fn rerank(&mut self) {
        self.members.sort_by(compare_fitness);
        for (rank, m) in self.members.iter_mut().enumerate() {
            m.rank = rank;
        }
    }

    /// Inserts the new members, re-ranks and evicts everything beyond `cap`.
    /// Returns the evicted members, worst last.
    pub fn absorb(&mut self, incoming: Vec<Member>, cap: usize) -> Vec<Member> {
        for m in incoming {
            if !self.contains(&m.policy_id) {
                self.members.push(m);
            }
        }
        self.rerank();
        if self.members.len() > cap {
            self.members.split_off(cap)
        } else {
            Vec::new()
        }
    }
}

/// Everything the search needs to resume after a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PopulationState {
    pub population: Population,
    pub canary: Option<CanaryRun>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub parent_id: String,
    /// Second parent when the proposal came from crossover.
    pub co_parent_id: Option<String>,
    pub parameters: PolicyParameters,
}

/// Mutation/crossover proposer over the ranked population.
#[derive(Debug, Clone)]
pub struct PopulationSearch {
    config: SearchConfig,
    knobs: KnobSet,
}

impl PopulationSearch {
    #[must_use]
    pub fn new(config: SearchConfig, knobs: KnobSet) -> Self {
        Self { config, knobs }
    }

    #[must_use]
    pub fn population_cap(&self) -> usize {
        self.config.population_cap
    }

    /// Proposes this generation's candidates. An empty population breeds from
    /// the incumbent alone.
    pub fn propose<R: Rng + ?Sized>(
        &self,
        population: &Population,
        incumbent: &Policy,
        rng: &mut R,
    ) -> Vec<Proposal> {
        let parents: Vec<(&str, &PolicyParameters)> = if population.is_empty() {
            vec![(incumbent.policy_id.as_str(), &incumbent.parameters)]
        } else {
            population
                .members()
                .iter()
                .map(|m| (m.policy_id.as_str(), &m.parameters))
                .collect()
        };

        let n = self.config.candidates_per_generation;
        let wide_count = n.div_ceil(2);
        (0..n)
            .map(|i| {
                let delta = if i < wide_count {
                    self.config.mutation_delta
                } else {
                    self.config.mutation_delta * NARROW_DELTA_FACTOR
                };
                let (parent_id, parent) = pick_parent(&parents, rng);
                if parents.len() > 1 && rng.gen_bool(self.config.crossover_rate.clamp(0.0, 1.0)) {
                    let (other_id, other) = pick_distinct(&parents, parent_id, rng);
                    let child = self.crossover(parent, other, rng);
                    Proposal {
                        parent_id: parent_id.to_string(),
                        co_parent_id: Some(other_id.to_string()),
                        parameters: self.mutate(&child, delta, rng),
                    }
                } else {
                    Proposal {
                        parent_id: parent_id.to_string(),
                        co_parent_id: None,
                        parameters: self.mutate(parent, delta, rng),
                    }
                }
            })
            .collect()
    }

    /// Perturbs a random, non-empty subset of knobs by at most `max_delta` each.
    pub fn mutate<R: Rng + ?Sized>(
        &self,
        params: &PolicyParameters,
        max_delta: f64,
        rng: &mut R,
    ) -> PolicyParameters {
        let mut out = params.clone();
        if self.knobs.knobs.is_empty() || max_delta <= 0.0 {
            return out;
        }
        let mut touched = false;
        for knob in &self.knobs.knobs {
            if rng.gen_bool(0.5) {
                let v = out.get(&knob.name).unwrap_or(knob.min);
                out.set(knob.name.clone(), v + rng.gen_range(-max_delta..=max_delta));
                touched = true;
            }
        }
        if !touched {
            if let Some(knob) = self.knobs.knobs.choose(rng) {
                let v = out.get(&knob.name).unwrap_or(knob.min);
                out.set(knob.name.clone(), v + rng.gen_range(-max_delta..=max_delta));
            }
        }
        self.knobs.clamp(&mut out);
        out
    }

    /// Uniform crossover: each knob comes from either parent.
    pub fn crossover<R: Rng + ?Sized>(
        &self,
        a: &PolicyParameters,
        b: &PolicyParameters,
        rng: &mut R,
    ) -> PolicyParameters {
        let mut out = a.clone();
        for knob in &self.knobs.knobs {
            if rng.gen_bool(0.5) {
                if let Some(v) = b.get(&knob.name) {
                    out.set(knob.name.clone(), v);
                }
            }
        }
        out
    }
}

/// Rank-biased pick: squaring a uniform draw favours the front of the list.
fn pick_parent<'a, R: Rng + ?Sized>(
    parents: &[(&'a str, &'a PolicyParameters)],
    rng: &mut R,
) -> (&'a str, &'a PolicyParameters) {
    let u: f64 = rng.gen();
    let idx = ((u * u) * parents.len() as f64) as usize;
    parents[idx.min(parents.len() - 1)]
}

fn pick_distinct<'a, R: Rng + ?Sized>(
    parents: &[(&'a str, &'a PolicyParameters)],
    exclude: &str,
    rng: &mut R,
) -> (&'a str, &'a PolicyParameters) {
    let others: Vec<_> = parents.iter().filter(|(id, _)| *id != exclude).collect();
    match others.choose(rng) {
        Some(p) => **p,
        None => parents[0],
    }
}
