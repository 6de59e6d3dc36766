// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-turn lane routing with hysteresis.
//!
//! Decision order: caller override → keyword/regex classifier → heuristic.
//! A dwell counter suppresses non-override switches until the current lane
//! has held for `min_dwell` consecutive turns, so borderline prompts do
//! not flap between lanes.

use std::collections::HashMap;

use regex::RegexBuilder;
use tracing::debug;

use tiller_config::{Lane, ProviderConfig, RouterConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Override,
    Classifier,
    Heuristic,
    Hysteresis,
}

/// One provider target: the endpoint to try and the models to use on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTarget {
    pub provider: String,
    pub model: String,
    pub fallback_models: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub lane: Lane,
    pub source: DecisionSource,
    /// Ordered provider targets: the lane primary first, then configured
    /// fallback providers.
    pub targets: Vec<ProviderTarget>,
}

pub struct TurnRouter {
    config: RouterConfig,
    providers: HashMap<String, ProviderConfig>,
    /// Current lane and how many consecutive turns it has held.
    state: Option<(Lane, u32)>,
}

impl TurnRouter {
    pub fn new(config: RouterConfig, providers: HashMap<String, ProviderConfig>) -> Self {
        Self {
            config,
            providers,
            state: None,
        }
    }

    /// Reset hysteresis state (session reset).
    pub fn reset(&mut self) {
        self.state = None;
    }

    pub fn decide(&mut self, prompt: &str, requested: Option<Lane>) -> Decision {
        let (candidate, mut source) = match requested {
            Some(lane) => (lane, DecisionSource::Override),
            None => match self.classify(prompt) {
                Some(lane) => (lane, DecisionSource::Classifier),
                None => (self.heuristic(prompt), DecisionSource::Heuristic),
            },
        };

        let lane = match &mut self.state {
            None => {
                self.state = Some((candidate, 1));
                candidate
            }
            Some((lane, dwell)) => {
                if source == DecisionSource::Override {
                    if candidate != *lane {
                        *lane = candidate;
                        *dwell = 1;
                    } else {
                        *dwell += 1;
                    }
                } else if candidate == *lane {
                    *dwell += 1;
                    if *dwell < self.config.min_dwell {
                        source = DecisionSource::Hysteresis;
                    }
                } else if *dwell >= self.config.min_dwell {
                    *lane = candidate;
                    *dwell = 1;
                } else {
                    // Blocked switch: the lane must re-earn stability.
                    source = DecisionSource::Hysteresis;
                    *dwell = 0;
                }
                *lane
            }
        };

        debug!(lane = %lane, ?source, "lane decision");
        Decision {
            lane,
            source,
            targets: self.targets_for(lane),
        }
    }

    /// Highest-priority matching classifier rule, mapped to a lane via the
    /// configured hints.
    fn classify(&self, prompt: &str) -> Option<Lane> {
        let mut best: Option<(&str, i32)> = None;
        for rule in &self.config.rules {
            if let Some(min) = rule.min_len {
                if prompt.len() < min {
                    continue;
                }
            }
            if let Some(max) = rule.max_len {
                if prompt.len() > max {
                    continue;
                }
            }
            let Ok(re) = RegexBuilder::new(&rule.pattern).case_insensitive(true).build() else {
                continue;
            };
            if re.is_match(prompt) && best.map(|(_, p)| rule.priority > p).unwrap_or(true) {
                best = Some((rule.hint.as_str(), rule.priority));
            }
        }
        let (hint, _) = best?;
        self.config.lane_hints.get(hint).copied()
    }

    /// Length, token estimate, code blocks, file references and complex
    /// instruction words push a prompt into the heavy lane.
    fn heuristic(&self, prompt: &str) -> Lane {
        if prompt.len() > self.config.heavy_prompt_chars {
            return Lane::Heavy;
        }
        if prompt.contains("```") {
            return Lane::Heavy;
        }
        let file_refs = prompt
            .split_whitespace()
            .filter(|w| {
                w.rsplit_once('.')
                    .map(|(stem, ext)| {
                        !stem.is_empty() && (1..=4).contains(&ext.len()) && ext.chars().all(char::is_alphanumeric)
                    })
                    .unwrap_or(false)
            })
            .count();
        if file_refs >= 3 {
            return Lane::Heavy;
        }
        const COMPLEX: &[&str] = &[
            "refactor",
            "implement",
            "architecture",
            "migrate",
            "debug",
            "optimi",
            "redesign",
        ];
        let lower = prompt.to_lowercase();
        if COMPLEX.iter().any(|k| lower.contains(k)) {
            return Lane::Heavy;
        }
        Lane::Fast
    }

    /// Compose the ordered provider targets for a lane: primary first,
    /// then the configured fallback providers.  Per target: the provider's
    /// model, or the lane model when the provider declares none; fallback
    /// models are the lane fallbacks unioned with the provider's own,
    /// minus the primary model.
    fn targets_for(&self, lane: Lane) -> Vec<ProviderTarget> {
        let lane_cfg = match lane {
            Lane::Fast => &self.config.fast,
            Lane::Heavy => &self.config.heavy,
        };
        let mut names = vec![lane_cfg.provider.clone()];
        for fb in &self.config.fallback_providers {
            if !names.contains(fb) {
                names.push(fb.clone());
            }
        }

        names
            .into_iter()
            .filter_map(|name| {
                let provider = self.providers.get(&name)?;
                let model = provider
                    .model
                    .clone()
                    .or_else(|| lane_cfg.model.clone())
                    .unwrap_or_default();
                let mut fallbacks = lane_cfg.fallback_models.clone();
                for m in &provider.fallback_models {
                    if !fallbacks.contains(m) {
                        fallbacks.push(m.clone());
                    }
                }
                fallbacks.retain(|m| m != &model);
                Some(ProviderTarget {
                    provider: name,
                    model,
                    fallback_models: fallbacks,
                })
            })
            .collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
