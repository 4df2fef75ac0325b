//! Dice resolution for skill checks.
//!
//! Supports `NdM` with an optional keep clause: `3d6kh2`, `4d6kl2`.
//! Outcome tiers are fixed thresholds on the total, independent of die size.

use crate::lang::Language;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

/// Formula used whenever a requested formula cannot be parsed.
pub const DEFAULT_FORMULA: &str = "2d6";

/// Upper bound on dice in a single formula.
pub const MAX_DICE: u32 = 100;

/// Upper bound on die size.
pub const MAX_SIDES: u32 = 1000;

/// Error type for dice parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiceError {
    #[error("Invalid dice notation: {0}")]
    InvalidNotation(String),
    #[error("Invalid die size: {0}")]
    InvalidDieSize(u32),
    #[error("Invalid dice count: {0}")]
    InvalidCount(u32),
    #[error("Keep count must be at least 1 (in {0})")]
    InvalidKeepCount(String),
    #[error("No dice specified")]
    NoDice,
}

/// Which dice a keep clause retains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepRule {
    Highest(u32),
    Lowest(u32),
}

impl KeepRule {
    pub fn count(&self) -> u32 {
        match self {
            KeepRule::Highest(n) | KeepRule::Lowest(n) => *n,
        }
    }
}

/// A parsed dice formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceFormula {
    pub count: u32,
    pub sides: u32,
    pub keep: Option<KeepRule>,
}

impl Default for DiceFormula {
    fn default() -> Self {
        Self {
            count: 2,
            sides: 6,
            keep: None,
        }
    }
}

impl DiceFormula {
    /// Parse a formula such as `2d6`, `3d6kh2` or `4d6kl2`.
    pub fn parse(notation: &str) -> Result<Self, DiceError> {
        let notation: String = notation
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        if notation.is_empty() {
            return Err(DiceError::NoDice);
        }

        let invalid = || DiceError::InvalidNotation(notation.clone());

        let d_pos = notation.find('d').ok_or_else(invalid)?;
        let count_str = &notation[..d_pos];
        let rest = &notation[d_pos + 1..];

        let count: u32 = if count_str.is_empty() {
            1
        } else {
            count_str.parse().map_err(|_| invalid())?
        };

        let (sides_str, keep) = if let Some(pos) = rest.find("kh") {
            let keep: u32 = rest[pos + 2..].parse().map_err(|_| invalid())?;
            (&rest[..pos], Some(KeepRule::Highest(keep)))
        } else if let Some(pos) = rest.find("kl") {
            let keep: u32 = rest[pos + 2..].parse().map_err(|_| invalid())?;
            (&rest[..pos], Some(KeepRule::Lowest(keep)))
        } else {
            (rest, None)
        };

        let sides: u32 = sides_str.parse().map_err(|_| invalid())?;

        if count == 0 || count > MAX_DICE {
            return Err(DiceError::InvalidCount(count));
        }
        if sides < 2 || sides > MAX_SIDES {
            return Err(DiceError::InvalidDieSize(sides));
        }
        if keep.is_some_and(|k| k.count() == 0) {
            return Err(DiceError::InvalidKeepCount(notation));
        }

        Ok(DiceFormula { count, sides, keep })
    }

    /// Parse a formula, falling back to `2d6` when it is missing or invalid.
    pub fn parse_or_default(notation: &str) -> Self {
        match Self::parse(notation) {
            Ok(formula) => formula,
            Err(e) => {
                if !notation.trim().is_empty() {
                    warn!(formula = notation, error = %e, "Invalid dice formula, falling back to 2d6");
                }
                Self::default()
            }
        }
    }

    /// Number of dice that count toward the total.
    pub fn kept_count(&self) -> usize {
        match self.keep {
            Some(rule) => rule.count().min(self.count) as usize,
            None => self.count as usize,
        }
    }

    /// Roll the formula.
    pub fn roll(&self) -> DiceResult {
        self.roll_with_rng(&mut rand::thread_rng())
    }

    /// Roll with a specific RNG (useful for testing).
    pub fn roll_with_rng<R: Rng>(&self, rng: &mut R) -> DiceResult {
        let all_rolls: Vec<u32> = (0..self.count)
            .map(|_| rng.gen_range(1..=self.sides))
            .collect();
        self.resolve(all_rolls)
    }

    /// Apply the keep rule to already drawn faces.
    pub fn resolve(&self, all_rolls: Vec<u32>) -> DiceResult {
        let (kept_rolls, dropped_rolls) = match self.keep {
            None => (all_rolls.clone(), Vec::new()),
            Some(rule) => {
                let mut sorted = all_rolls.clone();
                match rule {
                    KeepRule::Highest(_) => sorted.sort_by(|a, b| b.cmp(a)),
                    KeepRule::Lowest(_) => sorted.sort(),
                }
                let dropped = sorted.split_off(self.kept_count());
                (sorted, dropped)
            }
        };

        let total = kept_rolls.iter().map(|&r| r as i32).sum();
        DiceResult {
            total,
            all_rolls,
            kept_rolls,
            dropped_rolls,
            outcome: Outcome::from_total(total),
        }
    }
}

impl FromStr for DiceFormula {
    type Err = DiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DiceFormula::parse(s)
    }
}

impl fmt::Display for DiceFormula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}d{}", self.count, self.sides)?;
        match self.keep {
            Some(KeepRule::Highest(n)) => write!(f, "kh{n}"),
            Some(KeepRule::Lowest(n)) => write!(f, "kl{n}"),
            None => Ok(()),
        }
    }
}

/// Narrative outcome tier of a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Critical,
    Success,
    Partial,
    Failure,
}

impl Outcome {
    pub fn from_total(total: i32) -> Self {
        match total {
            t if t >= 12 => Outcome::Critical,
            10..=11 => Outcome::Success,
            7..=9 => Outcome::Partial,
            _ => Outcome::Failure,
        }
    }

    pub fn label(&self, lang: Language) -> &'static str {
        match (self, lang) {
            (Outcome::Critical, Language::En) => "critical success",
            (Outcome::Success, Language::En) => "success",
            (Outcome::Partial, Language::En) => "partial success",
            (Outcome::Failure, Language::En) => "failure",
            (Outcome::Critical, Language::Zh) => "大成功",
            (Outcome::Success, Language::Zh) => "成功",
            (Outcome::Partial, Language::Zh) => "部分成功",
            (Outcome::Failure, Language::Zh) => "失败",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label(Language::En))
    }
}

/// Result of a check, either rolled here or submitted by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceResult {
    pub total: i32,
    pub all_rolls: Vec<u32>,
    pub kept_rolls: Vec<u32>,
    #[serde(default)]
    pub dropped_rolls: Vec<u32>,
    pub outcome: Outcome,
}

impl DiceResult {
    /// One-line description handed to the model when a turn resumes.
    pub fn describe(&self, lang: Language) -> String {
        let join = |rolls: &[u32]| {
            rolls
                .iter()
                .map(|r| r.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut text = match lang {
            Language::En => format!(
                "Dice result: total {} (rolled [{}], kept [{}]). Outcome: {}.",
                self.total,
                join(&self.all_rolls),
                join(&self.kept_rolls),
                self.outcome.label(lang)
            ),
            Language::Zh => format!(
                "掷骰结果：总计 {}（掷出 [{}]，保留 [{}]）。结果：{}。",
                self.total,
                join(&self.all_rolls),
                join(&self.kept_rolls),
                self.outcome.label(lang)
            ),
        };
        if !self.dropped_rolls.is_empty() {
            let dropped = join(&self.dropped_rolls);
            match lang {
                Language::En => text.push_str(&format!(" Dropped [{dropped}].")),
                Language::Zh => text.push_str(&format!("舍弃 [{dropped}]。")),
            }
        }
        text
    }
}

/// A roll as submitted by the client. `dropped_rolls` and `outcome` are optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceSubmission {
    pub total: i32,
    #[serde(default)]
    pub all_rolls: Vec<u32>,
    #[serde(default)]
    pub kept_rolls: Vec<u32>,
    #[serde(default)]
    pub outcome: Option<Outcome>,
}

impl DiceSubmission {
    /// Derive the missing fields: dropped rolls are `all_rolls` minus
    /// `kept_rolls` by value with multiplicity, the outcome comes from the total.
    pub fn normalize(self) -> DiceResult {
        let kept_rolls = if self.kept_rolls.is_empty() {
            self.all_rolls.clone()
        } else {
            self.kept_rolls
        };

        let mut unmatched = kept_rolls.clone();
        let mut dropped_rolls = Vec::new();
        for &roll in &self.all_rolls {
            if let Some(pos) = unmatched.iter().position(|&k| k == roll) {
                unmatched.swap_remove(pos);
            } else {
                dropped_rolls.push(roll);
            }
        }

        DiceResult {
            total: self.total,
            outcome: self.outcome.unwrap_or_else(|| Outcome::from_total(self.total)),
            all_rolls: self.all_rolls,
            kept_rolls,
            dropped_rolls,
        }
    }
}

impl From<DiceSubmission> for DiceResult {
    fn from(submission: DiceSubmission) -> Self {
        submission.normalize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_parse_simple() {
        let f = DiceFormula::parse("2d6").unwrap();
        assert_eq!(f.count, 2);
        assert_eq!(f.sides, 6);
        assert_eq!(f.keep, None);
    }

    #[test]
    fn test_parse_keep_rules() {
        let f = DiceFormula::parse("3d6kh2").unwrap();
        assert_eq!(f.keep, Some(KeepRule::Highest(2)));
        let f = DiceFormula::parse(" 4D6KL2 ").unwrap();
        assert_eq!(f.keep, Some(KeepRule::Lowest(2)));
        assert_eq!(f.to_string(), "4d6kl2");
    }

    #[test]
    fn test_parse_implicit_count() {
        let f = DiceFormula::parse("d20").unwrap();
        assert_eq!(f.count, 1);
        assert_eq!(f.sides, 20);
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(DiceFormula::parse(""), Err(DiceError::NoDice));
        assert!(DiceFormula::parse("abc").is_err());
        assert!(DiceFormula::parse("0d6").is_err());
        assert!(DiceFormula::parse("2d1").is_err());
        assert!(DiceFormula::parse("3d6kh0").is_err());
        assert!(DiceFormula::parse("3d6kx2").is_err());
    }

    #[test]
    fn test_invalid_falls_back_to_2d6() {
        assert_eq!(DiceFormula::parse_or_default("nonsense"), DiceFormula::default());
        assert_eq!(DiceFormula::parse_or_default(""), DiceFormula::default());
        assert_eq!(DiceFormula::default().to_string(), DEFAULT_FORMULA);
    }

    #[test]
    fn test_keep_count_is_clamped() {
        let f = DiceFormula::parse("2d6kh5").unwrap();
        assert_eq!(f.kept_count(), 2);
        let result = f.resolve(vec![3, 5]);
        assert_eq!(result.kept_rolls, vec![5, 3]);
        assert!(result.dropped_rolls.is_empty());
        assert_eq!(result.total, 8);
    }

    #[test]
    fn test_resolve_keep_highest() {
        let f = DiceFormula::parse("3d6kh2").unwrap();
        let result = f.resolve(vec![2, 6, 4]);
        assert_eq!(result.all_rolls, vec![2, 6, 4]);
        assert_eq!(result.kept_rolls, vec![6, 4]);
        assert_eq!(result.dropped_rolls, vec![2]);
        assert_eq!(result.total, 10);
        assert_eq!(result.outcome, Outcome::Success);
    }

    #[test]
    fn test_resolve_keep_lowest_with_ties() {
        let f = DiceFormula::parse("4d6kl2").unwrap();
        let result = f.resolve(vec![3, 1, 3, 6]);
        assert_eq!(result.kept_rolls, vec![1, 3]);
        assert_eq!(result.dropped_rolls, vec![3, 6]);
        assert_eq!(result.total, 4);
        assert_eq!(result.outcome, Outcome::Failure);
    }

    #[test]
    fn test_outcome_thresholds() {
        assert_eq!(Outcome::from_total(18), Outcome::Critical);
        assert_eq!(Outcome::from_total(12), Outcome::Critical);
        assert_eq!(Outcome::from_total(11), Outcome::Success);
        assert_eq!(Outcome::from_total(10), Outcome::Success);
        assert_eq!(Outcome::from_total(9), Outcome::Partial);
        assert_eq!(Outcome::from_total(7), Outcome::Partial);
        assert_eq!(Outcome::from_total(6), Outcome::Failure);
        assert_eq!(Outcome::from_total(-3), Outcome::Failure);
    }

    #[test]
    fn test_seeded_roll_is_deterministic() {
        let f = DiceFormula::parse("4d6kh3").unwrap();
        let a = f.roll_with_rng(&mut StdRng::seed_from_u64(7));
        let b = f.roll_with_rng(&mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn test_submission_normalization() {
        let submission = DiceSubmission {
            total: 9,
            all_rolls: vec![5, 4, 1],
            kept_rolls: vec![5, 4],
            outcome: None,
        };
        let result = submission.normalize();
        assert_eq!(result.dropped_rolls, vec![1]);
        assert_eq!(result.outcome, Outcome::Partial);
    }

    #[test]
    fn test_submission_keeps_explicit_outcome() {
        let json = r#"{"total": 9, "all_rolls": [5, 4], "kept_rolls": [5, 4], "outcome": "partial"}"#;
        let submission: DiceSubmission = serde_json::from_str(json).unwrap();
        let result: DiceResult = submission.into();
        assert_eq!(result.outcome, Outcome::Partial);
        assert!(result.dropped_rolls.is_empty());
    }

    #[test]
    fn test_describe_mentions_outcome() {
        let result = DiceFormula::default().resolve(vec![5, 4]);
        assert!(result.describe(Language::En).contains("partial success"));
        assert!(result.describe(Language::Zh).contains("部分成功"));
    }

    fn keep_strategy() -> impl Strategy<Value = Option<KeepRule>> {
        prop_oneof![
            Just(None),
            (1u32..12).prop_map(|n| Some(KeepRule::Highest(n))),
            (1u32..12).prop_map(|n| Some(KeepRule::Lowest(n))),
        ]
    }

    proptest! {
        #[test]
        fn prop_roll_shape(count in 1u32..10, sides in 2u32..30, keep in keep_strategy(), seed in any::<u64>()) {
            let formula = DiceFormula { count, sides, keep };
            let parsed = DiceFormula::parse(&formula.to_string()).unwrap();
            prop_assert_eq!(parsed, formula);

            let result = formula.roll_with_rng(&mut StdRng::seed_from_u64(seed));
            prop_assert_eq!(result.all_rolls.len(), count as usize);
            prop_assert!(result.all_rolls.iter().all(|&r| r >= 1 && r <= sides));

            let expected_kept = keep.map_or(count, |k| k.count().min(count)) as usize;
            prop_assert_eq!(result.kept_rolls.len(), expected_kept);
            prop_assert_eq!(result.kept_rolls.len() + result.dropped_rolls.len(), count as usize);

            let mut sorted = result.all_rolls.clone();
            match keep {
                Some(KeepRule::Highest(_)) => sorted.sort_by(|a, b| b.cmp(a)),
                Some(KeepRule::Lowest(_)) => sorted.sort(),
                None => {}
            }
            if keep.is_some() {
                prop_assert_eq!(&result.kept_rolls[..], &sorted[..expected_kept]);
            }
            prop_assert_eq!(result.total, result.kept_rolls.iter().map(|&r| r as i32).sum::<i32>());
            prop_assert_eq!(result.outcome, Outcome::from_total(result.total));
        }
    }
}
