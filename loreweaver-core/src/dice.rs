//! Dice rolling for the narrator's uncertainty checks.
//!
//! Supports the NdM±K notation the roll_dice tool accepts, e.g. "d20",
//! "2d6+1", "1d20-2".

use rand::Rng;
use serde::Serialize;
use thiserror::Error;

/// Error type for dice parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiceError {
    #[error("Invalid dice formula: {0}")]
    InvalidFormula(String),

    #[error("Unreasonable dice formula: {0}")]
    OutOfRange(String),
}

const MAX_COUNT: u32 = 100;
const MAX_SIDES: u32 = 1000;

/// The outcome of one dice roll.
#[derive(Debug, Clone, Serialize)]
pub struct DiceRoll {
    pub formula: String,
    pub rolls: Vec<u32>,
    pub modifier: i32,
    pub total: i64,
}

/// Roll a formula with the thread RNG.
pub fn roll(formula: &str) -> Result<DiceRoll, DiceError> {
    roll_with_rng(formula, &mut rand::thread_rng())
}

/// Roll a formula with a caller-supplied RNG (seedable for tests).
pub fn roll_with_rng<R: Rng>(formula: &str, rng: &mut R) -> Result<DiceRoll, DiceError> {
    let (count, sides, modifier) = parse_formula(formula)?;

    let rolls: Vec<u32> = (0..count).map(|_| rng.gen_range(1..=sides)).collect();
    let total = rolls.iter().map(|&r| r as i64).sum::<i64>() + modifier as i64;

    Ok(DiceRoll {
        formula: formula.trim().to_string(),
        rolls,
        modifier,
        total,
    })
}

/// Parse "NdM", "dM", or "NdM±K".
fn parse_formula(formula: &str) -> Result<(u32, u32, i32), DiceError> {
    let compact: String = formula.chars().filter(|c| !c.is_whitespace()).collect();
    let lower = compact.to_lowercase();

    let (dice_part, modifier) = match lower.find(|c| c == '+' || c == '-') {
        Some(pos) => {
            let modifier: i32 = lower[pos..]
                .parse()
                .map_err(|_| DiceError::InvalidFormula(formula.to_string()))?;
            (&lower[..pos], modifier)
        }
        None => (lower.as_str(), 0),
    };

    let (count_part, sides_part) = dice_part
        .split_once('d')
        .ok_or_else(|| DiceError::InvalidFormula(formula.to_string()))?;

    let count: u32 = if count_part.is_empty() {
        1
    } else {
        count_part
            .parse()
            .map_err(|_| DiceError::InvalidFormula(formula.to_string()))?
    };
    let sides: u32 = sides_part
        .parse()
        .map_err(|_| DiceError::InvalidFormula(formula.to_string()))?;

    if count == 0 || sides < 2 {
        return Err(DiceError::InvalidFormula(formula.to_string()));
    }
    if count > MAX_COUNT || sides > MAX_SIDES {
        return Err(DiceError::OutOfRange(formula.to_string()));
    }

    Ok((count, sides, modifier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_parse_shapes() {
        assert_eq!(parse_formula("1d20"), Ok((1, 20, 0)));
        assert_eq!(parse_formula("d20"), Ok((1, 20, 0)));
        assert_eq!(parse_formula("2d6+3"), Ok((2, 6, 3)));
        assert_eq!(parse_formula("2D6 - 1"), Ok((2, 6, -1)));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_formula("twenty").is_err());
        assert!(parse_formula("0d6").is_err());
        assert!(parse_formula("1d1").is_err());
        assert!(parse_formula("2d6+x").is_err());
        assert!(parse_formula("9999d6").is_err());
    }

    #[test]
    fn test_roll_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let result = roll_with_rng("3d6+2", &mut rng).expect("rolls");
            assert_eq!(result.rolls.len(), 3);
            assert!(result.rolls.iter().all(|&r| (1..=6).contains(&r)));
            assert!((5..=20).contains(&result.total));
        }
    }

    #[test]
    fn test_roll_is_seed_deterministic() {
        let a = roll_with_rng("4d8", &mut StdRng::seed_from_u64(42)).expect("rolls");
        let b = roll_with_rng("4d8", &mut StdRng::seed_from_u64(42)).expect("rolls");
        assert_eq!(a.rolls, b.rolls);
        assert_eq!(a.total, b.total);
    }

    #[test]
    fn test_negative_modifier_can_go_below_zero() {
        let result = roll_with_rng("1d2-5", &mut StdRng::seed_from_u64(1)).expect("rolls");
        assert!(result.total < 0);
    }
}
