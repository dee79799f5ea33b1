use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, ops::RangeInclusive};

/// Card slots in a baccarat result (three per hand)
const BACCARAT_CARD_SLOTS: usize = 6;
const ROULETTE_POCKETS: RangeInclusive<i64> = 0..=36;

/// Supported table games
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum GameKind {
    Sicbo,
    Baccarat,
    Roulette,
}

impl fmt::Display for GameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameKind::Sicbo => write!(f, "sicbo"),
            GameKind::Baccarat => write!(f, "baccarat"),
            GameKind::Roulette => write!(f, "roulette"),
        }
    }
}

impl GameKind {
    /// Guess the game family from a table code such as `SBO-001` or `ARO-002`
    pub fn infer(game_code: &str) -> Option<Self> {
        let code = game_code.to_ascii_lowercase();
        if code.contains("sicbo") || code.starts_with("sbo") {
            Some(GameKind::Sicbo)
        } else if code.contains("baccarat") || code.starts_with("bac") || code.starts_with("bcr") {
            Some(GameKind::Baccarat)
        } else if code.contains("roulette") || code.starts_with("rou") || code.starts_with("aro") {
            Some(GameKind::Roulette)
        } else {
            None
        }
    }

    /// Placeholder result returned when detection times out
    pub fn default_result(self) -> RoundResult {
        match self {
            GameKind::Sicbo => RoundResult::Dice(vec![0, 0, 0]),
            GameKind::Baccarat => RoundResult::Cards(vec![String::new(); BACCARAT_CARD_SLOTS]),
            GameKind::Roulette => RoundResult::Number(-1),
        }
    }

    /// Argument key carrying the input stream in detect commands
    pub fn input_key(self) -> &'static str {
        match self {
            GameKind::Baccarat => "input_stream",
            GameKind::Sicbo | GameKind::Roulette => "input",
        }
    }

    /// Argument key carrying the output stream in detect commands
    pub fn output_key(self) -> &'static str {
        match self {
            GameKind::Baccarat => "output_stream",
            GameKind::Sicbo | GameKind::Roulette => "output",
        }
    }

    /// Decode the backend's `res` field into this game's result shape
    pub fn parse_result(self, res: &Value) -> Option<RoundResult> {
        match self {
            GameKind::Sicbo => {
                let dice = res
                    .as_array()?
                    .iter()
                    .map(|v| v.as_i64())
                    .collect::<Option<Vec<i64>>>()?;
                (dice.len() == 3).then_some(RoundResult::Dice(dice))
            }
            GameKind::Baccarat => {
                let cards = res
                    .as_array()?
                    .iter()
                    .map(|v| v.as_str().map(str::to_string))
                    .collect::<Option<Vec<String>>>()?;
                (cards.len() == BACCARAT_CARD_SLOTS).then_some(RoundResult::Cards(cards))
            }
            GameKind::Roulette => {
                let pocket = match res {
                    Value::Number(n) => n.as_i64()?,
                    Value::String(s) => s.trim().parse().ok()?,
                    _ => return None,
                };
                ROULETTE_POCKETS.contains(&pocket).then_some(RoundResult::Number(pocket))
            }
        }
    }
}

/// Outcome of one round as reported by the detection backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum RoundResult {
    /// Three die faces
    Dice(Vec<i64>),
    /// Card codes, six slots for baccarat
    Cards(Vec<String>),
    /// Winning pocket 0-36
    Number(i64),
}

impl RoundResult {
    pub fn as_number(&self) -> Option<i64> {
        match self {
            RoundResult::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_dice(&self) -> Option<&[i64]> {
        match self {
            RoundResult::Dice(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_cards(&self) -> Option<&[String]> {
        match self {
            RoundResult::Cards(c) => Some(c),
            _ => None,
        }
    }
}

impl fmt::Display for RoundResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundResult::Dice(d) => write!(f, "{:?}", d),
            RoundResult::Cards(c) => write!(f, "{:?}", c),
            RoundResult::Number(n) => write!(f, "{}", n),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_results() {
        assert_eq!(GameKind::Sicbo.default_result(), RoundResult::Dice(vec![0, 0, 0]));
        assert_eq!(
            GameKind::Baccarat.default_result().as_cards().map(|c| c.len()),
            Some(6)
        );
        assert_eq!(GameKind::Roulette.default_result().as_number(), Some(-1));
    }

    #[test]
    fn test_infer_from_code() {
        assert_eq!(GameKind::infer("SBO-001"), Some(GameKind::Sicbo));
        assert_eq!(GameKind::infer("BCR-002"), Some(GameKind::Baccarat));
        assert_eq!(GameKind::infer("ARO-001"), Some(GameKind::Roulette));
        assert_eq!(GameKind::infer("XYZ"), None);
    }

    #[test]
    fn test_parse_result_shapes() {
        assert_eq!(
            GameKind::Sicbo.parse_result(&json!([1, 4, 6])),
            Some(RoundResult::Dice(vec![1, 4, 6]))
        );
        assert_eq!(GameKind::Sicbo.parse_result(&json!([1, 4])), None);
        assert_eq!(
            GameKind::Roulette.parse_result(&json!(19)),
            Some(RoundResult::Number(19))
        );
        assert_eq!(
            GameKind::Roulette.parse_result(&json!("7")),
            Some(RoundResult::Number(7))
        );
        assert_eq!(GameKind::Roulette.parse_result(&json!(0)), Some(RoundResult::Number(0)));
        assert_eq!(GameKind::Roulette.parse_result(&json!(36)), Some(RoundResult::Number(36)));
        assert_eq!(GameKind::Roulette.parse_result(&json!(37)), None);
        assert_eq!(GameKind::Roulette.parse_result(&json!(99)), None);
        assert_eq!(GameKind::Roulette.parse_result(&json!(-1)), None);
        assert_eq!(GameKind::Roulette.parse_result(&json!("40")), None);
        assert_eq!(GameKind::Baccarat.parse_result(&json!(["As", "Kd"])), None);
        assert_eq!(
            GameKind::Baccarat.parse_result(&json!(["As", "Kd", "", "", "", "", "Qh"])),
            None
        );
        assert_eq!(
            GameKind::Baccarat.parse_result(&json!(["As", "Kd", "", "", "", ""])),
            Some(RoundResult::Cards(vec![
                "As".into(),
                "Kd".into(),
                "".into(),
                "".into(),
                "".into(),
                "".into()
            ]))
        );
    }
}
