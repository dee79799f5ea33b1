//! JSON payloads exchanged with the detection backend
//!
//! Commands: `{"command": "detect", "arg": {"round_id": .., "input": .., "output": ..}}`
//! Responses: `{"response": "result", "arg": {"round_id": .., "res": .., "err": 0}}`

use super::types::{GameKind, RoundResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stream locations handed to the backend with a detect command
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectParams {
    pub input: String,
    #[serde(default)]
    pub output: Option<String>,
}

impl DetectParams {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// Command sent on the game's command topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectCommand {
    pub command: String,
    pub arg: Map<String, Value>,
}

impl DetectCommand {
    pub fn detect(game: GameKind, round_id: &str, params: &DetectParams) -> Self {
        let mut arg = Map::new();
        arg.insert("round_id".to_string(), Value::String(round_id.to_string()));
        arg.insert(game.input_key().to_string(), Value::String(params.input.clone()));
        if let Some(ref output) = params.output {
            arg.insert(game.output_key().to_string(), Value::String(output.clone()));
        }
        Self {
            command: "detect".to_string(),
            arg,
        }
    }

    /// Tells the backend to abandon detection work for a round
    pub fn timeout(round_id: &str) -> Self {
        let mut arg = Map::new();
        arg.insert("round_id".to_string(), Value::String(round_id.to_string()));
        Self {
            command: "timeout".to_string(),
            arg,
        }
    }

    pub fn round_id(&self) -> Option<&str> {
        self.arg.get("round_id").and_then(Value::as_str)
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseArg {
    #[serde(default)]
    pub round_id: Option<String>,
    #[serde(default)]
    pub res: Value,
    #[serde(default)]
    pub err: i64,
}

/// Message published by the backend on the response topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DetectResponse {
    pub response: String,
    pub arg: ResponseArg,
}

impl DetectResponse {
    pub fn parse(payload: &[u8]) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }

    pub fn is_result(&self) -> bool {
        self.response == "result"
    }

    pub fn matches_round(&self, round_id: &str) -> bool {
        self.arg.round_id.as_deref() == Some(round_id)
    }

    /// Decoded `res` for the given game, if it has the right shape
    pub fn result(&self, game: GameKind) -> Option<RoundResult> {
        game.parse_result(&self.arg.res)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detect_command_keys_per_game() {
        let params = DetectParams::new("rtmp://in").with_output("rtmp://out");

        let sicbo = DetectCommand::detect(GameKind::Sicbo, "R1", &params);
        let value: Value = serde_json::from_slice(&sicbo.to_payload().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"command": "detect", "arg": {"round_id": "R1", "input": "rtmp://in", "output": "rtmp://out"}})
        );

        let baccarat = DetectCommand::detect(GameKind::Baccarat, "R2", &DetectParams::new("cam"));
        assert_eq!(baccarat.arg.get("input_stream"), Some(&json!("cam")));
        assert!(baccarat.arg.get("output_stream").is_none());
        assert_eq!(baccarat.round_id(), Some("R2"));
    }

    #[test]
    fn test_timeout_command() {
        let cmd = DetectCommand::timeout("R9");
        assert_eq!(cmd.command, "timeout");
        assert_eq!(cmd.round_id(), Some("R9"));
    }

    #[test]
    fn test_parse_response() {
        let payload = br#"{"response":"result","arg":{"round_id":"R1","res":19,"err":0}}"#;
        let resp = DetectResponse::parse(payload).unwrap();
        assert!(resp.is_result());
        assert!(resp.matches_round("R1"));
        assert!(!resp.matches_round("R2"));
        assert_eq!(resp.result(GameKind::Roulette), Some(RoundResult::Number(19)));

        assert!(DetectResponse::parse(b"not json").is_none());
    }
}
