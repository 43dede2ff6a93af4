//! Builders for server→client packages.

use serde_json::json;

use crate::package::Package;
use crate::types::StateSnapshot;

/// Join acknowledgement carrying the assigned player id and the current
/// game state for the client's initial view.
pub fn join_ack(id: u64, my_id: u64, state: &StateSnapshot) -> Package {
    Package::from_value(&json!({
        "id": id,
        "result": "joined",
        "my_id": my_id,
        "players": state.players,
        "rays": state.rays,
    }))
}

/// Join refusal: the selected team is full.
pub fn join_full(id: u64) -> Package {
    Package::from_value(&json!({
        "id": id,
        "result": "full",
    }))
}

/// Broadcast carrying the full current state of a game.
pub fn update_broadcast(state: &StateSnapshot) -> Package {
    Package::from_value(&json!({
        "type": "update",
        "players": state.players,
        "rays": state.rays,
    }))
}

/// Advisory warning; the connection stays open.
pub fn warning(message: &str) -> Package {
    Package::from_value(&json!({
        "closed": false,
        "type": "warning",
        "message": message,
    }))
}

/// Error after which the server intends to close the connection.
pub fn error(message: &str) -> Package {
    Package::from_value(&json!({
        "closed": true,
        "type": "error",
        "message": message,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Color, PlayerState, Point};
    use serde_json::Value;

    fn decode(pkg: &Package) -> Value {
        serde_json::from_str(pkg.as_str()).unwrap()
    }

    #[test]
    fn join_ack_shape() {
        let state = StateSnapshot {
            players: vec![PlayerState {
                player_id: 0,
                team_id: 1,
                nick: "Al".into(),
                color: Color::default(),
                health: 100.0,
                position: Point::default(),
                angle: 0.0,
            }],
            rays: vec![],
        };
        let value = decode(&join_ack(7, 0, &state));
        assert_eq!(value["id"], 7);
        assert_eq!(value["result"], "joined");
        assert_eq!(value["my_id"], 0);
        assert_eq!(value["players"].as_array().unwrap().len(), 1);
        assert_eq!(value["players"][0]["nick"], "Al");
        assert_eq!(value["rays"], serde_json::json!([]));
    }

    #[test]
    fn join_full_shape() {
        let value = decode(&join_full(3));
        assert_eq!(value, serde_json::json!({"id": 3, "result": "full"}));
    }

    #[test]
    fn update_broadcast_shape() {
        let value = decode(&update_broadcast(&StateSnapshot::default()));
        assert_eq!(value["type"], "update");
        assert_eq!(value["players"], serde_json::json!([]));
        assert_eq!(value["rays"], serde_json::json!([]));
    }

    #[test]
    fn warning_is_advisory() {
        let value = decode(&warning("Received an unidentified package."));
        assert_eq!(value["closed"], false);
        assert_eq!(value["type"], "warning");
    }

    #[test]
    fn error_is_closing() {
        let value = decode(&error("boom"));
        assert_eq!(value["closed"], true);
        assert_eq!(value["type"], "error");
        assert_eq!(value["message"], "boom");
    }
}
