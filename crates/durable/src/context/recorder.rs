//! Flow-shape recording
//!
//! A handler run against a recording context produces the ordered list of
//! durable primitives it would touch, without executing any user work. Used
//! by documentation and dashboards to render workflow structure.

use serde::{Deserialize, Serialize};

/// One durable primitive observed while recording a handler's shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowNode {
    Step {
        step_id: String,
    },
    Sleep {
        step_id: String,
        duration_ms: u64,
    },
    WaitSignal {
        signal_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Emit {
        event: String,
        step_id: String,
    },
    Switch {
        step_id: String,
        branches: Vec<String>,
    },
    Note {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_serialization() {
        let node = FlowNode::WaitSignal {
            signal_id: "paid".to_string(),
            step_id: None,
            timeout_ms: Some(5_000),
        };
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json.get("kind").and_then(|v| v.as_str()), Some("wait_signal"));
        assert!(json.get("step_id").is_none());

        let parsed: FlowNode = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, node);
    }
}
