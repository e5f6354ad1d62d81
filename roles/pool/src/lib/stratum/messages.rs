//! Line-delimited JSON-RPC messages exchanged with miners.

use serde::{ser::SerializeSeq, Deserialize, Serialize, Serializer};
use serde_json::Value;

pub const METHOD_SUBSCRIBE: &str = "mining.subscribe";
pub const METHOD_EXTRANONCE_SUBSCRIBE: &str = "mining.extranonce.subscribe";
pub const METHOD_AUTHORIZE: &str = "mining.authorize";
pub const METHOD_SUBMIT: &str = "mining.submit";
pub const METHOD_NOTIFY: &str = "mining.notify";
pub const METHOD_SET_DIFFICULTY: &str = "mining.set_difficulty";

pub const STRATUM_PROTOCOL: &str = "EthereumStratum/1.0.0";

/// JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// A request from a miner. Missing ids and params are tolerated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

/// A server-initiated message such as `mining.notify`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcEvent {
    pub id: Value,
    pub jsonrpc: &'static str,
    pub method: &'static str,
    pub params: Vec<Value>,
}

impl JsonRpcEvent {
    pub fn new(id: Value, method: &'static str, params: Vec<Value>) -> Self {
        Self {
            id,
            jsonrpc: "2.0",
            method,
            params,
        }
    }

    pub fn set_difficulty(difficulty: u64) -> Self {
        Self::new(Value::Null, METHOD_SET_DIFFICULTY, vec![Value::from(difficulty)])
    }

    pub fn notify(job_id: u32, params: Vec<Value>) -> Self {
        Self::new(Value::from(job_id), METHOD_NOTIFY, params)
    }
}

/// Error triple `[code, message, null]` as stratum miners expect it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl Serialize for RpcError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.code)?;
        seq.serialize_element(&self.message)?;
        seq.serialize_element(&Value::Null)?;
        seq.end()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonRpcResponse {
    pub id: Value,
    pub result: Value,
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}
