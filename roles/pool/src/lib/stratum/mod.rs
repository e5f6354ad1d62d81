//! ## Stratum
//!
//! Miner-facing protocol: line-delimited JSON-RPC over TCP. [`StratumHandler`] answers
//! requests for one session; [`server::StratumServer`] owns the listener and the
//! per-connection read and write tasks.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::{
    error::ShareError,
    session::MiningSession,
    share_validator::{ShareOutcome, ShareValidator},
};

pub mod messages;
pub mod server;

use messages::{
    JsonRpcRequest, JsonRpcResponse, METHOD_AUTHORIZE, METHOD_EXTRANONCE_SUBSCRIBE,
    METHOD_NOT_FOUND, METHOD_SUBMIT, METHOD_SUBSCRIBE, STRATUM_PROTOCOL,
};

pub struct StratumHandler {
    validator: Arc<ShareValidator>,
}

impl StratumHandler {
    pub fn new(validator: Arc<ShareValidator>) -> Self {
        Self { validator }
    }

    pub async fn handle(&self, session: &MiningSession, request: JsonRpcRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            METHOD_SUBSCRIBE => {
                if let Some(remote_app) = request.params.first().and_then(Value::as_str) {
                    session.set_remote_app(remote_app);
                }
                debug!(client_id = session.id(), "Subscribed");
                JsonRpcResponse::ok(request.id, json!([true, STRATUM_PROTOCOL]))
            }
            METHOD_EXTRANONCE_SUBSCRIBE => JsonRpcResponse::ok(request.id, json!(true)),
            METHOD_AUTHORIZE => self.authorize(session, request),
            METHOD_SUBMIT => self.submit(session, request).await,
            other => {
                debug!(client_id = session.id(), method = other, "Unknown method");
                JsonRpcResponse::error(request.id, METHOD_NOT_FOUND, "Method not found")
            }
        }
    }

    fn authorize(&self, session: &MiningSession, request: JsonRpcRequest) -> JsonRpcResponse {
        let identity = request
            .params
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default();
        let wallet = session.authorize(identity);
        if wallet.is_empty() {
            let (code, message) = ShareError::NoMinerAddress.stratum_code();
            return JsonRpcResponse::error(request.id, code, message);
        }
        info!(client_id = session.id(), wallet = %wallet, "Authorized {}", session);
        JsonRpcResponse::ok(request.id, json!(true))
    }

    async fn submit(&self, session: &MiningSession, request: JsonRpcRequest) -> JsonRpcResponse {
        match self.validator.handle_submit(session, &request.params).await {
            Ok(ShareOutcome::Accepted) | Ok(ShareOutcome::BlockFound { .. }) => {
                JsonRpcResponse::ok(request.id, json!(true))
            }
            Err(e) => {
                match &e {
                    ShareError::DupeShare | ShareError::StaleShare { .. } => {
                        info!(client_id = session.id(), error = %e, "Share rejected")
                    }
                    _ => warn!(client_id = session.id(), error = %e, "Share rejected"),
                }
                let (code, message) = e.stratum_code();
                JsonRpcResponse::error(request.id, code, message)
            }
        }
    }
}
