//! Session recorder (§4.4): maps a directed transport frame onto
//! session/rpc_call/event rows, enforcing the payload truncation policy.

use sha2::{Digest, Sha256};

use crate::config::{PayloadRetention, RecorderConfig};
use crate::store::{Direction, EventKind, NewEvent, Stores};
use crate::transport::Frame;

/// Writes session/rpc/event rows for one transport's traffic. Failures are
/// logged, never propagated: persistence is observability-only (§7) and must
/// not block the request path.
pub struct SessionRecorder {
    stores: Stores,
    config: RecorderConfig,
}

impl SessionRecorder {
    pub fn new(stores: Stores, config: RecorderConfig) -> Self {
        Self { stores, config }
    }

    /// Records one classified frame for `session_id`. `retention` overrides
    /// the recorder's default for this call only (per-session hash-only mode).
    pub fn record(&self, session_id: &str, direction: Direction, frame: &Frame, retention: Option<PayloadRetention>) {
        let retention = retention.unwrap_or(self.config.default_retention);
        match frame {
            Frame::Request(req) => {
                let rpc_id = req.id.as_str();
                if let Err(e) = self.stores.save_rpc_call(session_id, &rpc_id, &req.method) {
                    tracing::warn!(error = %e, session_id, rpc_id, "recorder: failed to save rpc call");
                }
                self.save_event(session_id, direction, EventKind::Request, Some(&rpc_id), None, req.params.as_ref(), retention);
            },
            Frame::Response(resp) => {
                let rpc_id = resp.id.as_str();
                match self.stores.rpc_call(session_id, &rpc_id) {
                    Ok(Some(_)) => {
                        let error_code = resp.error.as_ref().map(|e| e.code);
                        if let Err(e) = self.stores.complete_rpc_call(session_id, &rpc_id, resp.is_success(), error_code) {
                            tracing::warn!(error = %e, session_id, rpc_id, "recorder: failed to complete rpc call");
                        }
                    },
                    Ok(None) => {
                        tracing::warn!(session_id, rpc_id, "recorder: response without a prior request, discarding correlation");
                    },
                    Err(e) => tracing::warn!(error = %e, session_id, rpc_id, "recorder: failed to look up rpc call"),
                }
                let payload = resp
                    .result
                    .clone()
                    .or_else(|| resp.error.as_ref().map(|e| serde_json::json!({"code": e.code, "message": e.message})));
                self.save_event(session_id, direction, EventKind::Response, Some(&rpc_id), None, payload.as_ref(), retention);
            },
            Frame::Notification(n) => {
                self.save_event(session_id, direction, EventKind::Notification, None, Some(&n.method), n.params.as_ref(), retention);
            },
            Frame::Unknown(raw) => {
                self.save_event(session_id, direction, EventKind::TransportEvent, None, Some("unknown-frame"), Some(raw), retention);
            },
        }
    }

    /// Records a label-only transport event (stderr line, state transition)
    /// that carries no JSON payload.
    pub fn record_transport_event(&self, session_id: &str, direction: Direction, label: &str) {
        let result = self.stores.save_event(NewEvent {
            session_id,
            direction,
            kind: EventKind::TransportEvent,
            rpc_id: None,
            label: Some(label),
            payload_hash: None,
            payload_size: None,
            raw_json: None,
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, session_id, "recorder: failed to save transport event");
        }
    }

    fn save_event(
        &self,
        session_id: &str,
        direction: Direction,
        kind: EventKind,
        rpc_id: Option<&str>,
        label: Option<&str>,
        payload: Option<&serde_json::Value>,
        retention: PayloadRetention,
    ) {
        let (raw_json, payload_hash, payload_size) = match payload {
            None => (None, None, None),
            Some(value) => {
                let serialized = serde_json::to_string(value).unwrap_or_default();
                let hash = hex::encode(Sha256::digest(serialized.as_bytes()));
                let size = serialized.len() as i64;
                let raw = match retention {
                    PayloadRetention::HashOnly => None,
                    PayloadRetention::Full if serialized.len() <= self.config.max_event_payload_bytes => Some(serialized.clone()),
                    PayloadRetention::Full => Some(truncate_preview(&serialized, self.config.max_event_payload_bytes)),
                };
                (raw, Some(hash), Some(size))
            },
        };
        let result = self.stores.save_event(NewEvent {
            session_id,
            direction,
            kind,
            rpc_id,
            label,
            payload_hash: payload_hash.as_deref(),
            payload_size,
            raw_json: raw_json.as_deref(),
        });
        if let Err(e) = result {
            tracing::warn!(error = %e, session_id, "recorder: failed to save event");
        }
    }
}

/// Truncates `s` to at most `cap` bytes on a char boundary and appends a
/// marker, used when a payload exceeds `max_event_payload_bytes`. The hash is
/// always computed over the untruncated string by the caller.
fn truncate_preview(s: &str, cap: usize) -> String {
    if s.len() <= cap {
        return s.to_string();
    }
    let mut end = cap;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…[truncated, {} bytes total]", &s[..end], s.len())
}
