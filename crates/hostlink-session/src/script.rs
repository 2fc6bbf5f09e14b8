//! One loaded unit of remote code, with a request/response call boundary
//! layered on top of generic message passing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use hostlink_core::{AgentMessageRecord, LogLevel, ScriptHandle, Signal};
use hostlink_transport::AgentTransport;

use crate::errors::{RpcError, ScriptError};

/// Marker tagging the reserved request/response envelope inside otherwise
/// free-form script messages.
const RPC_MARKER: &str = "hostlink:rpc";

/// Method names excluded from the dynamic export surface because they
/// collide with result-chaining conventions.
const RESERVED_METHOD_NAMES: &[&str] = &["then", "catch", "finally"];

/// Narrow capability interface a script receives from its owning session:
/// enough to post records and reach the current transport, nothing more.
pub(crate) trait ScriptHost: Send + Sync {
    fn post_record(&self, record: AgentMessageRecord);
    fn transport(&self) -> Arc<dyn AgentTransport>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptState {
    Created,
    Destroyed,
}

/// Result of a successful RPC call: the out-of-band binary payload when one
/// was attached, otherwise the first response parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcResult {
    Value(Value),
    Data(Bytes),
}

impl RpcResult {
    /// The JSON value, or `Null` for a binary result.
    #[must_use]
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(value) => value,
            Self::Data(_) => Value::Null,
        }
    }
}

type PendingReply = oneshot::Sender<Result<RpcResult, ScriptError>>;
type LogHandler = Box<dyn Fn(LogLevel, &str) + Send + Sync>;

/// A script loaded into a remote process.
///
/// Owned exclusively by its session; destroyed when unloaded or when the
/// session is destroyed. Destruction is terminal and monotonic.
pub struct Script {
    id: ScriptHandle,
    host: Weak<dyn ScriptHost>,
    this: Weak<Script>,
    state: Mutex<ScriptState>,
    next_request_id: AtomicU64,
    pending_requests: Mutex<HashMap<u64, PendingReply>>,
    log_handler: RwLock<LogHandler>,
    destroyed: Signal<()>,
    message: Signal<(Value, Option<Bytes>)>,
}

impl Script {
    pub(crate) fn new(host: Weak<dyn ScriptHost>, id: ScriptHandle) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            host,
            this: this.clone(),
            state: Mutex::new(ScriptState::Created),
            next_request_id: AtomicU64::new(1),
            pending_requests: Mutex::new(HashMap::new()),
            log_handler: RwLock::new(Box::new(default_log_handler)),
            destroyed: Signal::new(),
            message: Signal::new(),
        })
    }

    /// Handle identifying this script within its session.
    #[must_use]
    pub fn id(&self) -> ScriptHandle {
        self.id
    }

    /// Whether the script has been destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        *self.state.lock().unwrap() == ScriptState::Destroyed
    }

    /// Fires once when the script is destroyed.
    #[must_use]
    pub fn destroyed(&self) -> &Signal<()> {
        &self.destroyed
    }

    /// Fires for every application-visible message the script sends.
    /// Protocol-internal records (RPC responses, log records) never reach it.
    #[must_use]
    pub fn message(&self) -> &Signal<(Value, Option<Bytes>)> {
        &self.message
    }

    /// Replace the sink receiving the script's log records.
    pub fn set_log_handler<F>(&self, handler: F)
    where
        F: Fn(LogLevel, &str) + Send + Sync + 'static,
    {
        *self.log_handler.write().unwrap() = Box::new(handler);
    }

    /// Restore the default tracing-backed log sink.
    pub fn reset_log_handler(&self) {
        *self.log_handler.write().unwrap() = Box::new(default_log_handler);
    }

    /// Load the script into the target process.
    ///
    /// # Errors
    /// Returns [`ScriptError::Load`] if the remote side rejects the load.
    pub async fn load(&self) -> Result<(), ScriptError> {
        let host = self.host.upgrade().ok_or(ScriptError::SessionGone)?;
        host.transport()
            .load_script(self.id)
            .await
            .map_err(ScriptError::Load)
    }

    /// Unload the script. Local state always transitions to destroyed, even
    /// when the remote call fails; a second call is a no-op.
    ///
    /// # Errors
    /// Returns [`ScriptError::Unload`] if the remote side rejected the
    /// destroy. The script is destroyed locally regardless.
    pub async fn unload(&self) -> Result<(), ScriptError> {
        if self.is_destroyed() {
            return Ok(());
        }
        let host = self.host.upgrade().ok_or(ScriptError::SessionGone)?;
        let result = host.transport().destroy_script(self.id).await;
        self.destroy_local();
        result.map_err(ScriptError::Unload)
    }

    /// Send a free-form message to the script, with an optional binary payload.
    ///
    /// Delivery follows the owning session's guarantee; there is no
    /// additional acknowledgement at this layer.
    ///
    /// # Errors
    /// Returns [`ScriptError::Encode`] if `message` cannot be serialized.
    pub fn post<M>(&self, message: &M, data: Option<Bytes>) -> Result<(), ScriptError>
    where
        M: Serialize + ?Sized,
    {
        let text = serde_json::to_string(message)?;
        if let Some(host) = self.host.upgrade() {
            host.post_record(AgentMessageRecord::script_message(self.id, text, data));
        }
        Ok(())
    }

    /// Issue a request to the script and await its response.
    ///
    /// The returned future settles exactly once: with the remote result,
    /// with the remote error, or with [`ScriptError::Destroyed`] if the
    /// script is or becomes destroyed while the call is outstanding.
    ///
    /// # Errors
    /// See above.
    pub async fn request(
        &self,
        operation: &str,
        params: Vec<Value>,
    ) -> Result<RpcResult, ScriptError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending_requests.lock().unwrap().insert(id, tx);

        let mut envelope = vec![
            Value::from(RPC_MARKER),
            Value::from(id),
            Value::from(operation),
        ];
        envelope.extend(params);
        if let Err(e) = self.post(&Value::Array(envelope), None) {
            self.pending_requests.lock().unwrap().remove(&id);
            return Err(e);
        }

        if self.is_destroyed() {
            if let Some(tx) = self.pending_requests.lock().unwrap().remove(&id) {
                let _ = tx.send(Err(ScriptError::Destroyed));
            }
        }

        rx.await.unwrap_or_else(|_| Err(ScriptError::Destroyed))
    }

    /// The dynamic export surface: any exported name becomes a remote call.
    #[must_use]
    pub fn exports(&self) -> ScriptExports {
        ScriptExports {
            script: self.this.clone(),
        }
    }

    /// Force-destroy local state: fail every pending request, then notify.
    /// Idempotent; never reverts.
    pub(crate) fn destroy_local(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ScriptState::Destroyed {
                return;
            }
            *state = ScriptState::Destroyed;
        }
        let pending: Vec<PendingReply> = {
            let mut pending = self.pending_requests.lock().unwrap();
            pending.drain().map(|(_, tx)| tx).collect()
        };
        for tx in pending {
            let _ = tx.send(Err(ScriptError::Destroyed));
        }
        self.destroyed.emit(&());
    }

    /// Route one inbound record: RPC response, log record, or application
    /// message — exactly one, in that priority order. The first two are
    /// protocol-internal and never reach the message signal.
    pub(crate) fn dispatch_message(&self, message: Value, data: Option<Bytes>) {
        if let Some(response) = parse_rpc_response(&message) {
            self.complete_request(response, data);
            return;
        }
        if let Some((level, text)) = parse_log_record(&message) {
            (self.log_handler.read().unwrap())(level, &text);
            return;
        }
        self.message.emit(&(message, data));
    }

    fn complete_request(&self, response: RpcResponse, data: Option<Bytes>) {
        let ok = match response.operation.as_str() {
            "ok" => true,
            "error" => false,
            _ => return,
        };
        let Some(tx) = self.pending_requests.lock().unwrap().remove(&response.id) else {
            return;
        };
        let outcome = if ok {
            Ok(match data {
                Some(data) => RpcResult::Data(data),
                None => RpcResult::Value(
                    response.params.first().cloned().unwrap_or(Value::Null),
                ),
            })
        } else {
            Err(ScriptError::Rpc(rpc_error_from_params(&response.params)))
        };
        let _ = tx.send(outcome);
    }
}

/// Calls into a script's exported functions by name.
///
/// Every call translates to `request("call", [name, args])` on the script.
/// The reserved continuation names (`then`, `catch`, `finally`) behave as
/// absent exports and are refused locally.
pub struct ScriptExports {
    script: Weak<Script>,
}

impl ScriptExports {
    /// Invoke the exported function `name` with `args`.
    ///
    /// # Errors
    /// Returns [`ScriptError::ReservedMethodName`] for reserved names,
    /// [`ScriptError::Destroyed`] once the script is gone, or the remote
    /// call's failure.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<RpcResult, ScriptError> {
        if RESERVED_METHOD_NAMES.contains(&name) {
            return Err(ScriptError::ReservedMethodName(name.to_string()));
        }
        let script = self.script.upgrade().ok_or(ScriptError::Destroyed)?;
        script
            .request("call", vec![Value::from(name), Value::Array(args)])
            .await
    }
}

struct RpcResponse {
    id: u64,
    operation: String,
    params: Vec<Value>,
}

fn parse_rpc_response(message: &Value) -> Option<RpcResponse> {
    if message.get("type")?.as_str()? != "send" {
        return None;
    }
    let payload = message.get("payload")?.as_array()?;
    if payload.len() < 3 || payload.first()?.as_str()? != RPC_MARKER {
        return None;
    }
    Some(RpcResponse {
        id: payload.get(1)?.as_u64()?,
        operation: payload.get(2)?.as_str()?.to_string(),
        params: payload[3..].to_vec(),
    })
}

fn parse_log_record(message: &Value) -> Option<(LogLevel, String)> {
    if message.get("type")?.as_str()? != "log" {
        return None;
    }
    let level = match message.get("level")?.as_str()? {
        "info" => LogLevel::Info,
        "warning" => LogLevel::Warning,
        "error" => LogLevel::Error,
        _ => return None,
    };
    Some((level, message.get("payload")?.as_str()?.to_string()))
}

fn rpc_error_from_params(params: &[Value]) -> RpcError {
    RpcError {
        message: params
            .first()
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
        name: params
            .get(1)
            .and_then(Value::as_str)
            .map(ToString::to_string),
        stack: params
            .get(2)
            .and_then(Value::as_str)
            .map(ToString::to_string),
        properties: params
            .get(3)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
    }
}

fn default_log_handler(level: LogLevel, text: &str) {
    match level {
        LogLevel::Info => tracing::info!(target: "hostlink::script", "{text}"),
        LogLevel::Warning => tracing::warn!(target: "hostlink::script", "{text}"),
        LogLevel::Error => tracing::error!(target: "hostlink::script", "{text}"),
    }
}
