//! Tool dispatch with exactly-once results.
//!
//! Every accepted [`ToolCall`] owes the remote side exactly one [`ToolResult`].
//! The broker keeps a ledger of pending and resolved ids; whichever path resolves
//! an id first (handler finished, handler failed, session cancelled) removes it
//! from `pending` under the ledger lock and is the only one that posts.

use crate::error::{VoiceError, VoiceResult};
use crate::tools::{StudioTool, ToolCall, ToolResult};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Host-side executor for tool calls.
#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    /// Run the tool and return its result payload. Errors become failure results.
    async fn handle(&self, tool: StudioTool) -> anyhow::Result<Value>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
type HandlerFn = Box<dyn Fn(StudioTool) -> HandlerFuture + Send + Sync>;

/// [`ToolHandler`] built from a closure.
pub struct FnToolHandler {
    f: HandlerFn,
}

impl FnToolHandler {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(StudioTool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            f: Box::new(move |tool| Box::pin(f(tool))),
        }
    }

    /// Wrap a synchronous handler.
    pub fn from_sync<F>(f: F) -> Self
    where
        F: Fn(StudioTool) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(move |tool| {
            let f = Arc::clone(&f);
            async move { f(tool) }
        })
    }
}

#[async_trait::async_trait]
impl ToolHandler for FnToolHandler {
    async fn handle(&self, tool: StudioTool) -> anyhow::Result<Value> {
        (self.f)(tool).await
    }
}

/// Where resolved results are posted. Must not block.
pub trait ResultSink: Send + Sync {
    fn post_result(&self, result: ToolResult) -> VoiceResult<()>;
}

struct PendingCall {
    name: String,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct CallLedger {
    pending: HashMap<String, PendingCall>,
    resolved: HashSet<String>,
    acknowledged: HashSet<String>,
}

pub struct ToolDispatchBroker {
    handler: Arc<dyn ToolHandler>,
    results: Arc<dyn ResultSink>,
    ledger: Arc<Mutex<CallLedger>>,
}

impl ToolDispatchBroker {
    pub fn new(handler: Arc<dyn ToolHandler>, results: Arc<dyn ResultSink>) -> Self {
        Self {
            handler,
            results,
            ledger: Arc::new(Mutex::new(CallLedger::default())),
        }
    }

    /// Accept a call and run its handler in the background.
    ///
    /// Reusing an id that is pending or already resolved is a protocol violation;
    /// the duplicate is rejected and nothing is dispatched. Must be called within
    /// a tokio runtime.
    pub fn handle(&self, call: ToolCall) -> VoiceResult<()> {
        if call.id.is_empty() {
            return Err(VoiceError::ProtocolViolation(format!("tool call '{}' has no id", call.name)));
        }

        {
            let mut ledger = lock_ledger(&self.ledger);
            if ledger.pending.contains_key(&call.id) {
                return Err(VoiceError::ProtocolViolation(format!(
                    "tool call id '{}' is still pending",
                    call.id
                )));
            }
            if ledger.resolved.contains(&call.id) {
                return Err(VoiceError::ProtocolViolation(format!(
                    "tool call id '{}' was already answered",
                    call.id
                )));
            }
            ledger.pending.insert(
                call.id.clone(),
                PendingCall {
                    name: call.name.clone(),
                    abort: None,
                },
            );
        }

        let tool = match StudioTool::from_call(&call) {
            Ok(tool) => tool,
            Err(e) => {
                let e = VoiceError::ToolHandler(format!("invalid arguments for {}: {}", call.name, e));
                warn!("Tool call {} rejected: {}", call.id, e);
                resolve(&self.ledger, self.results.as_ref(), handler_failure(&call, e));
                return Ok(());
            }
        };

        info!("🛠️ Dispatching tool {} (id {})", call.name, call.id);

        let handler = Arc::clone(&self.handler);
        let work = tokio::spawn(async move { handler.handle(tool).await });
        let abort = work.abort_handle();

        let ledger = Arc::clone(&self.ledger);
        let results = Arc::clone(&self.results);
        let id = call.id.clone();
        tokio::spawn(async move {
            let result = match work.await {
                Ok(Ok(value)) => ToolResult::success(&call, value),
                Ok(Err(e)) => handler_failure(&call, VoiceError::ToolHandler(format!("{:#}", e))),
                Err(join) if join.is_panic() => handler_failure(
                    &call,
                    VoiceError::ToolHandler(format!("tool handler for {} panicked", call.name)),
                ),
                Err(_) => ToolResult::failure(&call, "tool call cancelled"),
            };
            resolve(&ledger, results.as_ref(), result);
        });

        if let Some(pending) = lock_ledger(&self.ledger).pending.get_mut(&id) {
            pending.abort = Some(abort);
        }
        Ok(())
    }

    /// Abort every in-flight handler and post a cancellation failure for each.
    /// Returns how many calls were cancelled.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let mut ledger = lock_ledger(&self.ledger);
        let ids: Vec<String> = ledger.pending.keys().cloned().collect();
        for id in &ids {
            if let Some(pending) = ledger.pending.remove(id) {
                if let Some(abort) = pending.abort {
                    abort.abort();
                }
                ledger.resolved.insert(id.clone());
                let result = ToolResult {
                    id: id.clone(),
                    name: pending.name,
                    outcome: crate::tools::ToolOutcome::Failure(format!("tool call cancelled: {}", reason)),
                };
                if let Err(e) = self.results.post_result(result) {
                    debug!("Cancellation result for {} not delivered: {}", id, e);
                }
            }
        }
        if !ids.is_empty() {
            info!("Cancelled {} in-flight tool call(s): {}", ids.len(), reason);
        }
        ids.len()
    }

    /// Record the remote side's acknowledgement of a posted result.
    pub fn acknowledge(&self, id: &str) -> VoiceResult<()> {
        let mut ledger = lock_ledger(&self.ledger);
        if !ledger.resolved.contains(id) {
            return Err(VoiceError::ProtocolViolation(format!(
                "acknowledgement for unanswered tool call id '{}'",
                id
            )));
        }
        ledger.acknowledged.insert(id.to_string());
        debug!("Tool result {} acknowledged", id);
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        lock_ledger(&self.ledger).pending.len()
    }

    pub fn is_resolved(&self, id: &str) -> bool {
        lock_ledger(&self.ledger).resolved.contains(id)
    }

    pub fn is_acknowledged(&self, id: &str) -> bool {
        lock_ledger(&self.ledger).acknowledged.contains(id)
    }
}

/// Contain a handler-side error as the call's failure result.
fn handler_failure(call: &ToolCall, e: VoiceError) -> ToolResult {
    warn!("Tool {} (id {}) failed: {}", call.name, call.id, e);
    ToolResult::failure(call, e.to_string())
}

/// Post `result` if its id is still pending. Returns whether this call posted.
fn resolve(ledger: &Mutex<CallLedger>, results: &dyn ResultSink, result: ToolResult) -> bool {
    let mut ledger = lock_ledger(ledger);
    if ledger.pending.remove(&result.id).is_none() {
        return false;
    }
    ledger.resolved.insert(result.id.clone());

    let id = result.id.clone();
    let failed = result.is_failure();
    match results.post_result(result) {
        Ok(()) => debug!("Posted result for tool call {} (failure: {})", id, failed),
        Err(e) => warn!("Result for tool call {} not delivered: {}", id, e),
    }
    true
}

fn lock_ledger(ledger: &Mutex<CallLedger>) -> MutexGuard<'_, CallLedger> {
    ledger.lock().unwrap_or_else(|p| p.into_inner())
}
