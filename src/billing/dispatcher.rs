use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::mpsc::{channel, error::TrySendError, Receiver, Sender};
use tracing::{info, warn};

use super::models::SideEffectIntent;

/// key: side-effect-sink -> analytics / role collaborators
#[async_trait]
pub trait SideEffectSink: Send + Sync {
    async fn deliver(&self, intent: &SideEffectIntent) -> Result<()>;
}

/// Logs intents without forwarding them anywhere.
pub struct LogSink;

#[async_trait]
impl SideEffectSink for LogSink {
    async fn deliver(&self, intent: &SideEffectIntent) -> Result<()> {
        info!(
            intent = intent.kind(),
            intent_id = %intent.intent_id(),
            user_id = intent.user_id(),
            "side effect intent (log sink)"
        );
        Ok(())
    }
}

/// Posts each intent as JSON to a collaborator endpoint. The intent id doubles
/// as the idempotency key so the receiver can drop redeliveries.
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpSink {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl SideEffectSink for HttpSink {
    async fn deliver(&self, intent: &SideEffectIntent) -> Result<()> {
        let intent_id = intent.intent_id();
        self.client
            .post(&self.endpoint)
            .header("Idempotency-Key", &intent_id)
            .json(&json!({ "intent_id": intent_id, "intent": intent }))
            .send()
            .await
            .context("side effect endpoint unreachable")?
            .error_for_status()
            .context("side effect endpoint rejected intent")?;
        Ok(())
    }
}

/// key: side-effect-dispatch-handle -> fire-and-forget enqueue
#[derive(Clone)]
pub struct DispatchHandle {
    sender: Sender<SideEffectIntent>,
}

impl DispatchHandle {
    /// Never blocks and never fails the caller: a full or closed queue is
    /// logged and the intent dropped.
    pub fn submit(&self, intents: Vec<SideEffectIntent>) {
        for intent in intents {
            match self.sender.try_send(intent) {
                Ok(()) => {}
                Err(TrySendError::Full(intent)) => warn!(
                    intent = intent.kind(),
                    intent_id = %intent.intent_id(),
                    "side effect queue full; intent dropped"
                ),
                Err(TrySendError::Closed(intent)) => warn!(
                    intent = intent.kind(),
                    intent_id = %intent.intent_id(),
                    "side effect worker stopped; intent dropped"
                ),
            }
        }
    }
}

/// Handle plus the raw receiving end, for callers that drain intents themselves.
pub fn dispatch_channel(capacity: usize) -> (DispatchHandle, Receiver<SideEffectIntent>) {
    let (tx, rx) = channel(capacity.max(1));
    (DispatchHandle { sender: tx }, rx)
}

pub fn start_dispatch_worker(sink: Arc<dyn SideEffectSink>, capacity: usize) -> DispatchHandle {
    let (handle, mut rx) = dispatch_channel(capacity);
    tokio::spawn(async move {
        while let Some(intent) = rx.recv().await {
            match sink.deliver(&intent).await {
                Ok(()) => info!(
                    intent = intent.kind(),
                    intent_id = %intent.intent_id(),
                    user_id = intent.user_id(),
                    "side effect delivered"
                ),
                Err(err) => warn!(
                    ?err,
                    intent = intent.kind(),
                    intent_id = %intent.intent_id(),
                    user_id = intent.user_id(),
                    "side effect delivery failed; entitlement state unaffected"
                ),
            }
        }
    });
    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::models::PlanId;

    fn intent(event: &str) -> SideEffectIntent {
        SideEffectIntent::RoleElevated {
            user_id: 1,
            plan_id: PlanId::Monthly,
            event_id: event.to_string(),
        }
    }

    #[tokio::test]
    async fn full_queue_drops_without_blocking() {
        let (handle, mut rx) = dispatch_channel(1);
        handle.submit(vec![intent("a"), intent("b")]);
        assert_eq!(rx.try_recv().unwrap(), intent("a"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_queue_is_tolerated() {
        let (handle, rx) = dispatch_channel(4);
        drop(rx);
        handle.submit(vec![intent("a")]);
    }
}
