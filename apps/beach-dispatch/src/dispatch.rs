//! Scatter/gather over the shared store.
//!
//! A dispatch mints a batch id, subscribes to `cmd:results:{batch_id}`, pushes
//! one `execute` frame through the fanout and then collects per-command
//! results until all arrived or the timer fires. Whichever instance holds the
//! agent's socket republishes its results on the batch topic, so the request
//! can be served by any instance.

use std::time::Duration;

use dispatch_proto::{BatchId, CommandResultMessage, ServerMessage};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::fanout::FanoutRouter;
use crate::ids::{DeviceId, UserId};
use crate::registry::ConnectionRegistry;
use crate::store::{SharedStoreHandle, StoreError, StoreResult};

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutput {
    pub command: String,
    pub output: Value,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    pub device_id: DeviceId,
    pub results: Vec<CommandOutput>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialBatch {
    pub received_commands: usize,
    pub total_commands: usize,
    /// In arrival order, not command order.
    pub partial_results: Vec<CommandOutput>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Validation(String),
    #[error("device not connected")]
    NotConnected,
    #[error("command execution timed out")]
    TimedOut {
        device_id: DeviceId,
        partial: PartialBatch,
    },
    #[error("transport failure: {0}")]
    Transport(#[from] StoreError),
}

impl DispatchError {
    fn metric_label(&self) -> &'static str {
        match self {
            DispatchError::Validation(_) => "invalid",
            DispatchError::NotConnected => "not_connected",
            DispatchError::TimedOut { .. } => "timed_out",
            DispatchError::Transport(_) => "transport",
        }
    }
}

pub fn results_channel(batch_id: BatchId) -> String {
    format!("cmd:results:{}", batch_id)
}

#[derive(Clone)]
pub struct CommandDispatcher {
    registry: ConnectionRegistry,
    fanout: FanoutRouter,
    store: SharedStoreHandle,
    timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(
        registry: ConnectionRegistry,
        fanout: FanoutRouter,
        store: SharedStoreHandle,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            fanout,
            store,
            timeout,
        }
    }

    /// Run `commands` on the user's live device. When `target` is given it
    /// must name that device.
    pub async fn dispatch(
        &self,
        user_id: &UserId,
        target: Option<&DeviceId>,
        commands: Vec<String>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let started = Instant::now();
        let outcome = self.run(user_id, target, commands).await;

        let label = match &outcome {
            Ok(_) => "completed",
            Err(err) => err.metric_label(),
        };
        counter!("beach_dispatch_dispatch_total", 1, "outcome" => label);
        histogram!(
            "beach_dispatch_dispatch_seconds",
            started.elapsed().as_secs_f64()
        );
        outcome
    }

    async fn run(
        &self,
        user_id: &UserId,
        target: Option<&DeviceId>,
        commands: Vec<String>,
    ) -> Result<DispatchOutcome, DispatchError> {
        if commands.is_empty() {
            return Err(DispatchError::Validation(
                "commands must contain at least one entry".into(),
            ));
        }

        let device = self
            .registry
            .live_device(user_id)
            .await?
            .ok_or(DispatchError::NotConnected)?;
        if let Some(target) = target {
            if target != &device.device_id {
                debug!(user_id = %user_id, requested = %target, live = %device.device_id, "target is not the live device");
                return Err(DispatchError::NotConnected);
            }
        }

        let batch_id = BatchId::mint();
        let mut results = self.store.subscribe(&results_channel(batch_id)).await?;

        let execute = ServerMessage::Execute {
            batch_id,
            commands: commands.clone(),
        };
        self.fanout.publish(device.connection_token, &execute).await?;
        let deadline = Instant::now() + self.timeout;
        info!(
            user_id = %user_id,
            device_id = %device.device_id,
            batch_id = %batch_id,
            commands = commands.len(),
            "batch dispatched"
        );

        let mut collector = BatchCollector::new(commands);
        loop {
            let raw = match tokio::time::timeout_at(deadline, results.next_message()).await {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    warn!(batch_id = %batch_id, "result stream closed before completion");
                    return Err(StoreError::SubscriptionClosed(results.channel().to_string()).into());
                }
                Err(_) => {
                    let partial = collector.into_partial();
                    warn!(
                        batch_id = %batch_id,
                        received = partial.received_commands,
                        total = partial.total_commands,
                        "batch timed out"
                    );
                    return Err(DispatchError::TimedOut {
                        device_id: device.device_id,
                        partial,
                    });
                }
            };

            let message = match serde_json::from_str::<CommandResultMessage>(&raw) {
                Ok(message) => message,
                Err(err) => {
                    warn!(batch_id = %batch_id, error = %err, "unparseable command result");
                    counter!("beach_dispatch_results_ignored_total", 1, "reason" => "malformed");
                    continue;
                }
            };
            if let Err(reason) = collector.accept(message) {
                warn!(batch_id = %batch_id, ?reason, "ignoring command result");
                counter!("beach_dispatch_results_ignored_total", 1, "reason" => reason.metric_label());
                continue;
            }

            if collector.is_complete() {
                debug!(batch_id = %batch_id, "batch complete");
                return Ok(DispatchOutcome {
                    device_id: device.device_id,
                    results: collector.into_results(),
                });
            }
        }
    }

    /// Hand one agent-reported result to whichever instance is collecting
    /// its batch. Results for batches nobody waits on anymore are lost.
    pub async fn forward_result(&self, result: &CommandResultMessage) -> StoreResult<()> {
        let payload = serde_json::to_string(result)?;
        self.store
            .publish(&results_channel(result.batch_id), &payload)
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoredResult {
    InvalidIndex,
    Duplicate(usize),
}

impl IgnoredResult {
    fn metric_label(&self) -> &'static str {
        match self {
            IgnoredResult::InvalidIndex => "invalid_index",
            IgnoredResult::Duplicate(_) => "duplicate",
        }
    }
}

/// Index-aligned accumulator for one batch. The first result for an index
/// wins.
#[derive(Debug)]
struct BatchCollector {
    commands: Vec<String>,
    slots: Vec<Option<CommandOutput>>,
    arrival: Vec<usize>,
}

impl BatchCollector {
    fn new(commands: Vec<String>) -> Self {
        let slots = vec![None; commands.len()];
        Self {
            commands,
            slots,
            arrival: Vec::new(),
        }
    }

    fn received(&self) -> usize {
        self.arrival.len()
    }

    fn is_complete(&self) -> bool {
        self.received() == self.commands.len()
    }

    fn accept(&mut self, result: CommandResultMessage) -> Result<(), IgnoredResult> {
        let index = result_index(&result.index)
            .filter(|index| *index < self.commands.len())
            .ok_or(IgnoredResult::InvalidIndex)?;
        if self.slots[index].is_some() {
            return Err(IgnoredResult::Duplicate(index));
        }

        self.slots[index] = Some(CommandOutput {
            command: self.commands[index].clone(),
            output: result.output.unwrap_or(Value::Null),
            success: result.success.unwrap_or(false),
        });
        self.arrival.push(index);
        Ok(())
    }

    fn into_results(self) -> Vec<CommandOutput> {
        self.slots.into_iter().flatten().collect()
    }

    fn into_partial(self) -> PartialBatch {
        let received_commands = self.received();
        let total_commands = self.commands.len();
        let mut slots = self.slots;
        let partial_results = self
            .arrival
            .iter()
            .filter_map(|index| slots[*index].take())
            .collect();
        PartialBatch {
            received_commands,
            total_commands,
            partial_results,
        }
    }
}

/// Any non-negative integral JSON number, `1.0` included.
fn result_index(raw: &Value) -> Option<usize> {
    if let Some(index) = raw.as_u64() {
        return usize::try_from(index).ok();
    }
    let index = raw.as_f64()?;
    (index >= 0.0 && index.fract() == 0.0 && index <= u32::MAX as f64).then(|| index as usize)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use dispatch_proto::ConnectionToken;
    use futures_util::stream::StreamExt;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::fanout::DEFAULT_FANOUT_TOPIC;
    use crate::pairing::{PairingService, DEFAULT_PAIRING_TTL};
    use crate::store::{MemoryStore, SharedStore, Subscription};
    use crate::system_info::SystemInfoCache;

    struct Harness {
        dispatcher: CommandDispatcher,
        fanout: FanoutRouter,
        registry: ConnectionRegistry,
        pairing: PairingService,
    }

    fn harness(store: SharedStoreHandle) -> Harness {
        let pairing = PairingService::new(store.clone(), DEFAULT_PAIRING_TTL);
        let registry = ConnectionRegistry::new(
            store.clone(),
            pairing.clone(),
            SystemInfoCache::new(store.clone()),
        );
        let fanout = FanoutRouter::new(store.clone(), DEFAULT_FANOUT_TOPIC);
        let dispatcher = CommandDispatcher::new(
            registry.clone(),
            fanout.clone(),
            store,
            DEFAULT_COMMAND_TIMEOUT,
        );
        Harness {
            dispatcher,
            fanout,
            registry,
            pairing,
        }
    }

    fn user() -> UserId {
        UserId::parse("42").unwrap()
    }

    fn device() -> DeviceId {
        DeviceId::parse("laptop").unwrap()
    }

    /// Pair a fake agent and return the receiving end of its socket.
    async fn connect_agent(h: &Harness) -> mpsc::Receiver<String> {
        let code = h.pairing.issue_or_refresh(&user()).await.unwrap();
        let token = ConnectionToken::mint();
        let (tx, rx) = mpsc::channel(8);
        h.fanout.attach(token, tx);
        h.registry.register(&device(), token, &code.code).await.unwrap();
        rx
    }

    async fn next_batch(rx: &mut mpsc::Receiver<String>) -> (BatchId, Vec<String>) {
        let raw = rx.recv().await.unwrap();
        match serde_json::from_str::<ServerMessage>(&raw).unwrap() {
            ServerMessage::Execute { batch_id, commands } => (batch_id, commands),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    fn result(batch_id: BatchId, index: Value, output: &str) -> CommandResultMessage {
        CommandResultMessage {
            batch_id,
            index,
            command: None,
            output: Some(json!(output)),
            success: Some(true),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn results_are_index_aligned_regardless_of_arrival() {
        let store = MemoryStore::new();
        let h = harness(store.clone());
        let listener = h.fanout.start().await.unwrap();
        let mut agent = connect_agent(&h).await;

        let dispatcher = h.dispatcher.clone();
        let agent_side = tokio::spawn(async move {
            let (batch_id, commands) = next_batch(&mut agent).await;
            assert_eq!(commands, vec!["uptime", "df -h"]);
            dispatcher
                .forward_result(&result(batch_id, json!(1), "disk"))
                .await
                .unwrap();
            dispatcher
                .forward_result(&result(batch_id, json!(0), "up 3 days"))
                .await
                .unwrap();
        });

        let outcome = h
            .dispatcher
            .dispatch(&user(), None, vec!["uptime".into(), "df -h".into()])
            .await
            .unwrap();
        agent_side.await.unwrap();

        assert_eq!(outcome.device_id, device());
        assert_eq!(
            outcome.results,
            vec![
                CommandOutput {
                    command: "uptime".into(),
                    output: json!("up 3 days"),
                    success: true,
                },
                CommandOutput {
                    command: "df -h".into(),
                    output: json!("disk"),
                    success: true,
                },
            ]
        );

        // Only the fanout topic is left; the batch topic went with the dispatch.
        assert_eq!(store.active_channels(), 1);
        h.dispatcher
            .forward_result(&result(BatchId::mint(), json!(0), "late"))
            .await
            .unwrap();
        assert_eq!(store.active_channels(), 1);
        listener.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_partial_results_in_arrival_order() {
        let store = MemoryStore::new();
        let h = harness(store.clone());
        let listener = h.fanout.start().await.unwrap();
        let mut agent = connect_agent(&h).await;

        let dispatcher = h.dispatcher.clone();
        let agent_side = tokio::spawn(async move {
            let (batch_id, _) = next_batch(&mut agent).await;
            for (index, output) in [(json!(2), "c"), (json!(7), "bogus"), (json!(0), "a"), (json!(2), "dup")] {
                dispatcher
                    .forward_result(&result(batch_id, index, output))
                    .await
                    .unwrap();
            }
            batch_id
        });

        let started = Instant::now();
        let err = h
            .dispatcher
            .dispatch(
                &user(),
                Some(&device()),
                vec!["a".into(), "b".into(), "c".into()],
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() >= DEFAULT_COMMAND_TIMEOUT);
        match err {
            DispatchError::TimedOut { device_id, partial } => {
                assert_eq!(device_id, device());
                assert_eq!(partial.received_commands, 2);
                assert_eq!(partial.total_commands, 3);
                let outputs: Vec<_> = partial
                    .partial_results
                    .iter()
                    .map(|r| r.command.as_str())
                    .collect();
                assert_eq!(outputs, vec!["c", "a"]);
                assert_eq!(partial.partial_results[0].output, json!("c"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }

        assert_eq!(store.active_channels(), 1);
        let batch_id = agent_side.await.unwrap();
        h.dispatcher
            .forward_result(&result(batch_id, json!(1), "too late"))
            .await
            .unwrap();
        assert_eq!(store.active_channels(), 1);
        listener.abort();
    }

    #[tokio::test]
    async fn no_live_device_fails_without_subscribing() {
        let store = MemoryStore::new();
        let h = harness(store.clone());

        let err = h
            .dispatcher
            .dispatch(&user(), None, vec!["uptime".into()])
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::NotConnected));
        assert_eq!(store.active_channels(), 0);
    }

    #[tokio::test]
    async fn mismatched_target_is_not_connected() {
        let store = MemoryStore::new();
        let h = harness(store.clone());
        let _agent = connect_agent(&h).await;

        let other = DeviceId::parse("desktop").unwrap();
        let err = h
            .dispatcher
            .dispatch(&user(), Some(&other), vec!["uptime".into()])
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::NotConnected));
        assert_eq!(store.active_channels(), 0);
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let h = harness(MemoryStore::new());
        let err = h.dispatcher.dispatch(&user(), None, Vec::new()).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[derive(Clone, Copy)]
    enum Fault {
        RefusePublish,
        /// Result topics end right after subscribing.
        CloseResults,
    }

    /// Delegates to a `MemoryStore` with one injected fault.
    struct Faulty(Arc<MemoryStore>, Fault);

    #[async_trait]
    impl SharedStore for Faulty {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
            self.0.set(key, value).await
        }
        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<()> {
            self.0.set_ex(key, value, ttl).await
        }
        async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
            self.0.ttl(key).await
        }
        async fn delete(&self, keys: &[String]) -> StoreResult<()> {
            self.0.delete(keys).await
        }
        async fn scan_match(&self, pattern: &str) -> StoreResult<Vec<String>> {
            self.0.scan_match(pattern).await
        }
        async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
            match self.1 {
                Fault::RefusePublish => Err(redis::RedisError::from((
                    redis::ErrorKind::IoError,
                    "publish refused",
                ))
                .into()),
                Fault::CloseResults => self.0.publish(channel, payload).await,
            }
        }
        async fn subscribe(&self, channel: &str) -> StoreResult<Subscription> {
            match self.1 {
                Fault::CloseResults if channel.starts_with("cmd:results:") => Ok(
                    Subscription::new(channel, futures_util::stream::empty().boxed()),
                ),
                _ => self.0.subscribe(channel).await,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn publish_failure_is_immediate_and_releases_subscription() {
        let memory = MemoryStore::new();
        let h = harness(Arc::new(Faulty(memory.clone(), Fault::RefusePublish)));
        let _agent = connect_agent(&h).await;

        let started = Instant::now();
        let err = h
            .dispatcher
            .dispatch(&user(), None, vec!["uptime".into()])
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Transport(_)));
        assert!(started.elapsed() < DEFAULT_COMMAND_TIMEOUT);
        assert_eq!(memory.active_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_result_stream_is_a_transport_failure() {
        let memory = MemoryStore::new();
        let h = harness(Arc::new(Faulty(memory.clone(), Fault::CloseResults)));
        let _agent = connect_agent(&h).await;

        let started = Instant::now();
        let err = h
            .dispatcher
            .dispatch(&user(), None, vec!["uptime".into()])
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DispatchError::Transport(StoreError::SubscriptionClosed(ref channel))
                if channel.starts_with("cmd:results:")
        ));
        assert!(started.elapsed() < DEFAULT_COMMAND_TIMEOUT);
    }

    #[test]
    fn collector_ignores_bad_indexes_without_counting() {
        let batch_id = BatchId::mint();
        let mut collector = BatchCollector::new(vec!["a".into(), "b".into()]);

        for bad in [json!(-1), json!(2), json!("0"), json!(0.5), Value::Null] {
            assert_eq!(
                collector.accept(result(batch_id, bad, "x")),
                Err(IgnoredResult::InvalidIndex)
            );
        }
        assert_eq!(collector.received(), 0);

        collector.accept(result(batch_id, json!(1), "first")).unwrap();
        assert_eq!(
            collector.accept(result(batch_id, json!(1), "second")),
            Err(IgnoredResult::Duplicate(1))
        );
        assert_eq!(collector.received(), 1);
        assert!(!collector.is_complete());
    }

    #[test]
    fn integral_float_indexes_count() {
        let batch_id = BatchId::mint();
        let mut collector = BatchCollector::new(vec!["a".into(), "b".into()]);

        collector.accept(result(batch_id, json!(1.0), "one")).unwrap();
        collector.accept(result(batch_id, json!(0), "zero")).unwrap();
        assert!(collector.is_complete());
        let results = collector.into_results();
        assert_eq!(results[1].command, "b");
        assert_eq!(results[1].output, json!("one"));
    }
}
