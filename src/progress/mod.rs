//! 进度分发：按 run_id 扇出到零个或多个监听者，并缓存每个 run 的最新事件
//!
//! 投递为 fire-and-forget：不确认、不缓冲历史；尚未订阅的客户端会错过事件，
//! 但可通过 [`ProgressHub::latest`] 查询当前状态，新订阅者也会立即收到最新事件的回放。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::mpsc;

use crate::research::ProgressEvent;

/// 流水线侧的进度出口
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// 丢弃所有事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// 把事件收集到内存（测试与 CLI 用）
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProgressSink for CollectingSink {
    fn emit(&self, event: &ProgressEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// 观察某个 run 的监听者；返回 false 表示已断开，Hub 会移除它
pub trait ProgressListener: Send + Sync {
    fn on_progress(&self, run_id: &str, event: &ProgressEvent) -> bool;
}

impl ProgressListener for mpsc::UnboundedSender<ProgressEvent> {
    fn on_progress(&self, _run_id: &str, event: &ProgressEvent) -> bool {
        self.send(event.clone()).is_ok()
    }
}

/// 闭包监听者
pub struct CallbackListener<F>(pub F);

impl<F> ProgressListener for CallbackListener<F>
where
    F: Fn(&str, &ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, run_id: &str, event: &ProgressEvent) -> bool {
        (self.0)(run_id, event);
        true
    }
}

pub type SubscriptionId = u64;

#[derive(Default)]
struct RunChannel {
    latest: Option<ProgressEvent>,
    listeners: Vec<(SubscriptionId, Arc<dyn ProgressListener>)>,
    /// 同一 run 的投递（notify 扇出与订阅回放）串行执行
    delivery: Arc<Mutex<()>>,
}

/// 进度中枢：run_id → (最新事件, 监听者列表)
#[derive(Default)]
pub struct ProgressHub {
    runs: RwLock<HashMap<String, RunChannel>>,
    next_id: AtomicU64,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, RunChannel>> {
        self.runs.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, RunChannel>> {
        self.runs.write().unwrap_or_else(|e| e.into_inner())
    }

    fn delivery_lock(&self, run_id: &str) -> Arc<Mutex<()>> {
        let mut runs = self.write();
        Arc::clone(&runs.entry(run_id.to_string()).or_default().delivery)
    }

    /// 订阅某个 run；若已有最新事件则立即回放给该监听者
    ///
    /// 回放与 notify 共用该 run 的投递锁，监听者不会在终止事件之后再收到旧事件。
    /// 监听者回调中不得对同一 run 调用 notify / subscribe。
    pub fn subscribe(&self, run_id: &str, listener: Arc<dyn ProgressListener>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let delivery = self.delivery_lock(run_id);
        let _ordered = delivery.lock().unwrap_or_else(|e| e.into_inner());
        let latest = {
            let mut runs = self.write();
            let channel = runs.entry(run_id.to_string()).or_default();
            channel.listeners.push((id, Arc::clone(&listener)));
            channel.latest.clone()
        };
        if let Some(event) = latest {
            if !listener.on_progress(run_id, &event) {
                self.unsubscribe(run_id, id);
            }
        }
        id
    }

    /// 以 channel 形式订阅，返回订阅 ID 与接收端
    pub fn subscribe_channel(
        &self,
        run_id: &str,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(run_id, Arc::new(tx));
        (id, rx)
    }

    pub fn unsubscribe(&self, run_id: &str, id: SubscriptionId) -> bool {
        let mut runs = self.write();
        match runs.get_mut(run_id) {
            Some(channel) => {
                let before = channel.listeners.len();
                channel.listeners.retain(|(sid, _)| *sid != id);
                channel.listeners.len() != before
            }
            None => false,
        }
    }

    /// 记录最新事件并扇出；监听者在表锁外、投递锁内调用
    pub fn notify(&self, run_id: &str, event: &ProgressEvent) {
        let delivery = self.delivery_lock(run_id);
        let _ordered = delivery.lock().unwrap_or_else(|e| e.into_inner());
        let listeners = {
            let mut runs = self.write();
            let channel = runs.entry(run_id.to_string()).or_default();
            channel.latest = Some(event.clone());
            channel.listeners.clone()
        };

        let dead: Vec<SubscriptionId> = listeners
            .iter()
            .filter(|(_, l)| !l.on_progress(run_id, event))
            .map(|(id, _)| *id)
            .collect();

        if !dead.is_empty() {
            tracing::debug!(run_id, dropped = dead.len(), "removing disconnected progress listeners");
            let mut runs = self.write();
            if let Some(channel) = runs.get_mut(run_id) {
                channel.listeners.retain(|(id, _)| !dead.contains(id));
            }
        }
    }

    pub fn latest(&self, run_id: &str) -> Option<ProgressEvent> {
        self.read().get(run_id).and_then(|c| c.latest.clone())
    }

    pub fn listener_count(&self, run_id: &str) -> usize {
        self.read().get(run_id).map(|c| c.listeners.len()).unwrap_or(0)
    }

    /// 丢弃某个 run 的缓存与监听者
    pub fn remove(&self, run_id: &str) {
        self.write().remove(run_id);
    }

    /// 绑定到某个 run 的 Sink，供流水线使用
    pub fn reporter(self: &Arc<Self>, run_id: impl Into<String>) -> RunReporter {
        RunReporter {
            hub: Arc::clone(self),
            run_id: run_id.into(),
        }
    }
}

/// 某个 run 的进度出口：emit 即 hub.notify(run_id, event)
#[derive(Clone)]
pub struct RunReporter {
    hub: Arc<ProgressHub>,
    run_id: String,
}

impl RunReporter {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl ProgressSink for RunReporter {
    fn emit(&self, event: &ProgressEvent) {
        self.hub.notify(&self.run_id, event);
    }
}
