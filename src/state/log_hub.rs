//! 日志广播中心
//!
//! 按部署 ID 管理日志通道：分配序号、缓冲历史、同步分发给所有监听者。
//! 新订阅者先收到缓冲的历史，再收到实时记录；订阅与发布在同一把通道锁下完成，
//! 因此同一订阅内不会重复也不会乱序。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::env::constants::LOG_HISTORY_CAPACITY;
use crate::domain::LogRecord;

/// 日志监听者
///
/// 在发布者的调用栈上同步执行，实现必须是非阻塞的（例如转发到 channel）
pub trait LogListener: Send + Sync {
    fn on_record(&self, record: &LogRecord);
}

impl<F> LogListener for F
where
    F: Fn(&LogRecord) + Send + Sync,
{
    fn on_record(&self, record: &LogRecord) {
        self(record)
    }
}

/// 日志通道
struct LogChannel {
    /// 最近的日志（有界）
    history: VecDeque<LogRecord>,
    /// 已注册的监听者
    listeners: Vec<(u64, Arc<dyn LogListener>)>,
    /// 尚未确认持久化的记录（按序号排列）
    unflushed: Vec<LogRecord>,
    /// 串行化同一部署的持久化
    flush_lock: Arc<tokio::sync::Mutex<()>>,
    /// 下一条记录的序号
    next_seq: u64,
    /// 创建时间
    created_at: DateTime<Utc>,
    /// 是否已完成
    finished: bool,
}

impl LogChannel {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
            listeners: Vec::new(),
            unflushed: Vec::new(),
            flush_lock: Arc::new(tokio::sync::Mutex::new(())),
            next_seq: 1,
            created_at: Utc::now(),
            finished: false,
        }
    }
}

type SharedChannel = Arc<Mutex<LogChannel>>;

fn lock(channel: &SharedChannel) -> MutexGuard<'_, LogChannel> {
    channel.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 日志广播中心
pub struct LogBroadcastRegistry {
    /// 通道映射 (deployment_id -> LogChannel)
    channels: RwLock<HashMap<String, SharedChannel>>,
    next_listener_id: AtomicU64,
    history_capacity: usize,
}

/// 订阅句柄，drop 时自动取消订阅
pub struct Subscription {
    registry: Arc<LogBroadcastRegistry>,
    deployment_id: String,
    listener_id: u64,
}

impl Subscription {
    pub fn listener_id(&self) -> u64 {
        self.listener_id
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unsubscribe(&self.deployment_id, self.listener_id);
    }
}

impl LogBroadcastRegistry {
    pub fn new() -> Self {
        Self::with_capacity(LOG_HISTORY_CAPACITY)
    }

    pub fn with_capacity(history_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            history_capacity: history_capacity.max(1),
        }
    }

    fn channel(&self, deployment_id: &str) -> Option<SharedChannel> {
        let channels = self.channels.read().unwrap_or_else(|p| p.into_inner());
        channels.get(deployment_id).cloned()
    }

    fn channel_or_create(&self, deployment_id: &str) -> SharedChannel {
        if let Some(channel) = self.channel(deployment_id) {
            return channel;
        }
        let mut channels = self.channels.write().unwrap_or_else(|p| p.into_inner());
        channels
            .entry(deployment_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LogChannel::new())))
            .clone()
    }

    /// 创建日志通道（已存在时不做任何事）
    pub fn create(&self, deployment_id: &str) {
        self.channel_or_create(deployment_id);
    }

    /// 从已持久化的序号之后继续（重启后使用）
    ///
    /// 通道已存在时不做任何事
    pub fn resume(&self, deployment_id: &str, last_seq: u64) {
        let mut channels = self.channels.write().unwrap_or_else(|p| p.into_inner());
        channels.entry(deployment_id.to_string()).or_insert_with(|| {
            let mut channel = LogChannel::new();
            channel.next_seq = last_seq + 1;
            Arc::new(Mutex::new(channel))
        });
    }

    /// 发布一条日志
    ///
    /// 分配序号和时间戳后追加到历史，并按发布顺序同步分发给当前所有监听者。
    /// 返回已分配序号的记录；通道不存在（未创建或已清理）时丢弃记录并返回 None。
    pub fn publish(&self, deployment_id: &str, mut record: LogRecord) -> Option<LogRecord> {
        let Some(channel) = self.channel(deployment_id) else {
            warn!(
                deployment_id = %deployment_id,
                source = %record.source,
                "Dropping log record for missing channel"
            );
            return None;
        };
        let mut channel = lock(&channel);

        record.seq = channel.next_seq;
        record.timestamp = Utc::now();
        channel.next_seq += 1;

        if channel.history.len() >= self.history_capacity {
            channel.history.pop_front();
        }
        channel.history.push_back(record.clone());
        channel.unflushed.push(record.clone());

        for (_, listener) in &channel.listeners {
            listener.on_record(&record);
        }

        Some(record)
    }

    /// 订阅日志
    ///
    /// 先在通道锁内重放缓冲历史，再注册监听者；通道不存在时返回 None
    pub fn subscribe(
        self: &Arc<Self>,
        deployment_id: &str,
        listener: Arc<dyn LogListener>,
    ) -> Option<Subscription> {
        let channel = self.channel(deployment_id)?;
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);

        {
            let mut channel = lock(&channel);
            for record in &channel.history {
                listener.on_record(record);
            }
            channel.listeners.push((listener_id, listener));
        }

        debug!(deployment_id = %deployment_id, listener_id, "Log listener subscribed");

        Some(Subscription {
            registry: Arc::clone(self),
            deployment_id: deployment_id.to_string(),
            listener_id,
        })
    }

    /// 取消订阅，返回监听者是否存在
    pub fn unsubscribe(&self, deployment_id: &str, listener_id: u64) -> bool {
        let Some(channel) = self.channel(deployment_id) else {
            return false;
        };
        let mut channel = lock(&channel);
        let before = channel.listeners.len();
        channel.listeners.retain(|(id, _)| *id != listener_id);
        channel.listeners.len() != before
    }

    /// 标记通道完成
    pub fn finish(&self, deployment_id: &str) {
        if let Some(channel) = self.channel(deployment_id) {
            lock(&channel).finished = true;
        }
    }

    /// 检查通道是否已完成（不存在视为已完成）
    pub fn is_finished(&self, deployment_id: &str) -> bool {
        self.channel(deployment_id)
            .map_or(true, |channel| lock(&channel).finished)
    }

    /// 检查通道是否存在
    pub fn exists(&self, deployment_id: &str) -> bool {
        self.channel(deployment_id).is_some()
    }

    /// 缓冲中序号大于 `after_seq` 的记录
    pub fn history(&self, deployment_id: &str, after_seq: u64) -> Vec<LogRecord> {
        self.channel(deployment_id)
            .map(|channel| {
                lock(&channel)
                    .history
                    .iter()
                    .filter(|r| r.seq > after_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 尚未确认持久化的记录（副本）
    ///
    /// 与发布在同一把锁下读取，返回的记录序号连续；不受历史容量限制
    pub fn pending(&self, deployment_id: &str) -> Vec<LogRecord> {
        self.channel(deployment_id)
            .map(|channel| lock(&channel).unflushed.clone())
            .unwrap_or_default()
    }

    /// 确认序号不大于 `seq` 的记录已持久化
    pub fn acknowledge(&self, deployment_id: &str, seq: u64) {
        if let Some(channel) = self.channel(deployment_id) {
            lock(&channel).unflushed.retain(|r| r.seq > seq);
        }
    }

    /// 同一部署的持久化锁；持有期间读取 `pending` 并确认，保证批次按序写入
    pub fn flush_lock(&self, deployment_id: &str) -> Option<Arc<tokio::sync::Mutex<()>>> {
        self.channel(deployment_id)
            .map(|channel| Arc::clone(&lock(&channel).flush_lock))
    }

    /// 通道当前的监听者数量
    pub fn listener_count(&self, deployment_id: &str) -> usize {
        self.channel(deployment_id)
            .map_or(0, |channel| lock(&channel).listeners.len())
    }

    /// 清理已完成的通道
    ///
    /// 移除已完成且没有活跃订阅者的通道
    pub fn cleanup(&self) -> usize {
        let mut channels = self.channels.write().unwrap_or_else(|p| p.into_inner());
        let before = channels.len();
        channels.retain(|_, channel| {
            let channel = lock(channel);
            !channel.finished || !channel.listeners.is_empty()
        });
        before - channels.len()
    }

    /// 清理过期通道
    ///
    /// 超过指定时长的通道只保留未完成或有订阅者的
    pub fn cleanup_expired(&self, max_age_hours: i64) -> usize {
        let now = Utc::now();
        let mut channels = self.channels.write().unwrap_or_else(|p| p.into_inner());
        let before = channels.len();
        channels.retain(|_, channel| {
            let channel = lock(channel);
            if (now - channel.created_at).num_hours() < max_age_hours {
                return true;
            }
            !channel.finished || !channel.listeners.is_empty()
        });
        before - channels.len()
    }

    /// 获取通道数量
    pub fn count(&self) -> usize {
        self.channels.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// 获取活跃通道数量（未完成）
    pub fn active_count(&self) -> usize {
        let channels = self.channels.read().unwrap_or_else(|p| p.into_inner());
        channels.values().filter(|c| !lock(c).finished).count()
    }
}

impl Default for LogBroadcastRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn collector() -> (Arc<dyn LogListener>, Arc<Mutex<Vec<u64>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Arc<dyn LogListener> = Arc::new(move |record: &LogRecord| {
            sink.lock().unwrap().push(record.seq);
        });
        (listener, seen)
    }

    #[test]
    fn test_publish_assigns_monotonic_seq() {
        let registry = LogBroadcastRegistry::new();
        registry.create("dep-1");
        registry.create("dep-2");

        let first = registry.publish("dep-1", LogRecord::info("test", "a")).unwrap();
        let second = registry.publish("dep-1", LogRecord::info("test", "b")).unwrap();
        let other = registry.publish("dep-2", LogRecord::info("test", "c")).unwrap();

        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);
        // 序号按部署独立计数
        assert_eq!(other.seq, 1);
    }

    #[test]
    fn test_publish_after_cleanup_does_not_recreate_channel() {
        let registry = LogBroadcastRegistry::new();
        registry.create("dep-1");
        registry.publish("dep-1", LogRecord::info("test", "a"));
        registry.finish("dep-1");
        assert_eq!(registry.cleanup(), 1);

        assert!(registry.publish("dep-1", LogRecord::info("test", "late")).is_none());
        assert!(!registry.exists("dep-1"));
        assert!(registry.publish("never-created", LogRecord::info("test", "x")).is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_late_subscriber_gets_history_then_live() {
        let registry = Arc::new(LogBroadcastRegistry::new());
        registry.create("dep-1");
        registry.publish("dep-1", LogRecord::info("test", "1"));
        registry.publish("dep-1", LogRecord::info("test", "2"));

        let (listener, seen) = collector();
        let _sub = registry.subscribe("dep-1", listener).unwrap();
        registry.publish("dep-1", LogRecord::info("test", "3"));

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_subscribe_missing_channel() {
        let registry = Arc::new(LogBroadcastRegistry::new());
        let (listener, _) = collector();
        assert!(registry.subscribe("missing", listener).is_none());
    }

    #[test]
    fn test_dropping_subscription_unsubscribes() {
        let registry = Arc::new(LogBroadcastRegistry::new());
        registry.create("dep-1");

        let (listener, seen) = collector();
        let sub = registry.subscribe("dep-1", listener).unwrap();
        assert_eq!(registry.listener_count("dep-1"), 1);

        drop(sub);
        assert_eq!(registry.listener_count("dep-1"), 0);

        registry.publish("dep-1", LogRecord::info("test", "after"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let registry = LogBroadcastRegistry::with_capacity(2);
        registry.create("dep-1");
        for i in 0..5 {
            registry.publish("dep-1", LogRecord::info("test", i.to_string()));
        }
        let seqs: Vec<u64> = registry.history("dep-1", 0).iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![4, 5]);
        assert_eq!(registry.history("dep-1", 4).len(), 1);
    }

    #[test]
    fn test_pending_until_acknowledged() {
        let registry = LogBroadcastRegistry::with_capacity(1);
        registry.create("dep-1");
        registry.publish("dep-1", LogRecord::info("test", "a"));
        registry.publish("dep-1", LogRecord::info("test", "b"));

        // 不受历史容量限制
        let seqs: Vec<u64> = registry.pending("dep-1").iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        // 未确认前保留
        assert_eq!(registry.pending("dep-1").len(), 2);

        registry.acknowledge("dep-1", 1);
        registry.publish("dep-1", LogRecord::info("test", "c"));
        let seqs: Vec<u64> = registry.pending("dep-1").iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![2, 3]);

        registry.acknowledge("dep-1", 3);
        assert!(registry.pending("dep-1").is_empty());
        assert!(registry.pending("missing").is_empty());
        assert!(registry.flush_lock("missing").is_none());
    }

    #[test]
    fn test_resume_continues_sequence() {
        let registry = LogBroadcastRegistry::new();
        registry.resume("dep-1", 41);
        assert_eq!(registry.publish("dep-1", LogRecord::info("test", "a")).unwrap().seq, 42);

        // 已存在的通道不受影响
        registry.resume("dep-1", 7);
        assert_eq!(registry.publish("dep-1", LogRecord::info("test", "b")).unwrap().seq, 43);
    }

    #[test]
    fn test_finish_and_cleanup() {
        let registry = Arc::new(LogBroadcastRegistry::new());

        registry.create("dep-1");
        assert!(!registry.is_finished("dep-1"));

        registry.finish("dep-1");
        assert!(registry.is_finished("dep-1"));

        // 没有订阅者时，cleanup 应该移除通道
        assert_eq!(registry.cleanup(), 1);
        assert!(!registry.exists("dep-1"));
    }

    #[test]
    fn test_cleanup_preserves_active_subscribers() {
        let registry = Arc::new(LogBroadcastRegistry::new());

        registry.create("dep-1");
        let (listener, _) = collector();
        let _sub = registry.subscribe("dep-1", listener); // 保持订阅者存活

        registry.finish("dep-1");
        registry.cleanup();
        registry.cleanup_expired(0);

        // 有订阅者时，通道应该保留
        assert!(registry.exists("dep-1"));
        assert_eq!(registry.active_count(), 0);
        assert_eq!(registry.count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_subscribers_see_identical_sequence() {
        let registry = Arc::new(LogBroadcastRegistry::new());
        registry.create("dep-1");

        let publisher = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for i in 0..200 {
                    registry.publish("dep-1", LogRecord::info("test", i.to_string()));
                    if i % 20 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
                registry.finish("dep-1");
            })
        };

        let mut consumers = Vec::new();
        for _ in 0..3 {
            let registry = Arc::clone(&registry);
            consumers.push(tokio::spawn(async move {
                let (tx, mut rx) = mpsc::unbounded_channel::<LogRecord>();
                let listener: Arc<dyn LogListener> = Arc::new(move |record: &LogRecord| {
                    let _ = tx.send(record.clone());
                });
                let _sub = registry.subscribe("dep-1", listener).unwrap();

                let mut seqs = Vec::new();
                while seqs.len() < 200 {
                    match rx.recv().await {
                        Some(record) => seqs.push(record.seq),
                        None => break,
                    }
                }
                seqs
            }));
        }

        publisher.await.unwrap();
        let expected: Vec<u64> = (1..=200).collect();
        for consumer in consumers {
            assert_eq!(consumer.await.unwrap(), expected);
        }
    }
}
