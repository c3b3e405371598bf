//! Alert aggregation.
//!
//! Abnormal events are posted under a named category. Each category keeps a
//! bounded history (plus the first event ever, which is always retrievable),
//! a severity level, and per-level rate limiting: a pending category emits at
//! most once per interval unless polled with `force`. Emission goes through
//! the `log` facade and, when a broadcaster is attached, through a bounded
//! queue drained by a single worker thread so notification delivery never
//! runs under the monitor's mutex.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::thread;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::{Error, Result};

pub const DEFAULT_HISTORY_LENGTH: usize = 10;
pub const MIN_HISTORY_LENGTH: usize = 1;
pub const MAX_HISTORY_LENGTH: usize = 1000;

pub const DEFAULT_WARN_INTERVAL_MS: u64 = 600_000;
pub const DEFAULT_ERROR_INTERVAL_MS: u64 = 15_000;
pub const MIN_INTERVAL_MS: u64 = 1_000;
pub const MAX_INTERVAL_MS: u64 = 86_400_000;

const NOTIFICATION_QUEUE_DEPTH: usize = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AlertLevel {
    Normal,
    Warn,
    Error,
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Normal => write!(f, "NORMAL"),
            AlertLevel::Warn => write!(f, "WARN"),
            AlertLevel::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Event {
    pub time_ms: u64,
    pub level: AlertLevel,
    pub message: String,
}

/// What gets logged and handed to the broadcaster.
#[derive(Clone, Debug)]
pub struct Notification {
    pub category: String,
    pub level: AlertLevel,
    pub message: String,
    pub count: u64,
    /// Seconds between the first and last event when recurring.
    pub duration_s: u64,
}

pub trait Broadcaster: Send {
    fn notify(&self, notification: &Notification);
}

#[derive(Debug, Default)]
struct CategoryHistory {
    events: VecDeque<Event>,
    first_event: Option<Event>,
    count: u64,
    reported_count: u64,
    level: Option<AlertLevel>,
    last_log_warn: Option<u64>,
    last_log_error: Option<u64>,
}

struct Inner {
    categories: BTreeMap<String, CategoryHistory>,
    history_length: usize,
    warn_interval_ms: u64,
    error_interval_ms: u64,
}

pub struct AlertMonitor {
    inner: Mutex<Inner>,
    sender: Option<SyncSender<Notification>>,
    worker: Option<thread::JoinHandle<()>>,
    dropped_notifications: AtomicU64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Default for AlertMonitor {
    fn default() -> AlertMonitor {
        AlertMonitor::new()
    }
}

impl AlertMonitor {
    pub fn new() -> AlertMonitor {
        AlertMonitor {
            inner: Mutex::new(Inner {
                categories: BTreeMap::new(),
                history_length: DEFAULT_HISTORY_LENGTH,
                warn_interval_ms: DEFAULT_WARN_INTERVAL_MS,
                error_interval_ms: DEFAULT_ERROR_INTERVAL_MS,
            }),
            sender: None,
            worker: None,
            dropped_notifications: AtomicU64::new(0),
        }
    }

    /// Attaches a broadcaster behind a bounded queue and its worker thread.
    pub fn with_broadcaster(mut self, broadcaster: Box<dyn Broadcaster>) -> AlertMonitor {
        let (sender, receiver) = mpsc::sync_channel::<Notification>(NOTIFICATION_QUEUE_DEPTH);
        let worker = thread::Builder::new()
            .name("alert-notify".to_string())
            .spawn(move || {
                while let Ok(notification) = receiver.recv() {
                    broadcaster.notify(&notification);
                }
            })
            .expect("spawn alert worker");
        self.sender = Some(sender);
        self.worker = Some(worker);
        self
    }

    pub fn set_history_length(&self, length: usize) -> Result<()> {
        if !(MIN_HISTORY_LENGTH..=MAX_HISTORY_LENGTH).contains(&length) {
            return Err(Error::InvalidArgument(format!(
                "history length {length} outside [{MIN_HISTORY_LENGTH}, {MAX_HISTORY_LENGTH}]"
            )));
        }
        let mut inner = self.inner.lock();
        inner.history_length = length;
        for history in inner.categories.values_mut() {
            while history.events.len() > length {
                history.events.pop_front();
            }
        }
        Ok(())
    }

    pub fn set_warn_interval_ms(&self, interval: u64) -> Result<()> {
        check_interval(interval)?;
        self.inner.lock().warn_interval_ms = interval;
        Ok(())
    }

    pub fn set_error_interval_ms(&self, interval: u64) -> Result<()> {
        check_interval(interval)?;
        self.inner.lock().error_interval_ms = interval;
        Ok(())
    }

    pub fn post(&self, category: &str, event: Event) {
        let mut inner = self.inner.lock();
        let history_length = inner.history_length;
        let history = inner.categories.entry(category.to_string()).or_default();
        if history.first_event.is_none() {
            history.first_event = Some(event.clone());
        }
        history.count += 1;
        history.level = Some(history.level.map_or(event.level, |l| l.max(event.level)));
        history.events.push_back(event);
        while history.events.len() > history_length {
            history.events.pop_front();
        }
    }

    /// Posts with the wall clock; call sites that have no better timestamp.
    pub fn post_now(&self, category: &str, level: AlertLevel, message: &str) {
        self.post(
            category,
            Event {
                time_ms: now_ms(),
                level,
                message: message.to_string(),
            },
        );
    }

    /// Emits pending categories subject to per-level rate limits. Returns
    /// what was emitted; logging and notification happen off the mutex.
    pub fn poll(&self, now_ms: u64, force: bool) -> Vec<Notification> {
        let mut pending = Vec::new();
        {
            let mut inner = self.inner.lock();
            let warn_interval = inner.warn_interval_ms;
            let error_interval = inner.error_interval_ms;
            for (category, history) in inner.categories.iter_mut() {
                if history.count <= history.reported_count {
                    continue;
                }
                let level = match history.level {
                    Some(level) if level >= AlertLevel::Warn => level,
                    // NORMAL never emits.
                    _ => continue,
                };
                let (last_log, interval) = match level {
                    AlertLevel::Error => (&mut history.last_log_error, error_interval),
                    _ => (&mut history.last_log_warn, warn_interval),
                };
                let due = force || last_log.is_none_or(|t| now_ms > t + interval);
                if !due {
                    continue;
                }
                *last_log = Some(now_ms);
                history.reported_count = history.count;

                let latest = history.events.back();
                let first = history.first_event.as_ref();
                let duration_s = match (first, latest) {
                    (Some(first), Some(latest)) => {
                        latest.time_ms.saturating_sub(first.time_ms) / 1000
                    }
                    _ => 0,
                };
                let message = match latest {
                    Some(event) if history.count == 1 => event.message.clone(),
                    Some(event) => format!(
                        "{} (recurring, count={}, duration={}s)",
                        event.message, history.count, duration_s
                    ),
                    None => String::new(),
                };
                pending.push(Notification {
                    category: category.clone(),
                    level,
                    message,
                    count: history.count,
                    duration_s,
                });
            }
        }
        for notification in &pending {
            match notification.level {
                AlertLevel::Error => {
                    log::error!("[{}] {}", notification.category, notification.message)
                }
                _ => log::warn!("[{}] {}", notification.category, notification.message),
            }
            if let Some(sender) = &self.sender {
                match sender.try_send(notification.clone()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                        self.dropped_notifications.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        pending
    }

    pub fn reset(&self) {
        self.inner.lock().categories.clear();
    }

    pub fn dropped_notifications(&self) -> u64 {
        self.dropped_notifications.load(Ordering::Relaxed)
    }

    /// The first event ever posted to a category, kept even after the
    /// bounded history wraps.
    pub fn first_event(&self, category: &str) -> Option<Event> {
        self.inner
            .lock()
            .categories
            .get(category)
            .and_then(|h| h.first_event.clone())
    }

    pub fn history(&self, category: &str) -> Vec<Event> {
        self.inner
            .lock()
            .categories
            .get(category)
            .map(|h| h.events.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self, category: &str) -> u64 {
        self.inner
            .lock()
            .categories
            .get(category)
            .map(|h| h.count)
            .unwrap_or(0)
    }
}

impl Drop for AlertMonitor {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn check_interval(interval: u64) -> Result<()> {
    if !(MIN_INTERVAL_MS..=MAX_INTERVAL_MS).contains(&interval) {
        return Err(Error::InvalidArgument(format!(
            "interval {interval} ms outside [{MIN_INTERVAL_MS}, {MAX_INTERVAL_MS}]"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn warn_event(time_ms: u64, message: &str) -> Event {
        Event {
            time_ms,
            level: AlertLevel::Warn,
            message: message.to_string(),
        }
    }

    #[test]
    fn s6_recurring_events_collapse_into_one_emission() {
        let monitor = AlertMonitor::new();
        for i in 0..5u64 {
            monitor.post("io", warn_event(i * 100, "write stalled"));
        }
        let emitted = monitor.poll(700_000, false);
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].category, "io");
        assert_eq!(emitted[0].count, 5);
        assert_eq!(emitted[0].duration_s, 0);
        assert!(emitted[0].message.contains("count=5"));
        // Nothing new: nothing more to emit.
        assert!(monitor.poll(1_400_000, false).is_empty());
    }

    #[test]
    fn rate_limit_one_emission_per_interval() {
        let monitor = AlertMonitor::new();
        monitor.set_warn_interval_ms(1000).unwrap();
        let mut emissions = Vec::new();
        for t in 0..3000u64 {
            if t < 1000 {
                monitor.post("cat", warn_event(t, "e"));
            }
            for n in monitor.poll(t, false) {
                emissions.push((t, n.count));
            }
        }
        // One emission in the first second, one in the next; then the
        // stream has ended and the counts are fully reported.
        assert_eq!(emissions.len(), 2);
        assert!(emissions[0].0 < 1000);
        assert!((1000..2000).contains(&emissions[1].0));
        assert_eq!(emissions[1].1, 1000);
    }

    #[test]
    fn force_overrides_the_interval() {
        let monitor = AlertMonitor::new();
        monitor.post("cat", warn_event(0, "first"));
        assert_eq!(monitor.poll(1, false).len(), 1);
        monitor.post("cat", warn_event(2, "second"));
        // Within the interval: silent unless forced.
        assert!(monitor.poll(3, false).is_empty());
        let forced = monitor.poll(4, true);
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].count, 2);
        // reported_count advanced; nothing pending now.
        assert!(monitor.poll(5, true).is_empty());
    }

    #[test]
    fn normal_level_never_emits() {
        let monitor = AlertMonitor::new();
        monitor.post(
            "quiet",
            Event {
                time_ms: 0,
                level: AlertLevel::Normal,
                message: "routine".to_string(),
            },
        );
        assert!(monitor.poll(u64::MAX / 2, true).is_empty());
    }

    #[test]
    fn history_truncates_but_first_event_survives() {
        let monitor = AlertMonitor::new();
        monitor.set_history_length(3).unwrap();
        for i in 0..10u64 {
            monitor.post("cat", warn_event(i, &format!("event {i}")));
        }
        let history = monitor.history("cat");
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message, "event 7");
        let first = monitor.first_event("cat").unwrap();
        assert_eq!(first.message, "event 0");
        assert_eq!(monitor.count("cat"), 10);
    }

    #[test]
    fn config_bounds_are_enforced() {
        let monitor = AlertMonitor::new();
        assert!(monitor.set_history_length(0).is_err());
        assert!(monitor.set_history_length(1001).is_err());
        assert!(monitor.set_history_length(1000).is_ok());
        assert!(monitor.set_warn_interval_ms(999).is_err());
        assert!(monitor.set_warn_interval_ms(86_400_001).is_err());
        assert!(monitor.set_error_interval_ms(15_000).is_ok());
    }

    #[test]
    fn error_and_warn_intervals_are_independent() {
        let monitor = AlertMonitor::new();
        monitor.set_warn_interval_ms(600_000).unwrap();
        monitor.set_error_interval_ms(1_000).unwrap();
        monitor.post(
            "disk",
            Event {
                time_ms: 0,
                level: AlertLevel::Error,
                message: "checksum".to_string(),
            },
        );
        assert_eq!(monitor.poll(1, false).len(), 1);
        monitor.post(
            "disk",
            Event {
                time_ms: 2,
                level: AlertLevel::Error,
                message: "checksum".to_string(),
            },
        );
        // The short error interval applies, not the warn interval.
        assert_eq!(monitor.poll(1_500, false).len(), 1);
    }

    #[test]
    fn broadcaster_receives_off_the_mutex() {
        struct Counter(Arc<AtomicUsize>);
        impl Broadcaster for Counter {
            fn notify(&self, _notification: &Notification) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let delivered = Arc::new(AtomicUsize::new(0));
        let monitor = AlertMonitor::new().with_broadcaster(Box::new(Counter(delivered.clone())));
        monitor.post("cat", warn_event(0, "x"));
        monitor.poll(1, true);
        drop(monitor); // joins the worker, draining the queue
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reset_clears_everything() {
        let monitor = AlertMonitor::new();
        monitor.post("cat", warn_event(0, "x"));
        monitor.reset();
        assert_eq!(monitor.count("cat"), 0);
        assert!(monitor.first_event("cat").is_none());
        assert!(monitor.poll(10, true).is_empty());
    }
}
