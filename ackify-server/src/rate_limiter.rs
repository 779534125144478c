use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub current: i64,
    pub retry_after_secs: u64,
}

struct WindowSlot {
    count: i64,
    window_start: Instant,
}

/// Fixed-window in-memory limiter keyed by caller-chosen strings (client IP,
/// email, ip+doc pairs). A background task expires idle keys so the map does
/// not grow with one entry per client forever.
#[derive(Clone)]
pub struct WindowLimiter {
    inner: Arc<Mutex<HashMap<String, WindowSlot>>>,
    window: Duration,
}

impl WindowLimiter {
    pub fn new(window_secs: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window: Duration::from_secs(window_secs.max(1)),
        }
    }

    pub async fn check(&self, key: &str, limit: u32) -> RateDecision {
        let mut guard = self.inner.lock().await;
        let now = Instant::now();
        let slot = guard
            .entry(key.to_string())
            .or_insert(WindowSlot { count: 0, window_start: now });
        if now.duration_since(slot.window_start) >= self.window {
            slot.count = 0;
            slot.window_start = now;
        }
        slot.count += 1;
        let allowed = slot.count <= limit as i64;
        let elapsed = now.duration_since(slot.window_start);
        let retry_after_secs = self.window.saturating_sub(elapsed).as_secs().max(1);
        RateDecision { allowed, current: slot.count, retry_after_secs }
    }

    /// Drop keys idle for two full windows.
    pub fn spawn_cleanup(&self) {
        let inner = self.inner.clone();
        let window = self.window;
        tokio::spawn(async move {
            let mut ticker = interval(window.max(Duration::from_secs(60)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cutoff = window * 2;
                let now = Instant::now();
                let mut guard = inner.lock().await;
                guard.retain(|_, slot| now.duration_since(slot.window_start) < cutoff);
            }
        });
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ProxyDecision {
    pub allowed: bool,
    pub limit_type: Option<&'static str>,
    pub retry_after_secs: u64,
}

/// Limits for the document proxy: three independent per-minute counters.
/// When several limits bind at once the tightest one is reported.
#[derive(Clone)]
pub struct ProxyLimiter {
    by_ip: WindowLimiter,
    by_ip_doc: WindowLimiter,
    by_doc: WindowLimiter,
    ip_limit: u32,
    ip_doc_limit: u32,
    doc_limit: u32,
}

impl ProxyLimiter {
    pub fn new(ip_limit: u32, ip_doc_limit: u32, doc_limit: u32) -> Self {
        Self {
            by_ip: WindowLimiter::new(60),
            by_ip_doc: WindowLimiter::new(60),
            by_doc: WindowLimiter::new(60),
            ip_limit,
            ip_doc_limit,
            doc_limit,
        }
    }

    pub async fn check(&self, ip: &str, doc_id: &str) -> ProxyDecision {
        let ip_doc = self
            .by_ip_doc
            .check(&format!("{ip}|{doc_id}"), self.ip_doc_limit)
            .await;
        let ip_only = self.by_ip.check(ip, self.ip_limit).await;
        let doc_only = self.by_doc.check(doc_id, self.doc_limit).await;

        for (decision, limit_type) in [
            (ip_doc, "ip_doc"),
            (ip_only, "ip"),
            (doc_only, "doc"),
        ] {
            if !decision.allowed {
                return ProxyDecision {
                    allowed: false,
                    limit_type: Some(limit_type),
                    retry_after_secs: decision.retry_after_secs,
                };
            }
        }
        ProxyDecision { allowed: true, limit_type: None, retry_after_secs: 0 }
    }

    pub fn spawn_cleanup(&self) {
        self.by_ip.spawn_cleanup();
        self.by_ip_doc.spawn_cleanup();
        self.by_doc.spawn_cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_allows_up_to_limit() {
        let limiter = WindowLimiter::new(60);
        for _ in 0..5 {
            assert!(limiter.check("k", 5).await.allowed);
        }
        let denied = limiter.check("k", 5).await;
        assert!(!denied.allowed);
        assert!(denied.retry_after_secs >= 1);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = WindowLimiter::new(60);
        assert!(limiter.check("a", 1).await.allowed);
        assert!(!limiter.check("a", 1).await.allowed);
        assert!(limiter.check("b", 1).await.allowed);
    }

    #[tokio::test]
    async fn concurrent_checks_never_exceed_limit() {
        let limiter = WindowLimiter::new(60);
        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.check("k", 10).await.allowed }));
        }
        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn proxy_reports_tightest_limit() {
        let limiter = ProxyLimiter::new(100, 2, 100);
        assert!(limiter.check("1.2.3.4", "doc").await.allowed);
        assert!(limiter.check("1.2.3.4", "doc").await.allowed);
        let denied = limiter.check("1.2.3.4", "doc").await;
        assert!(!denied.allowed);
        assert_eq!(denied.limit_type, Some("ip_doc"));
    }

    #[tokio::test]
    async fn proxy_per_doc_limit_spans_ips() {
        let limiter = ProxyLimiter::new(100, 100, 3);
        assert!(limiter.check("10.0.0.1", "doc").await.allowed);
        assert!(limiter.check("10.0.0.2", "doc").await.allowed);
        assert!(limiter.check("10.0.0.3", "doc").await.allowed);
        let denied = limiter.check("10.0.0.4", "doc").await;
        assert!(!denied.allowed);
        assert_eq!(denied.limit_type, Some("doc"));
    }
}
