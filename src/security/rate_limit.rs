//! Fixed-window rate limiting with burst and violation accrual.
//!
//! Each client IP gets three store keys sharing one TTL (the violation
//! window): request count, violation count and window start. A request over
//! `requests_per_second + burst` within the window is a violation; once the
//! violations reach the threshold, the next request bans the address.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::SharedClock;
use crate::config::schema::RateLimitConfig;
use crate::observability::metrics;
use crate::pipeline::{BoxError, Flow, Middleware, Phase, RequestContext, TerminalResponse};
use crate::security::ban::BanManager;
use crate::security::events::SecurityEvent;
use crate::store::CounterStore;

pub const RATE_KEY_PREFIX: &str = "rate:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    RateLimited,
    Banned,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::RateLimited => "rate_limited",
            Decision::Banned => "banned",
        }
    }
}

/// Outcome of one check plus the metadata sent back as headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitVerdict {
    pub decision: Decision,
    pub limit: u64,
    pub remaining: u64,
    /// Unix seconds when the current window ends (ban expiry when banned).
    pub reset: u64,
    pub violations: u64,
}

struct RateKeys {
    count: String,
    violations: String,
    window: String,
}

impl RateKeys {
    fn new(ip: &IpAddr) -> Self {
        Self {
            count: format!("{RATE_KEY_PREFIX}{ip}:count"),
            violations: format!("{RATE_KEY_PREFIX}{ip}:violations"),
            window: format!("{RATE_KEY_PREFIX}{ip}:window"),
        }
    }

    fn all(&self) -> [&str; 3] {
        [&self.count, &self.violations, &self.window]
    }
}

pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    bans: Arc<BanManager>,
    clock: SharedClock,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        bans: Arc<BanManager>,
        clock: SharedClock,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            store,
            bans,
            clock,
            config,
        }
    }

    /// Requests allowed per window.
    pub fn limit(&self) -> u64 {
        u64::from(self.config.requests_per_second) + u64::from(self.config.burst)
    }

    pub fn violations_before_ban(&self) -> u32 {
        self.config.violations_before_ban
    }

    pub fn check(&self, ip: IpAddr) -> RateLimitVerdict {
        let now = self.clock.now();
        let keys = RateKeys::new(&ip);
        let window = self.config.violation_window_secs;
        let ttl = Some(Duration::from_secs(window));
        let limit = self.limit();
        let threshold = self.config.violations_before_ban;

        let mut window_start = self.read(&keys.window);
        let mut violations = self.read(&keys.violations);

        // Fixed window: everything resets on the first request after expiry.
        if now.saturating_sub(window_start) >= window {
            self.write(&keys.count, 0, ttl);
            self.write(&keys.violations, 0, ttl);
            self.write(&keys.window, now, ttl);
            window_start = now;
            violations = 0;
        }

        if violations >= u64::from(threshold) {
            let Some(record) = self.bans.ban(ip) else {
                // Counters stay so the next request retries the ban.
                return RateLimitVerdict {
                    decision: Decision::RateLimited,
                    limit,
                    remaining: 0,
                    reset: window_start + window,
                    violations,
                };
            };
            for key in keys.all() {
                if let Err(e) = self.store.delete(key) {
                    tracing::warn!(key, error = %e, "Failed to clear rate record");
                }
            }
            return RateLimitVerdict {
                decision: Decision::Banned,
                limit,
                remaining: 0,
                reset: record.ban_until,
                violations,
            };
        }

        let count = self.increment(&keys.count, ttl);
        let remaining = limit.saturating_sub(count);
        let reset = window_start + window;

        if count > limit {
            let violations = self.increment(&keys.violations, ttl);
            SecurityEvent::RateLimitWarning {
                ip,
                violations: violations as i64,
                threshold,
            }
            .emit();
            return RateLimitVerdict {
                decision: Decision::RateLimited,
                limit,
                remaining,
                reset,
                violations,
            };
        }

        RateLimitVerdict {
            decision: Decision::Allow,
            limit,
            remaining,
            reset,
            violations,
        }
    }

    fn increment(&self, key: &str, ttl: Option<Duration>) -> u64 {
        match self.store.incr(key, 1, 0, ttl) {
            Ok(value) => value.max(0) as u64,
            Err(e) => {
                tracing::debug!(key, error = %e, "Atomic increment failed, falling back to set");
                self.write(key, 1, ttl);
                1
            }
        }
    }

    fn read(&self, key: &str) -> u64 {
        match self.store.get(key) {
            Ok(value) => value.unwrap_or(0).max(0) as u64,
            Err(e) => {
                tracing::warn!(key, error = %e, "Failed to read rate record, treating as zero");
                0
            }
        }
    }

    fn write(&self, key: &str, value: u64, ttl: Option<Duration>) {
        if let Err(e) = self.store.set(key, value as i64, ttl) {
            tracing::warn!(key, error = %e, "Failed to write rate record");
        }
    }
}

/// Access-phase middleware wrapping [`RateLimiter`].
///
/// Sets the `X-RateLimit-*` headers on every evaluated request and leaves
/// the verdict in the context extensions for the access log.
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl Middleware for RateLimitMiddleware {
    fn handle(&self, _phase: Phase, ctx: &mut RequestContext) -> Result<Flow, BoxError> {
        let verdict = self.limiter.check(ctx.client_ip);

        ctx.set_response_header("x-ratelimit-limit", verdict.limit);
        ctx.set_response_header("x-ratelimit-remaining", verdict.remaining);
        ctx.set_response_header("x-ratelimit-reset", verdict.reset);
        metrics::record_decision(verdict.decision.as_str());

        let flow = match verdict.decision {
            Decision::Allow => Flow::Continue,
            Decision::RateLimited => {
                let left = u64::from(self.limiter.violations_before_ban())
                    .saturating_sub(verdict.violations);
                Flow::Terminate(TerminalResponse::rate_limited(left))
            }
            Decision::Banned => Flow::Terminate(TerminalResponse::banned()),
        };

        ctx.extensions.insert(verdict);
        Ok(flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pipeline::{MiddlewareDescriptor, MiddlewareState, Pipeline, PhaseDispatcher, PhaseSignal};
    use crate::security::artifact::ArtifactWriter;
    use crate::security::ban::BanCheckMiddleware;
    use crate::store::{MemoryStore, SafeSet, StoreError};
    use axum::http::StatusCode;
    use std::net::Ipv4Addr;

    const T0: u64 = 1_700_000_000;

    fn config() -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: 10,
            burst: 5,
            violation_window_secs: 60,
            violations_before_ban: 3,
            ..RateLimitConfig::default()
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<dyn CounterStore>,
        bans: Arc<BanManager>,
        limiter: Arc<RateLimiter>,
    }

    fn harness_with(store: impl FnOnce(SharedClock) -> Arc<dyn CounterStore>) -> Harness {
        let clock = Arc::new(ManualClock::new(T0));
        let store = store(clock.clone() as SharedClock);
        let bans = Arc::new(BanManager::new(
            store.clone(),
            clock.clone(),
            Duration::from_secs(1_800),
            ArtifactWriter::disabled(),
        ));
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            bans.clone(),
            clock.clone(),
            config(),
        ));
        Harness {
            clock,
            store,
            bans,
            limiter,
        }
    }

    fn harness() -> Harness {
        harness_with(|clock| Arc::new(MemoryStore::new(clock)) as Arc<dyn CounterStore>)
    }

    fn client() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, 44))
    }

    fn dispatcher(h: &Harness) -> PhaseDispatcher {
        let pipeline = Arc::new(Pipeline::new());
        pipeline
            .register(
                MiddlewareDescriptor::new("ban_check", Arc::new(BanCheckMiddleware::new(h.bans.clone())))
                    .priority(10)
                    .phase(Phase::Access)
                    .state(MiddlewareState::Active),
            )
            .unwrap();
        pipeline
            .register(
                MiddlewareDescriptor::new("rate_limit", Arc::new(RateLimitMiddleware::new(h.limiter.clone())))
                    .priority(20)
                    .phase(Phase::Access)
                    .state(MiddlewareState::Active),
            )
            .unwrap();
        PhaseDispatcher::new(pipeline)
    }

    #[test]
    fn test_burst_violations_then_ban() {
        let h = harness();
        let ip = client();

        for n in 1..=15u64 {
            let verdict = h.limiter.check(ip);
            assert_eq!(verdict.decision, Decision::Allow, "request {n}");
            assert_eq!(verdict.remaining, 15 - n);
            assert_eq!(verdict.reset, T0 + 60);
        }

        for violations in 1..=3u64 {
            let verdict = h.limiter.check(ip);
            assert_eq!(verdict.decision, Decision::RateLimited);
            assert_eq!(verdict.violations, violations);
            assert_eq!(verdict.remaining, 0);
        }

        let verdict = h.limiter.check(ip);
        assert_eq!(verdict.decision, Decision::Banned);
        assert_eq!(verdict.reset, T0 + 1_800);
        for key in RateKeys::new(&ip).all() {
            assert_eq!(h.store.get(key).unwrap(), None, "{key} survived the ban");
        }
        assert!(h.bans.is_banned(ip));
    }

    #[test]
    fn test_banned_request_never_reaches_limiter() {
        let h = harness();
        let dispatcher = dispatcher(&h);
        let ip = client();

        let mut last = None;
        for _ in 0..19 {
            let mut ctx = RequestContext::new(ip, "GET", "/");
            dispatcher.access(&mut ctx);
            last = ctx.final_status();
        }
        assert_eq!(last, Some(StatusCode::FORBIDDEN));

        let mut ctx = RequestContext::new(ip, "GET", "/");
        assert_eq!(dispatcher.access(&mut ctx), PhaseSignal::Stop);
        assert_eq!(ctx.final_status(), Some(StatusCode::FORBIDDEN));
        assert!(ctx.extensions.get::<RateLimitVerdict>().is_none());
        assert_eq!(h.store.get(&RateKeys::new(&ip).count).unwrap(), None);
    }

    #[test]
    fn test_fresh_count_after_ban_expires() {
        let h = harness();
        let dispatcher = dispatcher(&h);
        let ip = client();

        for _ in 0..19 {
            h.limiter.check(ip);
        }
        assert!(h.bans.is_banned(ip));

        h.clock.advance(1_799);
        let mut ctx = RequestContext::new(ip, "GET", "/");
        dispatcher.access(&mut ctx);
        assert_eq!(ctx.final_status(), Some(StatusCode::FORBIDDEN));

        h.clock.advance(2);
        let mut ctx = RequestContext::new(ip, "GET", "/");
        assert_eq!(dispatcher.access(&mut ctx), PhaseSignal::Continue);
        let verdict = ctx.extensions.get::<RateLimitVerdict>().unwrap();
        assert_eq!(verdict.decision, Decision::Allow);
        assert_eq!(verdict.remaining, 14);
        assert_eq!(h.store.get(&RateKeys::new(&ip).count).unwrap(), Some(1));
    }

    #[test]
    fn test_window_is_fixed_not_sliding() {
        let h = harness();
        let ip = client();

        for _ in 0..15 {
            h.limiter.check(ip);
        }
        h.clock.advance(59);
        assert_eq!(h.limiter.check(ip).decision, Decision::RateLimited);

        h.clock.advance(1);
        let verdict = h.limiter.check(ip);
        assert_eq!(verdict.decision, Decision::Allow);
        assert_eq!(verdict.violations, 0);
        assert_eq!(verdict.remaining, 14);
        assert_eq!(verdict.reset, T0 + 120);
    }

    #[test]
    fn test_headers_and_body_on_rejection() {
        let h = harness();
        let middleware = RateLimitMiddleware::new(h.limiter.clone());
        let ip = client();

        for _ in 0..15 {
            let mut ctx = RequestContext::new(ip, "GET", "/");
            assert_eq!(middleware.handle(Phase::Access, &mut ctx).unwrap(), Flow::Continue);
        }

        let mut ctx = RequestContext::new(ip, "GET", "/");
        let flow = middleware.handle(Phase::Access, &mut ctx).unwrap();
        assert_eq!(ctx.response_headers["x-ratelimit-limit"], "15");
        assert_eq!(ctx.response_headers["x-ratelimit-remaining"], "0");
        assert_eq!(ctx.response_headers["x-ratelimit-reset"], (T0 + 60).to_string().as_str());
        match flow {
            Flow::Terminate(response) => {
                assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
                assert_eq!(response.body["violations_remaining"], 2);
            }
            Flow::Continue => panic!("request over the limit was allowed"),
        }
    }

    /// Store without atomic increments.
    struct NoIncrStore(MemoryStore);

    impl CounterStore for NoIncrStore {
        fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
            self.0.get(key)
        }
        fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StoreError> {
            self.0.set(key, value, ttl)
        }
        fn incr(&self, _: &str, _: i64, _: i64, _: Option<Duration>) -> Result<i64, StoreError> {
            Err(StoreError::Unsupported("incr"))
        }
        fn safe_set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<SafeSet, StoreError> {
            self.0.safe_set(key, value, ttl)
        }
        fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key)
        }
        fn keys(&self) -> Result<Vec<String>, StoreError> {
            self.0.keys()
        }
        fn sweep_expired(&self) -> Result<usize, StoreError> {
            self.0.sweep_expired()
        }
    }

    /// Store that refuses to persist ban records.
    struct NoBanWrites(MemoryStore);

    impl CounterStore for NoBanWrites {
        fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
            self.0.get(key)
        }
        fn set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<(), StoreError> {
            if key.starts_with(crate::security::ban::BAN_KEY_PREFIX) {
                return Err(StoreError::Transient("read-only".into()));
            }
            self.0.set(key, value, ttl)
        }
        fn incr(&self, key: &str, delta: i64, default: i64, ttl: Option<Duration>) -> Result<i64, StoreError> {
            self.0.incr(key, delta, default, ttl)
        }
        fn safe_set(&self, key: &str, value: i64, ttl: Option<Duration>) -> Result<SafeSet, StoreError> {
            self.0.safe_set(key, value, ttl)
        }
        fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key)
        }
        fn keys(&self) -> Result<Vec<String>, StoreError> {
            self.0.keys()
        }
        fn sweep_expired(&self) -> Result<usize, StoreError> {
            self.0.sweep_expired()
        }
    }

    #[test]
    fn test_failed_ban_keeps_counters() {
        let h = harness_with(|clock| Arc::new(NoBanWrites(MemoryStore::new(clock))) as Arc<dyn CounterStore>);
        let ip = client();

        for _ in 0..18 {
            h.limiter.check(ip);
        }
        let verdict = h.limiter.check(ip);
        assert_eq!(verdict.decision, Decision::RateLimited);
        assert_eq!(verdict.remaining, 0);
        assert_eq!(verdict.reset, T0 + 60);
        assert!(!h.bans.is_banned(ip));
        assert_eq!(h.store.get(&RateKeys::new(&ip).violations).unwrap(), Some(3));
    }

    #[test]
    fn test_increment_failure_falls_back_to_set() {
        let h = harness_with(|clock| Arc::new(NoIncrStore(MemoryStore::new(clock))) as Arc<dyn CounterStore>);
        let ip = client();

        for _ in 0..20 {
            let verdict = h.limiter.check(ip);
            assert_eq!(verdict.decision, Decision::Allow);
            assert_eq!(verdict.remaining, 14);
        }
        assert_eq!(h.store.get(&RateKeys::new(&ip).count).unwrap(), Some(1));
    }
}
