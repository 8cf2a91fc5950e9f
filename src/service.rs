use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use crate::audit::{AuditHandle, BlockedRequest, BAN_REASON};
use crate::config::GateConfig;
use crate::core::{
    is_bypass_token, AttackScanner, BlacklistOracle, BypassTokenStore, ClientRequest,
    RateLimiter, RequestCounter, ScanMatch, Session, TOKEN_HEADER, TOKEN_QUERY_PARAM,
    TOTAL_REQUESTS_KEY,
};
use crate::utils::{log_verdict, log_waf_match, ShieldError, ShieldResult};

/// Outcome of gating a single request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Pass the request to the protected application
    Allow,
    /// Send the client to the challenge entry point
    ChallengeRedirect { location: String },
    /// An attack signature matched
    BlockedWaf(ScanMatch),
    /// The client IP is blacklisted
    BlockedBanned,
    /// The pipeline could not reach a decision
    BlockedError,
}

impl Verdict {
    /// Stable label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allow => "allow",
            Verdict::ChallengeRedirect { .. } => "challenge",
            Verdict::BlockedWaf(_) => "blocked_waf",
            Verdict::BlockedBanned => "blocked_banned",
            Verdict::BlockedError => "blocked_error",
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(
            self,
            Verdict::BlockedWaf(_) | Verdict::BlockedBanned | Verdict::BlockedError
        )
    }
}

/// External services consulted by the pipeline, built once at startup
#[derive(Clone)]
pub struct Collaborators {
    pub tokens: Arc<dyn BypassTokenStore>,
    pub blacklist: Arc<dyn BlacklistOracle>,
    pub scanner: Arc<dyn AttackScanner>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub counter: Arc<dyn RequestCounter>,
    pub audit: AuditHandle,
}

/// Turns one request plus its session into a verdict.
///
/// Checks run strictly in this order and the first decisive one wins:
/// bypass token, request counting, blacklist, signature scan, then the
/// session/challenge decision with rate limiting on the allow path.
pub struct GatingPipeline {
    collaborators: Collaborators,
    config: GateConfig,
}

impl GatingPipeline {
    pub fn new(collaborators: Collaborators, config: GateConfig) -> Self {
        Self {
            collaborators,
            config,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// Decide a request.
    ///
    /// Never fails: collaborator errors and timeouts become
    /// `Verdict::BlockedError` with the session handed back unchanged.
    pub async fn decide(&self, request: &ClientRequest, session: Session) -> (Verdict, Session) {
        let started = Instant::now();

        let (verdict, session) = match self.evaluate(request, &session).await {
            Ok(decided) => decided,
            Err(e) => {
                tracing::error!(
                    ip = %request.ip,
                    path = %request.path,
                    error = %e,
                    "gating pipeline failed"
                );
                (Verdict::BlockedError, session)
            }
        };

        metrics::increment_counter!("shield_verdicts_total", "verdict" => verdict.as_str());
        metrics::histogram!("shield_decision_seconds", started.elapsed().as_secs_f64());
        log_verdict(&request.ip, &request.path, verdict.as_str());

        (verdict, session)
    }

    async fn evaluate(
        &self,
        request: &ClientRequest,
        session: &Session,
    ) -> ShieldResult<(Verdict, Session)> {
        if self.has_solved_token(request).await? {
            return Ok((Verdict::Allow, session.clone()));
        }

        self.count_request().await;

        let c = &self.collaborators;
        if self.bounded("blacklist", c.blacklist.contains(request.ip)).await? {
            c.audit.record_blocked(
                request.ip,
                BAN_REASON,
                request.path_and_query(),
                request.user_agent(),
            );
            return Ok((Verdict::BlockedBanned, session.clone()));
        }

        if let Some(hit) = self.bounded("attack scan", c.scanner.scan(request)).await? {
            log_waf_match(&request.ip, &hit);
            c.audit.record_blocked(
                request.ip,
                BlockedRequest::waf_reason(&hit.rule_id),
                request.path_and_query(),
                request.user_agent(),
            );
            return Ok((Verdict::BlockedWaf(hit), session.clone()));
        }

        if session.authorized || !self.config.pow {
            let session = self.apply_rate_limit(request, session).await?;
            return Ok((Verdict::Allow, session));
        }

        Ok((self.challenge(request), session.clone()))
    }

    /// Either carrier may hold a solved token; they are checked independently
    async fn has_solved_token(&self, request: &ClientRequest) -> ShieldResult<bool> {
        let candidates = [request.query_param(TOKEN_QUERY_PARAM), request.header(TOKEN_HEADER)];

        for token in candidates.into_iter().flatten() {
            if !is_bypass_token(token) {
                continue;
            }
            let tokens = &self.collaborators.tokens;
            if self.bounded("bypass token lookup", tokens.is_solved(token)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Best effort: a failing counter never affects the verdict
    async fn count_request(&self) {
        let counter = &self.collaborators.counter;
        if let Err(e) = self
            .bounded("request counter", counter.increment(TOTAL_REQUESTS_KEY))
            .await
        {
            tracing::warn!(error = %e, "failed to count request");
        }
    }

    async fn apply_rate_limit(
        &self,
        request: &ClientRequest,
        session: &Session,
    ) -> ShieldResult<Session> {
        if !self.config.rate_limit {
            return Ok(session.clone());
        }

        let limiter = &self.collaborators.rate_limiter;
        let delta = self
            .bounded("rate limiter", limiter.consume(request.ip, session))
            .await?;
        if delta.limited {
            metrics::increment_counter!("shield_rate_limited_total");
        }
        Ok(session.clone().with_rate_limit(delta))
    }

    fn challenge(&self, request: &ClientRequest) -> Verdict {
        let entry = self.config.challenge_path.as_str();

        if request.path == "/" {
            return Verdict::ChallengeRedirect {
                location: entry.to_string(),
            };
        }
        if is_under(&request.path, entry) {
            return Verdict::Allow;
        }

        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("redirect", &request.path_and_query())
            .finish();
        Verdict::ChallengeRedirect {
            location: format!("{}?{}", entry, query),
        }
    }

    async fn bounded<T, F>(&self, what: &'static str, call: F) -> ShieldResult<T>
    where
        F: Future<Output = ShieldResult<T>>,
    {
        tokio::time::timeout(self.config.lookup_timeout(), call)
            .await
            .map_err(|_| ShieldError::Timeout(what))?
    }
}

/// `path` equals `prefix` or lies below it (`/pow`, `/pow/verify`, not `/powder`)
fn is_under(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditEvent;
    use crate::core::{
        MockAttackScanner, MockBlacklistOracle, MockBypassTokenStore, MockRateLimiter,
        MockRequestCounter, RateLimitDelta,
    };
    use axum::http::Method;
    use chrono::Utc;
    use mockall::predicate::eq;
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const TOKEN: &str = "6f1c2b0e-3a4d-4e5f-8a9b-0c1d2e3f4a5b";

    /// Mocks with permissive defaults; tests tighten the ones they care about
    struct Mocks {
        tokens: MockBypassTokenStore,
        blacklist: MockBlacklistOracle,
        scanner: MockAttackScanner,
        rate_limiter: MockRateLimiter,
        counter: MockRequestCounter,
    }

    impl Mocks {
        fn new() -> Self {
            Self {
                tokens: MockBypassTokenStore::new(),
                blacklist: MockBlacklistOracle::new(),
                scanner: MockAttackScanner::new(),
                rate_limiter: MockRateLimiter::new(),
                counter: MockRequestCounter::new(),
            }
        }

        /// Clean traffic: nothing solved, nothing blacklisted, nothing matched
        fn clean() -> Self {
            let mut mocks = Self::new();
            mocks.tokens.expect_is_solved().returning(|_| Ok(false));
            mocks.counter.expect_increment().returning(|_| Ok(()));
            mocks.blacklist.expect_contains().returning(|_| Ok(false));
            mocks.scanner.expect_scan().returning(|_| Ok(None));
            mocks.rate_limiter.expect_consume().returning(|_, _| Ok(delta(1, false)));
            mocks
        }

        fn pipeline(self, config: GateConfig) -> (GatingPipeline, mpsc::Receiver<AuditEvent>) {
            let (audit, rx) = AuditHandle::channel(16);
            let collaborators = Collaborators {
                tokens: Arc::new(self.tokens),
                blacklist: Arc::new(self.blacklist),
                scanner: Arc::new(self.scanner),
                rate_limiter: Arc::new(self.rate_limiter),
                counter: Arc::new(self.counter),
                audit,
            };
            (GatingPipeline::new(collaborators, config), rx)
        }
    }

    fn delta(count: u32, limited: bool) -> RateLimitDelta {
        RateLimitDelta {
            window_start: Utc::now(),
            count,
            limited,
            retry_after_secs: limited.then_some(30),
        }
    }

    fn config() -> GateConfig {
        GateConfig::default()
    }

    fn ip() -> IpAddr {
        "198.51.100.23".parse().unwrap()
    }

    fn get(target: &str) -> ClientRequest {
        ClientRequest::new(ip(), Method::GET, target)
    }

    fn waf_hit() -> ScanMatch {
        ScanMatch {
            rule_id: "942100".to_string(),
            comment: "SQL injection attack: UNION SELECT".to_string(),
            category: "sqli".to_string(),
            location: "query:id".to_string(),
        }
    }

    fn drain(rx: &mut mpsc::Receiver<AuditEvent>) -> Vec<AuditEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn redirect_param(location: &str) -> Option<String> {
        let (_, query) = location.split_once('?')?;
        let params: HashMap<String, String> =
            url::form_urlencoded::parse(query.as_bytes()).into_owned().collect();
        params.get("redirect").cloned()
    }

    #[tokio::test]
    async fn test_solved_token_in_query_short_circuits() {
        let mut mocks = Mocks::new();
        mocks
            .tokens
            .expect_is_solved()
            .withf(|token| token == TOKEN)
            .times(1)
            .returning(|_| Ok(true));
        mocks.counter.expect_increment().never();
        mocks.blacklist.expect_contains().never();
        mocks.scanner.expect_scan().never();
        mocks.rate_limiter.expect_consume().never();
        let (pipeline, mut rx) = mocks.pipeline(config());

        let request = get(&format!("/dashboard?pow_token={}", TOKEN));
        let (verdict, session) = pipeline.decide(&request, Session::default()).await;

        assert_eq!(verdict, Verdict::Allow);
        assert_eq!(session, Session::default());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_solved_token_in_header_short_circuits() {
        let mut mocks = Mocks::new();
        mocks.tokens.expect_is_solved().times(1).returning(|_| Ok(true));
        mocks.counter.expect_increment().never();
        mocks.blacklist.expect_contains().never();
        mocks.scanner.expect_scan().never();
        mocks.rate_limiter.expect_consume().never();
        let (pipeline, _rx) = mocks.pipeline(config());

        let request = get("/api/orders").with_header("pow-token", TOKEN);
        let (verdict, _) = pipeline.decide(&request, Session::default()).await;

        assert_eq!(verdict, Verdict::Allow);
    }

    #[tokio::test]
    async fn test_header_token_checked_when_query_token_unsolved() {
        const OTHER: &str = "aaaaaaaa-bbbb-cccc-dddd-eeeeeeeeeeee";
        let mut mocks = Mocks::new();
        mocks
            .tokens
            .expect_is_solved()
            .withf(|token| token == OTHER)
            .times(1)
            .returning(|_| Ok(false));
        mocks
            .tokens
            .expect_is_solved()
            .withf(|token| token == TOKEN)
            .times(1)
            .returning(|_| Ok(true));
        mocks.blacklist.expect_contains().never();
        let (pipeline, _rx) = mocks.pipeline(config());

        let request = get(&format!("/x?pow_token={}", OTHER)).with_header("PoW-Token", TOKEN);
        let (verdict, _) = pipeline.decide(&request, Session::default()).await;

        assert_eq!(verdict, Verdict::Allow);
    }

    #[tokio::test]
    async fn test_malformed_token_falls_through_to_blacklist_once() {
        let mut mocks = Mocks::new();
        mocks.tokens.expect_is_solved().never();
        mocks.counter.expect_increment().times(1).returning(|_| Ok(()));
        mocks
            .blacklist
            .expect_contains()
            .with(eq(ip()))
            .times(1)
            .returning(|_| Ok(false));
        mocks.scanner.expect_scan().returning(|_| Ok(None));
        let (pipeline, _rx) = mocks.pipeline(config());

        let request = get("/?pow_token=not-a-uuid").with_header("PoW-Token", "12345");
        let (verdict, _) = pipeline.decide(&request, Session::default()).await;

        assert_eq!(
            verdict,
            Verdict::ChallengeRedirect {
                location: "/pow".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_blacklisted_ip_is_banned_without_scanning() {
        let mut mocks = Mocks::new();
        mocks.counter.expect_increment().returning(|_| Ok(()));
        mocks.blacklist.expect_contains().times(1).returning(|_| Ok(true));
        mocks.scanner.expect_scan().never();
        mocks.rate_limiter.expect_consume().never();
        let (pipeline, mut rx) = mocks.pipeline(config());

        let request = get("/account?tab=1").with_header("User-Agent", "Mozilla/5.0");
        let (verdict, session) = pipeline.decide(&request, Session::authorized()).await;

        assert_eq!(verdict, Verdict::BlockedBanned);
        assert!(session.authorized);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            AuditEvent::Blocked(b) => {
                assert_eq!(b.reason, "IP blacklisted");
                assert_eq!(b.ip, ip());
                assert_eq!(b.request_url, "/account?tab=1");
                assert_eq!(b.user_agent, "Mozilla/5.0");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_scan_match_blocks_and_audits_once() {
        let mut mocks = Mocks::new();
        mocks.counter.expect_increment().returning(|_| Ok(()));
        mocks.blacklist.expect_contains().returning(|_| Ok(false));
        mocks
            .scanner
            .expect_scan()
            .times(1)
            .returning(|_| Ok(Some(waf_hit())));
        mocks.rate_limiter.expect_consume().never();
        let (pipeline, mut rx) = mocks.pipeline(config());

        let (verdict, _) = pipeline
            .decide(&get("/items?id=1+union+select"), Session::authorized())
            .await;

        assert_eq!(verdict, Verdict::BlockedWaf(waf_hit()));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        match &events[0] {
            AuditEvent::Blocked(b) => {
                assert!(b.reason.contains("942100"));
                assert_eq!(b.user_agent, "Unknown");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_root_redirects_without_redirect_param() {
        let (pipeline, _rx) = Mocks::clean().pipeline(config());

        let (verdict, _) = pipeline.decide(&get("/"), Session::default()).await;
        assert_eq!(
            verdict,
            Verdict::ChallengeRedirect {
                location: "/pow".to_string()
            }
        );

        let (verdict, _) = pipeline.decide(&get("/?utm=mail"), Session::default()).await;
        assert_eq!(verdict.as_str(), "challenge");
    }

    #[tokio::test]
    async fn test_deep_path_redirects_with_original_target() {
        let (pipeline, _rx) = Mocks::clean().pipeline(config());

        let (verdict, _) = pipeline.decide(&get("/dashboard"), Session::default()).await;
        match verdict {
            Verdict::ChallengeRedirect { location } => {
                assert!(location.starts_with("/pow?"));
                assert_eq!(redirect_param(&location).as_deref(), Some("/dashboard"));
            }
            other => panic!("expected challenge, got {:?}", other),
        }

        let (verdict, _) = pipeline
            .decide(&get("/reports?year=2024&q=a b"), Session::default())
            .await;
        match verdict {
            Verdict::ChallengeRedirect { location } => {
                assert_eq!(
                    redirect_param(&location).as_deref(),
                    Some("/reports?year=2024&q=a b")
                );
            }
            other => panic!("expected challenge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_challenge_paths_are_never_redirected() {
        let mut mocks = Mocks::clean();
        mocks.rate_limiter = MockRateLimiter::new();
        mocks.rate_limiter.expect_consume().never();
        let (pipeline, _rx) = mocks.pipeline(config());

        for path in ["/pow", "/pow/verify", "/pow?redirect=%2Fdashboard"] {
            let (verdict, session) = pipeline.decide(&get(path), Session::default()).await;
            assert_eq!(verdict, Verdict::Allow, "path {}", path);
            assert!(session.rate_limit.is_none());
        }

        let (verdict, _) = pipeline.decide(&get("/powder"), Session::default()).await;
        assert_eq!(verdict.as_str(), "challenge");
    }

    #[tokio::test]
    async fn test_authorized_session_is_never_challenged() {
        for pow in [true, false] {
            let (pipeline, _rx) = Mocks::clean().pipeline(GateConfig {
                pow,
                ..config()
            });

            for path in ["/", "/dashboard", "/pow/verify"] {
                let (verdict, session) = pipeline.decide(&get(path), Session::authorized()).await;
                assert_eq!(verdict, Verdict::Allow);
                assert!(session.authorized);
            }
        }
    }

    #[tokio::test]
    async fn test_pow_disabled_allows_and_rate_limits() {
        let mut mocks = Mocks::clean();
        mocks.rate_limiter = MockRateLimiter::new();
        mocks
            .rate_limiter
            .expect_consume()
            .withf(|client, session| *client == ip() && !session.authorized)
            .times(1)
            .returning(|_, _| Ok(delta(7, false)));
        let (pipeline, _rx) = mocks.pipeline(GateConfig {
            pow: false,
            ..config()
        });

        let (verdict, session) = pipeline.decide(&get("/dashboard"), Session::default()).await;

        assert_eq!(verdict, Verdict::Allow);
        assert!(!session.authorized);
        assert_eq!(session.rate_limit.unwrap().count, 7);
    }

    #[tokio::test]
    async fn test_rate_limit_disabled_skips_limiter() {
        let mut mocks = Mocks::clean();
        mocks.rate_limiter = MockRateLimiter::new();
        mocks.rate_limiter.expect_consume().never();
        let (pipeline, _rx) = mocks.pipeline(GateConfig {
            rate_limit: false,
            ..config()
        });

        let (verdict, session) = pipeline.decide(&get("/a"), Session::authorized()).await;
        assert_eq!(verdict, Verdict::Allow);
        assert_eq!(session, Session::authorized());
    }

    #[tokio::test]
    async fn test_quota_exceeded_is_a_session_update() {
        let mut mocks = Mocks::clean();
        mocks.rate_limiter = MockRateLimiter::new();
        mocks
            .rate_limiter
            .expect_consume()
            .returning(|_, _| Ok(delta(101, true)));
        let (pipeline, _rx) = mocks.pipeline(config());

        let (verdict, session) = pipeline.decide(&get("/a"), Session::authorized()).await;

        assert_eq!(verdict, Verdict::Allow);
        assert!(session.authorized);
        assert!(session.is_rate_limited());
        assert_eq!(session.rate_limit.unwrap().retry_after_secs, Some(30));
    }

    #[tokio::test]
    async fn test_collaborator_error_is_blocked_error_with_session_unchanged() {
        let mut mocks = Mocks::new();
        mocks.counter.expect_increment().returning(|_| Ok(()));
        mocks
            .blacklist
            .expect_contains()
            .returning(|_| Err(ShieldError::Internal("connection reset".to_string())));
        mocks.scanner.expect_scan().never();
        let (pipeline, mut rx) = mocks.pipeline(config());

        let before = Session::authorized().with_rate_limit(delta(3, false));
        let (verdict, after) = pipeline.decide(&get("/a"), before.clone()).await;

        assert_eq!(verdict, Verdict::BlockedError);
        assert!(verdict.is_blocked());
        assert_eq!(after, before);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_token_store_error_is_blocked_error() {
        let mut mocks = Mocks::new();
        mocks
            .tokens
            .expect_is_solved()
            .returning(|_| Err(ShieldError::Internal("store down".to_string())));
        mocks.blacklist.expect_contains().never();
        let (pipeline, _rx) = mocks.pipeline(config());

        let request = get("/").with_header("PoW-Token", TOKEN);
        let (verdict, _) = pipeline.decide(&request, Session::default()).await;

        assert_eq!(verdict, Verdict::BlockedError);
    }

    #[tokio::test]
    async fn test_counter_failure_does_not_change_verdict() {
        let mut mocks = Mocks::clean();
        mocks.counter = MockRequestCounter::new();
        mocks
            .counter
            .expect_increment()
            .times(1)
            .returning(|_| Err(ShieldError::Internal("counter unavailable".to_string())));
        let (pipeline, _rx) = mocks.pipeline(config());

        let (verdict, _) = pipeline.decide(&get("/dashboard"), Session::authorized()).await;
        assert_eq!(verdict, Verdict::Allow);
    }

    struct SlowScanner;

    #[async_trait::async_trait]
    impl AttackScanner for SlowScanner {
        async fn scan(&self, _request: &ClientRequest) -> ShieldResult<Option<ScanMatch>> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_slow_collaborator_times_out() {
        let mocks = Mocks::clean();
        let (audit, _rx) = AuditHandle::channel(4);
        let collaborators = Collaborators {
            tokens: Arc::new(mocks.tokens),
            blacklist: Arc::new(mocks.blacklist),
            scanner: Arc::new(SlowScanner),
            rate_limiter: Arc::new(mocks.rate_limiter),
            counter: Arc::new(mocks.counter),
            audit,
        };
        let pipeline = GatingPipeline::new(
            collaborators,
            GateConfig {
                lookup_timeout_ms: 20,
                ..config()
            },
        );

        let started = Instant::now();
        let (verdict, _) = pipeline.decide(&get("/a"), Session::authorized()).await;

        assert_eq!(verdict, Verdict::BlockedError);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_same_inputs_same_verdict() {
        let (pipeline, _rx) = Mocks::clean().pipeline(config());
        let request = get("/dashboard?x=1");

        let (first, _) = pipeline.decide(&request, Session::default()).await;
        let (second, _) = pipeline.decide(&request, Session::default()).await;

        assert_eq!(first, second);
    }

    #[test]
    fn test_is_under() {
        assert!(is_under("/pow", "/pow"));
        assert!(is_under("/pow/", "/pow"));
        assert!(is_under("/pow/verify", "/pow/"));
        assert!(!is_under("/powder", "/pow"));
        assert!(!is_under("/", "/pow"));
        assert!(!is_under("/api/pow", "/pow"));
    }
}
