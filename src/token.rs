//! Bearer token lifecycle under a fixed refresh and session budget.
//!
//! ```text
//! Unauthenticated --authenticate--> Active(0) --refresh--> Active(1) ... Active(max)
//! Active(n) --ceiling reached, or expired with n == max--> Expired
//! ```
//!
//! `Expired` is terminal for the process: nothing re-authenticates once the
//! session ceiling or the refresh cap has been reached.
use crate::credentials::Credential;
use crate::error::{DemError, Result};
use crate::remote::{Grant, IdentityService};
use crate::retry::{with_retry, RetryConfig};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct TokenPolicy {
    /// Lifetime granted by authentication and by each refresh
    pub validity_window: Duration,
    pub max_refresh: u32,
    /// Hard stop measured from the first authentication
    pub session_ceiling: Duration,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            validity_window: Duration::from_secs(600),
            max_refresh: 5,
            session_ceiling: Duration::from_secs(3600),
        }
    }
}

pub trait Clock {
    fn now(&self) -> Instant;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[derive(Clone)]
pub struct Token {
    bearer: String,
    refresh_handle: Option<String>,
    pub issued_at: Instant,
    pub expires_at: Instant,
    pub refresh_count: u32,
}

impl Token {
    pub fn bearer(&self) -> &str {
        &self.bearer
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("refresh_count", &self.refresh_count)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum TokenState {
    Unauthenticated,
    Active { token: Token, session_start: Instant },
    Expired { refreshes: u32, elapsed: Duration },
}

/// What has to happen before a request can be made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Authenticate,
    Use,
    Refresh,
    Exhaust,
}

impl TokenState {
    pub fn next_step(&self, now: Instant, policy: &TokenPolicy) -> Step {
        match self {
            Self::Unauthenticated => Step::Authenticate,
            Self::Expired { .. } => Step::Exhaust,
            Self::Active {
                token,
                session_start,
            } => {
                if now.saturating_duration_since(*session_start) >= policy.session_ceiling {
                    Step::Exhaust
                } else if now < token.expires_at {
                    Step::Use
                } else if token.refresh_count >= policy.max_refresh {
                    Step::Exhaust
                } else {
                    Step::Refresh
                }
            }
        }
    }

    /// `Unauthenticated -> Active(0)`
    pub fn activated(grant: Grant, now: Instant, policy: &TokenPolicy) -> Self {
        let expires_at = capped_expiry(now, &grant, now, policy);
        Self::Active {
            token: Token {
                bearer: grant.access_token,
                refresh_handle: grant.refresh_token,
                issued_at: now,
                expires_at,
                refresh_count: 0,
            },
            session_start: now,
        }
    }

    /// `Active(n) -> Active(n + 1)`. Other states are returned unchanged.
    pub fn refreshed(self, grant: Grant, now: Instant, policy: &TokenPolicy) -> Self {
        match self {
            Self::Active {
                token,
                session_start,
            } => {
                let base = now.max(token.expires_at);
                let expires_at = capped_expiry(base, &grant, session_start, policy);
                Self::Active {
                    token: Token {
                        bearer: grant.access_token,
                        refresh_handle: grant.refresh_token.or(token.refresh_handle),
                        issued_at: now,
                        expires_at,
                        refresh_count: token.refresh_count + 1,
                    },
                    session_start,
                }
            }
            other => other,
        }
    }

    /// Any state -> `Expired`
    pub fn exhausted(&self, now: Instant) -> Self {
        match self {
            Self::Active {
                token,
                session_start,
            } => Self::Expired {
                refreshes: token.refresh_count,
                elapsed: now.saturating_duration_since(*session_start),
            },
            Self::Expired { refreshes, elapsed } => Self::Expired {
                refreshes: *refreshes,
                elapsed: *elapsed,
            },
            Self::Unauthenticated => Self::Expired {
                refreshes: 0,
                elapsed: Duration::ZERO,
            },
        }
    }

    pub fn token(&self) -> Option<&Token> {
        match self {
            Self::Active { token, .. } => Some(token),
            _ => None,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }

    fn budget_error(&self) -> DemError {
        match self {
            Self::Expired { refreshes, elapsed } => DemError::TokenBudgetExhausted {
                refreshes: *refreshes,
                elapsed: *elapsed,
            },
            _ => DemError::TokenBudgetExhausted {
                refreshes: 0,
                elapsed: Duration::ZERO,
            },
        }
    }
}

/// `base` plus the granted lifetime (never more than the policy window),
/// bounded by the session ceiling.
fn capped_expiry(base: Instant, grant: &Grant, session_start: Instant, policy: &TokenPolicy) -> Instant {
    let lifetime = if grant.expires_in.is_zero() {
        policy.validity_window
    } else {
        grant.expires_in.min(policy.validity_window)
    };
    (base + lifetime).min(session_start + policy.session_ceiling)
}

/// Owns the token state and talks to the identity service on its behalf.
pub struct TokenManager<S, C = SystemClock> {
    service: S,
    clock: C,
    policy: TokenPolicy,
    retry: RetryConfig,
    state: TokenState,
}

impl<S: IdentityService> TokenManager<S, SystemClock> {
    pub fn new(service: S, policy: TokenPolicy, retry: RetryConfig) -> Self {
        Self::with_clock(service, SystemClock, policy, retry)
    }
}

impl<S: IdentityService, C: Clock> TokenManager<S, C> {
    pub fn with_clock(service: S, clock: C, policy: TokenPolicy, retry: RetryConfig) -> Self {
        Self {
            service,
            clock,
            policy,
            retry,
            state: TokenState::Unauthenticated,
        }
    }

    pub fn state(&self) -> &TokenState {
        &self.state
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Obtains the first token of the session.
    pub async fn authenticate(&mut self, credential: &Credential) -> Result<()> {
        match &self.state {
            TokenState::Expired { .. } => return Err(self.state.budget_error()),
            TokenState::Active { .. } => {
                warn!("Already authenticated, keeping the current token");
                return Ok(());
            }
            TokenState::Unauthenticated => {}
        }

        let service = &self.service;
        let grant = with_retry(&self.retry, "Authentication", move || {
            service.request_token(&credential.identity, credential.secret())
        })
        .await?;

        self.state = TokenState::activated(grant, self.clock.now(), &self.policy);
        info!(
            "Access token granted for {:?}",
            self.state
                .token()
                .map(|t| t.expires_at.saturating_duration_since(t.issued_at))
                .unwrap_or_default()
        );
        Ok(())
    }

    /// Returns a bearer value that is valid now, refreshing if needed.
    pub async fn ensure_valid(&mut self) -> Result<String> {
        let now = self.clock.now();
        match self.state.next_step(now, &self.policy) {
            Step::Authenticate => Err(DemError::NotAuthenticated),
            Step::Use => {
                let token = self.state.token().ok_or(DemError::NotAuthenticated)?;
                Ok(token.bearer.clone())
            }
            Step::Exhaust => {
                if !self.state.is_expired() {
                    self.state = self.state.exhausted(now);
                    warn!("Token budget is exhausted, no further requests will be made");
                }
                Err(self.state.budget_error())
            }
            Step::Refresh => {
                let handle = {
                    let token = self.state.token().ok_or(DemError::NotAuthenticated)?;
                    token
                        .refresh_handle
                        .clone()
                        .unwrap_or_else(|| token.bearer.clone())
                };

                let service = &self.service;
                let handle = handle.as_str();
                let grant = with_retry(&self.retry, "Token refresh", move || {
                    service.refresh_token(handle)
                })
                .await?;

                let now = self.clock.now();
                let state = std::mem::replace(&mut self.state, TokenState::Unauthenticated);
                self.state = state.refreshed(grant, now, &self.policy);

                let token = self.state.token().ok_or(DemError::NotAuthenticated)?;
                info!(
                    "Token refreshed ({}/{})",
                    token.refresh_count, self.policy.max_refresh
                );
                Ok(token.bearer.clone())
            }
        }
    }
}

/// Hand-driven clock for deterministic tests.
#[cfg(test)]
#[derive(Debug, Clone)]
pub(crate) struct ManualClock {
    origin: Instant,
    offset: std::sync::Arc<std::sync::Mutex<Duration>>,
}

#[cfg(test)]
impl ManualClock {
    pub(crate) fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Default::default(),
        }
    }

    pub(crate) fn advance(&self, by: Duration) {
        *self.offset.lock().unwrap() += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap()
    }
}
