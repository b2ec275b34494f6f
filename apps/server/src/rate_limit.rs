//! Per-client request budgets for each route group.
//!
//! A tier counts the requests of one client address over a sliding window.
//! Payment returns have a tier of their own, so the budget spent starting
//! payments never turns a paying customer away on the way back.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::ApiResponse;

/// Route groups with separate budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Session issue and the catalog.
    Public,
    /// Login, registration and email verification.
    Auth,
    /// Flow steps, slot reads and the dashboard.
    Booking,
    /// Submissions, each of which opens a gateway transaction.
    Payment,
    /// Browser returns from Paystack or Stripe.
    Callback,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::Public,
        Tier::Auth,
        Tier::Booking,
        Tier::Payment,
        Tier::Callback,
    ];

    pub fn default_budget(self) -> Budget {
        match self {
            Tier::Public => Budget::per(120, Duration::from_secs(60)),
            Tier::Auth => Budget::per(10, Duration::from_secs(60)),
            Tier::Booking => Budget::per(60, Duration::from_secs(60)),
            Tier::Payment => Budget::per(5, Duration::from_secs(300)),
            // Refreshes and back-button returns repeat the same callback.
            Tier::Callback => Budget::per(30, Duration::from_secs(300)),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Public => "public",
            Tier::Auth => "auth",
            Tier::Booking => "booking",
            Tier::Payment => "payment",
            Tier::Callback => "callback",
        })
    }
}

/// `requests` per client within any `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub requests: u32,
    pub window: Duration,
}

impl Budget {
    pub const fn per(requests: u32, window: Duration) -> Self {
        Self { requests, window }
    }
}

#[derive(Debug)]
struct TierState {
    budget: Budget,
    clients: DashMap<IpAddr, VecDeque<Instant>>,
}

#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    tiers: Arc<DashMap<Tier, TierState>>,
}

impl RateLimiter {
    /// A limiter with no budgets; every tier is open until one is set.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let limiter = Self::new();
        for tier in Tier::ALL {
            limiter.set_budget(tier, tier.default_budget());
        }
        limiter
    }

    /// Replace the budget of `tier`, forgetting what clients spent so far.
    pub fn set_budget(&self, tier: Tier, budget: Budget) {
        self.tiers.insert(
            tier,
            TierState {
                budget,
                clients: DashMap::new(),
            },
        );
    }

    /// Spend one request of `client` on `tier`. When the budget is used up,
    /// returns the seconds until the oldest counted request leaves the window.
    pub fn admit(&self, tier: Tier, client: IpAddr) -> Result<(), u64> {
        let Some(state) = self.tiers.get(&tier) else {
            return Ok(());
        };
        let Budget { requests, window } = state.budget;
        let now = Instant::now();
        let mut seen = state.clients.entry(client).or_default();

        while seen
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) >= window)
        {
            seen.pop_front();
        }

        if seen.len() >= requests as usize {
            let retry_after = seen
                .front()
                .map(|oldest| (*oldest + window).saturating_duration_since(now).as_secs())
                .unwrap_or(0);
            return Err(retry_after.max(1));
        }
        seen.push_back(now);
        Ok(())
    }

    /// Drop clients with nothing left inside twice their tier's window.
    pub fn forget_idle(&self) {
        let now = Instant::now();
        for state in self.tiers.iter() {
            let horizon = state.budget.window * 2;
            state.clients.retain(|_, seen| {
                seen.retain(|t| now.saturating_duration_since(*t) < horizon);
                !seen.is_empty()
            });
        }
    }
}

/// The first `X-Forwarded-For` hop when behind a proxy, else the peer.
pub fn client_ip(req: &Request) -> IpAddr {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|hop| hop.trim().parse().ok())
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip())
        })
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn over_budget(retry_after: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.to_string())],
        Json(ApiResponse::<()>::error(format!(
            "Too many requests. Try again in {retry_after} seconds"
        ))),
    )
        .into_response()
}

/// Middleware charging each request to the tier it is layered with.
pub async fn enforce(
    State((limiter, tier)): State<(RateLimiter, Tier)>,
    req: Request,
    next: Next,
) -> Response {
    let client = client_ip(&req);
    match limiter.admit(tier, client) {
        Ok(()) => next.run(req).await,
        Err(retry_after) => {
            tracing::warn!("{} over the {} budget, retry in {}s", client, tier, retry_after);
            over_budget(retry_after)
        }
    }
}
