// src/network/rate_limiter.rs
// Per-peer request throttling with two rolling windows and a blacklist.
//
// `basic` rejects peers that send more than a steady-state budget; `spam`
// catches sustained hammering and blacklists the peer for a while. Requests
// continuing an exchange the peer already has open are never throttled.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use super::ranking::PeerId;

/// One rolling window: at most `max_requests` attempts per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowPolicy {
    pub window: Duration,
    pub max_requests: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardConfig {
    pub basic: WindowPolicy,
    pub spam: WindowPolicy,
    pub blacklist_window: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            basic: WindowPolicy {
                window: Duration::from_secs(60),
                max_requests: 20,
            },
            spam: WindowPolicy {
                window: Duration::from_secs(60),
                max_requests: 150,
            },
            blacklist_window: Duration::from_secs(60 * 60),
        }
    }
}

/// Outcome of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Continues an open exchange; counters were not touched
    InFlight,
    Blacklisted { remaining: Duration },
    /// Tripped the spam window; the peer is now blacklisted
    Spam,
    RateLimited,
}

impl Admission {
    pub fn is_rejected(&self) -> bool {
        !matches!(self, Admission::Admitted | Admission::InFlight)
    }
}

/// Rolling window of attempt timestamps per peer
#[derive(Debug)]
struct SlidingWindow {
    policy: WindowPolicy,
    hits: HashMap<PeerId, VecDeque<Instant>>,
}

impl SlidingWindow {
    fn new(policy: WindowPolicy) -> Self {
        Self {
            policy,
            hits: HashMap::new(),
        }
    }

    /// Record an attempt at `now`; true when the window is over budget.
    fn limit(&mut self, peer: &PeerId, now: Instant) -> bool {
        let window = self.policy.window;
        let hits = self.hits.entry(peer.clone()).or_default();
        while let Some(first) = hits.front() {
            if now.saturating_duration_since(*first) >= window {
                hits.pop_front();
            } else {
                break;
            }
        }
        hits.push_back(now);
        hits.len() > self.policy.max_requests
    }

    fn prune(&mut self, now: Instant) {
        let window = self.policy.window;
        self.hits.retain(|_, hits| {
            hits.retain(|t| now.saturating_duration_since(*t) < window);
            !hits.is_empty()
        });
    }
}

#[derive(Debug)]
pub struct AbuseGuard {
    basic: SlidingWindow,
    spam: SlidingWindow,
    blacklist: HashMap<PeerId, Instant>,
    blacklist_window: Duration,
}

impl AbuseGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            basic: SlidingWindow::new(config.basic),
            spam: SlidingWindow::new(config.spam),
            blacklist: HashMap::new(),
            blacklist_window: config.blacklist_window,
        }
    }

    pub fn admit(&mut self, peer: &PeerId, in_flight: bool, now: Instant) -> Admission {
        if in_flight {
            return Admission::InFlight;
        }

        if let Some(remaining) = self.blacklist_remaining(peer, now) {
            tracing::debug!(
                peer = %peer,
                "Blocking request from {}. Node is blacklisted for {} minutes.",
                peer,
                remaining.as_secs() / 60
            );
            return Admission::Blacklisted { remaining };
        }

        if self.spam.limit(peer, now) {
            self.blacklist.insert(peer.clone(), now);
            tracing::debug!(
                peer = %peer,
                "Blocking request from {}. Spammer detected and blacklisted for {} minutes.",
                peer,
                self.blacklist_window.as_secs() / 60
            );
            return Admission::Spam;
        }

        if self.basic.limit(peer, now) {
            tracing::debug!(peer = %peer, "Blocking request from {}. Max number of requests exceeded.", peer);
            return Admission::RateLimited;
        }

        Admission::Admitted
    }

    /// Time left on the peer's blacklist entry; expired entries are dropped here.
    pub fn blacklist_remaining(&mut self, peer: &PeerId, now: Instant) -> Option<Duration> {
        let since = *self.blacklist.get(peer)?;
        let elapsed = now.saturating_duration_since(since);
        if elapsed < self.blacklist_window {
            Some(self.blacklist_window - elapsed)
        } else {
            self.blacklist.remove(peer);
            None
        }
    }

    pub fn is_blacklisted(&mut self, peer: &PeerId, now: Instant) -> bool {
        self.blacklist_remaining(peer, now).is_some()
    }

    pub fn blacklisted_count(&self) -> usize {
        self.blacklist.len()
    }

    /// Drop empty windows and expired blacklist entries
    pub fn prune(&mut self, now: Instant) {
        self.basic.prune(now);
        self.spam.prune(now);
        let window = self.blacklist_window;
        self.blacklist
            .retain(|_, since| now.saturating_duration_since(*since) < window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(basic: usize, spam: usize) -> GuardConfig {
        GuardConfig {
            basic: WindowPolicy {
                window: Duration::from_secs(60),
                max_requests: basic,
            },
            spam: WindowPolicy {
                window: Duration::from_secs(60),
                max_requests: spam,
            },
            blacklist_window: Duration::from_secs(600),
        }
    }

    #[test]
    fn basic_limit_rejects_without_blacklisting() {
        let mut guard = AbuseGuard::new(config(3, 100));
        let peer = PeerId::random();
        let now = Instant::now();

        for _ in 0..3 {
            assert_eq!(guard.admit(&peer, false, now), Admission::Admitted);
        }
        assert_eq!(guard.admit(&peer, false, now), Admission::RateLimited);
        assert!(!guard.is_blacklisted(&peer, now));

        // window slides
        let later = now + Duration::from_secs(61);
        assert_eq!(guard.admit(&peer, false, later), Admission::Admitted);
    }

    #[test]
    fn spam_blacklists_and_short_circuits() {
        let mut guard = AbuseGuard::new(config(2, 5));
        let peer = PeerId::random();
        let now = Instant::now();

        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(guard.admit(&peer, false, now));
        }
        assert_eq!(outcomes[0], Admission::Admitted);
        assert_eq!(outcomes[1], Admission::Admitted);
        assert_eq!(outcomes[2], Admission::RateLimited);
        assert_eq!(outcomes[5], Admission::Spam);
        assert!(guard.is_blacklisted(&peer, now));

        // while blacklisted the counters are not consulted, even after they slid out
        let later = now + Duration::from_secs(120);
        assert!(matches!(
            guard.admit(&peer, false, later),
            Admission::Blacklisted { .. }
        ));

        // blacklist expires lazily
        let after = now + Duration::from_secs(601);
        assert_eq!(guard.admit(&peer, false, after), Admission::Admitted);
        assert_eq!(guard.blacklisted_count(), 0);
    }

    #[test]
    fn in_flight_requests_are_never_limited() {
        let mut guard = AbuseGuard::new(config(1, 2));
        let peer = PeerId::random();
        let now = Instant::now();
        for _ in 0..1000 {
            assert_eq!(guard.admit(&peer, true, now), Admission::InFlight);
        }
        // counters were untouched
        assert_eq!(guard.admit(&peer, false, now), Admission::Admitted);
    }

    #[test]
    fn peers_are_limited_independently() {
        let mut guard = AbuseGuard::new(config(1, 10));
        let a = PeerId::random();
        let b = PeerId::random();
        let now = Instant::now();
        assert_eq!(guard.admit(&a, false, now), Admission::Admitted);
        assert_eq!(guard.admit(&a, false, now), Admission::RateLimited);
        assert_eq!(guard.admit(&b, false, now), Admission::Admitted);
    }

    #[test]
    fn prune_forgets_idle_peers() {
        let mut guard = AbuseGuard::new(config(1, 1));
        let peer = PeerId::random();
        let now = Instant::now();
        guard.admit(&peer, false, now);
        guard.admit(&peer, false, now);
        assert_eq!(guard.blacklisted_count(), 1);

        guard.prune(now + Duration::from_secs(3600));
        assert_eq!(guard.blacklisted_count(), 0);
        assert!(guard.basic.hits.is_empty());
        assert!(guard.spam.hits.is_empty());
    }
}
