//! Node session leases
//!
//! A node stays live while it keeps renewing its lease. A lease that runs
//! out, or is revoked by fault injection, is a failure signal.

use docio_common::SessionId;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug)]
pub struct Lease {
    session: SessionId,
    expires_at: Instant,
    revoked: bool,
}

impl Lease {
    /// Grant a new lease for `session`
    #[must_use]
    pub fn grant(session: SessionId, ttl: Duration) -> Self {
        Self {
            session,
            expires_at: Instant::now() + ttl,
            revoked: false,
        }
    }

    #[must_use]
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Extend the lease; a revoked lease cannot be renewed
    pub fn renew(&mut self, ttl: Duration) -> bool {
        if self.revoked {
            return false;
        }
        self.expires_at = Instant::now() + ttl;
        true
    }

    pub fn revoke(&mut self) {
        self.revoked = true;
    }

    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.revoked || now >= self.expires_at
    }

    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        if self.revoked {
            return Duration::ZERO;
        }
        self.expires_at.saturating_duration_since(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_expiry() {
        let mut lease = Lease::grant(SessionId::new(), Duration::from_millis(100));
        let now = Instant::now();
        assert!(!lease.is_expired(now));
        assert!(lease.is_expired(now + Duration::from_millis(150)));

        assert!(lease.renew(Duration::from_secs(10)));
        assert!(!lease.is_expired(now + Duration::from_millis(150)));
        assert!(lease.remaining(Instant::now()) > Duration::from_secs(9));
    }

    #[test]
    fn test_revoked_lease() {
        let mut lease = Lease::grant(SessionId::new(), Duration::from_secs(60));
        lease.revoke();
        assert!(lease.is_expired(Instant::now()));
        assert!(!lease.renew(Duration::from_secs(60)));
        assert_eq!(lease.remaining(Instant::now()), Duration::ZERO);
    }
}
