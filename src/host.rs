//! A single lease: a virtual host name bound to a local port until it expires

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::time::Duration;

/// Characters allowed in explicitly chosen host names (`[-_.a-z0-9]`, any case)
pub fn is_valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

/// Check a caller-supplied host name
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(is_valid_name_char)
}

/// A leased host.
///
/// Identity (`name`, `port`, `create_time`, `timeout`) is fixed at construction.
/// Only the expiry moves, and only forward, under a per-host lock so renewals
/// never contend on the registry.
#[derive(Debug)]
pub struct Host {
    name: String,
    port: u16,
    create_time: DateTime<Utc>,
    timeout: TimeDelta,
    expiry: Mutex<DateTime<Utc>>,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self::created_at(name, port, timeout, Utc::now())
    }

    /// Create a host as if it had been created at `now`
    pub fn created_at(name: impl Into<String>, port: u16, timeout: Duration, now: DateTime<Utc>) -> Self {
        let timeout = TimeDelta::from_std(timeout).unwrap_or_else(|_| TimeDelta::days(365));
        Self {
            name: name.into(),
            port,
            create_time: now,
            timeout,
            expiry: Mutex::new(now + timeout),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    pub fn timeout(&self) -> TimeDelta {
        self.timeout
    }

    pub fn expiry(&self) -> DateTime<Utc> {
        *self.expiry.lock()
    }

    pub fn is_expired(&self) -> bool {
        let expiry = self.expiry.lock();
        Utc::now() > *expiry
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > *self.expiry.lock()
    }

    /// Renew the lease. Returns false, leaving the expiry alone, once it has lapsed.
    ///
    /// The clock is read while holding the expiry lock, so a renewal that waits
    /// behind a concurrent expiry check cannot succeed with an earlier time.
    pub fn keep_alive(&self) -> bool {
        let mut expiry = self.expiry.lock();
        renew(&mut expiry, Utc::now(), self.timeout)
    }

    pub fn keep_alive_at(&self, now: DateTime<Utc>) -> bool {
        let mut expiry = self.expiry.lock();
        renew(&mut expiry, now, self.timeout)
    }
}

fn renew(expiry: &mut DateTime<Utc>, now: DateTime<Utc>, timeout: TimeDelta) -> bool {
    if now > *expiry {
        return false;
    }
    let renewed = now + timeout;
    if renewed > *expiry {
        *expiry = renewed;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_new_host_expiry() {
        let host = Host::created_at("api", 20001, Duration::from_secs(60), ts(0));

        assert_eq!(host.name(), "api");
        assert_eq!(host.port(), 20001);
        assert_eq!(host.create_time(), ts(0));
        assert_eq!(host.timeout(), TimeDelta::seconds(60));
        assert_eq!(host.expiry(), ts(60));
    }

    #[test]
    fn test_expired_only_after_expiry() {
        let host = Host::created_at("api", 20001, Duration::from_secs(60), ts(0));

        assert!(!host.is_expired_at(ts(30)));
        assert!(!host.is_expired_at(ts(60)));
        assert!(host.is_expired_at(ts(61)));
    }

    #[test]
    fn test_keep_alive_before_expiry_extends() {
        let host = Host::created_at("api", 20001, Duration::from_secs(60), ts(0));

        assert!(host.keep_alive_at(ts(45)));
        assert_eq!(host.expiry(), ts(105));
        assert!(!host.is_expired_at(ts(100)));
    }

    #[test]
    fn test_keep_alive_after_expiry_fails() {
        let host = Host::created_at("api", 20001, Duration::from_secs(60), ts(0));

        assert!(!host.keep_alive_at(ts(61)));
        assert_eq!(host.expiry(), ts(60));
        assert!(host.is_expired_at(ts(61)));
    }

    #[test]
    fn test_expiry_never_moves_backwards() {
        let host = Host::created_at("api", 20001, Duration::from_secs(60), ts(0));

        assert!(host.keep_alive_at(ts(50)));
        assert_eq!(host.expiry(), ts(110));

        // A renewal stamped earlier than the last one keeps the later expiry
        assert!(host.keep_alive_at(ts(20)));
        assert_eq!(host.expiry(), ts(110));
    }

    #[test]
    fn test_keep_alive_with_real_clock() {
        let host = Host::new("api", 20001, Duration::from_secs(60));
        let before = host.expiry();

        assert!(!host.is_expired());
        assert!(host.keep_alive());
        assert!(host.expiry() >= before);
    }

    #[test]
    fn test_keep_alive_waiting_on_lock_uses_current_time() {
        let host = Arc::new(Host::new("api", 20001, Duration::from_millis(200)));

        // Hold the expiry lock past the deadline while a renewal is queued
        let guard = host.expiry.lock();
        let renewal = {
            let host = Arc::clone(&host);
            std::thread::spawn(move || host.keep_alive())
        };
        std::thread::sleep(Duration::from_millis(400));
        drop(guard);

        assert!(!renewal.join().unwrap());
        assert!(host.is_expired());
    }

    #[test]
    fn test_concurrent_keep_alive() {
        let host = Arc::new(Host::new("api", 20001, Duration::from_secs(60)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let host = Arc::clone(&host);
                std::thread::spawn(move || (0..100).all(|_| host.keep_alive()))
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert!(!host.is_expired());
    }

    #[test]
    fn test_name_validation() {
        assert!(is_valid_name("api"));
        assert!(is_valid_name("my-host_1.dev"));
        assert!(is_valid_name("MyHost"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("my host"));
        assert!(!is_valid_name("host/1"));
        assert!(!is_valid_name("hôst"));
    }
}
