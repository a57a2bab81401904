//! Shared dedup ledger.
//!
//! One mutex-guarded store, three policies: exact-duplicate fingerprints
//! (ingress window + worker-side claim), per-(user, subtype) system-notice
//! windows, and a near-real-time guard absorbing the backend's
//! double-delivered new-message banners. Every operation takes an explicit
//! `now` so the windows are testable without sleeping.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::notices::NoticeKind;

/// Dedup identity for a chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(u64);

/// Derived key over the fields that make two events "the same question".
pub fn fingerprint(sender_id: &str, text: &str, item_id: &str) -> Fingerprint {
    let mut hasher = DefaultHasher::new();
    sender_id.hash(&mut hasher);
    text.hash(&mut hasher);
    item_id.hash(&mut hasher);
    Fingerprint(hasher.finish())
}

#[derive(Debug, Clone, Copy)]
pub struct DedupWindows {
    /// Exact-duplicate suppression at ingress.
    pub ingress: Duration,
    /// System-notice reply suppression per (user, subtype).
    pub notice: Duration,
    /// Extended suppression for shipping notices once one reply went out.
    pub shipping: Duration,
    /// Near-real-time guard on the new-message banner.
    pub burst_guard: Duration,
}

impl Default for DedupWindows {
    fn default() -> Self {
        Self {
            ingress: Duration::from_secs(30),
            notice: Duration::from_secs(60),
            shipping: Duration::from_secs(2 * 60 * 60),
            burst_guard: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct FingerprintRecord {
    last_seen: Instant,
    occurrences: u32,
    /// Set by the first worker that takes the event; later claims within the
    /// window lose. A fresh unclaimed ingress entry never suppresses its own
    /// worker, which is what the minimum-age guard exists to ensure.
    claimed_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct NoticeRecord {
    last_seen: Option<Instant>,
    last_replied: Option<Instant>,
    /// Shipping subtype only: a reply has been sent, extended window applies.
    replied_shipping: bool,
}

/// Why an event or notice was suppressed; logged, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppressed {
    DuplicateWithinWindow,
    AlreadyClaimed,
    NoticeWindow,
    ShippingWindow,
    BurstGuard,
}

pub struct DedupLedger {
    windows: DedupWindows,
    fingerprints: Mutex<HashMap<Fingerprint, FingerprintRecord>>,
    notices: Mutex<HashMap<(String, NoticeKind), NoticeRecord>>,
}

impl DedupLedger {
    pub fn new(windows: DedupWindows) -> Self {
        Self {
            windows,
            fingerprints: Mutex::new(HashMap::new()),
            notices: Mutex::new(HashMap::new()),
        }
    }

    /// Ingress check-and-record, atomic under the ledger lock: a sighting
    /// within the ingress window is a duplicate and must not be enqueued.
    pub fn observe(&self, fp: Fingerprint, now: Instant) -> Result<(), Suppressed> {
        let mut map = self.fingerprints.lock().unwrap_or_else(|e| e.into_inner());
        match map.get_mut(&fp) {
            Some(record)
                if now.duration_since(record.last_seen) < self.windows.ingress =>
            {
                record.occurrences += 1;
                Err(Suppressed::DuplicateWithinWindow)
            }
            Some(record) => {
                // Window elapsed: this sighting starts a fresh cycle.
                record.last_seen = now;
                record.occurrences = 1;
                record.claimed_at = None;
                Ok(())
            }
            None => {
                map.insert(
                    fp,
                    FingerprintRecord {
                        last_seen: now,
                        occurrences: 1,
                        claimed_at: None,
                    },
                );
                Ok(())
            }
        }
    }

    /// Worker-side claim. The first worker to claim a fingerprint within the
    /// window proceeds; any other worker holding a racing duplicate is told
    /// to drop it. Records unknown to the ledger (swept, or enqueued before
    /// a restart) are processed rather than lost.
    pub fn claim(&self, fp: Fingerprint, now: Instant) -> Result<(), Suppressed> {
        let mut map = self.fingerprints.lock().unwrap_or_else(|e| e.into_inner());
        let record = map.entry(fp).or_insert_with(|| FingerprintRecord {
            last_seen: now,
            occurrences: 1,
            claimed_at: None,
        });
        match record.claimed_at {
            Some(claimed) if now.duration_since(claimed) < self.windows.ingress => {
                Err(Suppressed::AlreadyClaimed)
            }
            _ => {
                record.claimed_at = Some(now);
                Ok(())
            }
        }
    }

    /// Notice suppression decision, checked at reply-selection time. The
    /// burst guard on the new-message banner runs before any window logic.
    pub fn notice_decision(
        &self,
        user_id: &str,
        kind: NoticeKind,
        now: Instant,
    ) -> Result<(), Suppressed> {
        let mut map = self.notices.lock().unwrap_or_else(|e| e.into_inner());
        let record = map
            .entry((user_id.to_string(), kind))
            .or_default();

        let previous_seen = record.last_seen.replace(now);

        if kind == NoticeKind::NewMessage {
            if let Some(seen) = previous_seen {
                if now.duration_since(seen) < self.windows.burst_guard {
                    return Err(Suppressed::BurstGuard);
                }
            }
        }

        if kind == NoticeKind::Shipping && record.replied_shipping {
            if let Some(replied) = record.last_replied {
                if now.duration_since(replied) < self.windows.shipping {
                    return Err(Suppressed::ShippingWindow);
                }
            }
        }

        if let Some(replied) = record.last_replied {
            if now.duration_since(replied) < self.windows.notice {
                return Err(Suppressed::NoticeWindow);
            }
        }

        Ok(())
    }

    /// Record that a notice reply went out; shipping subtypes flip to the
    /// extended window from here on.
    pub fn record_notice_reply(&self, user_id: &str, kind: NoticeKind, now: Instant) {
        let mut map = self.notices.lock().unwrap_or_else(|e| e.into_inner());
        let record = map
            .entry((user_id.to_string(), kind))
            .or_default();
        record.last_replied = Some(now);
        if kind == NoticeKind::Shipping {
            record.replied_shipping = true;
        }
    }

    /// Drop records old enough that no window can still suppress on them
    /// (3x their window). Called from a periodic sweep task.
    pub fn sweep(&self, now: Instant) {
        let fp_ttl = self.windows.ingress * 3;
        {
            let mut map = self.fingerprints.lock().unwrap_or_else(|e| e.into_inner());
            let before = map.len();
            map.retain(|_, r| now.duration_since(r.last_seen) < fp_ttl);
            let removed = before - map.len();
            if removed > 0 {
                tracing::debug!(removed, remaining = map.len(), "swept fingerprint records");
            }
        }

        let mut map = self.notices.lock().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|(_, kind), r| {
            let ttl = if *kind == NoticeKind::Shipping && r.replied_shipping {
                self.windows.shipping * 3
            } else {
                self.windows.notice * 3
            };
            let newest = match (r.last_seen, r.last_replied) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };
            newest
                .map(|t| now.duration_since(t) < ttl)
                .unwrap_or(false)
        });
        let removed = before - map.len();
        if removed > 0 {
            tracing::debug!(removed, remaining = map.len(), "swept notice records");
        }
    }

    #[cfg(test)]
    pub fn windows(&self) -> &DedupWindows {
        &self.windows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> DedupLedger {
        DedupLedger::new(DedupWindows::default())
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn fingerprint_is_stable_and_field_sensitive() {
        let a = fingerprint("u1", "多少钱", "item1");
        assert_eq!(a, fingerprint("u1", "多少钱", "item1"));
        assert_ne!(a, fingerprint("u2", "多少钱", "item1"));
        assert_ne!(a, fingerprint("u1", "包邮吗", "item1"));
        assert_ne!(a, fingerprint("u1", "多少钱", "item2"));
    }

    #[test]
    fn repeat_within_ingress_window_is_dropped() {
        let ledger = ledger();
        let fp = fingerprint("u", "hi", "i");
        let t0 = Instant::now();

        assert!(ledger.observe(fp, t0).is_ok());
        assert_eq!(
            ledger.observe(fp, t0 + secs(5)),
            Err(Suppressed::DuplicateWithinWindow)
        );
        assert_eq!(
            ledger.observe(fp, t0 + secs(29)),
            Err(Suppressed::DuplicateWithinWindow)
        );
        // Past the window the fingerprint is fresh again.
        assert!(ledger.observe(fp, t0 + secs(31)).is_ok());
    }

    #[test]
    fn first_claim_wins_second_is_dropped() {
        let ledger = ledger();
        let fp = fingerprint("u", "hi", "i");
        let t0 = Instant::now();

        ledger.observe(fp, t0).unwrap();
        assert!(ledger.claim(fp, t0 + secs(1)).is_ok());
        assert_eq!(
            ledger.claim(fp, t0 + secs(2)),
            Err(Suppressed::AlreadyClaimed)
        );
    }

    #[test]
    fn own_fresh_ingress_entry_does_not_block_claim() {
        // The record created microseconds ago at ingress must not count as
        // "already handled" when our own worker picks the event up.
        let ledger = ledger();
        let fp = fingerprint("u", "hi", "i");
        let t0 = Instant::now();
        ledger.observe(fp, t0).unwrap();
        assert!(ledger.claim(fp, t0).is_ok());
    }

    #[test]
    fn claim_without_record_proceeds() {
        let ledger = ledger();
        let fp = fingerprint("u", "hi", "i");
        assert!(ledger.claim(fp, Instant::now()).is_ok());
    }

    #[test]
    fn claim_is_reusable_after_window() {
        let ledger = ledger();
        let fp = fingerprint("u", "hi", "i");
        let t0 = Instant::now();
        ledger.claim(fp, t0).unwrap();
        assert!(ledger.claim(fp, t0 + secs(31)).is_ok());
    }

    #[test]
    fn notice_window_suppresses_after_reply() {
        let ledger = ledger();
        let t0 = Instant::now();

        assert!(ledger
            .notice_decision("u", NoticeKind::Payment, t0)
            .is_ok());
        ledger.record_notice_reply("u", NoticeKind::Payment, t0);

        assert_eq!(
            ledger.notice_decision("u", NoticeKind::Payment, t0 + secs(59)),
            Err(Suppressed::NoticeWindow)
        );
        assert!(ledger
            .notice_decision("u", NoticeKind::Payment, t0 + secs(61))
            .is_ok());
    }

    #[test]
    fn notice_windows_are_per_user_and_subtype() {
        let ledger = ledger();
        let t0 = Instant::now();
        ledger.record_notice_reply("u1", NoticeKind::Payment, t0);

        assert!(ledger
            .notice_decision("u2", NoticeKind::Payment, t0 + secs(1))
            .is_ok());
        assert!(ledger
            .notice_decision("u1", NoticeKind::OrderState, t0 + secs(1))
            .is_ok());
    }

    #[test]
    fn shipping_reply_extends_suppression_to_two_hours() {
        let ledger = ledger();
        let t0 = Instant::now();

        assert!(ledger
            .notice_decision("u", NoticeKind::Shipping, t0)
            .is_ok());
        ledger.record_notice_reply("u", NoticeKind::Shipping, t0);

        // Well past the 60s notice window but inside the shipping window.
        assert_eq!(
            ledger.notice_decision("u", NoticeKind::Shipping, t0 + secs(3600)),
            Err(Suppressed::ShippingWindow)
        );
        assert_eq!(
            ledger.notice_decision("u", NoticeKind::Shipping, t0 + secs(7199)),
            Err(Suppressed::ShippingWindow)
        );
        // 2h + epsilon: allowed again.
        assert!(ledger
            .notice_decision("u", NoticeKind::Shipping, t0 + secs(7201))
            .is_ok());
    }

    #[test]
    fn shipping_without_prior_reply_uses_normal_window() {
        let ledger = ledger();
        let t0 = Instant::now();
        // Seen but never replied: no suppression.
        assert!(ledger
            .notice_decision("u", NoticeKind::Shipping, t0)
            .is_ok());
        assert!(ledger
            .notice_decision("u", NoticeKind::Shipping, t0 + secs(3600))
            .is_ok());
    }

    #[test]
    fn burst_guard_absorbs_double_delivered_banner() {
        let ledger = ledger();
        let t0 = Instant::now();

        assert!(ledger
            .notice_decision("u", NoticeKind::NewMessage, t0)
            .is_ok());
        // Second delivery 2s later: suppressed before any window logic,
        // even though no reply has been recorded yet.
        assert_eq!(
            ledger.notice_decision("u", NoticeKind::NewMessage, t0 + secs(2)),
            Err(Suppressed::BurstGuard)
        );
        assert!(ledger
            .notice_decision("u", NoticeKind::NewMessage, t0 + secs(13))
            .is_ok());
    }

    #[test]
    fn burst_guard_only_applies_to_new_message_banner() {
        let ledger = ledger();
        let t0 = Instant::now();
        assert!(ledger
            .notice_decision("u", NoticeKind::Payment, t0)
            .is_ok());
        assert!(ledger
            .notice_decision("u", NoticeKind::Payment, t0 + secs(2))
            .is_ok());
    }

    #[test]
    fn sweep_drops_stale_records_and_keeps_live_ones() {
        let ledger = ledger();
        let t0 = Instant::now();
        let stale = fingerprint("u", "old", "i");
        let live = fingerprint("u", "new", "i");

        ledger.observe(stale, t0).unwrap();
        ledger.observe(live, t0 + secs(85)).unwrap();
        ledger.record_notice_reply("u", NoticeKind::Payment, t0);

        // 3x ingress window (90s) past t0: the stale fingerprint goes, the
        // live one stays; the notice record (3x 60s TTL) also goes.
        ledger.sweep(t0 + secs(91));
        assert!(ledger.observe(stale, t0 + secs(91)).is_ok());
        assert_eq!(
            ledger.observe(live, t0 + secs(91)),
            Err(Suppressed::DuplicateWithinWindow)
        );

        ledger.sweep(t0 + secs(181));
        assert!(ledger
            .notice_decision("u", NoticeKind::Payment, t0 + secs(181))
            .is_ok());
    }

    #[test]
    fn swept_shipping_records_respect_extended_ttl() {
        let ledger = ledger();
        let t0 = Instant::now();
        ledger.record_notice_reply("u", NoticeKind::Shipping, t0);

        // 3x notice window would have dropped it; shipping TTL keeps it.
        ledger.sweep(t0 + secs(200));
        assert_eq!(
            ledger.notice_decision("u", NoticeKind::Shipping, t0 + secs(201)),
            Err(Suppressed::ShippingWindow)
        );
    }
}
