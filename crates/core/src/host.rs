#![forbid(unsafe_code)]

use crate::detector::{DetectorId, DetectorTable};
use crate::pattern::ServiceMatch;
use crate::pool::Pool;
use crate::types::Transport;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const INVALID_CLIENT_THRESHOLD: u32 = 9;
pub const MAX_VALID_COUNT: u32 = 5;
pub const NEEDED_DUPE_DETRACT: u32 = 3;
pub const INCONCLUSIVE_WEIGHT: u32 = 3;

/// Where the search for this host's service currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    New,
    Valid,
    Port,
    Pattern,
    BruteForce,
}

/// Cache key: one entry per server endpoint per detection level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub ip: IpAddr,
    pub transport: Transport,
    pub port: u16,
    pub level: u8,
}

/// What the subsystem has learned about one {server, transport, port}
/// endpoint, including the hysteresis counters that keep a single
/// misbehaving client from unlearning a stable identification.
#[derive(Debug, Clone)]
pub struct HostEntry {
    pub state: HostState,
    pub svc: Option<DetectorId>,
    pub matches: Option<Vec<ServiceMatch>>,
    pub cursor: usize,
    pub valid_count: u32,
    pub invalid_client_count: u32,
    pub detract_count: u32,
    pub last_invalid_client: Option<IpAddr>,
    pub last_detract: Option<IpAddr>,
    pub searching: bool,
    pub reset_time: Option<Instant>,
}

impl HostEntry {
    pub fn new() -> Self {
        HostEntry {
            state: HostState::New,
            svc: None,
            matches: None,
            cursor: 0,
            valid_count: 0,
            invalid_client_count: 0,
            detract_count: 0,
            last_invalid_client: None,
            last_detract: None,
            searching: false,
            reset_time: None,
        }
    }

    /// Advance the pattern cursor past already-tried and inactive detectors.
    pub fn next_by_pattern(&mut self, detectors: &DetectorTable) -> Option<DetectorId> {
        let matches = self.matches.as_ref()?;
        while self.cursor + 1 < matches.len() {
            self.cursor += 1;
            let candidate = matches[self.cursor].detector;
            if detectors.get(candidate).is_active() {
                return Some(candidate);
            }
        }
        None
    }

    /// Hand the match list back to its pool once the search is settled.
    pub fn release_matches(&mut self, pool: &mut Pool<Vec<ServiceMatch>>) {
        if let Some(list) = self.matches.take() {
            pool.put(list);
        }
        self.cursor = 0;
    }

    fn full_reset(&mut self) {
        self.state = HostState::New;
        self.valid_count = 0;
        self.invalid_client_count = 0;
        self.last_invalid_client = None;
        self.detract_count = 0;
        self.last_detract = None;
    }

    /// Apply a failed identification to the state machine. `timed_out` marks
    /// a flow that died mid-search; `walk_active` says a candidate walk was
    /// allocated on the failing flow.
    pub fn handle_failure(
        &mut self,
        client_ip: IpAddr,
        timed_out: bool,
        walk_active: bool,
        now: Instant,
    ) {
        if self.state == HostState::Valid {
            if self.invalid_client_count >= INVALID_CLIENT_THRESHOLD {
                // Too many unrecognized clients counts as an invalid detect.
                if self.valid_count <= 1 {
                    self.full_reset();
                } else {
                    self.valid_count -= 1;
                    self.last_invalid_client = Some(client_ip);
                    self.invalid_client_count = 0;
                }
            } else if self.invalid_client_count == 0 {
                // Plain fails only detract when the same client repeats.
                if self.last_detract == Some(client_ip) {
                    self.detract_count += 1;
                } else {
                    self.last_detract = Some(client_ip);
                    self.detract_count = 1;
                }
                if self.detract_count >= NEEDED_DUPE_DETRACT {
                    if self.valid_count <= 1 {
                        self.full_reset();
                    } else {
                        self.valid_count -= 1;
                    }
                }
            }
        } else if timed_out && walk_active {
            self.state = HostState::New;
        } else if walk_active
            && self.state == HostState::BruteForce
            && self.invalid_client_count > 0
            && self.invalid_client_count < INVALID_CLIENT_THRESHOLD
        {
            // Some odd clients during the search: retry the port/pattern
            // sequence before burning through the brute-force list.
            self.state = HostState::New;
        }

        if self.state != HostState::Valid {
            self.reset_time = Some(now);
        }
        self.searching = false;
    }
}

impl Default for HostEntry {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<HostKey, HostEntry>,
    lru: VecDeque<HostKey>,
}

impl Shard {
    fn touch(&mut self, key: &HostKey) {
        if let Some(at) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(at);
            self.lru.push_back(*key);
        }
    }

    fn remove(&mut self, key: &HostKey) {
        self.entries.remove(key);
        if let Some(at) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(at);
        }
    }
}

/// The host knowledge cache shared by every worker. Partitioned by key hash
/// so a shard lock covers one entry's mutation; no detector ever runs under
/// a shard lock.
#[derive(Debug)]
pub struct HostTracker {
    shards: Vec<Mutex<Shard>>,
    shard_capacity: usize,
}

impl HostTracker {
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shards = shards.max(1);
        let shard_capacity = (capacity.max(1)).div_ceil(shards);
        HostTracker {
            shards: (0..shards).map(|_| Mutex::new(Shard::default())).collect(),
            shard_capacity,
        }
    }

    fn shard(&self, key: &HostKey) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn lock(m: &Mutex<Shard>) -> std::sync::MutexGuard<'_, Shard> {
        m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against an existing entry. Returns None when the endpoint is
    /// unknown.
    pub fn with_entry<R>(&self, key: &HostKey, f: impl FnOnce(&mut HostEntry) -> R) -> Option<R> {
        let mut shard = Self::lock(self.shard(key));
        let result = shard.entries.get_mut(key).map(f);
        if result.is_some() {
            shard.touch(key);
        }
        result
    }

    /// Run `f` against the entry, creating it first if needed; `f` learns
    /// whether the entry is fresh. Returns None only when the shard is full
    /// and every resident entry is mid-search.
    pub fn ensure<R>(
        &self,
        key: &HostKey,
        f: impl FnOnce(&mut HostEntry, bool) -> R,
    ) -> Option<R> {
        let mut shard = Self::lock(self.shard(key));
        let mut created = false;
        if !shard.entries.contains_key(key) {
            if shard.entries.len() >= self.shard_capacity {
                let victim = shard
                    .lru
                    .iter()
                    .find(|k| shard.entries.get(k).is_none_or(|e| !e.searching))
                    .copied()?;
                shard.remove(&victim);
            }
            shard.entries.insert(*key, HostEntry::new());
            shard.lru.push_back(*key);
            created = true;
        }
        shard.touch(key);
        shard.entries.get_mut(key).map(|e| f(e, created))
    }

    /// Peek at the known detector for an endpoint without touching state.
    pub fn svc_of(&self, key: &HostKey) -> Option<DetectorId> {
        let shard = Self::lock(self.shard(key));
        shard.entries.get(key).and_then(|e| e.svc)
    }

    pub fn contains(&self, key: &HostKey) -> bool {
        Self::lock(self.shard(key)).entries.contains_key(key)
    }

    pub fn remove(&self, key: &HostKey) {
        Self::lock(self.shard(key)).remove(key);
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|m| Self::lock(m).entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep entries that stalled without progress for longer than `idle`.
    pub fn prune(&self, now: Instant, idle: Duration) -> usize {
        let mut removed = 0;
        for m in &self.shards {
            let mut shard = Self::lock(m);
            let stale: Vec<HostKey> = shard
                .entries
                .iter()
                .filter(|(_, e)| {
                    !e.searching
                        && e.reset_time
                            .is_some_and(|t| now.duration_since(t) > idle)
                })
                .map(|(k, _)| *k)
                .collect();
            for key in stale {
                shard.remove(&key);
                removed += 1;
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn key(port: u16) -> HostKey {
        HostKey {
            ip: ip("10.0.0.1"),
            transport: Transport::Tcp,
            port,
            level: 0,
        }
    }

    fn valid_entry(valid_count: u32) -> HostEntry {
        let mut entry = HostEntry::new();
        entry.state = HostState::Valid;
        entry.svc = Some(DetectorId(0));
        entry.valid_count = valid_count;
        entry
    }

    #[test]
    fn repeated_same_client_fails_detract_slowly() {
        let now = Instant::now();
        let mut entry = valid_entry(3);
        let client = ip("192.168.1.5");
        for _ in 0..3 {
            entry.handle_failure(client, false, false, now);
        }
        assert_eq!(entry.state, HostState::Valid);
        assert_eq!(entry.valid_count, 2);
    }

    #[test]
    fn different_clients_do_not_detract() {
        let now = Instant::now();
        let mut entry = valid_entry(3);
        entry.handle_failure(ip("192.168.1.5"), false, false, now);
        entry.handle_failure(ip("192.168.1.6"), false, false, now);
        entry.handle_failure(ip("192.168.1.7"), false, false, now);
        assert_eq!(entry.valid_count, 3);
        assert_eq!(entry.state, HostState::Valid);
    }

    #[test]
    fn invalid_client_threshold_steps_down_then_resets() {
        let now = Instant::now();
        let client = ip("192.168.1.5");

        let mut entry = valid_entry(2);
        entry.invalid_client_count = INVALID_CLIENT_THRESHOLD;
        entry.handle_failure(client, false, false, now);
        assert_eq!(entry.state, HostState::Valid);
        assert_eq!(entry.valid_count, 1);
        assert_eq!(entry.invalid_client_count, 0);
        assert_eq!(entry.last_invalid_client, Some(client));

        entry.invalid_client_count = INVALID_CLIENT_THRESHOLD;
        entry.handle_failure(client, false, false, now);
        assert_eq!(entry.state, HostState::New);
        assert_eq!(entry.valid_count, 0);
        assert_eq!(entry.last_invalid_client, None);
    }

    #[test]
    fn search_timeout_restarts_from_new() {
        let now = Instant::now();
        let mut entry = HostEntry::new();
        entry.state = HostState::Pattern;
        entry.searching = true;
        entry.handle_failure(ip("10.9.9.9"), true, true, now);
        assert_eq!(entry.state, HostState::New);
        assert!(!entry.searching);
        assert!(entry.reset_time.is_some());
    }

    #[test]
    fn brute_force_retries_while_clients_look_invalid() {
        let now = Instant::now();
        let mut entry = HostEntry::new();
        entry.state = HostState::BruteForce;
        entry.invalid_client_count = 4;
        entry.handle_failure(ip("10.9.9.9"), false, true, now);
        assert_eq!(entry.state, HostState::New);

        let mut entry = HostEntry::new();
        entry.state = HostState::BruteForce;
        entry.invalid_client_count = INVALID_CLIENT_THRESHOLD;
        entry.handle_failure(ip("10.9.9.9"), false, true, now);
        assert_eq!(entry.state, HostState::BruteForce);
    }

    #[test]
    fn ensure_creates_and_with_entry_mutates() {
        let tracker = HostTracker::new(64, 4);
        let k = key(80);
        tracker
            .ensure(&k, |e, _| {
                e.state = HostState::Port;
            })
            .unwrap();
        assert!(tracker.contains(&k));
        let state = tracker.with_entry(&k, |e| e.state).unwrap();
        assert_eq!(state, HostState::Port);
        assert!(tracker.with_entry(&key(81), |_| ()).is_none());
    }

    #[test]
    fn full_shard_evicts_oldest_not_searching() {
        let tracker = HostTracker::new(1, 1);
        tracker.ensure(&key(1), |_, _| ()).unwrap();
        tracker.ensure(&key(2), |_, _| ()).unwrap();
        assert!(!tracker.contains(&key(1)));
        assert!(tracker.contains(&key(2)));
    }

    #[test]
    fn full_shard_of_searching_entries_refuses() {
        let tracker = HostTracker::new(1, 1);
        tracker
            .ensure(&key(1), |e, _| {
                e.searching = true;
            })
            .unwrap();
        assert!(tracker.ensure(&key(2), |_, _| ()).is_none());
        assert!(tracker.contains(&key(1)));
    }

    #[test]
    fn prune_sweeps_stalled_entries() {
        let tracker = HostTracker::new(16, 2);
        let now = Instant::now();
        tracker
            .ensure(&key(1), |e, _| {
                e.reset_time = Some(now);
            })
            .unwrap();
        tracker.ensure(&key(2), |_, _| ()).unwrap();
        let later = now + Duration::from_secs(600);
        assert_eq!(tracker.prune(later, Duration::from_secs(300)), 1);
        assert!(!tracker.contains(&key(1)));
        assert!(tracker.contains(&key(2)));
    }

    #[test]
    fn pattern_cursor_skips_inactive_detectors() {
        use crate::detector::{DetectorSpec, Registry};
        use crate::types::ServiceVerdict;

        fn v1(_: &mut crate::discovery::ServiceArgs<'_, '_>) -> ServiceVerdict {
            ServiceVerdict::InProcess
        }
        fn v2(_: &mut crate::discovery::ServiceArgs<'_, '_>) -> ServiceVerdict {
            ServiceVerdict::InProcess
        }
        fn v3(_: &mut crate::discovery::ServiceArgs<'_, '_>) -> ServiceVerdict {
            ServiceVerdict::InProcess
        }

        let mut registry = Registry::new();
        let mk = |validate, name| DetectorSpec {
            validate,
            user_data: None,
            name,
            provides_user: false,
            flow_data_key: 0,
        };
        let a = registry.add_port(&mk(v1, "a"), Transport::Tcp, 1, false);
        let b = registry.add_port(&mk(v2, "b"), Transport::Tcp, 2, false);
        let c = registry.add_port(&mk(v3, "c"), Transport::Tcp, 3, false);
        registry.detectors.activate_all();
        registry.detectors.set_active(b, false);

        let mut entry = HostEntry::new();
        entry.matches = Some(vec![
            ServiceMatch {
                detector: a,
                size: 4,
                count: 2,
            },
            ServiceMatch {
                detector: b,
                size: 4,
                count: 1,
            },
            ServiceMatch {
                detector: c,
                size: 2,
                count: 1,
            },
        ]);
        entry.cursor = 0;
        assert_eq!(entry.next_by_pattern(&registry.detectors), Some(c));
        assert_eq!(entry.next_by_pattern(&registry.detectors), None);
    }
}
