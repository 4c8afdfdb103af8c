#![forbid(unsafe_code)]

use crate::detector::DetectorId;
use crate::pool::Pool;
use crate::TraceLog;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};

// Staging list for one scan starts here and doubles as needed, up to the
// hard result bound.
const MATCH_LIST_INITIAL: usize = 32;
const MATCH_RESULT_LIMIT: usize = 4096;

/// One detector's showing in a payload scan: how many of its patterns hit
/// and the size of the first pattern seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceMatch {
    pub detector: DetectorId,
    pub size: usize,
    pub count: u32,
}

#[derive(Debug, Clone)]
struct PatternSlot {
    detector: DetectorId,
    size: usize,
    position: Option<usize>,
}

/// Multi-pattern payload index for one transport. Register everything, then
/// `prepare` once; registering again requires another `prepare` before the
/// next scan.
#[derive(Debug)]
pub struct ServicePatterns {
    slots: Vec<PatternSlot>,
    literals: Vec<Vec<u8>>,
    engine: Option<AhoCorasick>,
}

impl ServicePatterns {
    pub fn new() -> Self {
        ServicePatterns {
            slots: Vec::new(),
            literals: Vec::new(),
            engine: None,
        }
    }

    /// Queue a pattern for `detector`. `position` pins the hit to an exact
    /// payload offset; `None` matches anywhere.
    pub fn register(&mut self, detector: DetectorId, pattern: &[u8], position: Option<usize>) {
        self.slots.push(PatternSlot {
            detector,
            size: pattern.len(),
            position,
        });
        self.literals.push(pattern.to_vec());
        // Any new registration invalidates the prepared automaton.
        self.engine = None;
    }

    pub fn pattern_count(&self) -> usize {
        self.slots.len()
    }

    pub fn prepare(&mut self) -> Result<(), String> {
        if self.literals.is_empty() {
            self.engine = None;
            return Ok(());
        }
        let engine = AhoCorasickBuilder::new()
            .build(&self.literals)
            .map_err(|e| format!("pattern index build: {e}"))?;
        self.engine = Some(engine);
        Ok(())
    }

    /// Scan a payload and return every matching detector, best first.
    /// Precedence is hit count, then pattern size; ties keep discovery order.
    pub fn find_all(
        &self,
        payload: &[u8],
        list_pool: &mut Pool<Vec<ServiceMatch>>,
        trace: &mut TraceLog,
    ) -> Vec<ServiceMatch> {
        let mut matches = list_pool.take().unwrap_or_default();
        matches.clear();
        if matches.capacity() < MATCH_LIST_INITIAL {
            matches.reserve(MATCH_LIST_INITIAL - matches.capacity());
        }

        let Some(engine) = &self.engine else {
            return matches;
        };

        for hit in engine.find_overlapping_iter(payload) {
            let slot = &self.slots[hit.pattern().as_usize()];
            if let Some(position) = slot.position
                && hit.start() != position
            {
                continue;
            }
            if let Some(existing) = matches.iter_mut().find(|m| m.detector == slot.detector) {
                existing.count += 1;
                continue;
            }
            if matches.len() >= MATCH_RESULT_LIMIT {
                // Degrade rather than grow without bound: keep what we have.
                trace.log(|| format!("pattern scan result limit {MATCH_RESULT_LIMIT} reached"));
                break;
            }
            matches.push(ServiceMatch {
                detector: slot.detector,
                size: slot.size,
                count: 1,
            });
        }

        matches.sort_by(|a, b| b.count.cmp(&a.count).then(b.size.cmp(&a.size)));
        matches
    }
}

impl Default for ServicePatterns {
    fn default() -> Self {
        Self::new()
    }
}
