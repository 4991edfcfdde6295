//! Dedup planning: matching a candidate sandbox's pages against the page registry and
//! picking the best base sandbox per page under a weighted heuristic.

use std::collections::{BTreeMap, HashSet};

use meshbox_proto::Digest;

use crate::registry::{PageRegistry, RegistryEntry};

/// Weights for the base-selection score: `w1 * refcount(base) + (same_machine ? w2 : 0)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlannerWeights {
    /// Weight applied to the candidate base's current refcount.
    pub w1: f64,
    /// Bonus applied when the candidate base lives on the same machine as the requester.
    pub w2: f64,
}

impl Default for PlannerWeights {
    fn default() -> Self {
        Self { w1: 1.0, w2: 5.0 }
    }
}

/// One page of a dedup candidate, carrying its fingerprint set.
#[derive(Debug, Clone)]
pub struct CandidatePage {
    /// Dense page address/id within the candidate sandbox.
    pub addr: u64,
    /// Fingerprint digests collected for this page.
    pub digests: Vec<Digest>,
}

/// A page that found a base match, plus which base it matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedPage {
    /// The candidate page's own address.
    pub addr: u64,
    /// The chosen base entry.
    pub base: RegistryEntry,
}

/// The outcome of planning a dedup candidate's full page list.
#[derive(Debug, Clone, Default)]
pub struct PlanResult {
    /// Pages that found a base match, in input order.
    pub matched: Vec<MatchedPage>,
    /// Distinct base sandbox ids chosen across the whole candidate (refcount is bumped
    /// once per distinct base chosen here, not once per page).
    pub chosen_bases: Vec<u64>,
}

/// Matches a dedup candidate's pages against a [`PageRegistry`] and scores candidate bases.
pub struct DedupPlanner<'a> {
    registry: &'a PageRegistry,
    weights: PlannerWeights,
}

impl<'a> DedupPlanner<'a> {
    /// Builds a planner over `registry` using `weights`.
    pub const fn new(registry: &'a PageRegistry, weights: PlannerWeights) -> Self {
        Self { registry, weights }
    }

    /// Plans dedup matches for `candidate_machine_id`'s `pages`.
    ///
    /// `refcount_of` supplies the current refcount for a base sandbox id; the planner
    /// never mutates it — callers apply the `chosen_bases` increments themselves once the
    /// plan is accepted.
    pub fn plan(
        &self,
        candidate_machine_id: u32,
        pages: &[CandidatePage],
        refcount_of: impl Fn(u64) -> u64,
    ) -> PlanResult {
        let mut result = PlanResult::default();
        let mut chosen: HashSet<u64> = HashSet::new();

        for page in pages {
            let mut candidates: BTreeMap<u64, RegistryEntry> = BTreeMap::new();
            for digest in &page.digests {
                for entry in self.registry.lookup(*digest) {
                    candidates.entry(entry.sandbox_id).or_insert(entry);
                }
            }

            if candidates.is_empty() {
                continue;
            }

            let best = candidates
                .iter()
                .map(|(&sandbox_id, entry)| {
                    let same_machine = entry.machine_id == candidate_machine_id;
                    #[allow(clippy::cast_precision_loss)]
                    let score = self.weights.w1 * refcount_of(sandbox_id) as f64
                        + if same_machine { self.weights.w2 } else { 0.0 };
                    (sandbox_id, score, *entry)
                })
                // BTreeMap iterates by ascending sandbox_id, so the first max found by
                // `max_by` with a strict `>` comparison is the lowest-id tie-break winner.
                .fold(None::<(u64, f64, RegistryEntry)>, |acc, cur| match acc {
                    Some((_, best_score, _)) if cur.1 <= best_score => acc,
                    _ => Some(cur),
                });

            if let Some((sandbox_id, _, entry)) = best {
                result.matched.push(MatchedPage {
                    addr: page.addr,
                    base: entry,
                });
                chosen.insert(sandbox_id);
            }
        }

        result.chosen_bases = chosen.into_iter().collect();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::{CandidatePage, DedupPlanner, PlannerWeights};
    use crate::registry::{PageRegistry, RegistryEntry};
    use meshbox_proto::Digest;

    fn digest(byte: u8) -> Digest {
        Digest([byte; 20])
    }

    // ── 1. S5 planner tie-break from the scenario table ──
    #[test]
    fn scenario_s5_tie_break() {
        let registry = PageRegistry::new();
        let d = digest(0xAA);
        registry.insert(
            d,
            RegistryEntry {
                sandbox_id: 5,
                machine_id: 1,
                region_id: 0,
                offset: 0,
            },
        );
        registry.insert(
            d,
            RegistryEntry {
                sandbox_id: 7,
                machine_id: 0,
                region_id: 0,
                offset: 0,
            },
        );

        let weights = PlannerWeights { w1: 1.0, w2: 5.0 };
        let planner = DedupPlanner::new(&registry, weights);
        let pages = vec![CandidatePage {
            addr: 0,
            digests: vec![d],
        }];

        let refcount_of = |sandbox_id: u64| if sandbox_id == 5 || sandbox_id == 7 { 3 } else { 0 };
        let plan = planner.plan(1, &pages, refcount_of);

        assert_eq!(plan.matched.len(), 1);
        assert_eq!(plan.matched[0].base.sandbox_id, 5);
        assert_eq!(plan.chosen_bases, vec![5]);
    }

    // ── 2. a page with no matching digest is skipped, not an error ──
    #[test]
    fn unmatched_page_is_skipped() {
        let registry = PageRegistry::new();
        let planner = DedupPlanner::new(&registry, PlannerWeights::default());
        let pages = vec![CandidatePage {
            addr: 0,
            digests: vec![digest(1)],
        }];
        let plan = planner.plan(0, &pages, |_| 0);
        assert!(plan.matched.is_empty());
        assert!(plan.chosen_bases.is_empty());
    }

    // ── 3. refcount increments once per distinct base, not per page ──
    #[test]
    fn chosen_bases_deduplicated_across_pages() {
        let registry = PageRegistry::new();
        let d = digest(3);
        registry.insert(
            d,
            RegistryEntry {
                sandbox_id: 9,
                machine_id: 0,
                region_id: 0,
                offset: 0,
            },
        );
        let planner = DedupPlanner::new(&registry, PlannerWeights::default());
        let pages = vec![
            CandidatePage {
                addr: 0,
                digests: vec![d],
            },
            CandidatePage {
                addr: 1,
                digests: vec![d],
            },
        ];
        let plan = planner.plan(0, &pages, |_| 0);
        assert_eq!(plan.matched.len(), 2);
        assert_eq!(plan.chosen_bases, vec![9]);
    }
}
