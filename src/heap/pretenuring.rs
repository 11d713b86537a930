//! Allocation-site pretenuring.
//!
//! Objects allocated in the young generation may be followed by an allocation memento that
//! names their allocation site. The allocator counts the mementos it creates, and the young
//! marking visitor counts the mementos it finds behind surviving objects. A site whose
//! objects mostly survive should allocate directly in the old generation.

use std::collections::HashMap;
use std::hash::Hash;

use spin::Mutex;

use crate::util::options::Options;

/// Mementos found per allocation site by one visitor.
pub type PretenuringFeedback<O> = HashMap<O, usize>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PretenureDecision {
    Tenure,
    DontTenure,
}

#[derive(Copy, Clone, Debug, Default)]
struct SiteStats {
    created: usize,
    found: usize,
}

impl SiteStats {
    fn ratio(&self) -> f64 {
        if self.created == 0 {
            0.0
        } else {
            self.found as f64 / self.created as f64
        }
    }
}

pub struct PretenuringHandler<O> {
    min_mementos_created: usize,
    ratio: f64,
    sites: Mutex<HashMap<O, SiteStats>>,
}

impl<O: Copy + Eq + Hash + std::fmt::Debug> PretenuringHandler<O> {
    pub fn new(options: &Options) -> Self {
        Self {
            min_mementos_created: options.pretenuring_min_mementos_created,
            ratio: options.pretenuring_ratio,
            sites: Mutex::new(HashMap::new()),
        }
    }

    /// The allocator created a memento for `site`.
    pub fn record_allocation(&self, site: O) {
        self.sites.lock().entry(site).or_default().created += 1;
    }

    /// Add the mementos a visitor found.
    pub fn merge_feedback(&self, feedback: &PretenuringFeedback<O>) {
        let mut sites = self.sites.lock();
        for (site, found) in feedback {
            sites.entry(*site).or_default().found += found;
        }
    }

    /// Decide every site seen since the previous digest, and start counting afresh.
    pub fn digest_pretenuring_feedback(&self) -> HashMap<O, PretenureDecision> {
        let sites = std::mem::take(&mut *self.sites.lock());
        sites
            .into_iter()
            .map(|(site, stats)| {
                let decision = if stats.created >= self.min_mementos_created
                    && stats.ratio() >= self.ratio
                {
                    PretenureDecision::Tenure
                } else {
                    PretenureDecision::DontTenure
                };
                debug!(
                    "Pretenuring {:?}: created={} found={} ratio={:.2} -> {:?}",
                    site,
                    stats.created,
                    stats.found,
                    stats.ratio(),
                    decision
                );
                (site, decision)
            })
            .collect()
    }
}
