//! Block templates and the job cache.
//!
//! Node templates arrive with a 32-byte header hash. Miners refer to work by
//! a short job ID instead, so the store keeps two maps: job ID to header hash,
//! and header hash to the template with its proof-of-work state. Both are
//! bounded by the same FIFO order, so the oldest template is evicted first no
//! matter how recently a miner used it.
//!
//! Lookups distinguish two kinds of miss. A job ID that was evicted no longer
//! resolves at all (job not found). A job ID whose template was consumed by a
//! block submission still resolves to its hash, but there is no PoW state for
//! it any more, so shares against it are stale.

pub mod encoding;
mod header;
mod pow;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

pub use encoding::{encode_job, Encoding, IdentityMatcher};
pub use header::{BlockHeader, BlockTemplate, BlueWork, Hash};
pub use pow::PowState;

use crate::tracing::prelude::*;

/// Short job identifier sent to miners, a wrapping counter shown in decimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u16);

impl JobId {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Self)
    }
}

/// A job as broadcast to miners.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub header_hash: Hash,
    pub pre_pow_hash: Hash,
    pub timestamp: u64,
}

impl Job {
    /// `mining.notify` parameters for the given encoding.
    pub fn notify_params(&self, encoding: Encoding) -> Vec<serde_json::Value> {
        let mut params = vec![serde_json::Value::String(self.id.to_string())];
        params.extend(encode_job(&self.pre_pow_hash, self.timestamp, encoding));
        params
    }
}

struct Entry {
    template: BlockTemplate,
    pow: PowState,
    job: Job,
}

/// Bounded cache of live templates and the job IDs that refer to them.
pub struct TemplateStore {
    capacity: usize,
    templates: HashMap<Hash, Entry>,
    jobs: HashMap<JobId, Hash>,
    order: VecDeque<(JobId, Hash)>,
    next_id: u16,
}

impl TemplateStore {
    /// Create a store holding at most `capacity` templates (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            templates: HashMap::with_capacity(capacity + 1),
            jobs: HashMap::with_capacity(capacity + 1),
            order: VecDeque::with_capacity(capacity + 1),
            next_id: 1,
        }
    }

    /// Admit a new template and assign it a job ID.
    ///
    /// Returns `None` if a template with the same header hash is already
    /// cached. When the store is over capacity the single oldest job is
    /// evicted.
    pub fn admit(&mut self, template: BlockTemplate) -> Option<Job> {
        let header_hash = template.header.hash();
        if self.templates.contains_key(&header_hash) {
            trace!(hash = %header_hash, "Template already cached");
            return None;
        }

        let pow = PowState::new(&template.header);
        let id = JobId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);

        let job = Job {
            id,
            header_hash,
            pre_pow_hash: *pow.pre_pow_hash(),
            timestamp: pow.timestamp(),
        };
        self.templates.insert(
            header_hash,
            Entry {
                template,
                pow,
                job: job.clone(),
            },
        );
        // A reused ID after wraparound simply points at the newer template
        self.jobs.insert(id, header_hash);
        self.order.push_back((id, header_hash));

        while self.order.len() > self.capacity {
            self.evict_oldest();
        }

        debug!(job_id = %id, hash = %header_hash, cached = self.templates.len(), "Admitted template");
        Some(job)
    }

    fn evict_oldest(&mut self) {
        let Some((id, hash)) = self.order.pop_front() else {
            return;
        };
        self.templates.remove(&hash);
        if self.jobs.get(&id) == Some(&hash) {
            self.jobs.remove(&id);
        }
        trace!(job_id = %id, hash = %hash, "Evicted template");
    }

    /// Header hash for a job ID, if the job is still known.
    pub fn resolve(&self, id: JobId) -> Option<Hash> {
        self.jobs.get(&id).copied()
    }

    /// Proof-of-work state for a live template.
    pub fn pow_state(&self, hash: &Hash) -> Option<&PowState> {
        self.templates.get(hash).map(|entry| &entry.pow)
    }

    /// Remove a template for block submission.
    ///
    /// The job ID keeps resolving so that later shares for it count as
    /// stale rather than unknown.
    pub fn consume(&mut self, hash: &Hash) -> Option<BlockTemplate> {
        self.templates.remove(hash).map(|entry| entry.template)
    }

    /// Newest job whose template is still live.
    pub fn latest(&self) -> Option<&Job> {
        self.order
            .iter()
            .rev()
            .find_map(|(_, hash)| self.templates.get(hash))
            .map(|entry| &entry.job)
    }

    /// Number of live templates.
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}
