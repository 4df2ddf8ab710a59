// 🔍 Deduplication Engine - Score customer pairs for likely duplicates
// Typed rules (phone, email, name, exact name) summed into a 0-100 confidence

use crate::customer::{CustomerId, CustomerRecord};
use crate::normalize::{NormalizedCustomer, PhoneRegion};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use rayon::prelude::*;
use strsim::jaro_winkler;
use tracing::{debug, info, warn};

/// Below this many candidate pairs scoring stays on the calling thread
const PARALLEL_MIN_PAIRS: usize = 512;

/// Ordered pair key: lower id first
pub type PairKey = (CustomerId, CustomerId);

pub fn pair_key(a: CustomerId, b: CustomerId) -> PairKey {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Scoring weights and thresholds. Values are defaults, not contracts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// Points for identical normalized phone numbers (default: 40)
    pub phone_exact_weight: f64,

    /// Points for identical normalized emails (default: 50)
    pub email_exact_weight: f64,

    /// Max points for similar but not identical emails (default: 20)
    pub email_similarity_weight: f64,

    /// Minimum email similarity to count (default: 0.90)
    pub email_similarity_threshold: f64,

    /// Max points for similar names, scaled by similarity (default: 30)
    pub name_similarity_weight: f64,

    /// Both name parts must reach this similarity (default: 0.80)
    pub name_similarity_threshold: f64,

    /// Above this the reason reads "very similar name" (default: 0.90)
    pub name_very_similar_threshold: f64,

    /// Points for an identical full name with differing contact info (default: 25)
    pub exact_name_weight: f64,

    /// Pairs must score strictly above this to be reported (default: 0)
    pub min_confidence: f64,
}

impl Default for MatchConfig {
    fn default() -> Self {
        MatchConfig {
            phone_exact_weight: 40.0,
            email_exact_weight: 50.0,
            email_similarity_weight: 20.0,
            email_similarity_threshold: 0.90,
            name_similarity_weight: 30.0,
            name_similarity_threshold: 0.80,
            name_very_similar_threshold: 0.90,
            exact_name_weight: 25.0,
            min_confidence: 0.0,
        }
    }
}

// ============================================================================
// MATCH RULES
// ============================================================================

/// One contributing factor to a pair's confidence
#[derive(Debug, Clone, PartialEq)]
pub struct RuleHit {
    pub weight: f64,
    pub reason: String,
}

impl RuleHit {
    fn new(weight: f64, reason: &str) -> Self {
        RuleHit {
            weight,
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchRule {
    /// Identical or near-identical email address
    Email,

    /// Identical normalized phone number
    Phone,

    /// First and last names similar (Jaro-Winkler)
    Name,

    /// Identical full name while email or phone differ
    ExactName,
}

impl MatchRule {
    /// Evaluation order, which is also the order reasons are reported in
    pub const ALL: [MatchRule; 4] = [
        MatchRule::Email,
        MatchRule::Phone,
        MatchRule::Name,
        MatchRule::ExactName,
    ];

    pub fn score(
        &self,
        a: &NormalizedCustomer,
        b: &NormalizedCustomer,
        config: &MatchConfig,
    ) -> Option<RuleHit> {
        match self {
            MatchRule::Email => score_email(a, b, config),
            MatchRule::Phone => score_phone(a, b, config),
            MatchRule::Name => score_name(a, b, config),
            MatchRule::ExactName => score_exact_name(a, b, config),
        }
    }
}

fn score_phone(a: &NormalizedCustomer, b: &NormalizedCustomer, config: &MatchConfig) -> Option<RuleHit> {
    if a.phone.is_empty() || a.phone != b.phone {
        return None;
    }
    Some(RuleHit::new(config.phone_exact_weight, "same phone"))
}

fn score_email(a: &NormalizedCustomer, b: &NormalizedCustomer, config: &MatchConfig) -> Option<RuleHit> {
    if a.email.is_empty() || b.email.is_empty() {
        return None;
    }

    if a.email == b.email {
        return Some(RuleHit::new(config.email_exact_weight, "same email"));
    }

    if a.email_initial() != b.email_initial() {
        return None;
    }

    let similarity = jaro_winkler(&a.email.to_lowercase(), &b.email.to_lowercase());
    if similarity < config.email_similarity_threshold {
        return None;
    }

    Some(RuleHit::new(
        config.email_similarity_weight * similarity,
        "similar email",
    ))
}

fn score_name(a: &NormalizedCustomer, b: &NormalizedCustomer, config: &MatchConfig) -> Option<RuleHit> {
    let similarity = name_similarity(a, b)?;

    if similarity.weakest < config.name_similarity_threshold {
        return None;
    }

    let reason = if similarity.weakest >= config.name_very_similar_threshold {
        "very similar name"
    } else {
        "similar name"
    };

    Some(RuleHit::new(
        config.name_similarity_weight * similarity.average,
        reason,
    ))
}

fn score_exact_name(
    a: &NormalizedCustomer,
    b: &NormalizedCustomer,
    config: &MatchConfig,
) -> Option<RuleHit> {
    if a.full_name.is_empty() || a.full_name != b.full_name {
        return None;
    }

    if a.email == b.email && a.phone == b.phone {
        return None;
    }

    Some(RuleHit::new(
        config.exact_name_weight,
        "exact name, different contact",
    ))
}

/// Per-part name similarity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NameSimilarity {
    /// Lowest part score; both parts must clear the threshold
    pub weakest: f64,
    pub average: f64,
}

/// Jaro-Winkler on first and last name separately, or on the full name when
/// either record lacks a part. None when there is nothing to compare or the
/// compared names start with different letters.
pub fn name_similarity(a: &NormalizedCustomer, b: &NormalizedCustomer) -> Option<NameSimilarity> {
    if a.has_name_parts() && b.has_name_parts() {
        if a.last_initial() != b.last_initial() {
            return None;
        }
        let first = jaro_winkler(&a.first_name, &b.first_name);
        let last = jaro_winkler(&a.last_name, &b.last_name);
        return Some(NameSimilarity {
            weakest: first.min(last),
            average: (first + last) / 2.0,
        });
    }

    if a.full_name.is_empty() || a.full_initial() != b.full_initial() {
        return None;
    }

    let full = jaro_winkler(&a.full_name, &b.full_name);
    Some(NameSimilarity {
        weakest: full,
        average: full,
    })
}

// ============================================================================
// MATCH RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Lower id of the pair
    pub customer_a: CustomerId,

    /// Higher id of the pair
    pub customer_b: CustomerId,

    /// Confidence score (0 - 100)
    pub confidence: f64,

    /// Contributing factors, in rule order
    pub reasons: Vec<String>,
}

impl MatchResult {
    pub fn key(&self) -> PairKey {
        (self.customer_a, self.customer_b)
    }

    /// The other side of the pair, if `id` is part of it
    pub fn other(&self, id: CustomerId) -> Option<CustomerId> {
        if self.customer_a == id {
            Some(self.customer_b)
        } else if self.customer_b == id {
            Some(self.customer_a)
        } else {
            None
        }
    }
}

// ============================================================================
// BLOCKING
// ============================================================================

/// Index key for the candidate pre-filter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BlockKey {
    Phone(String),
    EmailInitial(char),
    /// Records with both name parts, by last-name initial
    LastInitial(char),
    /// Every named record, by full-name initial
    FullInitial(char),
}

impl BlockKey {
    fn for_person(person: &NormalizedCustomer) -> Vec<BlockKey> {
        let mut keys = Vec::with_capacity(4);
        if !person.phone.is_empty() {
            keys.push(BlockKey::Phone(person.phone.clone()));
        }
        if let Some(c) = person.email_initial() {
            keys.push(BlockKey::EmailInitial(c));
        }
        if person.has_name_parts() {
            if let Some(c) = person.last_initial() {
                keys.push(BlockKey::LastInitial(c));
            }
        }
        if let Some(c) = person.full_initial() {
            keys.push(BlockKey::FullInitial(c));
        }
        keys
    }

    /// Whether two records sharing this key can match through it. The
    /// full-name bucket only feeds the full-name fallback and exact-name rule.
    fn pairs(&self, a: &NormalizedCustomer, b: &NormalizedCustomer) -> bool {
        match self {
            BlockKey::FullInitial(_) => {
                !a.has_name_parts() || !b.has_name_parts() || a.full_name == b.full_name
            }
            _ => true,
        }
    }
}

// ============================================================================
// DEDUPLICATION ENGINE
// ============================================================================

pub struct DeduplicationEngine {
    pub config: MatchConfig,
    pub region: PhoneRegion,

    /// Scoring threads for large candidate sets (default: 1)
    pub workers: usize,
}

impl DeduplicationEngine {
    /// Create engine with default weights and the NZ phone region
    pub fn new() -> Self {
        Self::with_config(MatchConfig::default(), PhoneRegion::default())
    }

    pub fn with_config(config: MatchConfig, region: PhoneRegion) -> Self {
        DeduplicationEngine {
            config,
            region,
            workers: 1,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn normalize(&self, record: &CustomerRecord) -> NormalizedCustomer {
        NormalizedCustomer::from_record(record, &self.region)
    }

    /// Score one pair. None when no rule fires or the total is not above
    /// `min_confidence`.
    pub fn score_pair(&self, a: &NormalizedCustomer, b: &NormalizedCustomer) -> Option<MatchResult> {
        if a.id == b.id {
            return None;
        }

        let hits: Vec<RuleHit> = MatchRule::ALL
            .iter()
            .filter_map(|rule| rule.score(a, b, &self.config))
            .collect();

        if hits.is_empty() {
            return None;
        }

        let confidence = hits.iter().map(|h| h.weight).sum::<f64>().min(100.0);
        if confidence <= self.config.min_confidence {
            return None;
        }

        let (customer_a, customer_b) = pair_key(a.id, b.id);
        Some(MatchResult {
            customer_a,
            customer_b,
            confidence,
            reasons: hits.into_iter().map(|h| h.reason).collect(),
        })
    }

    /// Find all matching pairs among the active records, skipping ignored pairs
    pub fn find_duplicates(
        &self,
        records: &[CustomerRecord],
        ignored: &HashSet<PairKey>,
    ) -> Vec<MatchResult> {
        let people: Vec<NormalizedCustomer> = records
            .iter()
            .filter(|r| r.is_active())
            .map(|r| self.normalize(r))
            .collect();

        let pairs = self.candidate_pairs(&people, ignored);
        debug!(
            records = people.len(),
            candidate_pairs = pairs.len(),
            "Scoring candidate pairs"
        );

        let mut matches = self.score_candidates(&people, &pairs);
        matches.sort_by_key(|m| m.key());

        info!(
            records = people.len(),
            matches = matches.len(),
            "Duplicate scoring complete"
        );
        matches
    }

    /// Pairs that share a blocking key. Every rule only fires for records
    /// sharing one of these keys, so no reportable pair is skipped.
    pub fn candidate_pairs(
        &self,
        people: &[NormalizedCustomer],
        ignored: &HashSet<PairKey>,
    ) -> Vec<(usize, usize)> {
        let mut buckets: HashMap<BlockKey, Vec<usize>> = HashMap::new();

        for (index, person) in people.iter().enumerate() {
            for key in BlockKey::for_person(person) {
                buckets.entry(key).or_default().push(index);
            }
        }

        let mut pairs = BTreeSet::new();
        for (key, members) in &buckets {
            for (pos, &i) in members.iter().enumerate() {
                for &j in &members[pos + 1..] {
                    if !key.pairs(&people[i], &people[j]) {
                        continue;
                    }
                    if ignored.contains(&pair_key(people[i].id, people[j].id)) {
                        continue;
                    }
                    pairs.insert((i.min(j), i.max(j)));
                }
            }
        }

        pairs.into_iter().collect()
    }

    fn score_candidates(
        &self,
        people: &[NormalizedCustomer],
        pairs: &[(usize, usize)],
    ) -> Vec<MatchResult> {
        let score = |&(i, j): &(usize, usize)| self.score_pair(&people[i], &people[j]);

        if self.workers <= 1 || pairs.len() < PARALLEL_MIN_PAIRS {
            return pairs.iter().filter_map(score).collect();
        }

        match rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()
        {
            Ok(pool) => pool.install(|| pairs.par_iter().filter_map(score).collect()),
            Err(e) => {
                warn!(error = %e, "Scoring thread pool unavailable, scoring sequentially");
                pairs.iter().filter_map(score).collect()
            }
        }
    }

    /// Score one record (possibly unsaved) against every other active
    /// record. Strongest matches first, at most `limit`.
    pub fn matches_for(
        &self,
        candidate: &CustomerRecord,
        records: &[CustomerRecord],
        limit: usize,
    ) -> Vec<MatchResult> {
        let target = self.normalize(candidate);

        let mut matches: Vec<MatchResult> = records
            .iter()
            .filter(|r| r.is_active() && r.id != candidate.id)
            .filter_map(|r| self.score_pair(&target, &self.normalize(r)))
            .collect();

        matches.sort_by(|x, y| {
            y.confidence
                .total_cmp(&x.confidence)
                .then_with(|| x.key().cmp(&y.key()))
        });
        matches.truncate(limit);
        matches
    }
}

impl Default for DeduplicationEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
