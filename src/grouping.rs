// 🧩 Group Builder - transitive duplicate clusters with a designated primary
//
// Qualifying matches form an undirected graph; each connected component is a
// group. If A~B and B~C then A, B and C form one group even when A and C do
// not match directly.

use crate::customer::{CustomerId, CustomerRecord};
use crate::deduplication::{DeduplicationEngine, MatchResult, PairKey};
use chrono::{DateTime, Utc};
use petgraph::graphmap::UnGraphMap;
use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::info;

/// Match graph: customers as nodes, qualifying matches as edge weights
type MatchGraph<'a> = UnGraphMap<CustomerId, &'a MatchResult>;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConfig {
    /// Matches below this confidence do not link records (default: 30)
    pub group_threshold: f64,

    /// Summary bucket boundaries
    pub high_confidence: f64,
    pub medium_confidence: f64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        GroupConfig {
            group_threshold: 30.0,
            high_confidence: 80.0,
            medium_confidence: 60.0,
        }
    }
}

// ============================================================================
// DUPLICATE GROUP
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMember {
    pub customer_id: CustomerId,

    /// Direct confidence against the primary, or the weakest link on the
    /// strongest path to it
    pub confidence: f64,
    pub reasons: Vec<String>,

    /// Neighbour through which the member reaches the primary (None = direct)
    pub via: Option<CustomerId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub primary_id: CustomerId,
    pub members: Vec<GroupMember>,
    pub max_confidence: f64,
}

impl DuplicateGroup {
    /// Primary plus members
    pub fn size(&self) -> usize {
        self.members.len() + 1
    }

    pub fn member_ids(&self) -> Vec<CustomerId> {
        self.members.iter().map(|m| m.customer_id).collect()
    }
}

// ============================================================================
// GROUP BUILDER
// ============================================================================

pub struct GroupBuilder {
    pub config: GroupConfig,
}

impl GroupBuilder {
    pub fn new() -> Self {
        Self::with_config(GroupConfig::default())
    }

    pub fn with_config(config: GroupConfig) -> Self {
        GroupBuilder { config }
    }

    /// Full detection pass: score the snapshot, then cluster it.
    /// A pure function of its inputs; nothing is cached between runs.
    pub fn detect(
        &self,
        engine: &DeduplicationEngine,
        records: &[CustomerRecord],
        ignored: &HashSet<PairKey>,
    ) -> Vec<DuplicateGroup> {
        let matches = engine.find_duplicates(records, ignored);
        let groups = self.build(&matches, records);

        info!(
            records = records.len(),
            groups = groups.len(),
            "Duplicate detection complete"
        );
        groups
    }

    /// Partition matched records into groups. `records` supplies creation
    /// times for primary selection.
    pub fn build(&self, matches: &[MatchResult], records: &[CustomerRecord]) -> Vec<DuplicateGroup> {
        let created: HashMap<CustomerId, DateTime<Utc>> =
            records.iter().map(|r| (r.id, r.created_at)).collect();

        let mut graph = MatchGraph::new();
        for m in matches.iter().filter(|m| m.confidence >= self.config.group_threshold) {
            graph.add_edge(m.customer_a, m.customer_b, m);
        }

        // Stable index per id so the result does not depend on input order
        let mut ids: Vec<CustomerId> = graph.nodes().collect();
        ids.sort();
        let index: HashMap<CustomerId, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut sets = UnionFind::new(ids.len());
        for (a, b, _) in graph.all_edges() {
            sets.union(index[&a], index[&b]);
        }

        let mut components: BTreeMap<usize, Vec<CustomerId>> = BTreeMap::new();
        for (id, root) in ids.iter().zip(sets.into_labeling()) {
            components.entry(root).or_default().push(*id);
        }

        let mut groups: Vec<DuplicateGroup> = components
            .into_values()
            .filter(|members| members.len() >= 2)
            .map(|members| self.build_group(&members, &graph, &created))
            .collect();

        groups.sort_by(|a, b| {
            b.max_confidence
                .total_cmp(&a.max_confidence)
                .then_with(|| b.size().cmp(&a.size()))
                .then_with(|| a.primary_id.cmp(&b.primary_id))
        });
        groups
    }

    fn build_group(
        &self,
        component: &[CustomerId],
        graph: &MatchGraph<'_>,
        created: &HashMap<CustomerId, DateTime<Utc>>,
    ) -> DuplicateGroup {
        let primary_id = select_primary(component, created);
        let paths = widest_paths(graph, primary_id);

        let mut members: Vec<GroupMember> = component
            .iter()
            .filter(|id| **id != primary_id)
            .filter_map(|&id| match graph.edge_weight(id, primary_id) {
                Some(m) => Some(GroupMember {
                    customer_id: id,
                    confidence: m.confidence,
                    reasons: m.reasons.clone(),
                    via: None,
                }),
                None => paths.get(&id).map(|(bottleneck, parent, link)| GroupMember {
                    customer_id: id,
                    confidence: *bottleneck,
                    reasons: link.reasons.clone(),
                    via: Some(*parent),
                }),
            })
            .collect();

        members.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.customer_id.cmp(&b.customer_id))
        });

        let max_confidence = members
            .iter()
            .map(|m| m.confidence)
            .fold(0.0_f64, f64::max);

        DuplicateGroup {
            primary_id,
            members,
            max_confidence,
        }
    }
}

impl Default for GroupBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Earliest created record survives; ties go to the lowest id. Records
/// without a known creation time sort last.
fn select_primary(
    component: &[CustomerId],
    created: &HashMap<CustomerId, DateTime<Utc>>,
) -> CustomerId {
    component
        .iter()
        .copied()
        .min_by_key(|id| {
            let ts = created.get(id);
            (ts.is_none(), ts.copied(), *id)
        })
        .unwrap_or(component[0])
}

/// Maximum-bottleneck path from the primary to every reachable member, as
/// `(bottleneck, previous hop, edge into member)`. Ties settle the lowest id
/// first.
fn widest_paths<'a>(
    graph: &MatchGraph<'a>,
    primary: CustomerId,
) -> HashMap<CustomerId, (f64, CustomerId, &'a MatchResult)> {
    let mut best: BTreeMap<CustomerId, f64> = BTreeMap::new();
    let mut via: HashMap<CustomerId, (f64, CustomerId, &'a MatchResult)> = HashMap::new();
    let mut done: HashSet<CustomerId> = HashSet::new();
    best.insert(primary, f64::INFINITY);

    loop {
        let next = best
            .iter()
            .filter(|(id, _)| !done.contains(*id))
            .fold(None, |acc: Option<(CustomerId, f64)>, (id, width)| match acc {
                Some((_, w)) if w >= *width => acc,
                _ => Some((*id, *width)),
            });

        let Some((node, width)) = next else { break };
        done.insert(node);

        for (_, neighbor, link) in graph.edges(node) {
            if done.contains(&neighbor) {
                continue;
            }
            let candidate = width.min(link.confidence);
            if best.get(&neighbor).map_or(true, |w| candidate > *w) {
                best.insert(neighbor, candidate);
                via.insert(neighbor, (candidate, node, *link));
            }
        }
    }

    via
}

// ============================================================================
// SUMMARY
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateSummary {
    pub total_groups: usize,

    /// Customers across all groups, primaries included
    pub total_customers: usize,
    pub confidence_breakdown: ConfidenceBreakdown,
}

impl DuplicateSummary {
    pub fn from_groups(groups: &[DuplicateGroup], config: &GroupConfig) -> Self {
        let mut breakdown = ConfidenceBreakdown::default();
        for group in groups {
            if group.max_confidence >= config.high_confidence {
                breakdown.high += 1;
            } else if group.max_confidence >= config.medium_confidence {
                breakdown.medium += 1;
            } else {
                breakdown.low += 1;
            }
        }

        DuplicateSummary {
            total_groups: groups.len(),
            total_customers: groups.iter().map(|g| g.size()).sum(),
            confidence_breakdown: breakdown,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::customer::NewCustomer;
    use chrono::{Duration, TimeZone};

    fn record(id: i64, minutes: i64) -> CustomerRecord {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        NewCustomer::new("Test", "Customer").to_record(CustomerId(id), base + Duration::minutes(minutes))
    }

    fn link(a: i64, b: i64, confidence: f64, reason: &str) -> MatchResult {
        let (customer_a, customer_b) = crate::deduplication::pair_key(CustomerId(a), CustomerId(b));
        MatchResult {
            customer_a,
            customer_b,
            confidence,
            reasons: vec![reason.to_string()],
        }
    }

    #[test]
    fn test_transitive_group() {
        let builder = GroupBuilder::new();
        let records = vec![record(1, 0), record(2, 5), record(3, 10)];
        let matches = vec![link(1, 2, 90.0, "same phone"), link(2, 3, 85.0, "same email")];

        let groups = builder.build(&matches, &records);

        assert_eq!(groups.len(), 1);
        let group = &groups[0];
        assert_eq!(group.primary_id, CustomerId(1));
        assert_eq!(group.size(), 3);
        assert_eq!(group.max_confidence, 90.0);

        let c = group.members.iter().find(|m| m.customer_id == CustomerId(3)).unwrap();
        assert_eq!(c.via, Some(CustomerId(2)));
        assert_eq!(c.confidence, 85.0);
        assert_eq!(c.reasons, vec!["same email".to_string()]);
    }

    #[test]
    fn test_best_path_prefers_strongest_bottleneck() {
        let builder = GroupBuilder::new();
        let records = vec![record(1, 0), record(2, 1), record(3, 2), record(4, 3)];
        // 1-2-4 bottleneck 40, 1-3-4 bottleneck 70
        let matches = vec![
            link(1, 2, 95.0, "a"),
            link(2, 4, 40.0, "b"),
            link(1, 3, 70.0, "c"),
            link(3, 4, 80.0, "d"),
        ];

        let groups = builder.build(&matches, &records);
        let member = groups[0]
            .members
            .iter()
            .find(|m| m.customer_id == CustomerId(4))
            .unwrap();

        assert_eq!(member.via, Some(CustomerId(3)));
        assert_eq!(member.confidence, 70.0);
        assert_eq!(member.reasons, vec!["d".to_string()]);
    }

    #[test]
    fn test_primary_is_earliest_then_lowest_id() {
        let builder = GroupBuilder::new();

        let records = vec![record(5, 10), record(7, 0), record(9, 0)];
        let matches = vec![link(5, 7, 60.0, "x"), link(7, 9, 60.0, "y")];
        assert_eq!(builder.build(&matches, &records)[0].primary_id, CustomerId(7));

        // Deterministic regardless of input order
        let reversed: Vec<_> = matches.iter().rev().cloned().collect();
        assert_eq!(
            builder.build(&matches, &records),
            builder.build(&reversed, &records)
        );
    }

    #[test]
    fn test_path_tie_goes_through_lowest_id() {
        let builder = GroupBuilder::new();
        let records: Vec<_> = (1..=4).map(|i| record(i, i)).collect();
        // 4 reaches the primary through 2 or 3 with the same bottleneck
        let matches = vec![
            link(3, 4, 60.0, "via three"),
            link(1, 3, 80.0, "c"),
            link(2, 4, 60.0, "via two"),
            link(1, 2, 80.0, "b"),
        ];

        let groups = builder.build(&matches, &records);
        let member = groups[0]
            .members
            .iter()
            .find(|m| m.customer_id == CustomerId(4))
            .unwrap();
        assert_eq!(member.via, Some(CustomerId(2)));
        assert_eq!(member.reasons, vec!["via two".to_string()]);

        let reversed: Vec<_> = matches.iter().rev().cloned().collect();
        assert_eq!(groups, builder.build(&reversed, &records));
    }

    #[test]
    fn test_bridge_record_merges_clusters() {
        let builder = GroupBuilder::new();
        let records: Vec<_> = (1..=5).map(|i| record(i, i)).collect();
        let matches = vec![
            link(1, 2, 90.0, "a"),
            link(4, 5, 90.0, "b"),
            link(2, 3, 50.0, "c"),
            link(3, 4, 50.0, "d"),
        ];

        let groups = builder.build(&matches, &records);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].size(), 5);
    }

    #[test]
    fn test_threshold_excludes_weak_links() {
        let builder = GroupBuilder::new();
        let records: Vec<_> = (1..=4).map(|i| record(i, i)).collect();
        let matches = vec![link(1, 2, 90.0, "a"), link(2, 3, 10.0, "weak"), link(3, 4, 45.0, "b")];

        let groups = builder.build(&matches, &records);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().all(|g| g.size() == 2));
        // Sorted by max confidence, strongest first
        assert_eq!(groups[0].primary_id, CustomerId(1));
        assert_eq!(groups[1].primary_id, CustomerId(3));
    }

    #[test]
    fn test_sort_by_size_when_confidence_ties() {
        let builder = GroupBuilder::new();
        let records: Vec<_> = (1..=5).map(|i| record(i, i)).collect();
        let matches = vec![link(1, 2, 70.0, "a"), link(3, 4, 70.0, "b"), link(4, 5, 70.0, "c")];

        let groups = builder.build(&matches, &records);
        assert_eq!(groups[0].primary_id, CustomerId(3));
        assert_eq!(groups[1].primary_id, CustomerId(1));
    }

    #[test]
    fn test_each_record_in_one_group() {
        let builder = GroupBuilder::new();
        let records: Vec<_> = (1..=6).map(|i| record(i, i)).collect();
        let matches = vec![
            link(1, 2, 90.0, "a"),
            link(2, 3, 90.0, "a"),
            link(4, 5, 90.0, "a"),
            link(5, 6, 35.0, "a"),
        ];

        let groups = builder.build(&matches, &records);
        let mut seen = HashSet::new();
        for group in &groups {
            assert!(seen.insert(group.primary_id));
            for id in group.member_ids() {
                assert!(seen.insert(id), "customer {} appears twice", id);
            }
        }
        assert_eq!(seen.len(), 6);
    }

    #[test]
    fn test_summary_breakdown() {
        let builder = GroupBuilder::new();
        let records: Vec<_> = (1..=6).map(|i| record(i, i)).collect();
        let matches = vec![link(1, 2, 95.0, "a"), link(3, 4, 65.0, "b"), link(5, 6, 35.0, "c")];

        let groups = builder.build(&matches, &records);
        let summary = DuplicateSummary::from_groups(&groups, &builder.config);

        assert_eq!(summary.total_groups, 3);
        assert_eq!(summary.total_customers, 6);
        assert_eq!(
            summary.confidence_breakdown,
            ConfidenceBreakdown {
                high: 1,
                medium: 1,
                low: 1
            }
        );
    }

    #[test]
    fn test_empty_input() {
        let groups = GroupBuilder::new().build(&[], &[]);
        assert!(groups.is_empty());
        assert_eq!(
            DuplicateSummary::from_groups(&groups, &GroupConfig::default()),
            DuplicateSummary::default()
        );
    }
}
