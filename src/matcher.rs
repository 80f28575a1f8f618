// Candidate generation.
// Pure functions over a PlacementSnapshot: nothing here touches the store,
// so enumeration is naturally consistent and testable in isolation.
//
// The pipeline: solve each request group (granular groups via match_one,
// the unnumbered group via tree-with-sharing composition), merge group
// solutions under the group policy and the one-tree rule, re-check summed
// amounts, then order, sample and limit.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use tracing::{debug, instrument};

use crate::candidates::{
    build_provider_summaries, render_entries, AllocationCandidates, AllocationRequest,
};
use crate::contracts::{PlacementSnapshot, PlacementStore, ProviderView};
use crate::errors::Result;
use crate::requests::{GroupPolicy, ParsedRequest, PlacementRequest, RequestGroup};
use crate::types::{ClassId, ProviderId, TraitId};

/// One group's worth of a candidate: amounts chosen per (provider, class),
/// plus the bookkeeping the merge step needs.
#[derive(Debug, Clone)]
struct PartialCandidate {
    amounts: BTreeMap<(ProviderId, ClassId), i64>,
    providers: BTreeSet<ProviderId>,
    /// Root of the non-sharing providers in this partial, if any.
    non_sharing_root: Option<ProviderId>,
    sharers: BTreeSet<ProviderId>,
    /// Set when this partial came from a granular group.
    granular_provider: Option<ProviderId>,
}

/// A candidate merged across all groups, not yet finally checked.
#[derive(Debug, Clone, Default)]
struct MergedCandidate {
    amounts: BTreeMap<(ProviderId, ClassId), i64>,
    mappings: BTreeMap<String, BTreeSet<ProviderId>>,
    non_sharing_root: Option<ProviderId>,
    sharers: BTreeSet<ProviderId>,
    granular_chosen: BTreeSet<ProviderId>,
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.map(|d| Instant::now() >= d).unwrap_or(false)
}

/// Trait, aggregate and forbidden-trait filters common to every path.
/// Required traits are NOT checked here; granular matching demands them
/// on the provider itself while spread matching checks the tree union.
fn provider_passes_filters(
    snapshot: &PlacementSnapshot,
    provider: &ProviderView,
    group: &RequestGroup,
) -> bool {
    if !group.forbidden_traits.is_disjoint(&provider.traits) {
        return false;
    }
    if group.member_of.is_empty() && group.forbidden_aggregates.is_empty() {
        return true;
    }
    let member = snapshot.member_aggregates(provider);
    if !group.member_of.iter().all(|any| !any.is_disjoint(&member)) {
        return false;
    }
    member.is_disjoint(&group.forbidden_aggregates)
}

/// Tree scoping: inside the requested tree, or a sharer reachable from it.
fn provider_in_scope(
    snapshot: &PlacementSnapshot,
    provider: &ProviderView,
    tree_root: Option<ProviderId>,
) -> bool {
    match tree_root {
        None => true,
        Some(root) => {
            provider.root_id == root
                || (snapshot.is_sharing(provider)
                    && snapshot.sharer_reaches_tree(provider, root))
        }
    }
}

/// The atomic filter: all `(provider_id, root_id)` pairs where the
/// provider alone satisfies every resource of the group, owns every
/// required trait, owns no forbidden trait, and passes the aggregate and
/// tree filters.
pub fn match_one(
    snapshot: &PlacementSnapshot,
    group: &RequestGroup,
    tree_root: Option<ProviderId>,
) -> Vec<(ProviderId, ProviderId)> {
    snapshot
        .providers
        .values()
        .filter(|p| provider_in_scope(snapshot, p, tree_root))
        .filter(|p| provider_passes_filters(snapshot, p, group))
        .filter(|p| group.required_traits.is_subset(&p.traits))
        .filter(|p| {
            group
                .resources
                .iter()
                .all(|(class_id, amount)| p.admits(*class_id, *amount))
        })
        .map(|p| (p.id, p.root_id))
        .collect()
}

fn solve_granular(
    snapshot: &PlacementSnapshot,
    group: &RequestGroup,
    tree_root: Option<ProviderId>,
) -> Vec<PartialCandidate> {
    match_one(snapshot, group, tree_root)
        .into_iter()
        .map(|(provider_id, root_id)| {
            let provider = snapshot
                .provider(provider_id)
                .expect("match_one only yields snapshot providers");
            let sharing = snapshot.is_sharing(provider);
            let amounts = group
                .resources
                .iter()
                .map(|(class_id, amount)| ((provider_id, *class_id), *amount))
                .collect();
            PartialCandidate {
                amounts,
                providers: BTreeSet::from([provider_id]),
                non_sharing_root: (!sharing).then_some(root_id),
                sharers: if sharing {
                    BTreeSet::from([provider_id])
                } else {
                    BTreeSet::new()
                },
                granular_provider: Some(provider_id),
            }
        })
        .collect()
}

/// Tree-with-sharing composition for the unnumbered group.
fn solve_spread(
    snapshot: &PlacementSnapshot,
    group: &RequestGroup,
    tree_root: Option<ProviderId>,
    deadline: Option<Instant>,
) -> Vec<PartialCandidate> {
    // Per-class provider sets for the full requested amount. An empty
    // set for any class means zero candidates, immediately.
    let mut per_class: Vec<(ClassId, i64, Vec<ProviderId>)> = Vec::new();
    for (class_id, amount) in &group.resources {
        let providers: Vec<ProviderId> = snapshot
            .providers
            .values()
            .filter(|p| provider_in_scope(snapshot, p, tree_root))
            .filter(|p| provider_passes_filters(snapshot, p, group))
            .filter(|p| p.admits(*class_id, *amount))
            .map(|p| p.id)
            .collect();
        if providers.is_empty() {
            return Vec::new();
        }
        per_class.push((*class_id, *amount, providers));
    }

    // Anchor trees: every tree a candidate roots in, plus every tree
    // that reaches a candidate sharer. A tree contributing no resource
    // of its own can still anchor a composition of sharers it connects.
    let mut anchors: BTreeSet<ProviderId> = BTreeSet::new();
    let mut candidate_sharers: BTreeSet<ProviderId> = BTreeSet::new();
    for (_, _, providers) in &per_class {
        for provider_id in providers {
            let provider = snapshot.provider(*provider_id).expect("in snapshot");
            if snapshot.is_sharing(provider) {
                candidate_sharers.insert(*provider_id);
            }
            anchors.insert(provider.root_id);
        }
    }
    if !candidate_sharers.is_empty() {
        let all_roots: BTreeSet<ProviderId> =
            snapshot.providers.values().map(|p| p.root_id).collect();
        for sharer_id in &candidate_sharers {
            let sharer = snapshot.provider(*sharer_id).expect("in snapshot");
            for root in &all_roots {
                if snapshot.sharer_reaches_tree(sharer, *root) {
                    anchors.insert(*root);
                }
            }
        }
    }
    if let Some(root) = tree_root {
        anchors.retain(|a| *a == root);
    }

    let mut seen: BTreeSet<BTreeMap<(ProviderId, ClassId), i64>> = BTreeSet::new();
    let mut out = Vec::new();

    for anchor in anchors {
        if expired(deadline) {
            debug!(anchor, "deadline expired during tree enumeration");
            break;
        }
        // Restrict each class to providers usable from this anchor.
        let mut choices: Vec<(ClassId, i64, Vec<ProviderId>)> = Vec::new();
        let mut anchor_covered = true;
        for (class_id, amount, providers) in &per_class {
            let usable: Vec<ProviderId> = providers
                .iter()
                .copied()
                .filter(|provider_id| {
                    let provider = snapshot.provider(*provider_id).expect("in snapshot");
                    provider.root_id == anchor
                        || (snapshot.is_sharing(provider)
                            && snapshot.sharer_reaches_tree(provider, anchor))
                })
                .collect();
            if usable.is_empty() {
                anchor_covered = false;
                break;
            }
            choices.push((*class_id, *amount, usable));
        }
        if !anchor_covered {
            continue;
        }

        // Required traits may be satisfied anywhere in the anchor tree
        // or on a reachable candidate sharer. This is deliberately
        // coarse: non-contributing tree members count, and a trait may
        // sit on a provider other than the one serving the resource.
        if !group.required_traits.is_empty() {
            let mut available: BTreeSet<TraitId> = BTreeSet::new();
            for member in snapshot.tree_members(anchor) {
                available.extend(member.traits.iter().copied());
            }
            for sharer_id in &candidate_sharers {
                let sharer = snapshot.provider(*sharer_id).expect("in snapshot");
                if snapshot.sharer_reaches_tree(sharer, anchor) {
                    available.extend(sharer.traits.iter().copied());
                }
            }
            if !group.required_traits.is_subset(&available) {
                continue;
            }
        }

        enumerate_anchor(
            snapshot,
            anchor,
            &choices,
            &group.required_traits,
            &mut seen,
            &mut out,
            deadline,
        );
    }

    out
}

/// Advance the product odometer; false when every combination is done.
fn advance(idx: &mut [usize], choices: &[(ClassId, i64, Vec<ProviderId>)]) -> bool {
    let mut slot = choices.len() - 1;
    loop {
        idx[slot] += 1;
        if idx[slot] < choices[slot].2.len() {
            return true;
        }
        idx[slot] = 0;
        if slot == 0 {
            return false;
        }
        slot -= 1;
    }
}

/// Cartesian product of per-class choices within one anchor, deduplicated
/// by the exact amounts map across anchors.
fn enumerate_anchor(
    snapshot: &PlacementSnapshot,
    anchor: ProviderId,
    choices: &[(ClassId, i64, Vec<ProviderId>)],
    required_traits: &BTreeSet<TraitId>,
    seen: &mut BTreeSet<BTreeMap<(ProviderId, ClassId), i64>>,
    out: &mut Vec<PartialCandidate>,
    deadline: Option<Instant>,
) {
    if choices.is_empty() {
        return;
    }
    let mut idx = vec![0usize; choices.len()];
    let mut combos_since_check = 0u32;
    'outer: loop {
        combos_since_check += 1;
        if combos_since_check >= 256 {
            combos_since_check = 0;
            if expired(deadline) {
                return;
            }
        }

        let mut amounts: BTreeMap<(ProviderId, ClassId), i64> = BTreeMap::new();
        let mut providers = BTreeSet::new();
        let mut sharers = BTreeSet::new();
        let mut chosen_traits: BTreeSet<TraitId> = BTreeSet::new();
        let mut has_non_sharing = false;
        for (slot, (class_id, amount, usable)) in choices.iter().enumerate() {
            let provider_id = usable[idx[slot]];
            amounts.insert((provider_id, *class_id), *amount);
            providers.insert(provider_id);
            let provider = snapshot.provider(provider_id).expect("in snapshot");
            chosen_traits.extend(provider.traits.iter().copied());
            if snapshot.is_sharing(provider) {
                sharers.insert(provider_id);
            } else {
                has_non_sharing = true;
            }
        }
        // Second-phase trait check: the providers actually chosen must
        // collectively own the required traits. Which chosen provider
        // owns a trait is not attributed to the resource it serves.
        if !required_traits.is_subset(&chosen_traits) {
            if !advance(&mut idx, choices) {
                break 'outer;
            }
            continue;
        }
        if seen.insert(amounts.clone()) {
            out.push(PartialCandidate {
                amounts,
                providers,
                non_sharing_root: has_non_sharing.then_some(anchor),
                sharers,
                granular_provider: None,
            });
        }

        if !advance(&mut idx, choices) {
            break 'outer;
        }
    }
}

fn try_merge(
    merged: &MergedCandidate,
    partial: &PartialCandidate,
    suffix: &str,
    policy: GroupPolicy,
) -> Option<MergedCandidate> {
    // All non-sharing providers across groups must root to one tree.
    let non_sharing_root = match (merged.non_sharing_root, partial.non_sharing_root) {
        (Some(a), Some(b)) if a != b => return None,
        (a, b) => a.or(b),
    };
    if policy == GroupPolicy::Isolate {
        if let Some(provider_id) = partial.granular_provider {
            if merged.granular_chosen.contains(&provider_id) {
                return None;
            }
        }
    }

    let mut next = merged.clone();
    next.non_sharing_root = non_sharing_root;
    for (key, amount) in &partial.amounts {
        *next.amounts.entry(*key).or_insert(0) += amount;
    }
    next.mappings
        .insert(suffix.to_string(), partial.providers.clone());
    next.sharers.extend(partial.sharers.iter().copied());
    if let Some(provider_id) = partial.granular_provider {
        next.granular_chosen.insert(provider_id);
    }
    Some(next)
}

/// Final checks on a fully merged candidate: one-tree consistency for
/// sharers, and admissibility of the summed amounts. Returns the anchor
/// root used for ordering.
fn finalize(
    snapshot: &PlacementSnapshot,
    merged: &MergedCandidate,
) -> Option<ProviderId> {
    let anchor = match merged.non_sharing_root {
        Some(root) => {
            for sharer_id in &merged.sharers {
                let sharer = snapshot.provider(*sharer_id)?;
                if !snapshot.sharer_reaches_tree(sharer, root) {
                    return None;
                }
            }
            root
        }
        None => {
            // Sharing-only: some tree must reach every chosen sharer.
            let all_roots: BTreeSet<ProviderId> =
                snapshot.providers.values().map(|p| p.root_id).collect();
            all_roots.into_iter().find(|root| {
                merged.sharers.iter().all(|sharer_id| {
                    snapshot
                        .provider(*sharer_id)
                        .map(|s| snapshot.sharer_reaches_tree(s, *root))
                        .unwrap_or(false)
                })
            })?
        }
    };

    // Overlapping groups may have stacked amounts on one (provider,
    // class); the sum must still be admissible on its own.
    for ((provider_id, class_id), amount) in &merged.amounts {
        let provider = snapshot.provider(*provider_id)?;
        if !provider.admits(*class_id, *amount) {
            return None;
        }
    }
    Some(anchor)
}

/// Generate allocation candidates for a resolved request against a
/// consistent snapshot.
///
/// Never fails on inventory state: requests nothing can satisfy yield an
/// empty result. An expired deadline yields whatever was enumerated so
/// far.
#[instrument(skip_all, fields(groups = request.groups.len()))]
pub fn allocation_candidates(
    snapshot: &PlacementSnapshot,
    request: &PlacementRequest,
) -> Result<AllocationCandidates> {
    let deadline = request.deadline;

    // The tree filter names a provider; anywhere in its tree means the
    // whole tree. An unknown uuid is an inventory-state miss, not an
    // error.
    let tree_root = match request.tree_root {
        Some(uuid) => {
            match snapshot.providers.values().find(|p| p.uuid == uuid) {
                Some(p) => Some(p.root_id),
                None => return Ok(AllocationCandidates::default()),
            }
        }
        None => None,
    };

    // Solve each group independently.
    let mut solved: Vec<(&RequestGroup, Vec<PartialCandidate>)> = Vec::new();
    for group in &request.groups {
        if expired(deadline) {
            return Ok(AllocationCandidates::default());
        }
        let partials = if group.use_same_provider {
            solve_granular(snapshot, group, tree_root)
        } else {
            solve_spread(snapshot, group, tree_root, deadline)
        };
        debug!(
            suffix = group.suffix.as_str(),
            count = partials.len(),
            "solved request group"
        );
        if partials.is_empty() {
            return Ok(AllocationCandidates::default());
        }
        solved.push((group, partials));
    }

    // Cartesian product across groups under the group policy.
    let mut merged: Vec<MergedCandidate> = vec![MergedCandidate::default()];
    for (group, partials) in &solved {
        // A candidate missing a group would be unusable; on expiry here
        // the whole set is dropped rather than emitted half-merged.
        if expired(deadline) {
            return Ok(AllocationCandidates::default());
        }
        let mut next = Vec::with_capacity(merged.len() * partials.len());
        for m in &merged {
            for partial in partials {
                if let Some(candidate) =
                    try_merge(m, partial, &group.suffix, request.group_policy)
                {
                    next.push(candidate);
                }
            }
        }
        if next.is_empty() {
            return Ok(AllocationCandidates::default());
        }
        merged = next;
    }

    // Final consistency and summed-capacity checks, dedup, ordering.
    let mut finalists: Vec<(ProviderId, MergedCandidate)> = Vec::new();
    let mut dedup: BTreeSet<(
        BTreeMap<(ProviderId, ClassId), i64>,
        BTreeMap<String, BTreeSet<ProviderId>>,
    )> = BTreeSet::new();
    for candidate in merged {
        if let Some(anchor) = finalize(snapshot, &candidate) {
            let key = (candidate.amounts.clone(), candidate.mappings.clone());
            if dedup.insert(key) {
                finalists.push((anchor, candidate));
            }
        }
    }

    finalists.sort_by(|a, b| {
        let ka: Vec<_> = a.1.amounts.iter().collect();
        let kb: Vec<_> = b.1.amounts.iter().collect();
        (a.0, ka).cmp(&(b.0, kb))
    });

    if request.randomize {
        // Uniform over the pre-limit candidate set.
        fastrand::shuffle(&mut finalists);
    }
    if let Some(limit) = request.limit {
        finalists.truncate(limit);
    }

    // Render requests and summaries from the post-limit set only.
    let mut allocation_requests = Vec::with_capacity(finalists.len());
    let mut summarized: BTreeSet<ProviderId> = BTreeSet::new();
    for (_, candidate) in &finalists {
        let allocations = render_entries(snapshot, &candidate.amounts)?;
        let mut mappings = BTreeMap::new();
        for (suffix, provider_ids) in &candidate.mappings {
            let uuids = provider_ids
                .iter()
                .map(|id| {
                    snapshot
                        .provider(*id)
                        .expect("chosen providers come from the snapshot")
                        .uuid
                })
                .collect();
            mappings.insert(suffix.clone(), uuids);
        }
        summarized.extend(candidate.amounts.keys().map(|(provider_id, _)| *provider_id));
        allocation_requests.push(AllocationRequest {
            allocations,
            mappings,
        });
    }
    let provider_summaries = build_provider_summaries(snapshot, &summarized)?;

    Ok(AllocationCandidates {
        allocation_requests,
        provider_summaries,
    })
}

/// Convenience entry: snapshot the store, resolve the parsed request and
/// enumerate, optionally under a deadline.
pub async fn find_candidates(
    store: &dyn PlacementStore,
    parsed: &ParsedRequest,
    deadline: Option<Instant>,
) -> Result<AllocationCandidates> {
    let snapshot = store.snapshot().await?;
    let mut request = parsed.resolve(&snapshot)?;
    request.deadline = deadline;
    allocation_candidates(&snapshot, &request)
}
