//! Hierarchical policy resolution over a group-membership graph.
//!
//! Agents belong to policy groups; groups form a forest through optional
//! parent pointers and carry a map of policy keys to values. The
//! effective policy for an agent is the fold of every policy map
//! encountered while walking each membership group and its ancestor
//! chain, merged key by key with a most-restrictive rule.
//!
//! # Merge rule
//!
//! Policies must compose safely across an arbitrary group lattice, so
//! the merge is commutative and monotonically restrictive regardless of
//! traversal order:
//!
//! - numbers: `min`
//! - booleans: logical AND (`false` wins)
//! - string lists (e.g. allowed scopes): set intersection — but an empty
//!   intersection keeps the existing value, because an empty scope list
//!   would be indistinguishable from "no restriction"
//! - any other combination: first-seen wins (no restrictive ordering is
//!   defined across arbitrary types; this is a documented limitation,
//!   not an error)
//!
//! # Cycle safety
//!
//! Parent pointers are kept symmetric at creation time, but resolution
//! still guards every walk with a visited set so that a cycle introduced
//! by data corruption terminates instead of looping.
//!
//! Unlike the other admission engines this one keeps its store in
//! memory: a mutex-guarded keyed structure, one per resolver instance,
//! so per-tenant or per-test resolvers coexist without shared state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::store;

/// Errors from policy-group operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PolicyGroupError {
    /// The referenced group does not exist.
    #[error("policy group not found: {group_id}")]
    GroupNotFound {
        /// The group ID that was not found.
        group_id: String,
    },

    /// The supplied parent group does not exist.
    #[error("parent policy group not found: {group_id}")]
    ParentNotFound {
        /// The parent group ID that was not found.
        group_id: String,
    },

    /// Malformed group arguments.
    #[error("invalid policy group: {reason}")]
    InvalidGroup {
        /// Why the group was rejected.
        reason: String,
    },
}

/// A policy value with an explicit most-restrictive merge per variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyValue {
    /// Boolean capability flag; merged with logical AND.
    Bool(bool),
    /// Numeric limit; merged with `min`.
    Number(f64),
    /// String list (scopes, allowed tools); merged with set
    /// intersection.
    StringList(Vec<String>),
    /// Anything else; first-seen wins on merge.
    Opaque(serde_json::Value),
}

impl PolicyValue {
    /// Merges `other` into `self`, choosing the more restrictive value.
    ///
    /// Commutative and idempotent for the homogeneous variants; a
    /// collision between different variants keeps `self` (first-seen
    /// wins).
    #[must_use]
    pub fn merge_restrictive(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => Self::Number(a.min(*b)),
            (Self::Bool(a), Self::Bool(b)) => Self::Bool(*a && *b),
            (Self::StringList(a), Self::StringList(b)) => {
                let keep: BTreeSet<&str> = b.iter().map(String::as_str).collect();
                let intersection: Vec<String> = a
                    .iter()
                    .filter(|item| keep.contains(item.as_str()))
                    .cloned()
                    .collect();
                if intersection.is_empty() {
                    // An empty scope list would read as "no restriction",
                    // which is the opposite of intent.
                    Self::StringList(a.clone())
                } else {
                    Self::StringList(intersection)
                }
            },
            (first_seen, _) => first_seen.clone(),
        }
    }
}

impl From<bool> for PolicyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for PolicyValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<Vec<String>> for PolicyValue {
    fn from(value: Vec<String>) -> Self {
        Self::StringList(value)
    }
}

/// A policy group node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyGroup {
    /// Generated group identifier.
    pub group_id: String,
    /// Human-readable group name.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Policy keys carried by this group.
    pub policies: BTreeMap<String, PolicyValue>,
    /// Agents directly belonging to this group.
    pub members: BTreeSet<String>,
    /// Optional parent group; kept symmetric with the parent's
    /// `children` list.
    pub parent_group_id: Option<String>,
    /// Child groups; kept symmetric with each child's
    /// `parent_group_id`.
    pub children: Vec<String>,
    /// Creation timestamp (epoch nanoseconds).
    pub created_at_ns: i64,
}

/// Arguments for [`PolicyResolver::create_group`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    /// Human-readable group name. Must not be empty.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Optional parent group ID; must exist if supplied.
    pub parent_group_id: Option<String>,
    /// Initial policy map.
    pub policies: BTreeMap<String, PolicyValue>,
}

impl GroupSpec {
    /// Creates a spec with the given name and no parent or policies.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the parent group.
    #[must_use]
    pub fn parent(mut self, parent_group_id: impl Into<String>) -> Self {
        self.parent_group_id = Some(parent_group_id.into());
        self
    }

    /// Adds one policy key.
    #[must_use]
    pub fn policy(mut self, key: impl Into<String>, value: impl Into<PolicyValue>) -> Self {
        self.policies.insert(key.into(), value.into());
        self
    }
}

/// The result of resolving an agent's effective policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EffectivePolicy {
    /// The agent the policy applies to.
    pub agent_id: String,
    /// Most-restrictive fold of every policy map encountered.
    pub effective_policies: BTreeMap<String, PolicyValue>,
    /// Every group visited during resolution, in walk order.
    pub source_group_ids: Vec<String>,
    /// When resolution ran.
    pub resolved_at: DateTime<Utc>,
}

/// Aggregate counters over the group graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupStats {
    /// Number of groups.
    pub total_groups: usize,
    /// Sum of direct memberships across all groups.
    pub total_memberships: usize,
    /// Groups carrying at least one policy key.
    pub groups_with_policies: usize,
}

/// The hierarchical policy resolver engine.
pub struct PolicyResolver {
    state: Mutex<ResolverState>,
}

#[derive(Debug, Default)]
struct ResolverState {
    groups: HashMap<String, PolicyGroup>,
}

impl Default for PolicyResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyResolver {
    /// Creates an empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ResolverState::default()),
        }
    }

    /// Creates a group, wiring the parent/child pointers symmetrically.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyGroupError::InvalidGroup`] for an empty name and
    /// [`PolicyGroupError::ParentNotFound`] if `parent_group_id` is
    /// supplied but unknown.
    pub fn create_group(&self, spec: GroupSpec) -> Result<PolicyGroup, PolicyGroupError> {
        if spec.name.is_empty() {
            return Err(PolicyGroupError::InvalidGroup {
                reason: "name must not be empty".to_string(),
            });
        }

        let mut state = self.lock();
        if let Some(parent_id) = &spec.parent_group_id {
            if !state.groups.contains_key(parent_id) {
                return Err(PolicyGroupError::ParentNotFound {
                    group_id: parent_id.clone(),
                });
            }
        }

        let group = PolicyGroup {
            group_id: Uuid::new_v4().to_string(),
            name: spec.name,
            description: spec.description,
            policies: spec.policies,
            members: BTreeSet::new(),
            parent_group_id: spec.parent_group_id.clone(),
            children: Vec::new(),
            created_at_ns: store::now_ns(),
        };

        if let Some(parent_id) = &spec.parent_group_id {
            if let Some(parent) = state.groups.get_mut(parent_id) {
                parent.children.push(group.group_id.clone());
            }
        }
        state.groups.insert(group.group_id.clone(), group.clone());
        Ok(group)
    }

    /// Returns a group by ID.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyGroupError::GroupNotFound`] for an unknown group.
    pub fn get_group(&self, group_id: &str) -> Result<PolicyGroup, PolicyGroupError> {
        let state = self.lock();
        state
            .groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| PolicyGroupError::GroupNotFound {
                group_id: group_id.to_string(),
            })
    }

    /// Lists all groups, ordered by group ID.
    #[must_use]
    pub fn list_groups(&self) -> Vec<PolicyGroup> {
        let state = self.lock();
        let mut groups: Vec<PolicyGroup> = state.groups.values().cloned().collect();
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        groups
    }

    /// Deletes a group, detaching its children and unlinking it from its
    /// parent. Memberships are dropped with the group.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyGroupError::GroupNotFound`] for an unknown group.
    pub fn delete_group(&self, group_id: &str) -> Result<(), PolicyGroupError> {
        let mut state = self.lock();
        let group = state.groups.remove(group_id).ok_or_else(|| {
            PolicyGroupError::GroupNotFound {
                group_id: group_id.to_string(),
            }
        })?;

        if let Some(parent_id) = &group.parent_group_id {
            if let Some(parent) = state.groups.get_mut(parent_id) {
                parent.children.retain(|child| child != group_id);
            }
        }
        for child_id in &group.children {
            if let Some(child) = state.groups.get_mut(child_id) {
                child.parent_group_id = None;
            }
        }
        Ok(())
    }

    /// Adds an agent to a group. Adding an existing member is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyGroupError::GroupNotFound`] for an unknown group.
    pub fn add_member(&self, group_id: &str, agent_id: &str) -> Result<(), PolicyGroupError> {
        if agent_id.is_empty() {
            return Err(PolicyGroupError::InvalidGroup {
                reason: "agent_id must not be empty".to_string(),
            });
        }
        let mut state = self.lock();
        let group = state.groups.get_mut(group_id).ok_or_else(|| {
            PolicyGroupError::GroupNotFound {
                group_id: group_id.to_string(),
            }
        })?;
        group.members.insert(agent_id.to_string());
        Ok(())
    }

    /// Removes an agent from a group. Removing a non-member is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyGroupError::GroupNotFound`] for an unknown group.
    pub fn remove_member(&self, group_id: &str, agent_id: &str) -> Result<(), PolicyGroupError> {
        let mut state = self.lock();
        let group = state.groups.get_mut(group_id).ok_or_else(|| {
            PolicyGroupError::GroupNotFound {
                group_id: group_id.to_string(),
            }
        })?;
        group.members.remove(agent_id);
        Ok(())
    }

    /// Merges `policies` into the group's policy map (per-key overwrite,
    /// not whole-map replacement).
    ///
    /// # Errors
    ///
    /// Returns [`PolicyGroupError::GroupNotFound`] for an unknown group.
    pub fn update_group_policies(
        &self,
        group_id: &str,
        policies: BTreeMap<String, PolicyValue>,
    ) -> Result<PolicyGroup, PolicyGroupError> {
        let mut state = self.lock();
        let group = state.groups.get_mut(group_id).ok_or_else(|| {
            PolicyGroupError::GroupNotFound {
                group_id: group_id.to_string(),
            }
        })?;
        group.policies.extend(policies);
        Ok(group.clone())
    }

    /// Resolves the effective policy for an agent.
    ///
    /// Walks every group the agent belongs to plus each group's ancestor
    /// chain, folding all encountered policy maps with
    /// [`PolicyValue::merge_restrictive`]. A shared visited set stops
    /// the walk at the first already-visited group, so resolution
    /// terminates even on corrupted cyclic parent links. An agent with
    /// no memberships resolves to an empty policy map.
    #[must_use]
    pub fn get_effective_policy(&self, agent_id: &str) -> EffectivePolicy {
        let state = self.lock();

        let mut direct: Vec<&PolicyGroup> = state
            .groups
            .values()
            .filter(|group| group.members.contains(agent_id))
            .collect();
        direct.sort_by(|a, b| a.group_id.cmp(&b.group_id));

        let mut visited: BTreeSet<String> = BTreeSet::new();
        let mut effective: BTreeMap<String, PolicyValue> = BTreeMap::new();
        let mut sources: Vec<String> = Vec::new();

        for group in direct {
            let mut cursor = Some(group.group_id.clone());
            while let Some(group_id) = cursor {
                if !visited.insert(group_id.clone()) {
                    break;
                }
                // A dangling parent pointer ends the chain.
                let Some(node) = state.groups.get(&group_id) else {
                    break;
                };
                sources.push(group_id);

                for (key, value) in &node.policies {
                    match effective.get(key) {
                        Some(existing) => {
                            let merged = existing.merge_restrictive(value);
                            effective.insert(key.clone(), merged);
                        },
                        None => {
                            effective.insert(key.clone(), value.clone());
                        },
                    }
                }
                cursor = node.parent_group_id.clone();
            }
        }

        EffectivePolicy {
            agent_id: agent_id.to_string(),
            effective_policies: effective,
            source_group_ids: sources,
            resolved_at: Utc::now(),
        }
    }

    /// Returns the groups an agent directly belongs to, ordered by group
    /// ID.
    #[must_use]
    pub fn get_agent_groups(&self, agent_id: &str) -> Vec<PolicyGroup> {
        let state = self.lock();
        let mut groups: Vec<PolicyGroup> = state
            .groups
            .values()
            .filter(|group| group.members.contains(agent_id))
            .cloned()
            .collect();
        groups.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        groups
    }

    /// Returns aggregate counters over the group graph.
    #[must_use]
    pub fn get_group_stats(&self) -> GroupStats {
        let state = self.lock();
        GroupStats {
            total_groups: state.groups.len(),
            total_memberships: state.groups.values().map(|g| g.members.len()).sum(),
            groups_with_policies: state
                .groups
                .values()
                .filter(|g| !g.policies.is_empty())
                .count(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ResolverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_most_restrictive_number_across_groups() {
        let resolver = PolicyResolver::new();
        let a = resolver
            .create_group(GroupSpec::new("group-a").policy("max_rate", 100.0))
            .unwrap();
        let b = resolver
            .create_group(GroupSpec::new("group-b").policy("max_rate", 50.0))
            .unwrap();
        resolver.add_member(&a.group_id, "agent-1").unwrap();
        resolver.add_member(&b.group_id, "agent-1").unwrap();

        let effective = resolver.get_effective_policy("agent-1");
        assert_eq!(
            effective.effective_policies.get("max_rate"),
            Some(&PolicyValue::Number(50.0))
        );
    }

    #[test]
    fn test_non_conflicting_key_passes_through() {
        let resolver = PolicyResolver::new();
        let a = resolver
            .create_group(GroupSpec::new("group-a").policy("max_cost", 1000.0))
            .unwrap();
        resolver.add_member(&a.group_id, "agent-1").unwrap();

        let effective = resolver.get_effective_policy("agent-1");
        assert_eq!(
            effective.effective_policies.get("max_cost"),
            Some(&PolicyValue::Number(1000.0))
        );
    }

    #[test]
    fn test_bool_merge_false_wins() {
        let resolver = PolicyResolver::new();
        let a = resolver
            .create_group(GroupSpec::new("group-a").policy("can_spawn", true))
            .unwrap();
        let b = resolver
            .create_group(GroupSpec::new("group-b").policy("can_spawn", false))
            .unwrap();
        resolver.add_member(&a.group_id, "agent-1").unwrap();
        resolver.add_member(&b.group_id, "agent-1").unwrap();

        let effective = resolver.get_effective_policy("agent-1");
        assert_eq!(
            effective.effective_policies.get("can_spawn"),
            Some(&PolicyValue::Bool(false))
        );
    }

    #[test]
    fn test_list_merge_intersects() {
        let resolver = PolicyResolver::new();
        let a = resolver
            .create_group(
                GroupSpec::new("group-a").policy("scopes", strings(&["read", "write", "admin"])),
            )
            .unwrap();
        let b = resolver
            .create_group(GroupSpec::new("group-b").policy("scopes", strings(&["read", "write"])))
            .unwrap();
        resolver.add_member(&a.group_id, "agent-1").unwrap();
        resolver.add_member(&b.group_id, "agent-1").unwrap();

        let effective = resolver.get_effective_policy("agent-1");
        assert_eq!(
            effective.effective_policies.get("scopes"),
            Some(&PolicyValue::StringList(strings(&["read", "write"])))
        );
    }

    #[test]
    fn test_empty_intersection_keeps_existing() {
        let existing = PolicyValue::StringList(strings(&["read"]));
        let other = PolicyValue::StringList(strings(&["write"]));
        assert_eq!(
            existing.merge_restrictive(&other),
            PolicyValue::StringList(strings(&["read"]))
        );
    }

    #[test]
    fn test_mixed_types_first_seen_wins() {
        let number = PolicyValue::Number(10.0);
        let flag = PolicyValue::Bool(false);
        assert_eq!(number.merge_restrictive(&flag), PolicyValue::Number(10.0));
        assert_eq!(flag.merge_restrictive(&number), PolicyValue::Bool(false));
    }

    #[test]
    fn test_ancestor_policies_inherited() {
        let resolver = PolicyResolver::new();
        let root = resolver
            .create_group(GroupSpec::new("root").policy("max_rate", 10.0))
            .unwrap();
        let child = resolver
            .create_group(
                GroupSpec::new("child")
                    .parent(root.group_id.clone())
                    .policy("max_cost", 500.0),
            )
            .unwrap();
        resolver.add_member(&child.group_id, "agent-1").unwrap();

        let effective = resolver.get_effective_policy("agent-1");
        assert_eq!(
            effective.effective_policies.get("max_rate"),
            Some(&PolicyValue::Number(10.0))
        );
        assert_eq!(
            effective.effective_policies.get("max_cost"),
            Some(&PolicyValue::Number(500.0))
        );
        assert_eq!(effective.source_group_ids.len(), 2);
    }

    #[test]
    fn test_ancestor_restricts_child() {
        let resolver = PolicyResolver::new();
        let root = resolver
            .create_group(GroupSpec::new("root").policy("max_rate", 10.0))
            .unwrap();
        let child = resolver
            .create_group(
                GroupSpec::new("child")
                    .parent(root.group_id.clone())
                    .policy("max_rate", 100.0),
            )
            .unwrap();
        resolver.add_member(&child.group_id, "agent-1").unwrap();

        let effective = resolver.get_effective_policy("agent-1");
        assert_eq!(
            effective.effective_policies.get("max_rate"),
            Some(&PolicyValue::Number(10.0))
        );
    }

    #[test]
    fn test_cycle_terminates() {
        let resolver = PolicyResolver::new();
        let a = resolver
            .create_group(GroupSpec::new("group-a").policy("max_rate", 10.0))
            .unwrap();
        let b = resolver
            .create_group(GroupSpec::new("group-b").parent(a.group_id.clone()))
            .unwrap();
        resolver.add_member(&b.group_id, "agent-1").unwrap();

        // Corrupt the graph: a's parent points back at b.
        {
            let mut state = resolver.state.lock().unwrap();
            if let Some(group) = state.groups.get_mut(&a.group_id) {
                group.parent_group_id = Some(b.group_id.clone());
            }
        }

        let effective = resolver.get_effective_policy("agent-1");
        assert_eq!(
            effective.effective_policies.get("max_rate"),
            Some(&PolicyValue::Number(10.0))
        );
        // Each group visited exactly once.
        assert_eq!(effective.source_group_ids.len(), 2);
    }

    #[test]
    fn test_membership_is_idempotent() {
        let resolver = PolicyResolver::new();
        let group = resolver.create_group(GroupSpec::new("group-a")).unwrap();

        resolver.add_member(&group.group_id, "agent-1").unwrap();
        resolver.add_member(&group.group_id, "agent-1").unwrap();
        assert_eq!(resolver.get_group(&group.group_id).unwrap().members.len(), 1);

        resolver.remove_member(&group.group_id, "agent-1").unwrap();
        resolver.remove_member(&group.group_id, "agent-1").unwrap();
        assert!(resolver.get_group(&group.group_id).unwrap().members.is_empty());
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let resolver = PolicyResolver::new();
        let result = resolver.create_group(GroupSpec::new("orphan").parent("missing"));
        assert!(matches!(result, Err(PolicyGroupError::ParentNotFound { .. })));
    }

    #[test]
    fn test_unknown_group_not_found() {
        let resolver = PolicyResolver::new();
        assert!(matches!(
            resolver.add_member("missing", "agent-1"),
            Err(PolicyGroupError::GroupNotFound { .. })
        ));
        assert!(matches!(
            resolver.update_group_policies("missing", BTreeMap::new()),
            Err(PolicyGroupError::GroupNotFound { .. })
        ));
    }

    #[test]
    fn test_update_policies_merges_keys() {
        let resolver = PolicyResolver::new();
        let group = resolver
            .create_group(GroupSpec::new("group-a").policy("max_rate", 10.0))
            .unwrap();

        let mut update = BTreeMap::new();
        update.insert("max_cost".to_string(), PolicyValue::Number(500.0));
        update.insert("max_rate".to_string(), PolicyValue::Number(5.0));
        let updated = resolver
            .update_group_policies(&group.group_id, update)
            .unwrap();

        // Existing key overwritten, other keys retained.
        assert_eq!(updated.policies.get("max_rate"), Some(&PolicyValue::Number(5.0)));
        assert_eq!(updated.policies.get("max_cost"), Some(&PolicyValue::Number(500.0)));
    }

    #[test]
    fn test_parent_child_pointers_symmetric() {
        let resolver = PolicyResolver::new();
        let root = resolver.create_group(GroupSpec::new("root")).unwrap();
        let child = resolver
            .create_group(GroupSpec::new("child").parent(root.group_id.clone()))
            .unwrap();

        let root = resolver.get_group(&root.group_id).unwrap();
        assert_eq!(root.children, vec![child.group_id.clone()]);
        assert_eq!(child.parent_group_id, Some(root.group_id));
    }

    #[test]
    fn test_delete_group_detaches_children() {
        let resolver = PolicyResolver::new();
        let root = resolver.create_group(GroupSpec::new("root")).unwrap();
        let child = resolver
            .create_group(GroupSpec::new("child").parent(root.group_id.clone()))
            .unwrap();

        resolver.delete_group(&root.group_id).unwrap();
        assert!(matches!(
            resolver.get_group(&root.group_id),
            Err(PolicyGroupError::GroupNotFound { .. })
        ));
        let child = resolver.get_group(&child.group_id).unwrap();
        assert!(child.parent_group_id.is_none());
    }

    #[test]
    fn test_group_stats() {
        let resolver = PolicyResolver::new();
        let a = resolver
            .create_group(GroupSpec::new("group-a").policy("max_rate", 10.0))
            .unwrap();
        let b = resolver.create_group(GroupSpec::new("group-b")).unwrap();
        resolver.add_member(&a.group_id, "agent-1").unwrap();
        resolver.add_member(&a.group_id, "agent-2").unwrap();
        resolver.add_member(&b.group_id, "agent-1").unwrap();

        let stats = resolver.get_group_stats();
        assert_eq!(stats.total_groups, 2);
        assert_eq!(stats.total_memberships, 3);
        assert_eq!(stats.groups_with_policies, 1);
    }

    #[test]
    fn test_agent_with_no_groups_resolves_empty() {
        let resolver = PolicyResolver::new();
        let effective = resolver.get_effective_policy("agent-1");
        assert!(effective.effective_policies.is_empty());
        assert!(effective.source_group_ids.is_empty());
    }

    mod merge_laws {
        use proptest::prelude::*;

        use super::super::PolicyValue;

        fn homogeneous_pair() -> impl Strategy<Value = (PolicyValue, PolicyValue)> {
            prop_oneof![
                (any::<bool>(), any::<bool>())
                    .prop_map(|(a, b)| (PolicyValue::Bool(a), PolicyValue::Bool(b))),
                (0.0_f64..1e9, 0.0_f64..1e9)
                    .prop_map(|(a, b)| (PolicyValue::Number(a), PolicyValue::Number(b))),
                (
                    prop::collection::vec("[a-c]{1,2}", 0..4),
                    prop::collection::vec("[a-c]{1,2}", 0..4),
                )
                    .prop_map(|(a, b)| {
                        (PolicyValue::StringList(a), PolicyValue::StringList(b))
                    }),
            ]
        }

        proptest! {
            #[test]
            fn merge_is_idempotent(value in homogeneous_pair().prop_map(|(a, _)| a)) {
                let merged = value.merge_restrictive(&value);
                // Idempotence up to list de-duplication order.
                prop_assert_eq!(merged.merge_restrictive(&value), value.merge_restrictive(&value));
            }

            #[test]
            fn number_merge_is_monotone((a, b) in (0.0_f64..1e9, 0.0_f64..1e9)) {
                let merged = PolicyValue::Number(a).merge_restrictive(&PolicyValue::Number(b));
                if let PolicyValue::Number(m) = merged {
                    prop_assert!(m <= a && m <= b);
                } else {
                    prop_assert!(false, "number merge changed variant");
                }
            }

            #[test]
            fn bool_merge_is_and((a, b) in (any::<bool>(), any::<bool>())) {
                let merged = PolicyValue::Bool(a).merge_restrictive(&PolicyValue::Bool(b));
                prop_assert_eq!(merged, PolicyValue::Bool(a && b));
            }

            #[test]
            fn list_merge_never_widens((a, b) in homogeneous_pair()) {
                if let (PolicyValue::StringList(left), PolicyValue::StringList(_)) = (&a, &b) {
                    if let PolicyValue::StringList(merged) = a.merge_restrictive(&b) {
                        prop_assert!(merged.iter().all(|item| left.contains(item)));
                    } else {
                        prop_assert!(false, "list merge changed variant");
                    }
                }
            }
        }
    }
}
