//! Named broadcast groups and their membership.
//!
//! Membership is a plain many-to-many relation between group ids and node
//! ids. Groups that lose their last member are kept, so a group id handed out
//! once stays joinable for the life of the process.

use std::collections::{BTreeSet, HashMap};

use {serde::Serialize, tracing::debug};

#[derive(Debug, Clone)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub members: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupStats {
    pub total_groups: usize,
    /// Sum of member counts over all groups.
    pub total_memberships: usize,
}

#[derive(Default)]
pub struct GroupManager {
    groups: HashMap<String, Group>,
    /// name → id of the first group created with that name
    by_name: HashMap<String, String>,
}

impl GroupManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find a group by name or create it with `creator` as its first member.
    /// The boolean is true when the group was created by this call.
    pub fn get_or_create_group(
        &mut self,
        name: &str,
        creator: &str,
        description: Option<String>,
    ) -> (&Group, bool) {
        let existing = self
            .by_name
            .get(name)
            .filter(|id| self.groups.contains_key(id.as_str()))
            .cloned();
        let created = existing.is_none();
        let id = existing.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if created {
            debug!(group_id = %id, name = %name, creator = %creator, "group created");
            self.by_name.insert(name.to_string(), id.clone());
        }
        let group = self.groups.entry(id.clone()).or_insert_with(|| Group {
            id,
            name: name.to_string(),
            description,
            members: BTreeSet::from([creator.to_string()]),
        });
        (&*group, created)
    }

    pub fn get_group(&self, id: &str) -> Option<&Group> {
        self.groups.get(id)
    }

    pub fn get_group_by_name(&self, name: &str) -> Option<&Group> {
        self.by_name.get(name).and_then(|id| self.groups.get(id))
    }

    /// Returns false if the group does not exist.
    pub fn add_node_to_group(&mut self, group_id: &str, node_id: &str) -> bool {
        match self.groups.get_mut(group_id) {
            Some(group) => {
                group.members.insert(node_id.to_string());
                true
            },
            None => false,
        }
    }

    /// Returns true if the node was a member.
    pub fn remove_node_from_group(&mut self, group_id: &str, node_id: &str) -> bool {
        self.groups
            .get_mut(group_id)
            .is_some_and(|g| g.members.remove(node_id))
    }

    /// Detach a node from every group; returns the ids it was removed from.
    pub fn remove_node_from_all_groups(&mut self, node_id: &str) -> Vec<String> {
        let mut left: Vec<String> = self
            .groups
            .values_mut()
            .filter_map(|g| g.members.remove(node_id).then(|| g.id.clone()))
            .collect();
        left.sort();
        left
    }

    /// Member ids in a stable order; empty for an unknown group.
    pub fn get_group_members(&self, group_id: &str) -> Vec<String> {
        self.groups
            .get(group_id)
            .map(|g| g.members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.groups.len()
    }

    pub fn get_stats(&self) -> GroupStats {
        GroupStats {
            total_groups: self.groups.len(),
            total_memberships: self.groups.values().map(|g| g.members.len()).sum(),
        }
    }
}
