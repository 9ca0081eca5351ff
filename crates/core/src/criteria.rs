//! Node query criteria and the predicate tree they compile to.
//!
//! A [`NodeQuery`] is a disjunction of [`NodeCriteria`] groups; each group is
//! a conjunction of optional filters. Stores either evaluate the resulting
//! [`Predicate`] in memory ([`Predicate::matches`]) or translate it to SQL.

use serde::{Deserialize, Serialize};

use crate::node::NodeRecord;
use crate::types::DbId;

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// The user on whose behalf a query runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: DbId,
    pub is_admin: bool,
}

impl Principal {
    pub fn user(user_id: DbId) -> Self {
        Self {
            user_id,
            is_admin: false,
        }
    }

    pub fn admin(user_id: DbId) -> Self {
        Self {
            user_id,
            is_admin: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Criteria builder
// ---------------------------------------------------------------------------

/// Filter on the provider server id. Null checks and equality are exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerIdFilter {
    IsNull,
    IsNotNull,
    Equals(String),
}

/// One AND-group of optional filters. An empty group matches every node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeCriteria {
    pub busy: Option<bool>,
    pub remote: Option<bool>,
    pub stopped: Option<bool>,
    pub server_id: Option<ServerIdFilter>,
    pub principal: Option<Principal>,
}

impl NodeCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn busy(mut self, busy: bool) -> Self {
        self.busy = Some(busy);
        self
    }

    pub fn remote(mut self, remote: bool) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn stopped(mut self, stopped: bool) -> Self {
        self.stopped = Some(stopped);
        self
    }

    pub fn server_id_is_null(mut self, is_null: bool) -> Self {
        self.server_id = Some(if is_null {
            ServerIdFilter::IsNull
        } else {
            ServerIdFilter::IsNotNull
        });
        self
    }

    /// Exact match on the provider id; replaces any null check.
    pub fn node_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(ServerIdFilter::Equals(server_id.into()));
        self
    }

    /// Scope to nodes owned by `principal`, unless the principal is an admin.
    pub fn principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    /// Compile to a conjunction. A leading tautology keeps empty groups true.
    pub fn to_predicate(&self) -> Predicate {
        let mut terms = vec![Predicate::True];

        if let Some(busy) = self.busy {
            terms.push(Predicate::Eq(NodeField::Busy, FieldValue::Bool(busy)));
        }
        if let Some(remote) = self.remote {
            terms.push(Predicate::Eq(NodeField::Remote, FieldValue::Bool(remote)));
        }
        if let Some(stopped) = self.stopped {
            terms.push(Predicate::Eq(NodeField::Stopped, FieldValue::Bool(stopped)));
        }
        match &self.server_id {
            Some(ServerIdFilter::IsNull) => terms.push(Predicate::IsNull(NodeField::ServerId)),
            Some(ServerIdFilter::IsNotNull) => {
                terms.push(Predicate::IsNotNull(NodeField::ServerId))
            }
            Some(ServerIdFilter::Equals(id)) => terms.push(Predicate::Eq(
                NodeField::ServerId,
                FieldValue::Text(id.clone()),
            )),
            None => {}
        }
        if let Some(principal) = self.principal.filter(|p| !p.is_admin) {
            terms.push(Predicate::Eq(
                NodeField::OwnerId,
                FieldValue::Id(principal.user_id),
            ));
        }

        Predicate::And(terms)
    }
}

/// A disjunction of criteria groups with an optional overall row cap.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeQuery {
    pub groups: Vec<NodeCriteria>,
    pub max_rows: Option<usize>,
}

impl NodeQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an OR-ed criteria group.
    pub fn criteria(mut self, criteria: NodeCriteria) -> Self {
        self.groups.push(criteria);
        self
    }

    /// Cap the total result size. Zero means unlimited.
    pub fn max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = (max_rows > 0).then_some(max_rows);
        self
    }

    /// Compile the whole query. No groups at all places no restriction.
    pub fn to_predicate(&self) -> Predicate {
        if self.groups.is_empty() {
            return Predicate::True;
        }
        Predicate::Or(self.groups.iter().map(NodeCriteria::to_predicate).collect())
    }

    /// Evaluate against an in-memory sequence, honouring `max_rows`.
    pub fn apply<'a, I>(&self, nodes: I) -> Vec<NodeRecord>
    where
        I: IntoIterator<Item = &'a NodeRecord>,
    {
        let predicate = self.to_predicate();
        let matching = nodes.into_iter().filter(|n| predicate.matches(n)).cloned();
        match self.max_rows {
            Some(limit) => matching.take(limit).collect(),
            None => matching.collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Predicate tree
// ---------------------------------------------------------------------------

/// Filterable node columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeField {
    Busy,
    Remote,
    Stopped,
    ServerId,
    OwnerId,
}

impl NodeField {
    pub fn column(self) -> &'static str {
        match self {
            Self::Busy => "busy",
            Self::Remote => "remote",
            Self::Stopped => "stopped",
            Self::ServerId => "server_id",
            Self::OwnerId => "owner_id",
        }
    }

    fn value_of(self, node: &NodeRecord) -> Option<FieldValue> {
        match self {
            Self::Busy => Some(FieldValue::Bool(node.busy)),
            Self::Remote => Some(FieldValue::Bool(node.remote)),
            Self::Stopped => Some(FieldValue::Bool(node.stopped)),
            Self::ServerId => node.server_id.clone().map(FieldValue::Text),
            Self::OwnerId => node.owner_id.map(FieldValue::Id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Bool(bool),
    Text(String),
    Id(DbId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    True,
    Eq(NodeField, FieldValue),
    IsNull(NodeField),
    IsNotNull(NodeField),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn matches(&self, node: &NodeRecord) -> bool {
        match self {
            Self::True => true,
            Self::Eq(field, expected) => field.value_of(node).as_ref() == Some(expected),
            Self::IsNull(field) => field.value_of(node).is_none(),
            Self::IsNotNull(field) => field.value_of(node).is_some(),
            Self::And(terms) => terms.iter().all(|t| t.matches(node)),
            Self::Or(terms) => terms.iter().any(|t| t.matches(node)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::test_helpers::node;

    fn fleet() -> Vec<NodeRecord> {
        let mut busy = node(1, 0);
        busy.busy = true;
        busy.owner_id = Some(100);

        let mut remote = node(2, 0);
        remote.remote = true;
        remote.owner_id = Some(200);

        let mut placeholder = node(3, 0);
        placeholder.server_id = None;

        let mut stopped = node(4, 0);
        stopped.stopped = true;
        stopped.owner_id = Some(100);

        vec![busy, remote, placeholder, stopped]
    }

    fn ids(nodes: &[NodeRecord]) -> Vec<i64> {
        nodes.iter().map(|n| n.id).collect()
    }

    #[test]
    fn empty_group_matches_everything() {
        let q = NodeQuery::new().criteria(NodeCriteria::new());
        assert_eq!(ids(&q.apply(&fleet())), vec![1, 2, 3, 4]);
    }

    #[test]
    fn no_groups_matches_everything() {
        assert_eq!(ids(&NodeQuery::new().apply(&fleet())), vec![1, 2, 3, 4]);
    }

    #[test]
    fn groups_are_or_and_filters_are_and() {
        let q = NodeQuery::new()
            .criteria(NodeCriteria::new().busy(true).remote(false))
            .criteria(NodeCriteria::new().remote(true));
        assert_eq!(ids(&q.apply(&fleet())), vec![1, 2]);

        let q = NodeQuery::new().criteria(NodeCriteria::new().busy(true).remote(true));
        assert!(q.apply(&fleet()).is_empty());
    }

    #[test]
    fn server_id_null_checks() {
        let null = NodeQuery::new().criteria(NodeCriteria::new().server_id_is_null(true));
        assert_eq!(ids(&null.apply(&fleet())), vec![3]);

        let not_null = NodeQuery::new().criteria(NodeCriteria::new().server_id_is_null(false));
        assert_eq!(ids(&not_null.apply(&fleet())), vec![1, 2, 4]);
    }

    #[test]
    fn node_id_replaces_null_check() {
        let c = NodeCriteria::new().server_id_is_null(true).node_id("srv-4");
        assert_eq!(c.server_id, Some(ServerIdFilter::Equals("srv-4".into())));
        let q = NodeQuery::new().criteria(c);
        assert_eq!(ids(&q.apply(&fleet())), vec![4]);
    }

    #[test]
    fn owner_filter_only_applies_to_non_admins() {
        let user = NodeQuery::new().criteria(NodeCriteria::new().principal(Principal::user(100)));
        assert_eq!(ids(&user.apply(&fleet())), vec![1, 4]);

        let admin = NodeQuery::new().criteria(NodeCriteria::new().principal(Principal::admin(100)));
        assert_eq!(ids(&admin.apply(&fleet())), vec![1, 2, 3, 4]);
    }

    #[test]
    fn max_rows_caps_the_union_not_each_group() {
        let q = NodeQuery::new()
            .criteria(NodeCriteria::new().stopped(false))
            .criteria(NodeCriteria::new().stopped(true))
            .max_rows(2);
        assert_eq!(q.apply(&fleet()).len(), 2);

        let unlimited = NodeQuery::new().max_rows(0);
        assert_eq!(unlimited.max_rows, None);
    }

    #[test]
    fn group_predicate_starts_with_tautology() {
        assert_eq!(
            NodeCriteria::new().to_predicate(),
            Predicate::And(vec![Predicate::True])
        );
        assert_eq!(NodeQuery::new().to_predicate(), Predicate::True);
    }
}
