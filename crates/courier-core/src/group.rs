//! Broadcast groups.
//!
//! A group mirrors one chat channel on one worker: the set of local
//! connections subscribed to it.

use courier_protocol::ConnectionId;
use std::collections::HashSet;
use tracing::debug;

/// A group identifier (the channel id).
pub type GroupId = String;

/// Local members of one group.
#[derive(Debug)]
pub struct Group {
    name: GroupId,
    members: HashSet<ConnectionId>,
}

impl Group {
    #[must_use]
    pub fn new(name: impl Into<GroupId>) -> Self {
        Self {
            name: name.into(),
            members: HashSet::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn contains(&self, connection: &ConnectionId) -> bool {
        self.members.contains(connection)
    }

    /// Returns `true` if the connection was not yet a member.
    pub fn add(&mut self, connection: ConnectionId) -> bool {
        let added = self.members.insert(connection);
        if added {
            debug!(group = %self.name, members = self.members.len(), "Member added");
        }
        added
    }

    /// Returns `true` if the connection was a member.
    pub fn remove(&mut self, connection: &ConnectionId) -> bool {
        let removed = self.members.remove(connection);
        if removed {
            debug!(group = %self.name, connection = %connection, "Member removed");
        }
        removed
    }

    /// Members other than `except`.
    pub fn members_except<'a>(
        &'a self,
        except: Option<&'a ConnectionId>,
    ) -> impl Iterator<Item = &'a ConnectionId> + 'a {
        self.members.iter().filter(move |c| Some(*c) != except)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_membership() {
        let mut group = Group::new("chnl_general");
        let a = ConnectionId::from("a");
        let b = ConnectionId::from("b");

        assert!(group.add(a.clone()));
        assert!(!group.add(a.clone()));
        assert!(group.add(b.clone()));
        assert_eq!(group.member_count(), 2);

        let others: Vec<_> = group.members_except(Some(&a)).collect();
        assert_eq!(others, vec![&b]);

        assert!(group.remove(&a));
        assert!(!group.remove(&a));
        assert!(!group.contains(&a));
    }
}
