use std::collections::BTreeMap;

use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errinput;
use crate::error::Result;

/// A node tag: a short, stable identifier assigned when a node joins the
/// cluster ("A", "B", ... "Z", "AA", ...).
pub type NodeTag = String;

/// The membership class of a cluster node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    /// A full member that votes in elections and counts towards quorums.
    Voter,
    /// A member being added to the cluster: replicates the log but does not
    /// vote, and is promoted to voter automatically once caught up.
    Promotable,
    /// A member that replicates the log indefinitely without ever voting.
    NonVoter,
}

/// A requested placement for a topology modification: move the node into
/// one of the three membership sets, or remove it from the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChange {
    Voter,
    Promotable,
    NonVoter,
    Remove,
}

/// The cluster topology: the three disjoint membership sets, mapping node
/// tags to peer URLs. A topology without an id belongs to a node that has
/// never been bootstrapped or added to a cluster (the passive state).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterTopology {
    /// The cluster id, identical on all members. None if not in a cluster.
    pub id: Option<Uuid>,
    /// Voting members.
    pub voters: BTreeMap<NodeTag, String>,
    /// Members being added, replicating but not yet voting.
    pub promotables: BTreeMap<NodeTag, String>,
    /// Permanently non-voting members.
    pub non_voters: BTreeMap<NodeTag, String>,
    /// The most recently assigned node tag, used to generate the next one.
    pub last_node_tag: NodeTag,
}

impl crate::encoding::Value for ClusterTopology {}

impl ClusterTopology {
    /// Returns an empty topology (the passive state).
    pub fn empty() -> Self {
        Self {
            id: None,
            voters: BTreeMap::new(),
            promotables: BTreeMap::new(),
            non_voters: BTreeMap::new(),
            last_node_tag: NodeTag::new(),
        }
    }

    /// Returns a fresh single-node topology with the given founding member
    /// as the only voter.
    pub fn bootstrap(tag: NodeTag, url: String) -> Self {
        let mut topology = Self::empty();
        topology.id = Some(Uuid::new_v4());
        topology.voters.insert(tag.clone(), url);
        topology.last_node_tag = tag;
        topology
    }

    /// Returns the membership class of the given node, if it is a member.
    pub fn member_kind(&self, tag: &str) -> Option<MemberKind> {
        if self.voters.contains_key(tag) {
            Some(MemberKind::Voter)
        } else if self.promotables.contains_key(tag) {
            Some(MemberKind::Promotable)
        } else if self.non_voters.contains_key(tag) {
            Some(MemberKind::NonVoter)
        } else {
            None
        }
    }

    /// Returns true if the given node is a member of any set.
    pub fn contains(&self, tag: &str) -> bool {
        self.member_kind(tag).is_some()
    }

    /// Returns true if the given node is a voting member.
    pub fn is_voter(&self, tag: &str) -> bool {
        self.voters.contains_key(tag)
    }

    /// Returns the URL of the given member, if any.
    pub fn url(&self, tag: &str) -> Option<&String> {
        self.voters
            .get(tag)
            .or_else(|| self.promotables.get(tag))
            .or_else(|| self.non_voters.get(tag))
    }

    /// Returns the tag of the member with the given URL, if any. Nodes find
    /// themselves in a received topology by their own URL.
    pub fn tag_of_url(&self, url: &str) -> Option<&NodeTag> {
        self.members().find(|(_, u, _)| *u == url).map(|(tag, _, _)| tag)
    }

    /// Iterates over all members as (tag, url, kind).
    pub fn members(&self) -> impl std::iter::Iterator<Item = (&NodeTag, &String, MemberKind)> {
        self.voters
            .iter()
            .map(|(t, u)| (t, u, MemberKind::Voter))
            .chain(self.promotables.iter().map(|(t, u)| (t, u, MemberKind::Promotable)))
            .chain(self.non_voters.iter().map(|(t, u)| (t, u, MemberKind::NonVoter)))
    }

    /// Returns the quorum size: more than half of the voting members.
    pub fn voter_majority(&self) -> usize {
        self.voters.len() / 2 + 1
    }

    /// Generates the tag for the next node to join, advancing alphabetically
    /// with a base-26 carry ("Z" is followed by "AA").
    pub fn next_tag(&self) -> NodeTag {
        let mut tag: Vec<u8> = self.last_node_tag.bytes().collect();
        let mut i = tag.len();
        loop {
            if i == 0 {
                tag.insert(0, b'A');
                break;
            }
            i -= 1;
            if tag[i] < b'Z' {
                tag[i] += 1;
                break;
            }
            tag[i] = b'A';
        }
        String::from_utf8(tag).expect("tags are ASCII")
    }

    /// Computes a new topology with the given node moved to the requested
    /// membership set, or removed. The node is first removed from all three
    /// sets, then re-added to the requested one; its URL is carried over if
    /// not given. Validation failures leave no trace: the receiver is
    /// unchanged and the caller gets a typed error.
    pub fn modify(
        &self,
        tag: &str,
        url: Option<String>,
        change: MembershipChange,
    ) -> Result<ClusterTopology> {
        let mut topology = self.clone();
        let previous = topology
            .voters
            .remove(tag)
            .or_else(|| topology.promotables.remove(tag))
            .or_else(|| topology.non_voters.remove(tag));

        match change {
            MembershipChange::Remove => {
                if previous.is_none() {
                    return Err(errinput!("node {tag} is not a cluster member"));
                }
            }
            kind => {
                if previous.is_some() && url.is_some() {
                    // A caller providing a URL asserts the node is new.
                    return Err(errinput!("node {tag} is already a cluster member"));
                }
                let Some(url) = url.or(previous) else {
                    return Err(errinput!("no URL known for node {tag}"));
                };
                let set = match kind {
                    MembershipChange::Voter => &mut topology.voters,
                    MembershipChange::Promotable => &mut topology.promotables,
                    MembershipChange::NonVoter => &mut topology.non_voters,
                    MembershipChange::Remove => unreachable!(),
                };
                set.insert(tag.to_string(), url);
                if tag_order(tag) > tag_order(&topology.last_node_tag) {
                    topology.last_node_tag = tag.to_string();
                }
            }
        }
        Ok(topology)
    }
}

/// Orders node tags by generation order: by length, then alphabetically
/// ("Z" precedes "AA").
fn tag_order(tag: &str) -> (usize, &str) {
    (tag.len(), tag)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::Error;

    fn three_node() -> ClusterTopology {
        let mut topology = ClusterTopology::bootstrap("A".to_string(), "a:1".to_string());
        topology = topology
            .modify("B", Some("b:1".to_string()), MembershipChange::Voter)
            .expect("add B failed");
        topology = topology
            .modify("C", Some("c:1".to_string()), MembershipChange::Voter)
            .expect("add C failed");
        topology
    }

    #[test]
    fn bootstrap_is_a_single_voter() {
        let topology = ClusterTopology::bootstrap("A".to_string(), "a:1".to_string());
        assert!(topology.id.is_some());
        assert_eq!(topology.member_kind("A"), Some(MemberKind::Voter));
        assert_eq!(topology.voter_majority(), 1);
        assert_eq!(topology.last_node_tag, "A");
    }

    #[test]
    fn tags_advance_alphabetically() {
        let mut topology = ClusterTopology::empty();
        assert_eq!(topology.next_tag(), "A");
        topology.last_node_tag = "B".to_string();
        assert_eq!(topology.next_tag(), "C");
        topology.last_node_tag = "Z".to_string();
        assert_eq!(topology.next_tag(), "AA");
        topology.last_node_tag = "AZ".to_string();
        assert_eq!(topology.next_tag(), "BA");
    }

    #[test]
    fn a_tag_is_in_at_most_one_set() {
        let mut topology = three_node();
        topology = topology.modify("C", None, MembershipChange::NonVoter).expect("demote failed");
        assert_eq!(topology.member_kind("C"), Some(MemberKind::NonVoter));
        assert!(!topology.voters.contains_key("C"));

        topology = topology.modify("C", None, MembershipChange::Voter).expect("promote failed");
        assert_eq!(topology.member_kind("C"), Some(MemberKind::Voter));
        assert!(!topology.non_voters.contains_key("C"));
    }

    #[test]
    fn remove_requires_membership() {
        let topology = three_node();
        let removed = topology.modify("C", None, MembershipChange::Remove).expect("remove failed");
        assert!(!removed.contains("C"));
        assert_eq!(removed.voter_majority(), 2);

        assert!(matches!(
            removed.modify("C", None, MembershipChange::Remove),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn add_requires_absence_when_url_given() {
        let topology = three_node();
        assert!(matches!(
            topology.modify("B", Some("elsewhere:1".to_string()), MembershipChange::Voter),
            Err(Error::InvalidInput(_))
        ));
        // Without a URL this is a move, which is fine.
        assert!(topology.modify("B", None, MembershipChange::NonVoter).is_ok());
    }

    #[test]
    fn members_are_found_by_url() {
        let topology = three_node();
        assert_eq!(topology.tag_of_url("b:1"), Some(&"B".to_string()));
        assert_eq!(topology.tag_of_url("unknown:1"), None);
        assert_eq!(topology.url("C"), Some(&"c:1".to_string()));
    }

    #[test]
    fn majority_is_more_than_half_of_voters() {
        let mut topology = three_node();
        assert_eq!(topology.voter_majority(), 2);
        topology = topology
            .modify("D", Some("d:1".to_string()), MembershipChange::Promotable)
            .expect("add failed");
        // Promotables don't count towards the quorum.
        assert_eq!(topology.voter_majority(), 2);
        topology = topology.modify("D", None, MembershipChange::Voter).expect("promote failed");
        assert_eq!(topology.voter_majority(), 3);
    }
}
