//! Logical grouping of connections, streams and listeners.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

/// Opaque tag naming a logical classification.
///
/// Two groups are equal when their names are equal. Groups own nothing;
/// they only appear as set members.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Group(Arc<str>);

impl Group {
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Group({:?})", &*self.0)
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Group {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Group {
    fn from(name: String) -> Self {
        Self::new(name)
    }
}

/// Thread-safe set of groups.
#[derive(Default)]
pub struct GroupSet {
    groups: RwLock<HashSet<Group>>,
}

impl GroupSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the group was not already present.
    pub fn add(&self, group: Group) -> bool {
        self.groups.write().insert(group)
    }

    pub fn remove(&self, group: &Group) -> bool {
        self.groups.write().remove(group)
    }

    pub fn has(&self, group: &Group) -> bool {
        self.groups.read().contains(group)
    }

    /// Copy every member of `other` into this set.
    pub fn add_set(&self, other: &GroupSet) {
        if std::ptr::eq(self, other) {
            return;
        }
        let theirs: Vec<Group> = other.groups.read().iter().cloned().collect();
        self.groups.write().extend(theirs);
    }

    /// Members, sorted by name.
    pub fn groups(&self) -> Vec<Group> {
        let mut out: Vec<Group> = self.groups.read().iter().cloned().collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.groups.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.read().is_empty()
    }
}

impl Clone for GroupSet {
    /// Independent snapshot; later changes to either set do not propagate.
    fn clone(&self) -> Self {
        Self {
            groups: RwLock::new(self.groups.read().clone()),
        }
    }
}

impl fmt::Debug for GroupSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.groups()).finish()
    }
}

impl<G: Into<Group>> FromIterator<G> for GroupSet {
    fn from_iter<I: IntoIterator<Item = G>>(iter: I) -> Self {
        Self {
            groups: RwLock::new(iter.into_iter().map(Into::into).collect()),
        }
    }
}

/// Anything carrying a [`GroupSet`].
pub trait Groupable {
    fn group_set(&self) -> &GroupSet;

    fn groups(&self) -> Vec<Group> {
        self.group_set().groups()
    }

    fn in_group(&self, group: &Group) -> bool {
        self.group_set().has(group)
    }

    fn add_group(&self, group: Group) {
        self.group_set().add(group);
    }

    fn remove_group(&self, group: &Group) {
        self.group_set().remove(group);
    }
}

/// Narrow `items` to those tagged with `group`, preserving input order.
pub fn with_group<T: Groupable + Clone>(group: &Group, items: &[T]) -> Vec<T> {
    items
        .iter()
        .filter(|item| item.in_group(group))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone)]
    struct Tagged(&'static str, Arc<GroupSet>);

    impl Groupable for Tagged {
        fn group_set(&self) -> &GroupSet {
            &self.1
        }
    }

    fn names(names: &[&str]) -> Vec<Group> {
        names.iter().map(|n| Group::from(*n)).collect()
    }

    #[test]
    fn test_group_equality_by_name() {
        assert_eq!(Group::from("a"), Group::new(String::from("a")));
        assert_ne!(Group::from("a"), Group::from("b"));
        assert_eq!(Group::from("a").to_string(), "a");
    }

    #[test]
    fn test_add_remove_has() {
        let set = GroupSet::new();
        assert!(set.is_empty());
        assert!(set.add("a".into()));
        assert!(!set.add("a".into()));
        assert!(set.has(&"a".into()));
        assert_eq!(set.len(), 1);
        assert!(set.remove(&"a".into()));
        assert!(!set.has(&"a".into()));
    }

    #[test]
    fn test_clone_is_a_snapshot() {
        let original: GroupSet = ["a", "b"].into_iter().collect();
        let copy = original.clone();
        copy.add("c".into());
        original.add("d".into());

        assert_eq!(original.groups(), names(&["a", "b", "d"]));
        assert_eq!(copy.groups(), names(&["a", "b", "c"]));
    }

    #[test]
    fn test_add_set_and_self_merge() {
        let a: GroupSet = ["x"].into_iter().collect();
        let b: GroupSet = ["y", "z"].into_iter().collect();
        a.add_set(&b);
        a.add_set(&a);
        assert_eq!(a.groups(), names(&["x", "y", "z"]));
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn test_with_group_preserves_order() {
        let items = vec![
            Tagged("first", Arc::new(["red"].into_iter().collect())),
            Tagged("second", Arc::new(["blue"].into_iter().collect())),
            Tagged("third", Arc::new(["red", "blue"].into_iter().collect())),
        ];

        let red: Vec<&str> = with_group(&"red".into(), &items)
            .iter()
            .map(|t| t.0)
            .collect();
        assert_eq!(red, vec!["first", "third"]);

        assert!(with_group(&"green".into(), &items).is_empty());
    }
}
