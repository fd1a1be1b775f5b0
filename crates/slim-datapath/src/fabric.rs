//! Subscription and route tables plus forwarding resolution.
//!
//! Resolution order for a destination: local subscriptions, then remote
//! subscriptions by ascending connection id, then (only when no subscription
//! matched) routes in insertion order. The first `fanout` candidates win.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLock;
use slim_transport::ConnectionId;
use tracing::debug;

use crate::error::{DatapathError, Result};
use crate::name::Name;

/// One outbound action produced by forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Deliver to this process.
    Local,
    /// Send over the given connection.
    Remote(ConnectionId),
}

impl Action {
    /// Target connection, `None` for local delivery.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Action::Local => None,
            Action::Remote(id) => Some(*id),
        }
    }
}

impl From<Option<ConnectionId>> for Action {
    fn from(conn: Option<ConnectionId>) -> Self {
        match conn {
            Some(id) => Action::Remote(id),
            None => Action::Local,
        }
    }
}

type SubscriptionSet = BTreeMap<Option<u64>, BTreeSet<Option<ConnectionId>>>;
type RouteSet = BTreeMap<Option<u64>, Vec<ConnectionId>>;

/// The combined subscription and route tables.
///
/// Tables are indexed by the component sequence, then by instance id, so a
/// lookup touches only names with the destination's components.
#[derive(Debug, Default)]
pub struct Fabric {
    subscriptions: RwLock<HashMap<Vec<String>, SubscriptionSet>>,
    routes: RwLock<HashMap<Vec<String>, RouteSet>>,
}

impl Fabric {
    /// Empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `(name, connection)`; `None` means local delivery. Returns false
    /// when the pair was already present.
    pub fn subscribe(&self, name: &Name, connection: Option<ConnectionId>) -> bool {
        let mut subs = self.subscriptions.write();
        let inserted = subs
            .entry(name.components().to_vec())
            .or_default()
            .entry(name.id())
            .or_default()
            .insert(connection);
        if inserted {
            debug!(name = %name, connection = ?connection, "subscription added");
        }
        inserted
    }

    /// Removes a subscription; an absent pair is an error.
    pub fn unsubscribe(&self, name: &Name, connection: Option<ConnectionId>) -> Result<()> {
        let mut subs = self.subscriptions.write();
        let not_found = || DatapathError::SubscriptionNotFound {
            name: name.clone(),
            connection,
        };
        let by_id = subs.get_mut(name.components()).ok_or_else(not_found)?;
        let set = by_id.get_mut(&name.id()).ok_or_else(not_found)?;
        if !set.remove(&connection) {
            return Err(not_found());
        }
        if set.is_empty() {
            by_id.remove(&name.id());
        }
        if by_id.is_empty() {
            subs.remove(name.components());
        }
        debug!(name = %name, connection = ?connection, "subscription removed");
        Ok(())
    }

    /// Installs a route; a route that already exists keeps its position.
    pub fn set_route(&self, name: &Name, connection: ConnectionId) -> bool {
        let mut routes = self.routes.write();
        let list = routes
            .entry(name.components().to_vec())
            .or_default()
            .entry(name.id())
            .or_default();
        if list.contains(&connection) {
            return false;
        }
        list.push(connection);
        debug!(name = %name, connection, "route added");
        true
    }

    /// Removes a route; an absent route is an error.
    pub fn remove_route(&self, name: &Name, connection: ConnectionId) -> Result<()> {
        let mut routes = self.routes.write();
        let not_found = || DatapathError::RouteNotFound {
            name: name.clone(),
            connection,
        };
        let by_id = routes.get_mut(name.components()).ok_or_else(not_found)?;
        let list = by_id.get_mut(&name.id()).ok_or_else(not_found)?;
        let pos = list
            .iter()
            .position(|c| *c == connection)
            .ok_or_else(not_found)?;
        list.remove(pos);
        if list.is_empty() {
            by_id.remove(&name.id());
        }
        if by_id.is_empty() {
            routes.remove(name.components());
        }
        debug!(name = %name, connection, "route removed");
        Ok(())
    }

    /// True when at least one route matches `name`.
    pub fn has_route(&self, name: &Name) -> bool {
        self.routes
            .read()
            .get(name.components())
            .map(|by_id| by_id.contains_key(&name.id()))
            .unwrap_or(false)
    }

    /// True when exactly this `(name, connection)` pair is subscribed.
    pub fn is_subscribed(&self, name: &Name, connection: Option<ConnectionId>) -> bool {
        self.subscriptions
            .read()
            .get(name.components())
            .and_then(|by_id| by_id.get(&name.id()))
            .map(|set| set.contains(&connection))
            .unwrap_or(false)
    }

    /// Drops every subscription and route through `connection`.
    pub fn purge_connection(&self, connection: ConnectionId) -> usize {
        let mut removed = 0;
        {
            let mut subs = self.subscriptions.write();
            for by_id in subs.values_mut() {
                for set in by_id.values_mut() {
                    if set.remove(&Some(connection)) {
                        removed += 1;
                    }
                }
                by_id.retain(|_, set| !set.is_empty());
            }
            subs.retain(|_, by_id| !by_id.is_empty());
        }
        {
            let mut routes = self.routes.write();
            for by_id in routes.values_mut() {
                for list in by_id.values_mut() {
                    let before = list.len();
                    list.retain(|c| *c != connection);
                    removed += before - list.len();
                }
                by_id.retain(|_, list| !list.is_empty());
            }
            routes.retain(|_, by_id| !by_id.is_empty());
        }
        if removed > 0 {
            debug!(connection, removed, "purged connection from fabric");
        }
        removed
    }

    /// Snapshot of the subscription table, sorted.
    pub fn subscriptions(&self) -> Vec<(Name, Option<ConnectionId>)> {
        let subs = self.subscriptions.read();
        let mut out = Vec::new();
        for (components, by_id) in subs.iter() {
            for (id, set) in by_id {
                for conn in set {
                    out.push((
                        Name::from_parts(components.clone(), *id),
                        *conn,
                    ));
                }
            }
        }
        out.sort();
        out
    }

    /// Snapshot of the route table, sorted by name then insertion order.
    pub fn routes(&self) -> Vec<(Name, ConnectionId)> {
        let routes = self.routes.read();
        let mut names: Vec<(Name, Vec<ConnectionId>)> = Vec::new();
        for (components, by_id) in routes.iter() {
            for (id, list) in by_id {
                names.push((Name::from_parts(components.clone(), *id), list.clone()));
            }
        }
        names.sort_by(|a, b| a.0.cmp(&b.0));
        names
            .into_iter()
            .flat_map(|(name, list)| list.into_iter().map(move |c| (name.clone(), c)))
            .collect()
    }

    /// Resolves `destination` into at most `fanout` actions.
    pub fn forward(&self, destination: &Name, fanout: u32) -> Result<Vec<Action>> {
        self.forward_with(destination, fanout, None, |_| true)
    }

    /// Like [`Fabric::forward`], with a preferred connection tried first and a
    /// filter applied to every candidate before the route fallback is decided.
    pub fn forward_with<F>(
        &self,
        destination: &Name,
        fanout: u32,
        preferred: Option<ConnectionId>,
        allow: F,
    ) -> Result<Vec<Action>>
    where
        F: Fn(&Action) -> bool,
    {
        if fanout == 0 {
            return Err(DatapathError::InvalidArgument(
                "fanout must be at least 1".to_string(),
            ));
        }

        let mut candidates: Vec<Action> = Vec::new();
        if let Some(conn) = preferred {
            let action = Action::Remote(conn);
            if allow(&action) {
                candidates.push(action);
            }
        }

        let mut matched = self.matching_subscribers(destination, &allow);
        if matched.is_empty() {
            matched = self.matching_routes(destination, &allow);
        }
        for action in matched {
            if !candidates.contains(&action) {
                candidates.push(action);
            }
        }

        candidates.truncate(usize::try_from(fanout).unwrap_or(usize::MAX));
        if candidates.is_empty() {
            return Err(DatapathError::NoRoute {
                destination: destination.clone(),
            });
        }
        Ok(candidates)
    }

    fn matching_subscribers<F>(&self, destination: &Name, allow: &F) -> Vec<Action>
    where
        F: Fn(&Action) -> bool,
    {
        let subs = self.subscriptions.read();
        let Some(by_id) = subs.get(destination.components()) else {
            return Vec::new();
        };
        let mut local = false;
        let mut remote = BTreeSet::new();
        for (id, set) in by_id {
            if !id_matches(*id, destination.id()) {
                continue;
            }
            for conn in set {
                match conn {
                    None => local = true,
                    Some(c) => {
                        remote.insert(*c);
                    }
                }
            }
        }
        let mut out = Vec::with_capacity(remote.len() + 1);
        if local && allow(&Action::Local) {
            out.push(Action::Local);
        }
        out.extend(
            remote
                .into_iter()
                .map(Action::Remote)
                .filter(|a| allow(a)),
        );
        out
    }

    fn matching_routes<F>(&self, destination: &Name, allow: &F) -> Vec<Action>
    where
        F: Fn(&Action) -> bool,
    {
        let routes = self.routes.read();
        let Some(by_id) = routes.get(destination.components()) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for (id, list) in by_id {
            if !id_matches(*id, destination.id()) {
                continue;
            }
            for conn in list {
                let action = Action::Remote(*conn);
                if allow(&action) && !out.contains(&action) {
                    out.push(action);
                }
            }
        }
        out
    }
}

fn id_matches(entry: Option<u64>, destination: Option<u64>) -> bool {
    match (destination, entry) {
        (Some(wanted), Some(have)) => wanted == have,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dest() -> Name {
        Name::new(["org", "ns", "svc"], None).unwrap()
    }

    #[test]
    fn test_local_then_lowest_remote() {
        let fabric = Fabric::new();
        let d = dest();
        fabric.subscribe(&d, None);
        for conn in [5, 3, 9] {
            fabric.subscribe(&d, Some(conn));
        }
        let actions = fabric.forward(&d, 2).unwrap();
        assert_eq!(actions, vec![Action::Local, Action::Remote(3)]);
    }

    #[test]
    fn test_route_fallback() {
        let fabric = Fabric::new();
        let d = dest();
        fabric.set_route(&d, 7);
        assert_eq!(fabric.forward(&d, 1).unwrap(), vec![Action::Remote(7)]);
    }

    #[test]
    fn test_routes_ignored_when_subscribed() {
        let fabric = Fabric::new();
        let d = dest();
        fabric.set_route(&d, 7);
        fabric.subscribe(&d, Some(4));
        assert_eq!(
            fabric.forward(&d, crate::message::BROADCAST).unwrap(),
            vec![Action::Remote(4)]
        );
    }

    #[test]
    fn test_no_route() {
        let fabric = Fabric::new();
        let err = fabric.forward(&dest(), 1).unwrap_err();
        assert!(matches!(err, DatapathError::NoRoute { .. }));
        assert!(fabric.forward(&dest(), 4).is_err());
    }

    #[test]
    fn test_fanout_zero_rejected() {
        let fabric = Fabric::new();
        fabric.subscribe(&dest(), None);
        assert!(matches!(
            fabric.forward(&dest(), 0),
            Err(DatapathError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_instance_matching() {
        let fabric = Fabric::new();
        let d = dest();
        fabric.subscribe(&d.with_id(1), Some(1));
        fabric.subscribe(&d.with_id(2), Some(2));
        fabric.subscribe(&d, Some(3));

        assert_eq!(
            fabric.forward(&d.with_id(2), 8).unwrap(),
            vec![Action::Remote(2), Action::Remote(3)]
        );
        assert_eq!(
            fabric.forward(&d, 8).unwrap(),
            vec![Action::Remote(1), Action::Remote(2), Action::Remote(3)]
        );
    }

    #[test]
    fn test_unsubscribe_missing_is_error() {
        let fabric = Fabric::new();
        let d = dest();
        assert!(fabric.unsubscribe(&d, None).is_err());
        assert!(fabric.subscribe(&d, None));
        assert!(!fabric.subscribe(&d, None));
        fabric.unsubscribe(&d, None).unwrap();
        assert!(fabric.unsubscribe(&d, None).is_err());
        assert!(fabric.subscriptions().is_empty());
    }

    #[test]
    fn test_remove_route_missing_is_error() {
        let fabric = Fabric::new();
        let d = dest();
        assert!(matches!(
            fabric.remove_route(&d, 1),
            Err(DatapathError::RouteNotFound { .. })
        ));
        fabric.set_route(&d, 1);
        fabric.remove_route(&d, 1).unwrap();
        assert!(!fabric.has_route(&d));
    }

    #[test]
    fn test_route_insertion_order() {
        let fabric = Fabric::new();
        let d = dest();
        fabric.set_route(&d, 9);
        fabric.set_route(&d, 2);
        fabric.set_route(&d, 9);
        assert_eq!(
            fabric.forward(&d, 8).unwrap(),
            vec![Action::Remote(9), Action::Remote(2)]
        );
    }

    #[test]
    fn test_preferred_and_filter() {
        let fabric = Fabric::new();
        let d = dest();
        fabric.subscribe(&d, None);
        fabric.subscribe(&d, Some(3));
        fabric.set_route(&d, 8);

        let actions = fabric
            .forward_with(&d, 1, Some(5), |_| true)
            .unwrap();
        assert_eq!(actions, vec![Action::Remote(5)]);

        // With local and conn 3 filtered out, the route fallback applies.
        let actions = fabric
            .forward_with(&d, 8, None, |a| *a == Action::Remote(8))
            .unwrap();
        assert_eq!(actions, vec![Action::Remote(8)]);
    }

    #[test]
    fn test_purge_connection() {
        let fabric = Fabric::new();
        let d = dest();
        fabric.subscribe(&d, Some(4));
        fabric.subscribe(&d, None);
        fabric.set_route(&d, 4);
        assert_eq!(fabric.purge_connection(4), 2);
        assert_eq!(fabric.subscriptions(), vec![(d.clone(), None)]);
        assert!(fabric.routes().is_empty());
    }

    proptest! {
        #[test]
        fn prop_local_first_then_ascending(
            conns in proptest::collection::btree_set(1u64..1000, 0..20),
            local in any::<bool>(),
            fanout in 1u32..30,
        ) {
            let fabric = Fabric::new();
            let d = dest();
            if local {
                fabric.subscribe(&d, None);
            }
            for c in conns.iter().rev() {
                fabric.subscribe(&d, Some(*c));
            }

            let mut expected: Vec<Action> = Vec::new();
            if local {
                expected.push(Action::Local);
            }
            expected.extend(conns.iter().map(|c| Action::Remote(*c)));
            expected.truncate(fanout as usize);

            match fabric.forward(&d, fanout) {
                Ok(actions) => prop_assert_eq!(actions, expected),
                Err(_) => prop_assert!(expected.is_empty()),
            }
        }
    }
}
