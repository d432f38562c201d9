use std::hash::Hash;

use smallvec::SmallVec;

use crate::collections::map::HashMap;

type Scopes<V> = SmallVec<[V; 2]>;

/// Many-to-many relation between observed values and the scopes that
/// observe them. A scope is stored at most once per value.
pub struct ScopeMap<K, V> {
    map: HashMap<K, Scopes<V>>,
}

impl<K, V> Default for ScopeMap<K, V> {
    fn default() -> Self {
        Self {
            map: HashMap::default(),
        }
    }
}

impl<K: Hash + Eq + Clone, V: PartialEq + Clone> ScopeMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `false` if the pair was already present.
    pub fn add(&mut self, key: K, scope: V) -> bool {
        let scopes = self.map.entry(key).or_default();
        if scopes.contains(&scope) {
            return false;
        }
        scopes.push(scope);
        true
    }

    /// Replaces every scope of `key` with `scope`.
    pub fn set(&mut self, key: K, scope: V) {
        let scopes = self.map.entry(key).or_default();
        scopes.clear();
        scopes.push(scope);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn contains_pair(&self, key: &K, scope: &V) -> bool {
        self.map.get(key).is_some_and(|scopes| scopes.contains(scope))
    }

    pub fn for_each_scope_of(&self, key: &K, mut action: impl FnMut(&V)) {
        if let Some(scopes) = self.map.get(key) {
            for scope in scopes {
                action(scope);
            }
        }
    }

    /// Copy of the scopes of `key`, for callers that mutate the map while
    /// visiting them.
    pub fn scopes_of(&self, key: &K) -> Vec<V> {
        self.map
            .get(key)
            .map(|scopes| scopes.to_vec())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, key: &K, scope: &V) -> bool {
        let Some(scopes) = self.map.get_mut(key) else {
            return false;
        };
        let Some(index) = scopes.iter().position(|held| held == scope) else {
            return false;
        };
        scopes.remove(index);
        if scopes.is_empty() {
            self.map.remove(key);
        }
        true
    }

    pub fn remove_key(&mut self, key: &K) -> Vec<V> {
        self.map
            .remove(key)
            .map(|scopes| scopes.into_vec())
            .unwrap_or_default()
    }

    /// Removes `scope` from every value.
    pub fn remove_scope(&mut self, scope: &V) {
        self.remove_scope_if(|held| held == scope);
    }

    pub fn remove_scope_if(&mut self, mut predicate: impl FnMut(&V) -> bool) {
        self.map.retain(|_, scopes| {
            scopes.retain(|scope| !predicate(scope));
            !scopes.is_empty()
        });
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    /// Number of observed values.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}
