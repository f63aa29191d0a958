/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

/// Ensures only types that support comparison can be inserted into the
/// Attributes struct.  This allows the use of value-based equality rather
/// than relying on pointer comparisons.
trait AttributeValueTrait: Any + Send + Sync + Debug {
    fn any_ref(&self) -> &dyn Any;
    fn dyn_eq(&self, other: &dyn AttributeValueTrait) -> bool;
    fn dyn_cmp(&self, other: &dyn AttributeValueTrait) -> Ordering;
}

impl<T: Any + Send + Sync + Eq + Ord + Debug> AttributeValueTrait for T {
    fn any_ref(&self) -> &dyn Any {
        self
    }

    fn dyn_eq(&self, other: &dyn AttributeValueTrait) -> bool {
        match other.any_ref().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }

    fn dyn_cmp(&self, other: &dyn AttributeValueTrait) -> Ordering {
        match other.any_ref().downcast_ref::<T>() {
            Some(other) => self.cmp(other),
            // Entries are keyed by TypeId, so same-type comparison is the
            // only case reachable through Attributes.
            None => TypeId::of::<T>().cmp(&other.any_ref().type_id()),
        }
    }
}

#[derive(Clone, Debug)]
struct AttributeValue(Arc<dyn AttributeValueTrait>);

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        self.0.dyn_eq(other.0.as_ref())
    }
}

impl Eq for AttributeValue {}

impl PartialOrd for AttributeValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AttributeValue {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.dyn_cmp(other.0.as_ref())
    }
}

/// An immutable collection of attributes indexed by their type.
///
/// `Attributes` provides a map-like interface where values are keyed by
/// their TypeId, and every mutation produces a new value, leaving the
/// original untouched.  This makes the type cheap to snapshot into pickers
/// and resolver updates.
///
/// Equality and ordering are structural: two `Attributes` are equal if they
/// contain the same set of values, compared by value.  Stored types must
/// implement `Any + Send + Sync + Eq + Ord + Debug`.
#[derive(Clone, Default, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attributes {
    // Sorted by TypeId.  Cloning shares the values, not the entries, which
    // keeps add/remove O(n) on typically tiny maps.
    entries: Vec<(TypeId, AttributeValue)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new Attributes with the value added.  If a value of the
    /// same type already exists, it is replaced.
    pub fn add<T: Send + Sync + Eq + Ord + Debug + 'static>(&self, value: T) -> Self {
        let id = TypeId::of::<T>();
        let value = AttributeValue(Arc::new(value));
        let mut entries = self.entries.clone();
        match entries.binary_search_by_key(&id, |(k, _)| *k) {
            Ok(i) => entries[i].1 = value,
            Err(i) => entries.insert(i, (id, value)),
        }
        Attributes { entries }
    }

    /// Gets a reference to a value of type T, if present.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        let id = TypeId::of::<T>();
        self.entries
            .binary_search_by_key(&id, |(k, _)| *k)
            .ok()
            .and_then(|i| self.entries[i].1.0.any_ref().downcast_ref())
    }

    /// Returns a new Attributes with the value of type T removed.
    pub fn remove<T: 'static>(&self) -> Self {
        let id = TypeId::of::<T>();
        let mut entries = self.entries.clone();
        if let Ok(i) = entries.binary_search_by_key(&id, |(k, _)| *k) {
            entries.remove(i);
        }
        Attributes { entries }
    }

    /// Returns a new Attributes containing the values of both maps.  Values
    /// from `other` win when both contain the same type.
    pub fn union(&self, other: &Attributes) -> Self {
        let mut merged = self.clone();
        for (id, value) in &other.entries {
            match merged.entries.binary_search_by_key(id, |(k, _)| *k) {
                Ok(i) => merged.entries[i].1 = value.clone(),
                Err(i) => merged.entries.insert(i, (*id, value.clone())),
            }
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_equality() {
        let a1 = Attributes::new().add(10i32);
        let a2 = Attributes::new().add(10i32);
        let a3 = Attributes::new().add(11i32);
        assert_eq!(a1, a2);
        assert_ne!(a1, a3);
        assert_ne!(a1, a1.add("foo".to_string()));
    }

    #[test]
    fn add_get_remove() {
        let attrs = Attributes::new().add(42i32).add("hello".to_string());
        assert_eq!(attrs.get::<i32>(), Some(&42));
        assert_eq!(attrs.get::<String>(), Some(&"hello".to_string()));
        assert_eq!(attrs.get::<bool>(), None);

        let removed = attrs.remove::<i32>();
        assert_eq!(removed.get::<i32>(), None);
        assert_eq!(removed.get::<String>(), Some(&"hello".to_string()));
        // The original is unchanged.
        assert_eq!(attrs.get::<i32>(), Some(&42));
    }

    #[test]
    fn union_prefers_other() {
        let a1 = Attributes::new().add(10i32).add(20u32);
        let a2 = Attributes::new().add(30i64).add(40i32);
        let merged = a1.union(&a2);
        assert_eq!(merged.get::<i32>(), Some(&40));
        assert_eq!(merged.get::<u32>(), Some(&20));
        assert_eq!(merged.get::<i64>(), Some(&30));
        assert_eq!(a1.get::<i32>(), Some(&10));
    }

    #[test]
    fn overwrite_is_persistent() {
        let a1 = Attributes::new().add(10i32);
        let a2 = a1.add(20i32);
        assert_eq!(a1.get::<i32>(), Some(&10));
        assert_eq!(a2.get::<i32>(), Some(&20));
    }
}
