// src/core/concurrency/resource.rs
use std::fmt;

/// Hierarchical name of a lockable resource, rooted at the database.
/// Each name has its own granted-lock list and wait queue in the manager.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName(Vec<String>);

impl ResourceName {
    /// The root resource.
    #[must_use]
    pub fn database() -> Self {
        Self(vec!["database".to_owned()])
    }

    /// A resource one level below this one.
    #[must_use]
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut path = self.0.clone();
        path.push(name.into());
        Self(path)
    }

    /// The enclosing resource, or `None` at the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.0.len() <= 1 {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hierarchy() {
        let db = ResourceName::database();
        let table = db.child("orders");
        let page = table.child("3");
        assert_eq!(page.to_string(), "database/orders/3");
        assert_eq!(page.parent(), Some(table.clone()));
        assert_eq!(db.parent(), None);
        assert_ne!(table, db.child("customers"));
    }
}
