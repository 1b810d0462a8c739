/// Named-entry registry shared by workspaces, macros and saved references
///
/// Entries keep insertion order. Uniqueness is checked at insertion and
/// rename time; nothing else is synchronized.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("name '{0}' already exists")]
    NameCollision(String),
    #[error("name must not be empty")]
    EmptyName,
    #[error("no entry named '{0}'")]
    NotFound(String),
}

#[derive(Debug, Clone)]
pub struct Registry<T> {
    prefix: String,
    entries: Vec<(String, T)>,
}

impl<T> Registry<T> {
    /// Empty registry whose suggested names are `<prefix><N>`.
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            entries: Vec::new(),
        }
    }

    /// `<prefix><N>` with the smallest unused N, counting from 0.
    pub fn suggest_name(&self) -> String {
        (0..)
            .map(|n| format!("{}{}", self.prefix, n))
            .find(|name| !self.contains(name))
            .unwrap_or_else(|| self.prefix.clone())
    }

    pub fn check_name(&self, name: &str) -> Result<(), RegistryError> {
        if name.is_empty() {
            Err(RegistryError::EmptyName)
        } else if self.contains(name) {
            Err(RegistryError::NameCollision(name.to_string()))
        } else {
            Ok(())
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|(n, _)| n == name)
    }

    pub fn add(&mut self, name: impl Into<String>, value: T) -> Result<(), RegistryError> {
        let name = name.into();
        self.check_name(&name)?;
        self.entries.push((name, value));
        Ok(())
    }

    /// Rename in place, keeping the entry's position.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<(), RegistryError> {
        let index = self
            .position(old)
            .ok_or_else(|| RegistryError::NotFound(old.to_string()))?;
        if old == new {
            return Ok(());
        }
        self.check_name(new)?;
        self.entries[index].0 = new.to_string();
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<T, RegistryError> {
        let index = self
            .position(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;
        Ok(self.entries.remove(index).1)
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut T> {
        self.entries.iter_mut().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_index(&self, index: usize) -> Option<(&str, &T)> {
        self.entries.get(index).map(|(n, v)| (n.as_str(), v))
    }

    pub fn get_index_mut(&mut self, index: usize) -> Option<(&str, &mut T)> {
        self.entries.get_mut(index).map(|(n, v)| (n.as_str(), v))
    }

    /// Names in insertion order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut T)> {
        self.entries.iter_mut().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggested_names_fill_gaps() {
        let mut reg: Registry<f64> = Registry::new("ref");
        assert_eq!(reg.suggest_name(), "ref0");
        reg.add("ref0", 1.0).unwrap();
        reg.add("ref1", 2.0).unwrap();
        assert_eq!(reg.suggest_name(), "ref2");
        reg.remove("ref0").unwrap();
        assert_eq!(reg.suggest_name(), "ref0");
    }

    #[test]
    fn test_names_are_unique() {
        let mut reg: Registry<u8> = Registry::new("macro");
        reg.add("a", 1).unwrap();
        assert_eq!(reg.add("a", 2), Err(RegistryError::NameCollision("a".into())));
        assert_eq!(reg.add("", 2), Err(RegistryError::EmptyName));
        reg.add("b", 2).unwrap();
        assert_eq!(reg.rename("b", "a"), Err(RegistryError::NameCollision("a".into())));
        assert_eq!(reg.get("a"), Some(&1));
    }

    #[test]
    fn test_rename_keeps_order_and_value() {
        let mut reg: Registry<u8> = Registry::new("spectrum");
        reg.add("x", 1).unwrap();
        reg.add("y", 2).unwrap();
        reg.rename("x", "z").unwrap();
        assert_eq!(reg.names(), vec!["z", "y"]);
        assert_eq!(reg.get("z"), Some(&1));
        assert!(reg.rename("x", "w").is_err());
        reg.rename("z", "z").unwrap();
    }

    #[test]
    fn test_remove_missing() {
        let mut reg: Registry<u8> = Registry::new("m");
        assert_eq!(reg.remove("nope"), Err(RegistryError::NotFound("nope".into())));
        assert!(reg.is_empty());
    }
}
