use std::collections::BTreeMap;

use arbor_types::{ClientError, Condition};

#[derive(Debug, Clone)]
enum Node {
    Directory(BTreeMap<String, Node>),
    File(String),
}

type Children = BTreeMap<String, Node>;

/// In-memory hierarchical key-value tree of directories and files.
///
/// Paths are absolute and already canonical; empty components are ignored,
/// so `/` and `` both name the root.
#[derive(Debug, Clone, Default)]
pub struct MemTree {
    root: Children,
}

fn components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

fn prefix(components: &[&str], len: usize) -> String {
    format!("/{}", components[..len].join("/"))
}

fn not_found(components: &[&str], len: usize) -> ClientError {
    ClientError::Lookup(format!("Path '{}' does not exist", prefix(components, len)))
}

fn not_directory(components: &[&str], len: usize) -> ClientError {
    ClientError::Type(format!("Path '{}' is a file", prefix(components, len)))
}

/// Walks `components` as directories from `root`.
fn walk<'a>(root: &'a Children, components: &[&str]) -> Result<&'a Children, ClientError> {
    let mut dir = root;
    for (i, comp) in components.iter().enumerate() {
        dir = match dir.get(*comp) {
            Some(Node::Directory(children)) => children,
            Some(Node::File(_)) => return Err(not_directory(components, i + 1)),
            None => return Err(not_found(components, i + 1)),
        };
    }
    Ok(dir)
}

fn walk_mut<'a>(root: &'a mut Children, components: &[&str]) -> Result<&'a mut Children, ClientError> {
    let mut dir = root;
    for (i, comp) in components.iter().enumerate() {
        dir = match dir.get_mut(*comp) {
            Some(Node::Directory(children)) => children,
            Some(Node::File(_)) => return Err(not_directory(components, i + 1)),
            None => return Err(not_found(components, i + 1)),
        };
    }
    Ok(dir)
}

impl MemTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `ConditionNotMet` unless `condition` is unset or holds.
    pub fn check_condition(&self, condition: &Condition) -> Result<(), ClientError> {
        if !condition.is_set() {
            return Ok(());
        }
        match self.read(&condition.path) {
            Ok(value) if value == condition.expected_value => Ok(()),
            Ok(value) => Err(ClientError::ConditionNotMet(format!(
                "Path '{}' has value '{}', not '{}' as required",
                condition.path, value, condition.expected_value
            ))),
            Err(err) => Err(ClientError::ConditionNotMet(format!(
                "Could not read value at path '{}': {}",
                condition.path, err
            ))),
        }
    }

    /// Creates `path` and any missing parents. Existing directories are fine.
    pub fn make_directory(&mut self, path: &str) -> Result<(), ClientError> {
        let comps = components(path);
        // Validate before creating anything so a failure leaves no partial parents.
        let mut dir = &self.root;
        for (i, comp) in comps.iter().enumerate() {
            match dir.get(*comp) {
                Some(Node::Directory(children)) => dir = children,
                Some(Node::File(_)) => return Err(not_directory(&comps, i + 1)),
                None => break,
            }
        }
        let mut dir = &mut self.root;
        for comp in &comps {
            let node = dir
                .entry((*comp).to_string())
                .or_insert_with(|| Node::Directory(Children::new()));
            dir = match node {
                Node::Directory(children) => children,
                Node::File(_) => return Err(ClientError::Type(format!("Path '{path}' is a file"))),
            };
        }
        Ok(())
    }

    /// Sorted children of `path`; directories carry a trailing `/`.
    pub fn list_directory(&self, path: &str) -> Result<Vec<String>, ClientError> {
        let children = walk(&self.root, &components(path))?;
        Ok(children
            .iter()
            .map(|(name, node)| match node {
                Node::Directory(_) => format!("{name}/"),
                Node::File(_) => name.clone(),
            })
            .collect())
    }

    /// Removes `path` and everything below it. Absent paths are not an error.
    pub fn remove_directory(&mut self, path: &str) -> Result<(), ClientError> {
        let comps = components(path);
        let Some((last, parents)) = comps.split_last() else {
            self.root.clear();
            return Ok(());
        };
        let parent = match walk_mut(&mut self.root, parents) {
            Ok(parent) => parent,
            Err(ClientError::Lookup(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        match parent.get(*last) {
            None => Ok(()),
            Some(Node::File(_)) => Err(ClientError::Type(format!("Path '{path}' is a file"))),
            Some(Node::Directory(_)) => {
                parent.remove(*last);
                Ok(())
            }
        }
    }

    /// Writes `contents` to the file at `path`. The parent must exist.
    pub fn write(&mut self, path: &str, contents: &str) -> Result<(), ClientError> {
        let comps = components(path);
        let Some((last, parents)) = comps.split_last() else {
            return Err(ClientError::Type(format!("Path '{path}' is a directory")));
        };
        let parent = walk_mut(&mut self.root, parents)?;
        match parent.get_mut(*last) {
            Some(Node::Directory(_)) => Err(ClientError::Type(format!("Path '{path}' is a directory"))),
            Some(Node::File(existing)) => {
                *existing = contents.to_string();
                Ok(())
            }
            None => {
                parent.insert((*last).to_string(), Node::File(contents.to_string()));
                Ok(())
            }
        }
    }

    pub fn read(&self, path: &str) -> Result<String, ClientError> {
        let comps = components(path);
        let Some((last, parents)) = comps.split_last() else {
            return Err(ClientError::Type(format!("Path '{path}' is a directory")));
        };
        let parent = walk(&self.root, parents)?;
        match parent.get(*last) {
            Some(Node::File(contents)) => Ok(contents.clone()),
            Some(Node::Directory(_)) => Err(ClientError::Type(format!("Path '{path}' is a directory"))),
            None => Err(ClientError::Lookup(format!("Path '{path}' does not exist"))),
        }
    }

    /// Removes the file at `path`. Absent files are not an error.
    pub fn remove_file(&mut self, path: &str) -> Result<(), ClientError> {
        let comps = components(path);
        let Some((last, parents)) = comps.split_last() else {
            return Err(ClientError::Type(format!("Path '{path}' is a directory")));
        };
        let parent = match walk_mut(&mut self.root, parents) {
            Ok(parent) => parent,
            Err(ClientError::Lookup(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        match parent.get(*last) {
            None => Ok(()),
            Some(Node::Directory(_)) => Err(ClientError::Type(format!("Path '{path}' is a directory"))),
            Some(Node::File(_)) => {
                parent.remove(*last);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_directory_creates_parents() {
        let mut tree = MemTree::new();
        tree.make_directory("/a/b/c").unwrap();
        assert_eq!(tree.list_directory("/").unwrap(), vec!["a/"]);
        assert_eq!(tree.list_directory("/a/b").unwrap(), vec!["c/"]);
        tree.make_directory("/a/b").unwrap();
    }

    #[test]
    fn test_make_directory_through_file_is_type_error() {
        let mut tree = MemTree::new();
        tree.write("/f", "x").unwrap();
        let err = tree.make_directory("/f/sub").unwrap_err();
        assert!(matches!(err, ClientError::Type(_)), "{err:?}");
        assert_eq!(tree.list_directory("/").unwrap(), vec!["f"]);
    }

    #[test]
    fn test_list_sorts_and_marks_directories() {
        let mut tree = MemTree::new();
        tree.make_directory("/zeta").unwrap();
        tree.write("/beta", "1").unwrap();
        tree.make_directory("/alpha").unwrap();
        assert_eq!(tree.list_directory("/").unwrap(), vec!["alpha/", "beta", "zeta/"]);
    }

    #[test]
    fn test_list_missing_or_file() {
        let mut tree = MemTree::new();
        tree.write("/f", "").unwrap();
        assert!(matches!(tree.list_directory("/nope"), Err(ClientError::Lookup(_))));
        assert!(matches!(tree.list_directory("/f"), Err(ClientError::Type(_))));
    }

    #[test]
    fn test_write_requires_parent() {
        let mut tree = MemTree::new();
        let err = tree.write("/missing/file", "v").unwrap_err();
        assert!(matches!(err, ClientError::Lookup(_)));
        tree.make_directory("/d").unwrap();
        assert!(matches!(tree.write("/d", "v"), Err(ClientError::Type(_))));
        tree.write("/d/file", "v1").unwrap();
        tree.write("/d/file", "v2").unwrap();
        assert_eq!(tree.read("/d/file").unwrap(), "v2");
    }

    #[test]
    fn test_read_errors() {
        let mut tree = MemTree::new();
        tree.make_directory("/d").unwrap();
        assert!(matches!(tree.read("/d"), Err(ClientError::Type(_))));
        assert!(matches!(tree.read("/d/x"), Err(ClientError::Lookup(_))));
        assert!(matches!(tree.read("/"), Err(ClientError::Type(_))));
    }

    #[test]
    fn test_removes_are_idempotent() {
        let mut tree = MemTree::new();
        tree.make_directory("/d/e").unwrap();
        tree.write("/d/e/f", "x").unwrap();
        tree.remove_directory("/d").unwrap();
        tree.remove_directory("/d").unwrap();
        tree.remove_directory("/never/existed").unwrap();
        tree.remove_file("/d/e/f").unwrap();
        assert!(tree.list_directory("/").unwrap().is_empty());
    }

    #[test]
    fn test_remove_kind_mismatch() {
        let mut tree = MemTree::new();
        tree.make_directory("/d").unwrap();
        tree.write("/f", "x").unwrap();
        assert!(matches!(tree.remove_file("/d"), Err(ClientError::Type(_))));
        assert!(matches!(tree.remove_directory("/f"), Err(ClientError::Type(_))));
    }

    #[test]
    fn test_remove_root_clears_everything() {
        let mut tree = MemTree::new();
        tree.make_directory("/a").unwrap();
        tree.write("/b", "x").unwrap();
        tree.remove_directory("/").unwrap();
        assert!(tree.list_directory("/").unwrap().is_empty());
    }

    #[test]
    fn test_condition_checks_file_value() {
        let mut tree = MemTree::new();
        assert!(tree.check_condition(&Condition::default()).is_ok());
        tree.write("/lock", "held").unwrap();
        assert!(tree.check_condition(&Condition::new("/lock", "held")).is_ok());
        let err = tree.check_condition(&Condition::new("/lock", "free")).unwrap_err();
        assert_eq!(
            err.message(),
            "Path '/lock' has value 'held', not 'free' as required"
        );
        let err = tree.check_condition(&Condition::new("/absent", "")).unwrap_err();
        assert!(matches!(err, ClientError::ConditionNotMet(_)));
    }
}
