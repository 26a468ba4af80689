//! Extended attributes.
//!
//! A plain `(name, value)` list per inode. Clones share the list by `Arc`;
//! the first mutation in a layer copies it.

use lcfs_error::{LcError, Result};

pub const XATTR_NAME_MAX: usize = 255;
/// A record (name + value + 5-byte header) must fit one overflow block.
pub const XATTR_VALUE_MAX: usize = 3584;

/// Flag bits for `set` matching the transport's setxattr contract.
pub const XATTR_CREATE: i32 = 1;
pub const XATTR_REPLACE: i32 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XattrList {
    attrs: Vec<(String, Vec<u8>)>,
}

impl XattrList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_slice())
    }

    /// Set an attribute. `flags` may demand pure creation or replacement.
    pub fn set(&mut self, name: &str, value: &[u8], flags: i32) -> Result<()> {
        if name.is_empty() || name.len() > XATTR_NAME_MAX {
            return Err(LcError::NameTooLong);
        }
        if value.len() > XATTR_VALUE_MAX {
            return Err(LcError::Invalid("xattr value too large".to_owned()));
        }
        let existing = self.attrs.iter_mut().find(|(n, _)| n == name);
        match existing {
            Some(slot) => {
                if flags & XATTR_CREATE != 0 {
                    return Err(LcError::Exists);
                }
                slot.1 = value.to_vec();
            }
            None => {
                if flags & XATTR_REPLACE != 0 {
                    return Err(LcError::not_found(name));
                }
                self.attrs.push((name.to_owned(), value.to_vec()));
            }
        }
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        let idx = self
            .attrs
            .iter()
            .position(|(n, _)| n == name)
            .ok_or_else(|| LcError::not_found(name))?;
        self.attrs.remove(idx);
        Ok(())
    }

    /// Names in insertion order, for listxattr.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.attrs.iter().map(|(n, _)| n.as_str()).collect()
    }

    #[must_use]
    pub fn to_records(&self) -> Vec<(String, Vec<u8>)> {
        self.attrs.clone()
    }

    #[must_use]
    pub fn from_records(records: Vec<(String, Vec<u8>)>) -> Self {
        Self { attrs: records }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove() {
        let mut list = XattrList::new();
        list.set("user.k", b"v", 0).unwrap();
        assert_eq!(list.get("user.k"), Some(b"v".as_slice()));
        list.set("user.k", b"v2", 0).unwrap();
        assert_eq!(list.get("user.k"), Some(b"v2".as_slice()));
        list.remove("user.k").unwrap();
        assert!(list.get("user.k").is_none());
        assert!(list.remove("user.k").is_err());
    }

    #[test]
    fn create_and_replace_flags() {
        let mut list = XattrList::new();
        assert!(matches!(
            list.set("user.k", b"v", XATTR_REPLACE),
            Err(LcError::NotFound(_))
        ));
        list.set("user.k", b"v", XATTR_CREATE).unwrap();
        assert!(matches!(
            list.set("user.k", b"v2", XATTR_CREATE),
            Err(LcError::Exists)
        ));
        list.set("user.k", b"v2", XATTR_REPLACE).unwrap();
        assert_eq!(list.get("user.k"), Some(b"v2".as_slice()));
    }

    #[test]
    fn names_lists_in_order() {
        let mut list = XattrList::new();
        list.set("user.a", b"1", 0).unwrap();
        list.set("user.b", b"2", 0).unwrap();
        assert_eq!(list.names(), vec!["user.a", "user.b"]);
    }

    #[test]
    fn size_limits() {
        let mut list = XattrList::new();
        assert!(list.set(&"x".repeat(300), b"v", 0).is_err());
        assert!(list
            .set("user.big", &vec![0_u8; XATTR_VALUE_MAX + 1], 0)
            .is_err());
    }
}
