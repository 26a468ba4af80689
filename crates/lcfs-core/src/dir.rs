//! Directory bodies.
//!
//! Small directories keep a linear entry list; once a directory grows past
//! `LC_DIR_HASH_THRESHOLD` entries it converts to name-hash buckets so
//! lookup stays O(1) for wide directories. Bodies are shared between a
//! parent layer and its clones via `Arc`; mutation goes through
//! `Arc::make_mut`, which deep-copies a shared body first.

use lcfs_error::{LcError, Result};
use lcfs_types::{FileKind, Ino, LC_DIRCACHE_SIZE, LC_DIR_HASH_THRESHOLD};

/// Marker byte stored in directory records for each file kind, matching
/// the `d_type` values the transport expects.
#[must_use]
pub fn dirent_kind(mode: u32) -> u8 {
    use lcfs_types::{S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK};
    match mode & S_IFMT {
        S_IFIFO => 1,
        S_IFCHR => 2,
        S_IFDIR => 4,
        S_IFBLK => 6,
        S_IFREG => 8,
        S_IFLNK => 10,
        S_IFSOCK => 12,
        _ => 0,
    }
}

/// Reverse of `dirent_kind`, for rebuilding in-memory state from disk.
#[must_use]
pub fn kind_from_dirent(kind: u8) -> FileKind {
    match kind {
        4 => FileKind::Directory,
        8 => FileKind::Regular,
        10 => FileKind::Symlink,
        _ => FileKind::Special,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Vec<u8>,
    pub ino: Ino,
    pub kind: u8,
}

fn name_hash(name: &[u8]) -> usize {
    // djb2.
    let mut h: u64 = 5381;
    for &b in name {
        h = h.wrapping_mul(33).wrapping_add(u64::from(b));
    }
    h as usize % LC_DIRCACHE_SIZE
}

/// A directory body: linear for small directories, hashed for wide ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirBody {
    Linear(Vec<DirEntry>),
    Hashed { buckets: Vec<Vec<DirEntry>>, count: usize },
}

impl Default for DirBody {
    fn default() -> Self {
        Self::Linear(Vec::new())
    }
}

impl DirBody {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Linear(entries) => entries.len(),
            Self::Hashed { count, .. } => *count,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn lookup(&self, name: &[u8]) -> Option<&DirEntry> {
        match self {
            Self::Linear(entries) => entries.iter().find(|e| e.name == name),
            Self::Hashed { buckets, .. } => {
                buckets[name_hash(name)].iter().find(|e| e.name == name)
            }
        }
    }

    /// Add an entry. Fails with `Exists` on a name collision.
    pub fn add(&mut self, name: &[u8], ino: Ino, kind: u8) -> Result<()> {
        if name.is_empty() || name.len() > u8::MAX as usize {
            return Err(if name.is_empty() {
                LcError::Invalid("empty name".to_owned())
            } else {
                LcError::NameTooLong
            });
        }
        if self.lookup(name).is_some() {
            return Err(LcError::Exists);
        }
        let entry = DirEntry {
            name: name.to_vec(),
            ino,
            kind,
        };
        match self {
            Self::Linear(entries) if entries.len() < LC_DIR_HASH_THRESHOLD => {
                entries.push(entry);
            }
            Self::Linear(entries) => {
                // Crossing the threshold: rehash into buckets.
                let mut buckets = vec![Vec::new(); LC_DIRCACHE_SIZE];
                let count = entries.len() + 1;
                for e in entries.drain(..) {
                    buckets[name_hash(&e.name)].push(e);
                }
                buckets[name_hash(&entry.name)].push(entry);
                *self = Self::Hashed { buckets, count };
            }
            Self::Hashed { buckets, count } => {
                buckets[name_hash(&entry.name)].push(entry);
                *count += 1;
            }
        }
        Ok(())
    }

    /// Remove an entry by name, returning it.
    pub fn remove(&mut self, name: &[u8]) -> Option<DirEntry> {
        match self {
            Self::Linear(entries) => {
                let idx = entries.iter().position(|e| e.name == name)?;
                Some(entries.remove(idx))
            }
            Self::Hashed { buckets, count } => {
                let bucket = &mut buckets[name_hash(name)];
                let idx = bucket.iter().position(|e| e.name == name)?;
                *count -= 1;
                Some(bucket.remove(idx))
            }
        }
    }

    /// Iterate entries starting at position `cookie` in a stable order.
    /// Yields `(next_cookie, entry)` pairs suitable for resumable readdir.
    pub fn iterate(&self, cookie: u64) -> impl Iterator<Item = (u64, &DirEntry)> + '_ {
        let entries: Box<dyn Iterator<Item = &DirEntry>> = match self {
            Self::Linear(entries) => Box::new(entries.iter()),
            Self::Hashed { buckets, .. } => Box::new(buckets.iter().flatten()),
        };
        entries
            .enumerate()
            .skip(cookie as usize)
            .map(|(i, e)| (i as u64 + 1, e))
    }

    /// All entries in iteration order, for persistence.
    #[must_use]
    pub fn to_records(&self) -> Vec<(Ino, u8, Vec<u8>)> {
        self.iterate(0)
            .map(|(_, e)| (e.ino, e.kind, e.name.clone()))
            .collect()
    }

    /// Rebuild from persisted records.
    #[must_use]
    pub fn from_records(records: Vec<(Ino, u8, Vec<u8>)>) -> Self {
        let mut body = Self::new();
        for (ino, kind, name) in records {
            // Collisions cannot occur in well-formed on-disk data; keep
            // the first entry if they somehow do.
            let _ = body.add(&name, ino, kind);
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(body: &mut DirBody, name: &str, ino: u64) {
        body.add(name.as_bytes(), Ino(ino), 8).unwrap();
    }

    #[test]
    fn add_lookup_remove_linear() {
        let mut body = DirBody::new();
        add(&mut body, "a", 2);
        add(&mut body, "b", 3);
        assert_eq!(body.len(), 2);
        assert_eq!(body.lookup(b"a").unwrap().ino, Ino(2));
        assert!(body.lookup(b"c").is_none());

        let removed = body.remove(b"a").unwrap();
        assert_eq!(removed.ino, Ino(2));
        assert!(body.lookup(b"a").is_none());
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn duplicate_name_is_exists() {
        let mut body = DirBody::new();
        add(&mut body, "a", 2);
        assert!(matches!(
            body.add(b"a", Ino(9), 8),
            Err(LcError::Exists)
        ));
    }

    #[test]
    fn converts_to_hashed_past_threshold() {
        let mut body = DirBody::new();
        for i in 0..=LC_DIR_HASH_THRESHOLD {
            add(&mut body, &format!("f{i:04}"), 100 + i as u64);
        }
        assert!(matches!(body, DirBody::Hashed { .. }));
        assert_eq!(body.len(), LC_DIR_HASH_THRESHOLD + 1);
        // Every entry still resolves.
        for i in 0..=LC_DIR_HASH_THRESHOLD {
            let e = body.lookup(format!("f{i:04}").as_bytes()).unwrap();
            assert_eq!(e.ino, Ino(100 + i as u64));
        }
    }

    #[test]
    fn wide_directory_remove_half() {
        let mut body = DirBody::new();
        for i in 0..2048 {
            add(&mut body, &format!("f{i:04}"), 100 + i);
        }
        assert_eq!(body.lookup(b"f1234").unwrap().ino, Ino(1334));
        for i in (0..2048).step_by(2) {
            assert!(body.remove(format!("f{i:04}").as_bytes()).is_some());
        }
        assert_eq!(body.len(), 1024);
        let names: Vec<String> = body
            .iterate(0)
            .map(|(_, e)| String::from_utf8(e.name.clone()).unwrap())
            .collect();
        assert_eq!(names.len(), 1024);
        assert!(names.iter().all(|n| {
            let i: usize = n[1..].parse().unwrap();
            i % 2 == 1
        }));
    }

    #[test]
    fn iterate_resumes_at_cookie() {
        let mut body = DirBody::new();
        add(&mut body, "a", 2);
        add(&mut body, "b", 3);
        add(&mut body, "c", 4);

        let mut cookie = 0;
        let mut seen = Vec::new();
        loop {
            let Some((next, e)) = body.iterate(cookie).next() else {
                break;
            };
            seen.push(e.name.clone());
            cookie = next;
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn records_round_trip() {
        let mut body = DirBody::new();
        for i in 0..50 {
            add(&mut body, &format!("f{i}"), 10 + i);
        }
        let rebuilt = DirBody::from_records(body.to_records());
        assert_eq!(rebuilt.len(), 50);
        for i in 0..50 {
            assert_eq!(
                rebuilt.lookup(format!("f{i}").as_bytes()).unwrap().ino,
                Ino(10 + i)
            );
        }
    }

    #[test]
    fn rejects_bad_names() {
        let mut body = DirBody::new();
        assert!(body.add(b"", Ino(2), 8).is_err());
        assert!(matches!(
            body.add(&[b'x'; 300], Ino(2), 8),
            Err(LcError::NameTooLong)
        ));
    }
}
