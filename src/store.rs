//! Content-addressed storage of immutable byte blobs and directory trees.
//!
//! Blobs are keyed by their BLAKE3 digest; directories are Merkle nodes
//! (name → child digest) canonically encoded with CBOR and stored as
//! ordinary blobs. Content is never mutated in place: all writes are
//! insert-if-absent, so concurrent readers never observe a partial entry.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::{Arc, RwLock};

use camino::{Utf8Path, Utf8PathBuf};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::hash::Hash32;

/// A fingerprint identifying an immutable blob or directory tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest {
    pub hash: Hash32,
    pub size: u64,
}

/// One child of a directory tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub digest: Digest,
    pub is_dir: bool,
}

/// A directory tree node: child name → entry. `BTreeMap` keeps the encoded
/// form canonical, so identical directories always share one digest.
pub type TreeNode = BTreeMap<String, TreeEntry>;

/// Process-wide content-addressed store.
#[derive(Default)]
pub struct Store {
    blobs: RwLock<HashMap<Hash32, Arc<[u8]>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a blob, returning its digest. Identical content always yields
    /// the identical digest; a colliding hash over different content would
    /// be a store-integrity violation and aborts rather than overwrite.
    pub fn put(&self, bytes: &[u8]) -> Digest {
        let hash = Hash32::hash(bytes);
        let size = bytes.len() as u64;

        {
            let blobs = self.blobs.read().unwrap();
            if let Some(existing) = blobs.get(&hash) {
                assert_eq!(
                    existing.len() as u64,
                    size,
                    "store integrity violation: digest collision on {}",
                    hash.to_hex(),
                );
                return Digest { hash, size };
            }
        }

        self.blobs
            .write()
            .unwrap()
            .entry(hash)
            .or_insert_with(|| Arc::from(bytes));

        Digest { hash, size }
    }

    pub fn get(&self, digest: &Digest) -> Result<Arc<[u8]>, StoreError> {
        self.blobs
            .read()
            .unwrap()
            .get(&digest.hash)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(digest.hash.to_hex()))
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.read().unwrap().contains_key(&digest.hash)
    }

    /// Stores a directory node, returning the digest of its canonical
    /// encoding. Children must already be stored.
    pub fn put_tree(&self, node: &TreeNode) -> Result<Digest, StoreError> {
        let mut buf = Vec::new();
        ciborium::into_writer(node, &mut buf).map_err(|e| StoreError::Encode(e.to_string()))?;
        Ok(self.put(&buf))
    }

    pub fn get_tree(&self, digest: &Digest) -> Result<TreeNode, StoreError> {
        let bytes = self.get(digest)?;
        ciborium::from_reader(bytes.as_ref())
            .map_err(|_| StoreError::Decode(digest.hash.to_hex()))
    }

    /// The digest of an empty directory.
    pub fn empty_tree(&self) -> Digest {
        // Encoding an empty map cannot fail.
        self.put_tree(&TreeNode::new()).unwrap()
    }

    /// Captures filesystem content under `root` into a directory tree.
    ///
    /// `paths` are relative to `root`; directories are walked recursively,
    /// paths that don't exist are omitted from the result. File contents
    /// are hashed in parallel.
    pub fn snapshot(&self, root: &Utf8Path, paths: &[Utf8PathBuf]) -> Result<Digest, StoreError> {
        let mut files = Vec::new();
        for path in paths {
            collect_files(root, path, &mut files)?;
        }
        files.sort();
        files.dedup();

        let blobs: Vec<(Utf8PathBuf, Digest)> = files
            .par_iter()
            .map(|rel| -> Result<_, StoreError> {
                let bytes = fs::read(root.join(rel))?;
                Ok((rel.clone(), self.put(&bytes)))
            })
            .collect::<Result<_, _>>()?;

        let mut tree = DirBuilder::default();
        for (rel, digest) in &blobs {
            tree.insert(rel, *digest);
        }
        tree.write(self)
    }

    /// Writes a directory tree back out under `dest`.
    pub fn materialize(&self, digest: &Digest, dest: &Utf8Path) -> Result<(), StoreError> {
        fs::create_dir_all(dest)?;

        for (name, entry) in self.get_tree(digest)? {
            let path = dest.join(&name);
            if entry.is_dir {
                self.materialize(&entry.digest, &path)?;
            } else {
                fs::write(&path, self.get(&entry.digest)?)?;
            }
        }

        Ok(())
    }
}

fn collect_files(
    root: &Utf8Path,
    rel: &Utf8Path,
    acc: &mut Vec<Utf8PathBuf>,
) -> Result<(), StoreError> {
    let full = root.join(rel);

    if full.is_dir() {
        for child in full.read_dir_utf8()? {
            let child = child?;
            collect_files(root, &rel.join(child.file_name()), acc)?;
        }
    } else if full.is_file() {
        acc.push(rel.to_owned());
    }

    Ok(())
}

/// Intermediate nested layout used to assemble Merkle nodes bottom-up.
#[derive(Default)]
struct DirBuilder {
    files: BTreeMap<String, Digest>,
    dirs: BTreeMap<String, DirBuilder>,
}

impl DirBuilder {
    fn insert(&mut self, rel: &Utf8Path, digest: Digest) {
        let mut components = rel.components();
        let Some(first) = components.next() else {
            return;
        };

        let rest = components.as_path();
        if rest.as_str().is_empty() {
            self.files.insert(first.as_str().to_owned(), digest);
        } else {
            self.dirs
                .entry(first.as_str().to_owned())
                .or_default()
                .insert(rest, digest);
        }
    }

    fn write(&self, store: &Store) -> Result<Digest, StoreError> {
        let mut node = TreeNode::new();

        for (name, digest) in &self.files {
            node.insert(
                name.clone(),
                TreeEntry {
                    digest: *digest,
                    is_dir: false,
                },
            );
        }

        for (name, dir) in &self.dirs {
            node.insert(
                name.clone(),
                TreeEntry {
                    digest: dir.write(store)?,
                    is_dir: true,
                },
            );
        }

        store.put_tree(&node)
    }
}
