//! Ref-counted resource tables.
//!
//! Every resource id handed out by a feature system (textures, meshes, materials, ...)
//! is a key into a [`ResourceRegistry`]. Keys are derived from the resource's source
//! path and name, so repeated loads of the same asset resolve to one entry whose
//! reference count grows instead of uploading the data again.

use crate::error::{Error, Result};
use hashbrown::HashMap;

struct Entry<R> {
    source: String,
    ref_count: u32,
    resource: Option<R>,
}

/// A resource still referenced when its registry was torn down.
#[derive(Debug)]
pub struct LiveResource<R> {
    pub key: u64,
    pub source: String,
    pub ref_count: u32,
    pub resource: R,
}

/// Table of ref-counted resources keyed by content key.
pub struct ResourceRegistry<R> {
    kind: &'static str,
    entries: HashMap<u64, Entry<R>>,
}

impl<R> ResourceRegistry<R> {
    /// Create an empty registry. `kind` names the resource type in diagnostics.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    /// Acquire a reference to the resource under `key`.
    ///
    /// `load` runs only when the key has no live resource; otherwise the existing
    /// entry's reference count is incremented. `source` identifies the asset and is
    /// used to reject key collisions between different assets.
    pub fn acquire<E, F>(&mut self, key: u64, source: &str, load: F) -> std::result::Result<u64, E>
    where
        F: FnOnce() -> std::result::Result<R, E>,
        E: From<Error>,
    {
        if let Some(entry) = self.entries.get_mut(&key) {
            if entry.source != source {
                return Err(Error::InvalidData(format!(
                    "{} key {key:016x} collides: '{}' vs '{source}'",
                    self.kind, entry.source
                ))
                .into());
            }
            if entry.resource.is_some() {
                entry.ref_count += 1;
                return Ok(key);
            }
        }

        let resource = load()?;
        tracing::debug!(kind = self.kind, source, "loaded resource");
        self.entries.insert(
            key,
            Entry {
                source: source.to_owned(),
                ref_count: 1,
                resource: Some(resource),
            },
        );
        Ok(key)
    }

    /// Drop one reference to `key`.
    ///
    /// Returns the resource once its last reference is gone so the caller can free
    /// whatever GPU objects back it. The entry itself is kept so a further release
    /// is reported as [`Error::ReleaseUnreferenced`].
    pub fn release(&mut self, key: u64) -> Result<Option<R>> {
        let entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| Error::NotFound(format!("{} {key:016x}", self.kind)))?;

        if entry.ref_count == 0 {
            return Err(Error::ReleaseUnreferenced(format!(
                "{} '{}'",
                self.kind, entry.source
            )));
        }

        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            tracing::debug!(kind = self.kind, source = %entry.source, "released resource");
            Ok(entry.resource.take())
        } else {
            Ok(None)
        }
    }

    /// The live resource under `key`.
    pub fn get(&self, key: u64) -> Option<&R> {
        self.entries.get(&key).and_then(|e| e.resource.as_ref())
    }

    /// Mutable access to the live resource under `key`.
    pub fn get_mut(&mut self, key: u64) -> Option<&mut R> {
        self.entries.get_mut(&key).and_then(|e| e.resource.as_mut())
    }

    /// Current reference count of `key`; zero when unknown or released.
    pub fn ref_count(&self, key: u64) -> u32 {
        self.entries.get(&key).map_or(0, |e| e.ref_count)
    }

    /// Number of resources with a nonzero reference count.
    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|e| e.resource.is_some()).count()
    }

    /// Remove every entry, returning the ones that were still referenced.
    pub fn drain_live(&mut self) -> Vec<LiveResource<R>> {
        self.entries
            .drain()
            .filter_map(|(key, entry)| {
                entry.resource.map(|resource| LiveResource {
                    key,
                    source: entry.source,
                    ref_count: entry.ref_count,
                    resource,
                })
            })
            .collect()
    }

    /// Resource type name used in diagnostics.
    pub const fn kind(&self) -> &'static str {
        self.kind
    }
}
