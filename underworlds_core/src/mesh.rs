//! The Mesh Store - content-addressed geometry blobs.
//!
//! Blobs are keyed by a caller-supplied hash. Deduplication is only as good
//! as the hash: a `MeshHasher` must map identical geometry to the same id.

use crate::error::{Result, UwdsError};
use crate::types::{Mesh, MeshId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;

/// Hash strategy for mesh blobs.
///
/// Contract: same content ⇒ same hash.
pub trait MeshHasher: Send + Sync {
    fn hash(&self, mesh: &Mesh) -> MeshId;
}

/// Default hasher: BLAKE3 over the exact bit patterns of vertices, faces,
/// normals and material, each section prefixed by its length.
#[derive(Debug, Clone, Copy, Default)]
pub struct Blake3MeshHasher;

impl MeshHasher for Blake3MeshHasher {
    fn hash(&self, mesh: &Mesh) -> MeshId {
        let mut hasher = blake3::Hasher::new();

        hasher.update(&(mesh.vertices.len() as u64).to_le_bytes());
        for v in &mesh.vertices {
            for c in v {
                hasher.update(&c.to_le_bytes());
            }
        }

        hasher.update(&(mesh.faces.len() as u64).to_le_bytes());
        for f in &mesh.faces {
            for i in f {
                hasher.update(&i.to_le_bytes());
            }
        }

        hasher.update(&(mesh.normals.len() as u64).to_le_bytes());
        for n in &mesh.normals {
            for c in n {
                hasher.update(&c.to_le_bytes());
            }
        }

        for c in &mesh.material.diffuse {
            hasher.update(&c.to_le_bytes());
        }

        MeshId(hasher.finalize().to_hex().to_string())
    }
}

/// Storage backend for mesh blobs.
///
/// Implementations must be thread-safe. `put` is idempotent.
pub trait MeshStore: Send + Sync {
    fn has(&self, id: &MeshId) -> bool;

    fn get(&self, id: &MeshId) -> Result<Mesh>;

    /// Stores a blob. Returns false if the id was already present, in which
    /// case the stored copy is kept.
    fn put(&self, id: MeshId, mesh: Mesh) -> Result<bool>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Volatile mesh store.
#[derive(Debug, Default)]
pub struct InMemoryMeshStore {
    meshes: RwLock<HashMap<MeshId, Mesh>>,
}

impl InMemoryMeshStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MeshStore for InMemoryMeshStore {
    fn has(&self, id: &MeshId) -> bool {
        self.meshes.read().contains_key(id)
    }

    fn get(&self, id: &MeshId) -> Result<Mesh> {
        self.meshes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| UwdsError::not_found(format!("mesh {}", id)))
    }

    fn put(&self, id: MeshId, mesh: Mesh) -> Result<bool> {
        if id.is_empty() {
            return Err(UwdsError::invalid("mesh id must not be empty"));
        }
        let mut meshes = self.meshes.write();
        if meshes.contains_key(&id) {
            return Ok(false);
        }
        meshes.insert(id, mesh);
        Ok(true)
    }

    fn len(&self) -> usize {
        self.meshes.read().len()
    }
}

/// Sled-based persistent mesh store
///
/// Uses an embedded key-value database for durability. Blobs are stored as
/// JSON under their hash.
pub struct SledMeshStore {
    db: sled::Db,
}

impl SledMeshStore {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| UwdsError::Storage(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Create a temporary store, removed on drop
    pub fn open_temp() -> Result<Self> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| UwdsError::Storage(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self { db })
    }
}

impl MeshStore for SledMeshStore {
    fn has(&self, id: &MeshId) -> bool {
        self.db.contains_key(id.as_str()).unwrap_or(false)
    }

    fn get(&self, id: &MeshId) -> Result<Mesh> {
        let bytes = self
            .db
            .get(id.as_str())
            .map_err(|e| UwdsError::Storage(format!("Read failed: {}", e)))?
            .ok_or_else(|| UwdsError::not_found(format!("mesh {}", id)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| UwdsError::Storage(format!("Corrupt mesh {}: {}", id, e)))
    }

    fn put(&self, id: MeshId, mesh: Mesh) -> Result<bool> {
        if id.is_empty() {
            return Err(UwdsError::invalid("mesh id must not be empty"));
        }
        let bytes = serde_json::to_vec(&mesh)
            .map_err(|e| UwdsError::Storage(format!("Encode failed: {}", e)))?;
        let previous = self
            .db
            .compare_and_swap(id.as_str(), None as Option<&[u8]>, Some(bytes))
            .map_err(|e| UwdsError::Storage(format!("Insert failed: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| UwdsError::Storage(format!("Flush failed: {}", e)))?;
        Ok(previous.is_ok())
    }

    fn len(&self) -> usize {
        self.db.len()
    }
}
