//! vec0 extension registration and vector byte plumbing.
//!
//! Vectors travel to SQLite as little-endian f32 BLOBs. A per-dimension
//! buffer pool recycles scratch `Vec<f32>` allocations; released buffers
//! are zeroed before reuse, and the emitted BLOB always owns its own bytes
//! so pooled storage is never aliased by a bound parameter.

use std::collections::HashMap;
use std::sync::{Mutex, Once, OnceLock};

use rusqlite::ffi::sqlite3_auto_extension;
use sqlite_vec::sqlite3_vec_init;
use tracing::debug;

use vellum_core::errors::{VellumError, VellumResult};

static VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension process-wide, exactly once, before
/// any connection that needs vec0 virtual tables is opened.
///
/// # Safety
///
/// `sqlite3_vec_init` is the extension entry point exported by the
/// `sqlite-vec` crate with the signature `sqlite3_auto_extension`
/// expects; the transmute only adapts the declared parameter list. This
/// follows the registration pattern from the crate's own tests.
pub fn register_vector_extension() {
    VEC_INIT.call_once(|| {
        unsafe {
            sqlite3_auto_extension(Some(std::mem::transmute::<
                *const (),
                unsafe extern "C" fn(
                    *mut rusqlite::ffi::sqlite3,
                    *mut *mut std::os::raw::c_char,
                    *const rusqlite::ffi::sqlite3_api_routines,
                ) -> std::os::raw::c_int,
            >(sqlite3_vec_init as *const ())));
        }
        debug!("sqlite-vec extension registered");
    });
}

/// Encode a vector as a little-endian f32 BLOB. The returned buffer owns
/// its bytes.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decode a little-endian f32 BLOB back into a vector.
pub fn blob_to_vector(blob: &[u8]) -> VellumResult<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(VellumError::validation(format!(
            "vector blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Maximum pooled buffers per dimension.
const POOL_LIMIT_PER_DIM: usize = 16;

/// Size-bounded pool of scratch vectors, keyed by dimension.
pub struct VectorBufferPool {
    buffers: Mutex<HashMap<usize, Vec<Vec<f32>>>>,
}

impl VectorBufferPool {
    pub fn new() -> VectorBufferPool {
        VectorBufferPool {
            buffers: Mutex::new(HashMap::new()),
        }
    }

    /// Take a zeroed buffer of `dimensions` length.
    pub fn acquire(&self, dimensions: usize) -> Vec<f32> {
        if let Ok(mut pools) = self.buffers.lock() {
            if let Some(buf) = pools.get_mut(&dimensions).and_then(Vec::pop) {
                return buf;
            }
        }
        vec![0.0; dimensions]
    }

    /// Return a buffer to the pool. The contents are zeroed before the
    /// buffer becomes reusable.
    pub fn release(&self, mut buffer: Vec<f32>) {
        buffer.iter_mut().for_each(|v| *v = 0.0);
        if let Ok(mut pools) = self.buffers.lock() {
            let slot = pools.entry(buffer.len()).or_default();
            if slot.len() < POOL_LIMIT_PER_DIM {
                slot.push(buffer);
            }
        }
    }

    /// Drop all pooled buffers. Called when the last database closes.
    pub fn clear(&self) {
        if let Ok(mut pools) = self.buffers.lock() {
            pools.clear();
        }
    }
}

impl Default for VectorBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide buffer pool.
pub fn buffer_pool() -> &'static VectorBufferPool {
    static POOL: OnceLock<VectorBufferPool> = OnceLock::new();
    POOL.get_or_init(VectorBufferPool::new)
}
