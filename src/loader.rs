//! Module loading and the prepared-module cache
//!
//! Loading runs in three steps: fingerprint the raw bytes, consult the
//! cache, and only then decode (an external collaborator behind
//! [`ModuleDecoder`]) and compile. Identical binaries across fork/exec
//! hit the cache and share one [`PreparedModule`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine as _;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use crate::exec::{prepare_module, CompileError, PreparedModule};
use crate::wasm::Module;

type Blake2b256 = Blake2b<U32>;

/// Errors surfaced while turning bytes into a prepared module.
#[derive(Debug)]
pub enum LoadError {
    /// The decoder rejected the binary.
    Decode(String),
    /// The module declares more than one linear memory.
    MultipleLinearMemories,
    /// The module decoded but failed to compile.
    Compile(CompileError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(reason) => write!(f, "decoding module: {}", reason),
            Self::MultipleLinearMemories => {
                write!(f, "more than one linear memories in module")
            }
            Self::Compile(e) => write!(f, "compiling module: {}", e),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<CompileError> for LoadError {
    fn from(e: CompileError) -> Self {
        LoadError::Compile(e)
    }
}

/// The binary decoder/validator collaborator. Implementations parse
/// and validate a `.wasm` image, resolving imports against the given
/// environment module so that the returned function index space is
/// complete (host functions included).
pub trait ModuleDecoder {
    fn decode(&self, bytes: &[u8], env: &Module) -> Result<Module, LoadError>;
}

/// Content address of a module: Blake2b-256 over the raw bytes,
/// base64url-encoded.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut h = Blake2b256::new();
    h.update(bytes);
    URL_SAFE.encode(h.finalize())
}

struct CacheInner {
    entries: HashMap<String, Arc<PreparedModule>>,
    /// Access order, most recent last.
    order: Vec<String>,
    cap: usize,
}

/// Bounded cache of prepared modules keyed by fingerprint, with LRU
/// eviction.
pub struct ModuleCache {
    inner: Mutex<CacheInner>,
}

impl ModuleCache {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
                cap,
            }),
        }
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<PreparedModule>> {
        let mut inner = self.inner.lock().unwrap();
        let hit = inner.entries.get(key).cloned();
        if hit.is_some() {
            inner.order.retain(|k| k != key);
            inner.order.push(key.to_string());
        }
        hit
    }

    pub fn set(&self, key: &str, module: Arc<PreparedModule>) {
        let mut inner = self.inner.lock().unwrap();
        while inner.entries.len() >= inner.cap && !inner.entries.contains_key(key) {
            let Some(oldest) = inner.order.first().cloned() else {
                break;
            };
            inner.entries.remove(&oldest);
            inner.order.remove(0);
        }
        inner.order.retain(|k| k != key);
        inner.order.push(key.to_string());
        inner.entries.insert(key.to_string(), module);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ModuleCache {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Turns module bytes into shared prepared modules.
pub struct Loader {
    cache: Option<Arc<ModuleCache>>,
}

impl Loader {
    pub fn new(cache: Option<Arc<ModuleCache>>) -> Self {
        Self { cache }
    }

    /// Load a module: cache hit short-circuits decode and compile.
    pub fn load(
        &self,
        decoder: &dyn ModuleDecoder,
        bytes: &[u8],
        env: &Module,
    ) -> Result<Arc<PreparedModule>, LoadError> {
        let key = self.cache.as_ref().map(|cache| {
            let key = fingerprint(bytes);
            log::debug!("loader: cache key {}", key);
            (cache, key)
        });

        if let Some((cache, key)) = &key {
            if let Some(hit) = cache.lookup(key) {
                log::debug!("loader: cache hit {}", key);
                return Ok(hit);
            }
        }

        let module = decoder.decode(bytes, env)?;
        let prepared = Arc::new(prepare_module(module)?);

        if let Some((cache, key)) = &key {
            cache.set(key, Arc::clone(&prepared));
            log::debug!("loader: cached module {}", key);
        }

        Ok(prepared)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::wasm::Module;

    struct CountingDecoder {
        calls: AtomicUsize,
    }

    impl ModuleDecoder for CountingDecoder {
        fn decode(&self, _bytes: &[u8], _env: &Module) -> Result<Module, LoadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Module::new())
        }
    }

    #[test]
    fn test_fingerprint_is_stable_and_distinct() {
        let a = fingerprint(b"module-a");
        let b = fingerprint(b"module-b");
        assert_eq!(a, fingerprint(b"module-a"));
        assert_ne!(a, b);
        // base64url of 32 bytes
        assert_eq!(a.len(), 44);
        assert!(!a.contains('/') && !a.contains('+'));
    }

    #[test]
    fn test_identical_bytes_decode_once() {
        let decoder = CountingDecoder {
            calls: AtomicUsize::new(0),
        };
        let cache = Arc::new(ModuleCache::new(10));
        let loader = Loader::new(Some(cache));
        let env = Module::new();

        let first = loader.load(&decoder, b"same", &env).unwrap();
        let second = loader.load(&decoder, b"same", &env).unwrap();

        assert_eq!(decoder.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_uncached_loader_decodes_every_time() {
        let decoder = CountingDecoder {
            calls: AtomicUsize::new(0),
        };
        let loader = Loader::new(None);
        let env = Module::new();

        loader.load(&decoder, b"same", &env).unwrap();
        loader.load(&decoder, b"same", &env).unwrap();
        assert_eq!(decoder.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cache_evicts_least_recently_used() {
        let cache = ModuleCache::new(2);
        let m = |_: ()| Arc::new(prepare_module(Module::new()).unwrap());

        cache.set("a", m(()));
        cache.set("b", m(()));
        // Touch "a" so "b" becomes the eviction candidate.
        assert!(cache.lookup("a").is_some());
        cache.set("c", m(()));

        assert!(cache.lookup("a").is_some());
        assert!(cache.lookup("b").is_none());
        assert!(cache.lookup("c").is_some());
        assert_eq!(cache.len(), 2);
    }
}
