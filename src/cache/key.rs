//! Request fingerprinting for the response cache.

/// 64-bit cache key over `(method, target, body)`.
///
/// A `:` separator is hashed between the fields so that moving bytes across a
/// field boundary always changes the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey(pub u64);

impl CacheKey {
    pub fn hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

pub fn generate_cache_key(method: &str, target: &str, body: &[u8]) -> CacheKey {
    let mut hash = Fnv1a::new();
    hash.update(method.as_bytes());
    hash.update(b":");
    hash.update(target.as_bytes());
    hash.update(b":");
    hash.update(body);
    CacheKey(hash.digest())
}

/// True when a `Cache-Control` header asks the gateway not to serve or store
/// a cached response (`no-cache` or `no-store`, compared case-insensitively).
pub fn should_bypass_cache(cache_control: &str) -> bool {
    if cache_control.is_empty() {
        return false;
    }
    let lower = cache_control.to_ascii_lowercase();
    lower.contains("no-cache") || lower.contains("no-store")
}

/// Incremental FNV-1a 64.
struct Fnv1a {
    hash: u64,
}

impl Fnv1a {
    fn new() -> Self {
        Self {
            hash: 0xcbf29ce484222325,
        }
    }

    fn update(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.hash ^= u64::from(*b);
            self.hash = self.hash.wrapping_mul(0x100000001b3);
        }
    }

    fn digest(&self) -> u64 {
        self.hash
    }
}
