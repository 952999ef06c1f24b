//! Kernel source cache and monolithic program build.
//!
//! Every device owns one program. Kernel sources accumulate in the cache and
//! are compiled together in a single build; registering a new source after a
//! build invalidates it. Sources are deduplicated by content hash, with the
//! generated entry name normalized first: front-end code generators append
//! unique numeric suffixes to entry names, and stripping them keeps the
//! stored source, and therefore its hash and the vendor driver's own
//! on-disk compile cache, stable across runs that differ only in
//! non-semantic numbering.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::{debug, trace};
use opencl3::context::Context;
use opencl3::kernel::Kernel;
use opencl3::program::Program;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, Result};

/// Compiler options passed to the single program build.
const BUILD_OPTIONS: &str = "";

struct SourceEntry {
    /// Normalized entry name with the content hash appended.
    canonical: String,
    /// Source text with the entry renamed to the canonical name.
    source: String,
    /// Declared names that resolved to this entry (diagnostics only).
    aliases: Vec<String>,
}

#[derive(Default)]
struct CacheInner {
    /// Content hash -> entry. A BTreeMap so that concatenation order, and
    /// therefore the built program text, is deterministic.
    entries: BTreeMap<String, SourceEntry>,
    /// Declared or canonical entry name -> canonical entry name.
    names: FxHashMap<String, String>,
    /// `None` means dirty: a source was registered since the last build.
    built: Option<Arc<Program>>,
}

/// The per-device kernel source cache and compiled program.
pub struct ProgramCache {
    // Source-set mutation and build state share one lock: registering a
    // source and invalidating the build must be atomic.
    inner: Mutex<CacheInner>,
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramCache {
    pub fn new() -> Self {
        ProgramCache {
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Register one kernel's source text. Returns the canonical entry name
    /// to use when instantiating the kernel.
    ///
    /// If a content-identical source (after entry-name normalization) was
    /// already registered, the existing entry is reused and the declared
    /// name recorded as an alias; otherwise the new entry invalidates any
    /// previously built program.
    pub fn add_kernel_source(&self, source: &str) -> Result<String> {
        let declared = parse_entry_name(source).ok_or_else(|| {
            EngineError::InvalidKernelSource(format!(
                "no __kernel entry point found in source ({} bytes)",
                source.len()
            ))
        })?;
        let base = strip_numeric_suffix(&declared);
        let normalized = rename_identifier(source, &declared, base);
        let hash = content_hash(&normalized);
        let canonical = format!("{}_{}", base, hash);

        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(&hash) {
            trace!(
                "kernel source '{}' deduplicated onto existing entry '{}'",
                declared, entry.canonical
            );
            entry.aliases.push(declared.clone());
            let canonical = entry.canonical.clone();
            inner.names.insert(declared, canonical.clone());
            return Ok(canonical);
        }

        let stored = rename_identifier(&normalized, base, &canonical);
        debug!(
            "registered kernel source '{}' as '{}' ({} bytes)",
            declared,
            canonical,
            stored.len()
        );
        inner.entries.insert(
            hash,
            SourceEntry {
                canonical: canonical.clone(),
                source: stored,
                aliases: vec![declared.clone()],
            },
        );
        inner.names.insert(declared, canonical.clone());
        inner.names.insert(canonical.clone(), canonical.clone());
        inner.built = None; // new source invalidates the build
        Ok(canonical)
    }

    /// Resolve a declared or canonical entry name to its canonical form.
    pub fn resolve(&self, name: &str) -> Option<String> {
        self.inner.lock().unwrap().names.get(name).cloned()
    }

    /// Number of distinct compiled entry points.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Whether the current source set has been built.
    pub fn is_built(&self) -> bool {
        self.inner.lock().unwrap().built.is_some()
    }

    /// The concatenated program source in build order.
    pub fn program_source(&self) -> String {
        let inner = self.inner.lock().unwrap();
        concatenate(&inner.entries)
    }

    /// Build (or return the memoized) program containing every registered
    /// source. A build failure is fatal and carries the full source text.
    pub fn program(&self, context: &Context) -> Result<Arc<Program>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(program) = &inner.built {
            return Ok(Arc::clone(program));
        }
        let source = concatenate(&inner.entries);
        debug!(
            "building program: {} entry point(s), {} bytes",
            inner.entries.len(),
            source.len()
        );
        let program = Program::create_and_build_from_source(context, &source, BUILD_OPTIONS)
            .map_err(|e| EngineError::BuildFailed {
                detail: format!("{:?}", e),
                program_source: source.clone(),
            })?;
        let program = Arc::new(program);
        inner.built = Some(Arc::clone(&program));
        Ok(program)
    }

    /// Bind a compiled entry point. The program must already be built;
    /// a missing entry indicates a source/name mismatch and is fatal.
    pub fn create_kernel(&self, context: &Context, name: &str) -> Result<Kernel> {
        let canonical = self
            .resolve(name)
            .ok_or_else(|| EngineError::KernelNotFound(name.to_string()))?;
        let program = self.program(context)?;
        Kernel::create(&program, &canonical)
            .map_err(|_| EngineError::KernelNotFound(canonical.clone()))
    }

    /// Drop all sources and the built program.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.names.clear();
        inner.built = None;
    }
}

fn concatenate(entries: &BTreeMap<String, SourceEntry>) -> String {
    let mut out = String::new();
    for entry in entries.values() {
        out.push_str(entry.source.trim_end());
        out.push_str("\n\n");
    }
    out
}

/// First 16 hex characters of the sha256 of the normalized source.
fn content_hash(source: &str) -> String {
    let digest = Sha256::digest(source.as_bytes());
    digest
        .as_slice()
        .iter()
        .take(8)
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// Extract the declared entry name from kernel source: the identifier
/// following the first `__kernel ... void`. Generated sources contain one
/// entry point each.
fn parse_entry_name(source: &str) -> Option<String> {
    let after_kernel = &source[source.find("__kernel")? + "__kernel".len()..];
    let after_void = &after_kernel[after_kernel.find("void")? + "void".len()..];
    let name: String = after_void
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() { None } else { Some(name) }
}

/// Strip a trailing `_<digits>` suffix, the per-run unique numbering the
/// code generator appends to entry names.
fn strip_numeric_suffix(name: &str) -> &str {
    if let Some((head, tail)) = name.rsplit_once('_') {
        if !head.is_empty() && !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            return head;
        }
    }
    name
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Replace whole-identifier occurrences of `from` with `to`.
fn rename_identifier(source: &str, from: &str, to: &str) -> String {
    if from == to {
        return source.to_string();
    }
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(pos) = rest.find(from) {
        let end = pos + from.len();
        let before_ok = pos == 0 || !is_ident_byte(rest.as_bytes()[pos - 1]);
        let after_ok = end >= rest.len() || !is_ident_byte(rest.as_bytes()[end]);
        out.push_str(&rest[..pos]);
        out.push_str(if before_ok && after_ok { to } else { from });
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADD_SRC_1: &str = r#"
        __kernel void add_17(__global const float* a, __global const float* b, __global float* out) {
            int i = get_global_id(0);
            out[i] = a[i] + b[i];
        }
    "#;

    // Identical to ADD_SRC_1 except for the numeric suffix.
    const ADD_SRC_2: &str = r#"
        __kernel void add_23(__global const float* a, __global const float* b, __global float* out) {
            int i = get_global_id(0);
            out[i] = a[i] + b[i];
        }
    "#;

    const MUL_SRC: &str = r#"
        __kernel void mul_4(__global const float* a, __global float* out) {
            int i = get_global_id(0);
            out[i] = a[i] * a[i];
        }
    "#;

    #[test]
    fn test_parse_entry_name() {
        assert_eq!(parse_entry_name(ADD_SRC_1).as_deref(), Some("add_17"));
        assert_eq!(parse_entry_name("__kernel void f(int x) {}").as_deref(), Some("f"));
        assert_eq!(parse_entry_name("float helper(int x);"), None);
    }

    #[test]
    fn test_strip_numeric_suffix() {
        assert_eq!(strip_numeric_suffix("add_17"), "add");
        assert_eq!(strip_numeric_suffix("conv2d_1024"), "conv2d");
        assert_eq!(strip_numeric_suffix("plain"), "plain");
        assert_eq!(strip_numeric_suffix("mixed_1a"), "mixed_1a");
        assert_eq!(strip_numeric_suffix("_9"), "_9");
        assert_eq!(strip_numeric_suffix("trailing_"), "trailing_");
    }

    #[test]
    fn test_rename_identifier_respects_boundaries() {
        let renamed = rename_identifier("add(add_x, xadd, add)", "add", "sum");
        assert_eq!(renamed, "sum(add_x, xadd, sum)");
    }

    #[test]
    fn test_suffix_dedup_single_entry() {
        let cache = ProgramCache::new();
        let a = cache.add_kernel_source(ADD_SRC_1).unwrap();
        let b = cache.add_kernel_source(ADD_SRC_2).unwrap();
        // Content-identical after normalization: one entry, same canonical name.
        assert_eq!(a, b);
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.resolve("add_17").as_deref(), Some(a.as_str()));
        assert_eq!(cache.resolve("add_23").as_deref(), Some(a.as_str()));
    }

    #[test]
    fn test_distinct_sources_distinct_entries() {
        let cache = ProgramCache::new();
        let a = cache.add_kernel_source(ADD_SRC_1).unwrap();
        let m = cache.add_kernel_source(MUL_SRC).unwrap();
        assert_ne!(a, m);
        assert_eq!(cache.entry_count(), 2);
        assert!(a.starts_with("add_"));
        assert!(m.starts_with("mul_"));
    }

    #[test]
    fn test_canonical_name_embedded_in_source() {
        let cache = ProgramCache::new();
        let canonical = cache.add_kernel_source(ADD_SRC_1).unwrap();
        let program = cache.program_source();
        assert!(program.contains(&format!("__kernel void {}", canonical)));
        assert!(!program.contains("add_17"));
    }

    #[test]
    fn test_program_source_is_deterministic() {
        let build = |order: &[&str]| {
            let cache = ProgramCache::new();
            for src in order {
                cache.add_kernel_source(src).unwrap();
            }
            cache.program_source()
        };
        // Registration order must not affect the built program text.
        assert_eq!(build(&[ADD_SRC_1, MUL_SRC]), build(&[MUL_SRC, ADD_SRC_1]));
    }

    #[test]
    fn test_resolve_unknown_name() {
        let cache = ProgramCache::new();
        cache.add_kernel_source(ADD_SRC_1).unwrap();
        assert!(cache.resolve("nonexistent_3").is_none());
    }

    #[test]
    fn test_invalid_source_rejected() {
        let cache = ProgramCache::new();
        let err = cache.add_kernel_source("int x = 3;").unwrap_err();
        assert!(matches!(err, EngineError::InvalidKernelSource(_)));
    }

    #[test]
    fn test_clear_resets_cache() {
        let cache = ProgramCache::new();
        cache.add_kernel_source(ADD_SRC_1).unwrap();
        cache.clear();
        assert_eq!(cache.entry_count(), 0);
        assert!(cache.resolve("add_17").is_none());
    }
}
