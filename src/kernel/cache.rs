//! Caller-owned kernel memoisation.
//!
//! Kernels are expensive to rebuild inside parametric fits where only the
//! distribution changes between iterations. The cache is keyed by the exact
//! bit pattern of every input, so two requests share an entry only when they
//! would produce bit-identical matrices.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use log::debug;
use nalgebra::DMatrix;

use crate::domain::{KernelMethod, KernelOptions, Pathway};
use crate::error::DeerResult;
use crate::kernel::builder::build_kernel_with_background;

/// Exact content key of a kernel request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelKey {
    t: Vec<u64>,
    r: Vec<u64>,
    pathways: Vec<(u64, u64, u32)>,
    background: Option<Vec<u64>>,
    method: (u8, usize, Option<u64>),
    g: [u64; 2],
    flags: (bool, bool),
}

impl KernelKey {
    pub fn new(
        t: &[f64],
        r: &[f64],
        pathways: &[Pathway],
        background: Option<&[f64]>,
        options: &KernelOptions,
    ) -> Self {
        let method = match options.method {
            KernelMethod::Fresnel => (0, 0, None),
            KernelMethod::Grid {
                knots,
                excitation_bandwidth,
            } => (1, knots, excitation_bandwidth.map(f64::to_bits)),
        };
        Self {
            t: bits(t),
            r: bits(r),
            pathways: pathways
                .iter()
                .map(|p| (p.amplitude.to_bits(), p.zero_time.to_bits(), p.harmonic))
                .collect(),
            background: background.map(bits),
            method,
            g: [options.g[0].to_bits(), options.g[1].to_bits()],
            flags: (options.integrate, options.allow_negative_amplitudes),
        }
    }

    /// 64-bit digest of the key, e.g. for logging.
    pub fn content_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }
}

fn bits(values: &[f64]) -> Vec<u64> {
    values.iter().map(|v| v.to_bits()).collect()
}

/// Memoises kernels for repeated identical requests.
#[derive(Debug, Default)]
pub struct KernelCache {
    entries: HashMap<KernelKey, Arc<DMatrix<f64>>>,
    hits: usize,
    misses: usize,
}

impl KernelCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached kernel for these inputs, building it on a miss.
    /// Build errors are returned and nothing is cached.
    pub fn get_or_build(
        &mut self,
        t: &[f64],
        r: &[f64],
        pathways: &[Pathway],
        background: Option<&[f64]>,
        options: &KernelOptions,
    ) -> DeerResult<Arc<DMatrix<f64>>> {
        let key = KernelKey::new(t, r, pathways, background, options);
        if let Some(k) = self.entries.get(&key) {
            self.hits += 1;
            return Ok(Arc::clone(k));
        }

        let kernel = Arc::new(build_kernel_with_background(
            t, r, pathways, background, options,
        )?);
        self.misses += 1;
        debug!("kernel cache miss (key {:016x})", key.content_hash());
        self.entries.insert(key, Arc::clone(&kernel));
        Ok(kernel)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(hits, misses)` since creation or the last [`clear`](Self::clear).
    pub fn stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.hits = 0;
        self.misses = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::linspace;

    #[test]
    fn identical_requests_share_an_entry() {
        let t = linspace(0.0, 2.0, 50);
        let r = linspace(2.0, 5.0, 30);
        let mut cache = KernelCache::new();
        let options = KernelOptions::default();

        let a = cache.get_or_build(&t, &r, &[], None, &options).unwrap();
        let b = cache.get_or_build(&t, &r, &[], None, &options).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.stats(), (1, 1));

        let pathways = [Pathway::new(0.4, 0.0)];
        cache.get_or_build(&t, &r, &pathways, None, &options).unwrap();
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn keys_distinguish_options() {
        let t = [0.0, 0.5];
        let r = [3.0];
        let a = KernelKey::new(&t, &r, &[], None, &KernelOptions::default());
        let b = KernelKey::new(
            &t,
            &r,
            &[],
            None,
            &KernelOptions {
                method: KernelMethod::grid(),
                ..KernelOptions::default()
            },
        );
        assert_ne!(a, b);
        assert_eq!(
            a.content_hash(),
            KernelKey::new(&t, &r, &[], None, &KernelOptions::default()).content_hash()
        );
    }

    #[test]
    fn failed_builds_are_not_cached() {
        let mut cache = KernelCache::new();
        let res = cache.get_or_build(&[0.0], &[-1.0], &[], None, &KernelOptions::default());
        assert!(res.is_err());
        assert!(cache.is_empty());
    }
}
