use crate::error::{GcError, Result};
use serde::Deserialize;
use tern_mmap::PAGE_BYTES;

/// Tuning knobs for a [`Heap`](crate::Heap).
///
/// Deserializable so the embedding driver can keep it in its own config file;
/// missing fields fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Slab rounding granularity. Must be a multiple of the page size.
    pub slab_bytes: usize,
    /// Upper bound on mapped slab bytes, live and pooled together.
    pub max_heap_bytes: usize,
    /// Fraction of slab bytes in use above which an overflowing allocation collects.
    pub high_water: f32,
    /// Used bytes below which the heap never collects on its own.
    pub min_collect_bytes: usize,
    /// After a collection the threshold becomes `live_bytes * growth_factor`.
    pub growth_factor: f32,
    /// Vacated slabs kept mapped for reuse.
    pub slab_pool: usize,
    pub table_load_factor: f32,
    pub table_initial_capacity: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            slab_bytes: 64 * 1024,
            max_heap_bytes: 1024 * 1024 * 1024,
            high_water: 0.70,
            min_collect_bytes: 256 * 1024,
            growth_factor: 2.0,
            slab_pool: 4,
            table_load_factor: 0.75,
            table_initial_capacity: 8,
        }
    }
}

impl HeapConfig {
    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: String) -> Result<()> {
            Err(GcError::InvalidConfig(msg))
        }

        if self.slab_bytes == 0 || self.slab_bytes % PAGE_BYTES != 0 {
            return invalid(format!(
                "slab_bytes ({}) must be a positive multiple of {PAGE_BYTES}",
                self.slab_bytes
            ));
        }
        if self.max_heap_bytes < self.slab_bytes {
            return invalid(format!(
                "max_heap_bytes ({}) is smaller than one slab ({})",
                self.max_heap_bytes, self.slab_bytes
            ));
        }
        if !(self.high_water > 0.0 && self.high_water <= 1.0) {
            return invalid(format!("high_water ({}) must be in (0, 1]", self.high_water));
        }
        if !(self.growth_factor >= 1.0) {
            return invalid(format!("growth_factor ({}) must be at least 1", self.growth_factor));
        }
        if !(self.table_load_factor > 0.0 && self.table_load_factor < 1.0) {
            return invalid(format!(
                "table_load_factor ({}) must be in (0, 1)",
                self.table_load_factor
            ));
        }
        if !self.table_initial_capacity.is_power_of_two() {
            return invalid(format!(
                "table_initial_capacity ({}) must be a power of two",
                self.table_initial_capacity
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        HeapConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: HeapConfig =
            serde_json::from_str(r#"{ "slab_bytes": 8192, "high_water": 0.5 }"#).unwrap();

        assert_eq!(config.slab_bytes, 8192);
        assert_eq!(config.high_water, 0.5);
        assert_eq!(config.table_load_factor, 0.75);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_values() {
        let bad = [
            HeapConfig { slab_bytes: 1000, ..Default::default() },
            HeapConfig { max_heap_bytes: 4096, ..Default::default() },
            HeapConfig { high_water: 0.0, ..Default::default() },
            HeapConfig { growth_factor: 0.5, ..Default::default() },
            HeapConfig { table_load_factor: 1.0, ..Default::default() },
            HeapConfig { table_initial_capacity: 6, ..Default::default() },
        ];

        for config in bad {
            assert!(matches!(config.validate(), Err(GcError::InvalidConfig(_))), "{config:?}");
        }
    }
}
