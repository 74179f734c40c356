//! Runtime configuration for global, sparse and pointer arrays.

use serde::{Deserialize, Serialize};

/// Rule mapping a global row (or column) index to its owning process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Binning {
    /// Balanced ranges: rank `p` owns `[dim*p/nproc, dim*(p+1)/nproc)`.
    #[default]
    Balanced,
    /// Legacy stride rule `min(i / nproc, nproc - 1)`. Ownership ranges and
    /// binning both follow it, so blocks are uneven but still consistent.
    Strided,
}

/// What a collective assembly does when one process fails to allocate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// All-reduce the success flag after each allocation step; every process
    /// unwinds together and reports `false`.
    #[default]
    AllReduce,
    /// Each process records its own status and keeps going through the
    /// barriers. Peers may see remote errors or incomplete data.
    Local,
}

/// Configuration shared by the array registries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GaConfig {
    /// Capacity of the distributed array handle pool.
    pub max_arrays: usize,
    /// Capacity of the sparse array handle pool.
    pub max_sparse_arrays: usize,
    /// Capacity of the pointer array handle pool.
    pub max_pointer_arrays: usize,
    /// Initial triple-buffer capacity of a new sparse array.
    pub initial_capacity: usize,
    /// Row/column ownership rule used by sparse assembly.
    pub binning: Binning,
    /// Abort protocol for allocation failures during assembly.
    pub failure_policy: FailurePolicy,
    /// Sort the entries of every assembled row by column index.
    pub sort_columns: bool,
}

impl Default for GaConfig {
    fn default() -> Self {
        Self {
            max_arrays: 32768,
            max_sparse_arrays: 32768,
            max_pointer_arrays: 32768,
            initial_capacity: 1024,
            binning: Binning::Balanced,
            failure_policy: FailurePolicy::AllReduce,
            sort_columns: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let cfg: GaConfig =
            serde_json::from_str(r#"{"initial_capacity": 16, "binning": "strided"}"#).unwrap();
        assert_eq!(cfg.initial_capacity, 16);
        assert_eq!(cfg.binning, Binning::Strided);
        assert_eq!(cfg.failure_policy, FailurePolicy::AllReduce);
        assert_eq!(cfg.max_arrays, GaConfig::default().max_arrays);
    }

    #[test]
    fn json_round_trip() {
        let cfg = GaConfig {
            failure_policy: FailurePolicy::Local,
            sort_columns: true,
            ..Default::default()
        };
        let text = serde_json::to_string(&cfg).unwrap();
        let back: GaConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(cfg, back);
    }
}
