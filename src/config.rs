use serde::{Deserialize, Serialize};
use serde_json;
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use crate::amr::histogram::{CombineComparison, CombineFallback, MinBoxPolicy, ZeroCutTieBreak};
use crate::amr::node::HistogramReduction;
use crate::amr::owner::OwnerMode;
use crate::amr::stage::AdvanceMode;
use crate::error::{ClusterError, Result};

/// Tunable parameters of the clustering algorithm.
///
/// Keys prefixed with `DEV_` are developer knobs; their defaults are the
/// production behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterConfig {
    /// Largest allowed box extent per direction. `None` means unlimited.
    pub max_box_size: Option<Vec<i32>>,
    /// Sort each owner's output boxes by (lower, upper) corner before numbering.
    pub sort_output_nodes: bool,
    pub check_min_box_size: MinBoxPolicy,

    #[serde(rename = "DEV_algo_advance_mode")]
    pub algo_advance_mode: AdvanceMode,
    #[serde(rename = "DEV_owner_mode")]
    pub owner_mode: OwnerMode,
    /// Inflection cuts farther than this fraction of the half-extent from the
    /// center are ignored.
    #[serde(rename = "DEV_max_inflection_cut_from_center")]
    pub max_inflection_cut_from_center: f64,
    /// Below this aspect ratio only the longest direction is searched.
    #[serde(rename = "DEV_inflection_cut_threshold_ar")]
    pub inflection_cut_threshold_ar: f64,
    #[serde(rename = "DEV_histogram_reduction")]
    pub histogram_reduction: HistogramReduction,
    #[serde(rename = "DEV_zero_cut_tie_break")]
    pub zero_cut_tie_break: ZeroCutTieBreak,
    #[serde(rename = "DEV_combine_comparison")]
    pub combine_comparison: CombineComparison,
    #[serde(rename = "DEV_combine_fallback")]
    pub combine_fallback: CombineFallback,
    #[serde(rename = "DEV_single_owner_rank")]
    pub single_owner_rank: usize,
    /// Node identifiers a rank may allocate before the tag pool is exhausted.
    #[serde(rename = "DEV_tag_upper_bound")]
    pub tag_upper_bound: u32,

    /// How long a rank waits for a message before giving up.
    pub comm_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            max_box_size: None,
            sort_output_nodes: false,
            check_min_box_size: MinBoxPolicy::Warn,
            algo_advance_mode: AdvanceMode::AdvanceSome,
            owner_mode: OwnerMode::MostOverlap,
            max_inflection_cut_from_center: 1.0,
            inflection_cut_threshold_ar: 0.0,
            histogram_reduction: HistogramReduction::GatherToOwner,
            zero_cut_tie_break: ZeroCutTieBreak::MostCentered,
            combine_comparison: CombineComparison::AtLeast,
            combine_fallback: CombineFallback::Accept,
            single_owner_rank: 0,
            tag_upper_bound: i32::MAX as u32,
            comm_timeout_ms: 120_000,
        }
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ClusterError::InvalidMode {
            what: key,
            value: value.to_string(),
        }),
    }
}

fn parse_num<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| ClusterError::InvalidMode {
        what: key,
        value: value.to_string(),
    })
}

impl ClusterConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    pub fn write_to_dir(&self, out_dir: &Path) -> Result<()> {
        let path = out_dir.join("config.json");
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Override one key from a `key=value` string (same names as the JSON form).
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "max_box_size" => {
                self.max_box_size = if value.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(
                        value
                            .split(',')
                            .map(|v| parse_num("max_box_size", v))
                            .collect::<Result<Vec<i32>>>()?,
                    )
                };
            }
            "sort_output_nodes" => self.sort_output_nodes = parse_bool("sort_output_nodes", value)?,
            "check_min_box_size" => self.check_min_box_size = value.parse()?,
            "DEV_algo_advance_mode" => self.algo_advance_mode = value.parse()?,
            "DEV_owner_mode" => self.owner_mode = value.parse()?,
            "DEV_max_inflection_cut_from_center" => {
                self.max_inflection_cut_from_center = parse_num("DEV_max_inflection_cut_from_center", value)?
            }
            "DEV_inflection_cut_threshold_ar" => {
                self.inflection_cut_threshold_ar = parse_num("DEV_inflection_cut_threshold_ar", value)?
            }
            "DEV_histogram_reduction" => self.histogram_reduction = value.parse()?,
            "DEV_zero_cut_tie_break" => self.zero_cut_tie_break = value.parse()?,
            "DEV_combine_comparison" => self.combine_comparison = value.parse()?,
            "DEV_combine_fallback" => self.combine_fallback = value.parse()?,
            "DEV_single_owner_rank" => {
                self.single_owner_rank = parse_num("DEV_single_owner_rank", value)?
            }
            "DEV_tag_upper_bound" => self.tag_upper_bound = parse_num("DEV_tag_upper_bound", value)?,
            "comm_timeout_ms" => self.comm_timeout_ms = parse_num("comm_timeout_ms", value)?,
            _ => {
                return Err(ClusterError::InvalidMode {
                    what: "config key",
                    value: key.to_string(),
                });
            }
        }
        Ok(())
    }

    /// `max_box_size` as a per-direction array; unlimited when unset.
    pub fn max_box_size<const D: usize>(&self) -> Result<[i32; D]> {
        match &self.max_box_size {
            None => Ok([i32::MAX; D]),
            Some(v) => {
                let arr: [i32; D] = v.as_slice().try_into().map_err(|_| {
                    ClusterError::DimensionMismatch {
                        what: "max_box_size",
                        got: v.len(),
                        expected: D,
                    }
                })?;
                if arr.iter().any(|&m| m < 1) {
                    return Err(ClusterError::InvalidMaxBoxSize(v.clone()));
                }
                Ok(arr)
            }
        }
    }

    #[inline]
    pub fn comm_timeout(&self) -> Duration {
        Duration::from_millis(self.comm_timeout_ms)
    }

    /// Range checks that do not depend on the dimension.
    pub fn validate(&self) -> Result<()> {
        let m = self.max_inflection_cut_from_center;
        if !(0.0..=1.0).contains(&m) {
            return Err(ClusterError::InvalidTolerance {
                name: "DEV_max_inflection_cut_from_center",
                value: m,
            });
        }
        let ar = self.inflection_cut_threshold_ar;
        if !(0.0..=1.0).contains(&ar) {
            return Err(ClusterError::InvalidTolerance {
                name: "DEV_inflection_cut_threshold_ar",
                value: ar,
            });
        }
        Ok(())
    }
}

/// Provenance written next to the outputs of a driver run.
#[derive(Serialize)]
pub struct RunConfig {
    pub cluster: ClusterConfig,
    pub scenario: ScenarioConfig,
    pub run: RunInfo,
}

#[derive(Serialize)]
pub struct ScenarioConfig {
    pub name: String,
    pub n: usize,
    pub tile: usize,
    pub n_ranks: usize,
    pub min_box: [i32; 2],
    pub efficiency_tol: f64,
    pub combine_tol: f64,
    pub relationship_width: i32,
}

#[derive(Serialize)]
pub struct RunInfo {
    pub binary: String,
    pub run_id: String,

    // Optional provenance (can be filled later)
    pub git_commit: Option<String>,
}

impl RunConfig {
    pub fn write_to_dir(&self, out_dir: &Path) -> std::io::Result<()> {
        let path = out_dir.join("config.json");
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}
