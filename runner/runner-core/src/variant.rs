// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! From probe info and the set of extracted variants, compute the
//! ordered list of runner variant tags to try, best-fit first. This
//! module never spawns anything — it only returns candidates for
//! `RunnerProcess` to try in order.

use crate::accel::AcceleratorInfo;
use std::collections::HashMap;

/// Joins a library and an optional variant suffix into a variant tag:
/// `<library>[_<cpuflag|gpu-version>]`.
pub fn variant_tag(library: &str, variant: &str) -> String {
    if variant.is_empty() {
        library.to_string()
    } else {
        format!("{library}_{variant}")
    }
}

pub struct VariantSelector;

impl VariantSelector {
    /// `available` maps variant tag -> directory (as produced by
    /// `PayloadStore::available`); only the keys matter here.
    pub fn select(accel: &AcceleratorInfo, available: &HashMap<String, std::path::PathBuf>) -> Vec<String> {
        let mut out = Vec::new();
        let requested = variant_tag(&accel.library, &accel.variant);

        if available.contains_key(&requested) {
            out.push(requested.clone());
            if requested == "metal" {
                return out;
            }
        }

        if accel.library != "cpu" {
            let mut siblings: Vec<&String> = available
                .keys()
                .filter(|tag| {
                    **tag != requested && tag_prefix(tag) == accel.library
                })
                .collect();
            siblings.sort();
            for tag in siblings {
                out.push(tag.clone());
            }

            let cpu_fallback = match &accel.cpu_flag {
                Some(flag) => {
                    let tagged = variant_tag("cpu", flag);
                    if available.contains_key(&tagged) {
                        tagged
                    } else {
                        "cpu".to_string()
                    }
                }
                None => "cpu".to_string(),
            };
            if !out.contains(&cpu_fallback) {
                out.push(cpu_fallback);
            }
        }

        if out.is_empty() {
            out.push("cpu".to_string());
        }
        out
    }
}

/// The accelerator-family prefix of a variant tag: everything before the
/// first `_`, or the whole tag when there is no suffix.
fn tag_prefix(tag: &str) -> &str {
    tag.split('_').next().unwrap_or(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accel(library: &str, variant: &str, cpu_flag: Option<&str>) -> AcceleratorInfo {
        AcceleratorInfo {
            library: library.to_string(),
            variant: variant.to_string(),
            device_count: 1,
            total_vram_bytes: 8_000_000_000,
            os: "linux".to_string(),
            cpu_flag: cpu_flag.map(str::to_string),
        }
    }

    fn avail(tags: &[&str]) -> HashMap<String, std::path::PathBuf> {
        tags.iter().map(|t| (t.to_string(), std::path::PathBuf::from(t))).collect()
    }

    #[test]
    fn cuda_host_prefers_cuda_then_best_cpu_fallback() {
        let available = avail(&["cpu", "cpu_avx2", "cuda_v12"]);
        let a = accel("cuda", "v12", Some("avx2"));
        assert_eq!(VariantSelector::select(&a, &available), vec!["cuda_v12", "cpu_avx2"]);
    }

    #[test]
    fn metal_returns_immediately() {
        let available = avail(&["metal", "cpu"]);
        let a = accel("metal", "", None);
        assert_eq!(VariantSelector::select(&a, &available), vec!["metal"]);
    }

    #[test]
    fn cpu_host_only_tries_cpu() {
        let available = avail(&["cpu", "cpu_avx2"]);
        let a = accel("cpu", "avx2", Some("avx2"));
        assert_eq!(VariantSelector::select(&a, &available), vec!["cpu_avx2"]);
    }

    #[test]
    fn falls_back_to_bare_cpu_when_nothing_matches() {
        let available: HashMap<String, std::path::PathBuf> = HashMap::new();
        let a = accel("cuda", "v12", None);
        assert_eq!(VariantSelector::select(&a, &available), vec!["cpu"]);
    }

    #[test]
    fn siblings_are_sorted_and_deduplicated() {
        let available = avail(&["cuda_v11", "cuda_v12", "cuda_v10", "cpu"]);
        let a = accel("cuda", "v12", None);
        let out = VariantSelector::select(&a, &available);
        assert_eq!(out, vec!["cuda_v12", "cuda_v10", "cuda_v11", "cpu"]);
        let mut dedup = out.clone();
        dedup.sort();
        dedup.dedup();
        assert_eq!(dedup.len(), out.len());
    }

    #[test]
    fn last_element_is_cpu_variant_when_not_cpu_library() {
        let available = avail(&["rocm_v6", "cpu_avx2"]);
        let a = accel("rocm", "v6", Some("avx2"));
        let out = VariantSelector::select(&a, &available);
        assert_eq!(out.last().unwrap(), "cpu_avx2");
    }
}
