//! Device placement planning.
//!
//! Turns a requested [`DevicePlacement`] into a concrete tensor -> device map.
//! Fallback policy: sharded modes on a single device collapse to `Single(0)`.

use std::collections::BTreeMap;

use lorafuse_core::{DevicePlacement, LorafuseError, Result};
use tracing::{info, warn};

/// Path segments that introduce a decoder-layer index (`model.layers.3.…`).
const LAYER_CONTAINERS: [&str; 4] = ["layers", "h", "blocks", "layer"];

/// Name fragments of input embeddings, which sit before the first layer.
const EMBEDDING_MARKERS: [&str; 4] = ["embed", "wte", "wpe", "word_embeddings"];

/// A placement with `Auto` and the single-device fallback already applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolvedPlacement {
    Single(usize),
    ShardedByLayer,
    ShardedByTensor,
}

#[derive(Debug, Clone)]
pub struct DeviceMap {
    placement: ResolvedPlacement,
    assignments: BTreeMap<String, usize>,
    device_bytes: Vec<usize>,
}

impl DeviceMap {
    /// The placement actually applied.
    pub fn placement(&self) -> ResolvedPlacement {
        self.placement
    }

    pub fn device_of(&self, name: &str) -> Option<usize> {
        self.assignments.get(name).copied()
    }

    /// Planned bytes per device ordinal.
    pub fn device_bytes(&self) -> &[usize] {
        &self.device_bytes
    }

    pub fn device_count(&self) -> usize {
        self.device_bytes.len()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// Decoder-layer index encoded in a tensor name, if any.
pub fn layer_index(name: &str) -> Option<usize> {
    let mut segments = name.split('.');
    while let Some(seg) = segments.next() {
        if LAYER_CONTAINERS.contains(&seg) {
            if let Some(idx) = segments.clone().next().and_then(|s| s.parse().ok()) {
                return Some(idx);
            }
        }
    }
    None
}

pub fn is_embedding(name: &str) -> bool {
    EMBEDDING_MARKERS.iter().any(|m| name.contains(m))
}

/// Resolve `Auto` and apply the single-device fallback.
pub fn resolve_placement(
    requested: DevicePlacement,
    device_count: usize,
) -> Result<ResolvedPlacement> {
    if device_count == 0 {
        return Err(LorafuseError::InvalidArgument(
            "no compute devices available".into(),
        ));
    }
    let resolved = match requested {
        DevicePlacement::Auto if device_count == 1 => ResolvedPlacement::Single(0),
        DevicePlacement::Auto => ResolvedPlacement::ShardedByLayer,
        DevicePlacement::Single(ordinal) if ordinal >= device_count => {
            return Err(LorafuseError::InvalidArgument(format!(
                "device {ordinal} requested but only {device_count} available"
            )));
        }
        DevicePlacement::Single(ordinal) => ResolvedPlacement::Single(ordinal),
        DevicePlacement::ShardedByLayer | DevicePlacement::ShardedByTensor
            if device_count == 1 =>
        {
            warn!("{requested:?} requested with a single device; placing everything on device 0");
            ResolvedPlacement::Single(0)
        }
        DevicePlacement::ShardedByLayer => ResolvedPlacement::ShardedByLayer,
        DevicePlacement::ShardedByTensor => ResolvedPlacement::ShardedByTensor,
    };
    Ok(resolved)
}

/// Assign every `(name, bytes)` entry to a device.
pub fn plan_placement(
    requested: DevicePlacement,
    device_count: usize,
    tensors: &[(String, usize)],
) -> Result<DeviceMap> {
    let placement = resolve_placement(requested, device_count)?;
    let mut assignments = BTreeMap::new();
    let mut device_bytes = vec![0usize; device_count];

    match placement {
        ResolvedPlacement::Single(ordinal) => {
            for (name, bytes) in tensors {
                assignments.insert(name.clone(), ordinal);
                device_bytes[ordinal] += bytes;
            }
        }
        ResolvedPlacement::ShardedByLayer => {
            let num_layers = tensors
                .iter()
                .filter_map(|(name, _)| layer_index(name))
                .max()
                .map_or(0, |max| max + 1);
            let last = device_count - 1;
            for (name, bytes) in tensors {
                let device = match layer_index(name) {
                    Some(layer) => layer * device_count / num_layers,
                    None if is_embedding(name) => 0,
                    None => last,
                };
                assignments.insert(name.clone(), device);
                device_bytes[device] += bytes;
            }
        }
        ResolvedPlacement::ShardedByTensor => {
            let mut order: Vec<&(String, usize)> = tensors.iter().collect();
            order.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
            for (name, bytes) in order {
                let device = device_bytes
                    .iter()
                    .enumerate()
                    .min_by_key(|(ordinal, load)| (**load, *ordinal))
                    .map_or(0, |(ordinal, _)| ordinal);
                assignments.insert(name.clone(), device);
                device_bytes[device] += bytes;
            }
        }
    }

    info!(
        "Placement {:?} over {} device(s): {:?} bytes",
        placement, device_count, device_bytes
    );

    Ok(DeviceMap {
        placement,
        assignments,
        device_bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llama_like(layers: usize) -> Vec<(String, usize)> {
        let mut t = vec![("model.embed_tokens.weight".to_string(), 100)];
        for i in 0..layers {
            t.push((format!("model.layers.{i}.self_attn.q_proj.weight"), 10));
            t.push((format!("model.layers.{i}.input_layernorm.weight"), 1));
        }
        t.push(("model.norm.weight".to_string(), 1));
        t.push(("lm_head.weight".to_string(), 100));
        t
    }

    #[test]
    fn test_layer_index() {
        assert_eq!(layer_index("model.layers.12.mlp.up_proj.weight"), Some(12));
        assert_eq!(layer_index("transformer.h.3.attn.c_attn.weight"), Some(3));
        assert_eq!(layer_index("model.norm.weight"), None);
        assert_eq!(layer_index("model.layers.weight"), None);
    }

    #[test]
    fn test_auto_on_one_device_is_single() {
        let map = plan_placement(DevicePlacement::Auto, 1, &llama_like(2)).unwrap();
        assert_eq!(map.placement(), ResolvedPlacement::Single(0));
        assert_eq!(map.device_bytes(), &[223]);
    }

    #[test]
    fn test_auto_on_many_devices_shards_by_layer() {
        let map = plan_placement(DevicePlacement::Auto, 2, &llama_like(4)).unwrap();
        assert_eq!(map.placement(), ResolvedPlacement::ShardedByLayer);
        assert_eq!(map.device_of("model.embed_tokens.weight"), Some(0));
        assert_eq!(map.device_of("model.layers.0.self_attn.q_proj.weight"), Some(0));
        assert_eq!(map.device_of("model.layers.1.self_attn.q_proj.weight"), Some(0));
        assert_eq!(map.device_of("model.layers.2.self_attn.q_proj.weight"), Some(1));
        assert_eq!(map.device_of("model.layers.3.input_layernorm.weight"), Some(1));
        assert_eq!(map.device_of("model.norm.weight"), Some(1));
        assert_eq!(map.device_of("lm_head.weight"), Some(1));
    }

    #[test]
    fn test_sharded_falls_back_on_single_device() {
        for mode in [DevicePlacement::ShardedByLayer, DevicePlacement::ShardedByTensor] {
            let map = plan_placement(mode, 1, &llama_like(2)).unwrap();
            assert_eq!(map.placement(), ResolvedPlacement::Single(0));
        }
    }

    #[test]
    fn test_resolve_keeps_explicit_modes() {
        assert_eq!(
            resolve_placement(DevicePlacement::Single(1), 2).unwrap(),
            ResolvedPlacement::Single(1)
        );
        assert_eq!(
            resolve_placement(DevicePlacement::ShardedByTensor, 3).unwrap(),
            ResolvedPlacement::ShardedByTensor
        );
        assert_eq!(
            resolve_placement(DevicePlacement::Auto, 4).unwrap(),
            ResolvedPlacement::ShardedByLayer
        );
    }

    #[test]
    fn test_single_out_of_range() {
        assert!(plan_placement(DevicePlacement::Single(2), 2, &llama_like(1)).is_err());
        assert!(plan_placement(DevicePlacement::Auto, 0, &llama_like(1)).is_err());
    }

    #[test]
    fn test_by_tensor_balances_bytes() {
        let tensors = vec![
            ("a".to_string(), 50),
            ("b".to_string(), 40),
            ("c".to_string(), 30),
            ("d".to_string(), 20),
        ];
        let map = plan_placement(DevicePlacement::ShardedByTensor, 2, &tensors).unwrap();
        // a -> 0, b -> 1, c -> 1 (40 < 50), d -> 0 (50 < 70)
        assert_eq!(map.device_of("a"), Some(0));
        assert_eq!(map.device_of("b"), Some(1));
        assert_eq!(map.device_of("c"), Some(1));
        assert_eq!(map.device_of("d"), Some(0));
        assert_eq!(map.device_bytes(), &[70, 70]);
    }
}
