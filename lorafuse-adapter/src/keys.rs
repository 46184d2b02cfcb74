//! Mapping from adapter tensor names to base model tensor names.
//!
//! PEFT saves LoRA weights as
//! `base_model.model.<module>.lora_A[.<adapter>].weight`; embedding adapters
//! use `lora_embedding_A` parameters without a `.weight` suffix.

const PEFT_PREFIX: &str = "base_model.model.";
const ADAPTER_NAME: &str = "default";

/// Role of one tensor in an adapter checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterKey {
    /// Down projection `A` ([r, in]) of `module`.
    LoraA { module: String, embedding: bool },
    /// Up projection `B` ([out, r]) of `module`.
    LoraB { module: String, embedding: bool },
    /// A full tensor that overwrites the base tensor of the same name.
    Replace { base_name: String },
    /// Bookkeeping copy PEFT keeps of the untouched module.
    Ignored,
}

/// Classify an adapter tensor name.
pub fn classify(name: &str) -> AdapterKey {
    let stripped = name.strip_prefix(PEFT_PREFIX).unwrap_or(name);
    let segments: Vec<&str> = stripped
        .split('.')
        .filter(|s| *s != ADAPTER_NAME)
        .collect();

    if segments.contains(&"original_module") {
        return AdapterKey::Ignored;
    }

    for (idx, seg) in segments.iter().enumerate() {
        let (is_a, embedding) = match *seg {
            "lora_A" => (true, false),
            "lora_B" => (false, false),
            "lora_embedding_A" => (true, true),
            "lora_embedding_B" => (false, true),
            _ => continue,
        };
        let module = segments[..idx].join(".");
        return if is_a {
            AdapterKey::LoraA { module, embedding }
        } else {
            AdapterKey::LoraB { module, embedding }
        };
    }

    // modules_to_save wraps a full copy of the module.
    let base: Vec<&str> = segments
        .into_iter()
        .filter(|s| *s != "modules_to_save")
        .collect();
    AdapterKey::Replace {
        base_name: base.join("."),
    }
}

/// Base tensor updated by a LoRA pair on `module`.
pub fn base_weight_name(module: &str) -> String {
    format!("{module}.weight")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lora_keys() {
        assert_eq!(
            classify("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight"),
            AdapterKey::LoraA {
                module: "model.layers.0.self_attn.q_proj".into(),
                embedding: false
            }
        );
        assert_eq!(
            classify("base_model.model.model.layers.0.self_attn.q_proj.lora_B.default.weight"),
            AdapterKey::LoraB {
                module: "model.layers.0.self_attn.q_proj".into(),
                embedding: false
            }
        );
    }

    #[test]
    fn test_embedding_keys() {
        assert_eq!(
            classify("base_model.model.model.embed_tokens.lora_embedding_A"),
            AdapterKey::LoraA {
                module: "model.embed_tokens".into(),
                embedding: true
            }
        );
    }

    #[test]
    fn test_modules_to_save_and_bias() {
        assert_eq!(
            classify("base_model.model.lm_head.modules_to_save.default.weight"),
            AdapterKey::Replace {
                base_name: "lm_head.weight".into()
            }
        );
        assert_eq!(
            classify("base_model.model.model.layers.0.self_attn.q_proj.bias"),
            AdapterKey::Replace {
                base_name: "model.layers.0.self_attn.q_proj.bias".into()
            }
        );
        assert_eq!(
            classify("base_model.model.lm_head.original_module.weight"),
            AdapterKey::Ignored
        );
    }

    #[test]
    fn test_base_weight_name() {
        assert_eq!(base_weight_name("model.norm"), "model.norm.weight");
    }
}
