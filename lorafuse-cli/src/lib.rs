//! merge-lora: download a base model, load it 4-bit quantized, fold in a
//! LoRA adapter and save the merged checkpoint with its tokenizer.

pub mod cli;
pub mod pipeline;
pub mod tokenizer;
