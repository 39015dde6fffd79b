#![allow(dead_code)]

pub mod data_generators;
pub mod gguf_builder;
