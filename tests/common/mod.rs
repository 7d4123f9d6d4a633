#![allow(dead_code)]

pub mod checkpoint_builder;
pub mod data_generators;
