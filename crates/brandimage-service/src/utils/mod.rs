mod defer;

pub use defer::*;
