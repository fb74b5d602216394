//! Wire shapes on both sides of the gateway.

pub mod openai;
pub mod zai;
