//! GPTQ: Hessian-aware post-training weight quantization
//!
//! Each linear layer gets its own [`Gptq`] engine:
//! 1. `add_batch` accumulates `H = 2·XᵀX/N` from captured inputs
//! 2. `fasterquant` inverts the damped Hessian and quantizes column by column,
//!    compensating each rounding error on the remaining columns
//! 3. the resulting [`GptqOutput`] carries codes, scales, zero points and the
//!    activation-order permutation

mod engine;
mod hessian;
pub mod linalg;
mod output;

pub use engine::{EngineState, FasterquantOptions, Gptq, GroupSize};
pub use hessian::{flatten_input, HessianAccumulator};
pub use output::GptqOutput;
