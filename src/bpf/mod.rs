pub mod filter;

pub use filter::{AssemblyError, Instruction, JumpTest, RawInstruction, assemble};
