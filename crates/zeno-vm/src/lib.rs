//! # zeno-vm
//!
//! Compiles slot trees to bytecode and runs them on a stack machine.
//!
//! The interpreter in `zeno-core` remains the reference; the VM is an
//! optional fast path for trees [`compile`] accepts. Slots the VM does not
//! implement natively are delegated back to the engine through a [`Host`].

pub mod chunk;
pub mod compiler;
pub mod disasm;
pub mod error;
pub mod host;
pub mod opcode;
pub mod vm;

pub use chunk::{Chunk, ChunkBuilder, Constant, Function, MAGIC};
pub use compiler::compile;
pub use disasm::disassemble;
pub use error::VmError;
pub use host::{EngineHost, Host, NoopHost};
pub use opcode::OpCode;
pub use vm::{FRAMES_MAX, STACK_MAX, Vm};
