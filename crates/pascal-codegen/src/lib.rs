/// Cranelift code generation for the Pascal compiler.
///
/// Takes a parsed, closure-transformed `Program` and compiles it to
/// native machine code via Cranelift, producing a `.o` object file
/// that is then linked with `libpascal_runtime.a` to form an
/// executable.

pub mod builtins;
pub mod compiler;

pub use compiler::{compile, CodegenError};
