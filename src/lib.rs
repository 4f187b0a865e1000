//! A dynamic recompiler back end that lowers a machine-independent emulation
//! intermediate language (UML) onto AArch64 and executes the result.
//!
//! The [`Backend`] owns an executable code arena, a (mode, pc) hash table of
//! generated entry points, late-bound code handles and the emulated machine
//! state. A front end feeds it [`uml::Inst`] blocks through
//! [`Backend::generate`] and enters generated code with [`Backend::execute`].
//!
//! Code generation works on any host; running the produced code requires a
//! little-endian AArch64 machine.

pub mod backend;
pub mod cache;
mod codegen;
pub mod emitter;
pub mod error;
pub mod handle;
pub mod hash;
pub mod map;
pub mod space;
pub mod state;
pub mod uml;

pub use backend::{Backend, BackendConfig, BackendInfo, DebugHook};
pub use error::BackendError;
pub use handle::HandleId;
