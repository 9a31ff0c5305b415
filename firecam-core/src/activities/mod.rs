//! The seven cooperating activities (`spec.md` §2). Each module exposes the
//! pure, testable pieces of its activity; the thread-spawning `run` loops
//! that wire them to real hardware/sockets live in the `firecam` binary.

pub mod orchestrator;
pub mod recorder;
pub mod responder;
pub mod sampler;
pub mod thermal;
pub mod visual;
