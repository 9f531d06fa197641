pub mod compiler;
pub mod config;
pub mod engine;
pub mod env;
pub mod error;
pub mod heap;
pub mod primitives;
pub mod printer;
pub mod reader;
pub mod scope;
pub mod symbol;
pub mod syntax_rules;
pub mod value;

pub use config::EngineConfig;
pub use engine::{Engine, EngineStats, Pin};
pub use error::{CompileError, SchemeError, SchemeResult};
pub use heap::{GcStats, Mutator};
pub use value::Value;
