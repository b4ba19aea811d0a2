//! Built-in protocol handlers
//!
//! One module per protocol: delegation (`@`), declarative failure (`error`),
//! prompt evaluation (`eval`), per-element iteration (`iterator`),
//! language-model completion (`llm`), human-pause suspension (`pause`), and
//! scope variables (`var`).

pub mod delegate;
pub mod error;
pub mod evaluate;
pub mod iterate;
pub mod model;
pub mod suspend;
pub mod variable;

pub use delegate::DelegateHandler;
pub use error::ErrorHandler;
pub use evaluate::EvaluateHandler;
pub use iterate::IterateHandler;
pub use model::ModelHandler;
pub use suspend::SuspendHandler;
pub use variable::VariableHandler;
