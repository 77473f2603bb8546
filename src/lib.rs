/// IonScript Engine Library
///
/// Module layout:
///   - conf       — runtime configuration (toggles, ~/.config/ionscript/conf.toml)
///   - value      — the dynamically typed Value system
///   - bytecode   — instruction set, header, encoding/decoding
///   - ast / lexer / parser — front-end
///   - simplifier — constant-folding tree pass between parser and compiler
///   - compiler   — syntax tree → bytecode compiler
///   - vm         — stack-based bytecode interpreter
///   - runtime    — high-level Runtime (host function registration + VM wiring)
///   - errors     — the shared error type

// ── Core VM modules ──────────────────────────────────────────────────────────
pub mod conf;
pub mod value;
pub mod bytecode;
pub mod compiler;

// ── Front-end / language ─────────────────────────────────────────────────────
pub mod ast;
pub mod lexer;
pub mod parser;
pub mod simplifier;
pub mod errors;

// ── Runtime ───────────────────────────────────────────────────────────────────
pub mod vm;
pub mod runtime;

// ── Re-exports for convenience ────────────────────────────────────────────────
pub use conf::IonConf;
pub use errors::IonError;
pub use lexer::Lexer;
pub use parser::Parser;
pub use runtime::Runtime;
pub use value::Value;
pub use vm::Vm;
