//! Gemini CLI driver (Agent Client Protocol over stdio).

mod acp;
mod driver;
mod terminal;

pub use driver::GeminiDriver;
