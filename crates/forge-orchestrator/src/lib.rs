pub mod error;
pub mod interpreter;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod scheduler;
pub mod session;
pub mod testing;


pub use error::*;
pub use interpreter::parse as parse_response;
pub use pipeline::*;
pub use progress::ProgressReporter;
pub use scheduler::*;
pub use session::*;
