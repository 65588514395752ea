pub mod call;
pub mod message;
pub mod operation;
pub mod pipeline;
pub mod provider;

pub use call::*;
pub use message::*;
pub use operation::*;
pub use pipeline::*;
pub use provider::*;
