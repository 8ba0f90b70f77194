pub mod completion;
pub mod errors;
pub mod events;
pub mod jobs;
pub mod outbox;
pub mod transaction;

pub use completion::*;
pub use errors::*;
pub use events::*;
pub use jobs::*;
pub use outbox::*;
pub use transaction::*;
