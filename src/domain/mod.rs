pub mod records;
pub mod session;
pub mod snapshot;
pub mod timefmt;

pub use records::*;
pub use session::*;
pub use snapshot::*;
