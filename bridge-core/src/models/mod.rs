mod command;
mod copier;
mod event;
mod position;
mod registration;
mod session;
mod snapshot;

pub use command::*;
pub use copier::*;
pub use event::*;
pub use position::*;
pub use registration::*;
pub use session::*;
pub use snapshot::*;
