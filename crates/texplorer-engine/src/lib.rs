pub mod channels;
pub mod components;
pub mod error;
pub mod factory;
pub mod fs;
pub mod mock;
pub mod registry;
pub mod session;

pub use channels::{Channel, EventChannels};
pub use error::ExplorerError;
pub use factory::{ComponentFactory, DefaultComponentFactory, FactoryContext, SharedCollaborators, SubsystemGraph};
pub use registry::{DisposalRegistry, DisposalReport};
pub use session::ExplorerSession;
