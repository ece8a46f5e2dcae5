//! External Adapters (C1): thin, mockable contracts over every system
//! this worker talks to. Each trait is a capability set per §9's
//! "no inheritance" design note (e.g. *Sandbox = {provision, exec, read,
//! write, delete, sync, stop}*), not a class hierarchy.

pub mod db;
pub mod deployment;
pub mod llm;
pub mod object_store;
pub mod pubsub;
pub mod queue;
pub mod sandbox;
pub mod source_host;

pub use db::ControlDb;
pub use deployment::DeploymentPlatform;
pub use llm::Llm;
pub use object_store::ObjectStore;
pub use pubsub::PubSub;
pub use queue::Queue;
pub use sandbox::Sandbox;
pub use source_host::SourceHost;
