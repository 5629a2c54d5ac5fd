//! In-process telemetry agent.
//!
//! Applications record sessions, actions and events through [`OpenKit`].
//! Records are serialized into a bounded in-memory [`BeaconCache`]; a
//! background evictor keeps the cache within its age and size bounds while
//! a sender thread ships the data to the backend over HTTP.
//!
//! ```no_run
//! use openkit_agent::{config, OpenKit};
//!
//! let cfg = config::load_config(std::path::Path::new("/etc/openkit/agent.conf"))?;
//! let openkit = OpenKit::new(cfg)?;
//! openkit.initialize()?;
//!
//! if let Some(session) = openkit.create_session("10.0.0.1") {
//!     let action = session.enter_action("login");
//!     action.report_event("password entered");
//!     action.leave_action();
//!     session.end();
//! }
//! openkit.shutdown();
//! # Ok::<(), openkit_agent::error::AgentError>(())
//! ```

pub mod action;
pub mod cache;
pub mod communication;
pub mod config;
pub mod error;
pub mod openkit;
pub mod protocol;
pub mod session;
pub mod timing;
pub mod util;

#[cfg(test)]
pub(crate) mod testing;

pub use action::Action;
pub use cache::BeaconCache;
pub use openkit::OpenKit;
pub use session::Session;
