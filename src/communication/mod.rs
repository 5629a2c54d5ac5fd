//! Background communication with the backend.
//!
//! A single sender thread drives a [`SendingState`] machine:
//!
//! ```text
//! Init ──► TimeSync(initial) ──► CaptureOn ◄──► CaptureOff
//!                                   │   ▲
//!                                   ▼   │
//!                               TimeSync(periodic)
//!
//! shutdown: Init, initial TimeSync ──► Terminal
//!           everything else ──► Flush ──► Terminal
//! ```

pub mod context;
pub mod sender;
pub mod settings;
pub mod state;

pub use context::SendingContext;
pub use sender::BeaconSender;
pub use settings::ServerSettings;
pub use state::SendingState;
