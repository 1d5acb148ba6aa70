//! graphbroker - Microsoft identity token broker.
//!
//! Acquires access tokens for Microsoft Graph either as the application
//! itself (client credentials) or on behalf of a signed-in user, trying the
//! persisted token cache before any network or browser round trip.

#![deny(clippy::all)]

pub mod broker;
pub mod config;
pub mod error;
pub mod graph;
pub mod identity;
pub mod logging;
pub mod secure;

pub use broker::{Mode, TokenBroker};
pub use config::Config;
pub use error::{AcquisitionFailure, BrokerError};
pub use identity::{AccessToken, Account, TokenSource};
