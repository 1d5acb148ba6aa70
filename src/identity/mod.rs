//! Microsoft identity platform client layer.
//!
//! Provides the serializable token cache, the identity provider seam with its
//! Azure AD implementation (client credentials, refresh tokens, interactive
//! authorization code + PKCE), and the client application that implements
//! silent acquisition on top of both.

pub mod application;
pub mod cache;
pub mod callback_server;
pub mod oauth;
pub mod provider;

pub use application::{AccessToken, ClientApplication, TokenSource};
pub use cache::{Account, TokenCache};
pub use oauth::AzureAdClient;
pub use provider::{IdentityProvider, TokenResponse};
