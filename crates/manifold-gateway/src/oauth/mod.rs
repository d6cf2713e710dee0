//! OAuth session coordination for authorization-gated backends.
//!
//! Remote backends that advertise OAuth protection connect in two phases:
//! the gateway parks them in pending-auth, hands the operator an
//! authorization URL, and finishes the connection when the provider's
//! callback delivers the authorization code. The coordinator owns the
//! pending-flow map; providers own token persistence and the code exchange.

mod coordinator;
mod discovery;
mod provider;

pub use coordinator::{AuthorizationRequest, OAuthCoordinator, OAuthFlow};
pub use discovery::detect_authorization_required;
pub use provider::{OAuthProvider, OAuthTokens};
