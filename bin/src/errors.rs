//! Validation errors of the client manager.
//!
//! These are returned synchronously and leave the manager untouched. Transfer
//! failures are not errors at this level, they arrive in `Response::error`.

use crate::{
    arena::{ArenaError, ClientId, OptionsId, RequestId},
    options::EndOfLifePolicy,
};

/// Client manager error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// Options handle does not resolve.
    #[error("Options not found, options id: {0}.")]
    UnknownOptions(OptionsId),

    /// Request handle does not resolve.
    #[error("Request not found, request id: {0}.")]
    UnknownRequest(RequestId),

    /// Client handle does not resolve.
    #[error("Client not found, client id: {0}.")]
    UnknownClient(ClientId),

    /// Client is waiting for its requests to drain before it is removed.
    #[error("Client {0} is being destroyed and accepts no new requests.")]
    ClientDestroyed(ClientId),

    /// Requested policy does not match the client and there is no paired client.
    #[error("Options request {requested:?} but client {client} uses {actual:?}.")]
    IncompatibleOptions {
        /// Target client.
        client: ClientId,
        /// Policy the options ask for.
        requested: EndOfLifePolicy,
        /// Policy of the client.
        actual: EndOfLifePolicy,
    },

    /// Options were already used by a request and cannot change or be sent again.
    #[error("Options {0} were already sent.")]
    OptionsConsumed(OptionsId),

    /// A named client with the same owner and name exists.
    #[error("Client named {name:?} already exists for owner {owner:?}.")]
    NameTaken {
        /// Owner of the client.
        owner: String,
        /// Client name.
        name: String,
    },

    /// No more handles are available.
    #[error(transparent)]
    HandlesExhausted(#[from] ArenaError),

    /// The response of the request has not been delivered yet.
    #[error("Request {0} has not completed yet.")]
    RequestPending(RequestId),
}
