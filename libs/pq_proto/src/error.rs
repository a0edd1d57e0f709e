use thiserror::Error;

/// Failure while decoding a client's opening handshake.
///
/// None of these ever reach a connected backend: they are raised before a
/// backend socket exists, so the only possible remedy is to close the client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("startup message length {0} is below the minimum of 8 bytes")]
    MessageTooShort(i32),

    #[error("startup message length {len} exceeds the {max} byte ceiling")]
    MessageTooLarge { len: usize, max: usize },

    #[error("startup parameters are not valid UTF-8")]
    InvalidUtf8,

    #[error("startup parameters are missing a 'database' or 'user' key")]
    MissingDatabase,

    #[error("malformed key/value parameter list in StartupMessage")]
    MalformedParameters,

    #[error("CancelRequest payload is truncated")]
    TruncatedCancelRequest,
}
