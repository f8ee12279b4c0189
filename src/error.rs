use thiserror::Error;

/// Everything that can go wrong in the protocol layer.
///
/// Integrity failures ([`Error::SessionVerification`],
/// [`Error::AuthenticationFailure`]) are never retried internally; transport
/// and server errors carry the operation name and HTTP status so callers can
/// decide their own retry policy.
#[derive(Error, Debug)]
pub enum Error {
    #[error("public key must be at least 28 bytes, got {actual}")]
    InvalidKeyLength { actual: usize },

    #[error("failed to decode key or report material: {0}")]
    Decode(String),

    #[error("gave up after {attempts} key generation attempts ({produced} keys accepted)")]
    ExhaustedAttempts { attempts: u32, produced: usize },

    #[error("identity service violated the handshake contract during {operation}: {detail}")]
    Protocol {
        operation: &'static str,
        detail: String,
    },

    #[error("server negotiated unsupported key derivation variant {0:?}")]
    UnsupportedVariant(String),

    #[error("could not produce an SRP client proof")]
    ProofGeneration,

    #[error("server proof mismatch; refusing to trust this session")]
    SessionVerification,

    #[error("second factor submission rejected with status {status}")]
    SecondFactorRejected { status: u16 },

    #[error("handshake restarted {0} times without clearing the second factor")]
    TooManySecondFactorAttempts(usize),

    #[error("report ciphertext failed GCM authentication")]
    AuthenticationFailure,

    #[error("authentication payload is missing {0}")]
    MalformedAuthPayload(&'static str),

    #[error("anisette provider is unreachable")]
    ProviderUnavailable(#[source] reqwest::Error),

    #[error("{operation} request failed with status {status}")]
    Http {
        operation: &'static str,
        status: u16,
    },

    #[error("transport error")]
    Transport(#[from] reqwest::Error),

    #[error("property list error")]
    Plist(#[from] plist::Error),
}

impl From<base64::DecodeError> for Error {
    fn from(value: base64::DecodeError) -> Self {
        Error::Decode(value.to_string())
    }
}

pub type Result<T> = core::result::Result<T, Error>;
