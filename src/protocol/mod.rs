mod aes;
mod public_key;
mod report;

pub use aes::Aes;
pub use public_key::{
    OfflineFindingPublicKey, ADVERTISEMENT_PREFIX, DEFAULT_STATE_BYTE,
};
pub use report::{
    EncryptedReportPayload, Location, LocationReport, APPLE_EPOCH_OFFSET,
};
