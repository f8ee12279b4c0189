use std::io::{BufRead, Write};

use crate::error::{Error, Result};

/// Anisette attestation provider.
pub mod anisette;
/// Report-fetch endpoint client.
pub mod apple;
/// GrandSlam identity service client.
pub mod gsa;
/// Session credential and its persistence seam.
pub mod session;

pub use anisette::RemoteAnisetteProvider;
pub use apple::{AppleReportResponse, AppleReportsServer};
pub use gsa::{derive_session, DeviceIdentity, GsaClient, SecondFactorMethod};
pub use session::{CredentialStore, MemoryCredentialStore, SessionCredential};

/// Single-shot, blocking operator interaction, used only for credentials
/// and one-time codes.
pub trait OperatorPrompt {
    /// Display `message` and return the operator's answer.
    fn prompt_text(&self, message: &str) -> Result<String>;
}

/// Prompts on the controlling terminal.
pub struct StdinPrompt();

impl OperatorPrompt for StdinPrompt {
    fn prompt_text(&self, message: &str) -> Result<String> {
        let mut stdout = std::io::stdout();
        stdout
            .write_all(message.as_bytes())
            .and_then(|()| stdout.flush())
            .map_err(|e| Error::Decode(format!("terminal: {e}")))?;

        let mut answer = String::new();
        std::io::stdin()
            .lock()
            .read_line(&mut answer)
            .map_err(|e| Error::Decode(format!("terminal: {e}")))?;

        Ok(answer.trim_end_matches(['\r', '\n']).to_string())
    }
}
