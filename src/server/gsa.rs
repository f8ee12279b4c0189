use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as b64, Engine as _};
use hmac::{Hmac, Mac};
use num_bigint::BigUint;
use plist::{Dictionary, Value};
use rand::{rngs::OsRng, RngCore};
use reqwest::{header::HeaderMap, Client};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use srp::{
    client::SrpClient,
    groups::G_2048,
    utils::{compute_k, compute_u},
};
use uuid::Uuid;

use crate::error::{Error, Result};

use super::{
    anisette::RemoteAnisetteProvider, session::SessionCredential, OperatorPrompt,
};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Per-process device and user identifiers sent to the identity service.
///
/// Generated once by the caller and injected at construction, so their
/// lifecycle is explicit rather than hidden in process globals.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    /// Client identifier presented to the delegates endpoint.
    pub user_id: String,
    /// Device identifier sent with every GSA request.
    pub device_id: String,
}

impl DeviceIdentity {
    /// Generate a fresh random identity.
    pub fn random() -> Self {
        Self {
            user_id: Uuid::new_v4().to_string(),
            device_id: Uuid::new_v4().to_string(),
        }
    }
}

/// How the operator wants to receive the second-factor challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecondFactorMethod {
    /// A code texted to the account's phone number.
    #[default]
    Sms,
    /// A code displayed on one of the account's trusted devices.
    TrustedDevice,
}

/// States of one authentication attempt. `SecondFactorPending` loops back
/// to `Init`: the whole handshake restarts from scratch once the operator
/// confirms the second factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeState {
    Init,
    ChallengeSent,
    ChallengeVerified,
    SecondFactorPending,
    Complete,
}

impl HandshakeState {
    /// Move to `next`, rejecting transitions the protocol does not allow.
    fn advance(&mut self, next: HandshakeState) -> Result<()> {
        use HandshakeState::*;

        let legal = matches!(
            (*self, next),
            (Init, ChallengeSent)
                | (ChallengeSent, ChallengeVerified)
                | (ChallengeVerified, SecondFactorPending)
                | (ChallengeVerified, Complete)
        );
        if !legal {
            return Err(Error::Protocol {
                operation: "handshake",
                detail: format!("illegal state transition {self:?} -> {next:?}"),
            });
        }

        tracing::debug!(from = ?self, to = ?next, "handshake transition");
        *self = next;
        Ok(())
    }
}

/// Result of one full handshake run.
enum HandshakeOutcome {
    /// The decrypted secure payload is the final session material.
    Complete(Dictionary),
    /// The server demands a second factor before granting a session.
    SecondFactorNeeded {
        adsid: String,
        idms_token: String,
    },
}

/// The password pre-hashing variant negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KdfVariant {
    S2k,
    /// Like `S2k`, but the SHA-256 digest is re-encoded as lowercase hex
    /// text before PBKDF2, doubling the effective hash input.
    S2kFo,
}

impl TryFrom<&str> for KdfVariant {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "s2k" => Ok(KdfVariant::S2k),
            "s2k_fo" => Ok(KdfVariant::S2kFo),
            other => Err(Error::UnsupportedVariant(other.to_string())),
        }
    }
}

/// Client of Apple's GrandSlam identity service: runs the SRP handshake,
/// the second-factor sub-flows and the delegates login.
pub struct GsaClient<P> {
    client: Client,
    anisette: RemoteAnisetteProvider,
    identity: DeviceIdentity,
    prompt: P,
}

impl<P: OperatorPrompt> GsaClient<P> {
    const ENDPOINT_GSA: &'static str = "https://gsa.apple.com/grandslam/GsService2";
    const ENDPOINT_LOGIN_MOBILEME: &'static str =
        "https://setup.icloud.com/setup/iosbuddy/loginDelegates";

    const ENDPOINT_2FA_SMS_REQUEST: &'static str = "https://gsa.apple.com/auth/verify/phone/";
    const ENDPOINT_2FA_SMS_SUBMIT: &'static str =
        "https://gsa.apple.com/auth/verify/phone/securitycode";
    const ENDPOINT_2FA_TD_REQUEST: &'static str =
        "https://gsa.apple.com/auth/verify/trusteddevice";
    const ENDPOINT_2FA_TD_SUBMIT: &'static str =
        "https://gsa.apple.com/grandslam/GsService2/validate";

    /// Handshake restarts allowed while the server keeps demanding a
    /// second factor.
    pub const MAX_SECOND_FACTOR_RESTARTS: usize = 3;

    /// Create a client. `timeout` bounds every network call; a cancelled
    /// call leaves no handshake state behind.
    pub fn new(
        anisette: RemoteAnisetteProvider,
        identity: DeviceIdentity,
        prompt: P,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            anisette,
            identity,
            prompt,
        })
    }

    /// Authenticate against the identity service and return the decrypted
    /// session payload.
    ///
    /// On a second-factor demand the corresponding sub-flow runs and the
    /// entire handshake restarts, at most
    /// [`Self::MAX_SECOND_FACTOR_RESTARTS`] times. The requested factor
    /// method applies to the first demand only; restarts degrade to the
    /// default method, as the reference flow does.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
        factor: SecondFactorMethod,
    ) -> Result<Dictionary> {
        let mut method = factor;

        for restart in 0..=Self::MAX_SECOND_FACTOR_RESTARTS {
            match self.run_handshake(username, password).await? {
                HandshakeOutcome::Complete(payload) => return Ok(payload),
                HandshakeOutcome::SecondFactorNeeded { adsid, idms_token } => {
                    if restart == Self::MAX_SECOND_FACTOR_RESTARTS {
                        break;
                    }

                    tracing::info!(?method, "second factor required, requesting code");
                    let confirmed = match method {
                        SecondFactorMethod::Sms => {
                            self.sms_second_factor(&adsid, &idms_token).await
                        }
                        SecondFactorMethod::TrustedDevice => {
                            self.trusted_device_second_factor(&adsid, &idms_token).await
                        }
                    };
                    if let Err(error) = confirmed {
                        tracing::warn!(%error, "second factor not confirmed, restarting handshake anyway");
                    }

                    method = SecondFactorMethod::default();
                }
            }
        }

        Err(Error::TooManySecondFactorAttempts(
            Self::MAX_SECOND_FACTOR_RESTARTS,
        ))
    }

    /// Authenticate, then exchange the one-time password token for mobileme
    /// delegate data. The response contains the session credential at the
    /// path [`derive_session`] extracts.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        factor: SecondFactorMethod,
    ) -> Result<Dictionary> {
        let payload = self.authenticate(username, password, factor).await?;

        let pet = payload
            .get("t")
            .and_then(Value::as_dictionary)
            .and_then(|t| t.get("com.apple.gs.idms.pet"))
            .and_then(Value::as_dictionary)
            .and_then(|pet| pet.get("token"))
            .and_then(Value::as_string)
            .ok_or(Error::MalformedAuthPayload("com.apple.gs.idms.pet token"))?
            .to_string();
        let adsid = payload_text(&payload, "adsid")?;

        let mut delegates = Dictionary::new();
        delegates.insert(
            "com.apple.mobileme".to_string(),
            Value::Dictionary(Dictionary::new()),
        );

        let mut body = Dictionary::new();
        body.insert("apple-id".to_string(), Value::String(username.to_string()));
        body.insert("delegates".to_string(), Value::Dictionary(delegates));
        body.insert("password".to_string(), Value::String(pet.clone()));
        body.insert(
            "client-id".to_string(),
            Value::String(self.identity.user_id.clone()),
        );

        let mut body_bytes: Vec<u8> = vec![];
        Value::Dictionary(body).to_writer_xml(&mut body_bytes)?;

        let mut headers = self.anisette.get_header_map().await?;
        headers.insert(
            "X-Apple-ADSID",
            adsid
                .parse()
                .map_err(|e| Error::Decode(format!("adsid header: {e}")))?,
        );
        headers.insert(
            "User-Agent",
            "com.apple.iCloudHelper/282 CFNetwork/1408.0.4 Darwin/22.5.0"
                .parse()
                .expect("static header value"),
        );

        let response = self
            .client
            .post(Self::ENDPOINT_LOGIN_MOBILEME)
            .headers(headers)
            .basic_auth(username, Some(&pet))
            .body(body_bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                operation: "login delegates",
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await?;
        let value: Value = plist::from_bytes(&bytes)?;
        value
            .into_dictionary()
            .ok_or(Error::MalformedAuthPayload("login delegates dictionary"))
    }

    /// Run one complete SRP handshake against the identity service.
    async fn run_handshake(&self, username: &str, password: &str) -> Result<HandshakeOutcome> {
        let mut state = HandshakeState::Init;

        let mut a = [0u8; 64];
        OsRng.fill_bytes(&mut a);
        let a_pub = client_ephemeral(&a);

        let mut params = Dictionary::new();
        params.insert("A2k".to_string(), Value::Data(a_pub.clone()));
        params.insert(
            "ps".to_string(),
            Value::Array(vec![
                Value::String("s2k".to_string()),
                Value::String("s2k_fo".to_string()),
            ]),
        );
        params.insert("u".to_string(), Value::String(username.to_string()));
        params.insert("o".to_string(), Value::String("init".to_string()));

        let response = self.gsa_request("init", params).await?;
        state.advance(HandshakeState::ChallengeSent)?;

        check_status("init", &response)?;
        let salt = dict_data(&response, "s", "init")?.to_vec();
        let iterations: u32 = response
            .get("i")
            .and_then(Value::as_unsigned_integer)
            .and_then(|i| u32::try_from(i).ok())
            .ok_or_else(|| protocol_error("init", "missing iteration count"))?;
        let variant = KdfVariant::try_from(
            dict_string(&response, "sp", "init")?,
        )?;
        let cookie = dict_string(&response, "c", "init")?.to_string();
        let b_pub = dict_data(&response, "B", "init")?.to_vec();

        let password_key = derive_password_key(password, &salt, iterations, variant);
        let exchange = srp_exchange(username, &password_key, &salt, &a, &a_pub, &b_pub)?;

        let mut params = Dictionary::new();
        params.insert("c".to_string(), Value::String(cookie));
        params.insert("M1".to_string(), Value::Data(exchange.client_proof.clone()));
        params.insert("u".to_string(), Value::String(username.to_string()));
        params.insert("o".to_string(), Value::String("complete".to_string()));

        let response = self.gsa_request("complete", params).await?;
        check_status("complete", &response)?;

        let server_proof = dict_data(&response, "M2", "complete")?;
        verify_server_proof(&exchange.expected_server_proof, server_proof)?;
        state.advance(HandshakeState::ChallengeVerified)?;

        let encrypted_payload = dict_data(&response, "spd", "complete")?;
        let payload = parse_secure_payload(&decrypt_secure_payload(
            &exchange.session_key,
            encrypted_payload,
        )?)?;

        if requires_second_factor(&response) {
            state.advance(HandshakeState::SecondFactorPending)?;
            let adsid = payload_text(&payload, "adsid")?;
            let idms_token = payload_text(&payload, "GsIdmsToken")?;

            return Ok(HandshakeOutcome::SecondFactorNeeded { adsid, idms_token });
        }

        state.advance(HandshakeState::Complete)?;
        Ok(HandshakeOutcome::Complete(payload))
    }

    /// Post one plist-bodied request to the GSA endpoint, with the
    /// attestation snapshot merged into both the `cpd` dictionary and the
    /// HTTP headers.
    async fn gsa_request(
        &self,
        operation: &'static str,
        params: Dictionary,
    ) -> Result<Dictionary> {
        let attestation = self.anisette.get_headers().await?;

        let mut request = Dictionary::new();
        request.insert(
            "cpd".to_string(),
            Value::Dictionary(RemoteAnisetteProvider::cpd_from(&attestation)),
        );
        for (k, v) in params {
            request.insert(k, v);
        }

        let mut header_dict = Dictionary::new();
        header_dict.insert("Version".to_string(), Value::String("1.0.1".to_string()));

        let mut body = Dictionary::new();
        body.insert("Header".to_string(), Value::Dictionary(header_dict));
        body.insert("Request".to_string(), Value::Dictionary(request));

        let mut body_bytes: Vec<u8> = vec![];
        Value::Dictionary(body).to_writer_xml(&mut body_bytes)?;

        let mut headers = RemoteAnisetteProvider::header_map_from(&attestation)?;
        headers.insert(
            "Content-Type",
            "text/x-xml-plist".parse().expect("static header value"),
        );
        headers.insert("Accept", "*/*".parse().expect("static header value"));
        headers.insert(
            "User-Agent",
            "akd/1.0 CFNetwork/978.0.7 Darwin/18.7.0"
                .parse()
                .expect("static header value"),
        );
        headers.insert(
            "X-MMe-Client-Info",
            RemoteAnisetteProvider::CLIENT.parse().expect("static header value"),
        );
        headers.insert(
            "X-Mme-Device-Id",
            self.identity
                .device_id
                .parse()
                .map_err(|e| Error::Decode(format!("device id header: {e}")))?,
        );

        let response = self
            .client
            .post(Self::ENDPOINT_GSA)
            .headers(headers)
            .body(body_bytes)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                operation,
                status: status.as_u16(),
            });
        }

        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "Response")]
            response: Dictionary,
        }

        let bytes = response.bytes().await?;
        let body: Response = plist::from_bytes(&bytes)?;

        Ok(body.response)
    }

    /// Shared headers of both second-factor sub-flows.
    async fn second_factor_headers(&self, adsid: &str, idms_token: &str) -> Result<HeaderMap> {
        let identity_token = b64.encode(format!("{adsid}:{idms_token}"));

        let mut headers = self.anisette.get_header_map().await?;
        headers.insert(
            "Accept",
            "application/json, text/javascript, */*"
                .parse()
                .expect("static header value"),
        );
        headers.insert(
            "X-Apple-Identity-Token",
            identity_token.parse().expect("base64 is a valid header value"),
        );
        headers.insert(
            "X-Apple-App-Info",
            "com.apple.gs.xcode.auth".parse().expect("static header value"),
        );
        headers.insert(
            "X-Xcode-Version",
            "11.2 (11B41)".parse().expect("static header value"),
        );
        headers.insert("User-Agent", "Xcode".parse().expect("static header value"));

        Ok(headers)
    }

    /// Trigger a code on a trusted device, prompt for it, submit it.
    async fn trusted_device_second_factor(&self, adsid: &str, idms_token: &str) -> Result<()> {
        let mut headers = self.second_factor_headers(adsid, idms_token).await?;

        self.client
            .get(Self::ENDPOINT_2FA_TD_REQUEST)
            .headers(headers.clone())
            .send()
            .await?;

        let code = self.prompt.prompt_text("Enter 2FA code: ")?;
        headers.insert(
            "security-code",
            code.parse()
                .map_err(|e| Error::Decode(format!("security code header: {e}")))?,
        );
        headers.insert(
            "Accept",
            "text/x-xml-plist".parse().expect("static header value"),
        );

        let response = self
            .client
            .get(Self::ENDPOINT_2FA_TD_SUBMIT)
            .headers(headers)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::SecondFactorRejected {
                status: status.as_u16(),
            });
        }

        tracing::info!("second factor confirmed");
        Ok(())
    }

    /// Trigger an SMS code, prompt for it, submit it.
    async fn sms_second_factor(&self, adsid: &str, idms_token: &str) -> Result<()> {
        let mut headers = self.second_factor_headers(adsid, idms_token).await?;
        headers.insert(
            "Content-Type",
            "application/json".parse().expect("static header value"),
        );

        let trigger = serde_json::json!({ "phoneNumber": { "id": 1 }, "mode": "sms" });
        let response = self
            .client
            .put(Self::ENDPOINT_2FA_SMS_REQUEST)
            .headers(headers.clone())
            .json(&trigger)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::SecondFactorRejected {
                status: status.as_u16(),
            });
        }

        let code = self.prompt.prompt_text("Enter 2FA code: ")?;
        let submit = serde_json::json!({
            "phoneNumber": { "id": 1 },
            "mode": "sms",
            "securityCode": { "code": code },
        });

        let response = self
            .client
            .post(Self::ENDPOINT_2FA_SMS_SUBMIT)
            .headers(headers)
            .json(&submit)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::SecondFactorRejected {
                status: status.as_u16(),
            });
        }

        tracing::info!("second factor confirmed");
        Ok(())
    }
}

/// Extract the session credential from a delegates login response.
pub fn derive_session(payload: &Dictionary) -> Result<SessionCredential> {
    let dsid = match payload.get("dsid") {
        Some(Value::String(s)) => s.clone(),
        Some(v) => v
            .as_signed_integer()
            .map(|i| i.to_string())
            .ok_or(Error::MalformedAuthPayload("dsid"))?,
        None => return Err(Error::MalformedAuthPayload("dsid")),
    };

    let token = payload
        .get("delegates")
        .and_then(Value::as_dictionary)
        .and_then(|d| d.get("com.apple.mobileme"))
        .and_then(Value::as_dictionary)
        .and_then(|d| d.get("service-data"))
        .and_then(Value::as_dictionary)
        .and_then(|d| d.get("tokens"))
        .and_then(Value::as_dictionary)
        .and_then(|d| d.get("searchPartyToken"))
        .and_then(Value::as_string)
        .ok_or(Error::MalformedAuthPayload("searchPartyToken"))?;

    Ok(SessionCredential {
        dsid,
        search_party_token: token.to_string(),
    })
}

/// The client-side results of one SRP exchange: the proof that goes on the
/// wire, the counter-proof the server must echo, and the hashed session key
/// that protects the secure payload.
struct SrpExchange {
    client_proof: Vec<u8>,
    expected_server_proof: Vec<u8>,
    session_key: Vec<u8>,
}

/// The client's public ephemeral `A = g^a mod N`, minimal big-endian bytes.
fn client_ephemeral(a: &[u8]) -> Vec<u8> {
    G_2048
        .g
        .modpow(&BigUint::from_bytes_be(a), &G_2048.n)
        .to_bytes_be()
}

/// `H(N) ⊕ H(g)`, with `g` left-padded to the width of `N` before hashing.
fn group_hash_xor() -> [u8; 32] {
    let n = G_2048.n.to_bytes_be();
    let g = G_2048.g.to_bytes_be();
    let mut padded_g = vec![0u8; n.len()];
    padded_g[n.len() - g.len()..].copy_from_slice(&g);

    let hn = Sha256::digest(&n);
    let hg = Sha256::digest(&padded_g);

    let mut out = [0u8; 32];
    for (byte, (left, right)) in out.iter_mut().zip(hn.iter().zip(hg.iter())) {
        *byte = left ^ right;
    }
    out
}

/// Run the client side of the SRP-6a exchange the identity service speaks.
///
/// The service verifies the full RFC 2945 proof
/// `M1 = H(H(N)⊕H(g) ‖ H(I) ‖ s ‖ A ‖ B ‖ K)` with the hashed session key
/// `K = H(S)`, expects `x = H(s ‖ H(I ‖ ":" ‖ P))` over the PBKDF2-derived
/// password key, and answers with `M2 = H(A ‖ M1 ‖ K)`. `K`, not the raw
/// premaster secret, is what keys the secure payload.
fn srp_exchange(
    username: &str,
    password_key: &[u8],
    salt: &[u8],
    a: &[u8],
    a_pub: &[u8],
    b_pub: &[u8],
) -> Result<SrpExchange> {
    let n = &G_2048.n;
    let g = &G_2048.g;

    let b_int = BigUint::from_bytes_be(b_pub) % n;
    if b_int == BigUint::from(0u32) {
        return Err(Error::ProofGeneration);
    }

    let u = compute_u::<Sha256>(a_pub, b_pub);
    let k = compute_k::<Sha256>(&G_2048);

    let identity_hash =
        SrpClient::<Sha256>::compute_identity_hash(username.as_bytes(), password_key);
    let x = SrpClient::<Sha256>::compute_x(identity_hash.as_slice(), salt);

    // S = (B - k * g^x) ^ (a + u * x) mod N
    let base = (&b_int + n - (&k * g.modpow(&x, n)) % n) % n;
    let exponent = BigUint::from_bytes_be(a) + &u * &x;
    let premaster = base.modpow(&exponent, n);

    let session_key = Sha256::digest(premaster.to_bytes_be()).to_vec();

    let mut m1 = Sha256::new();
    m1.update(group_hash_xor());
    m1.update(Sha256::digest(username.as_bytes()));
    m1.update(salt);
    m1.update(a_pub);
    m1.update(b_pub);
    m1.update(&session_key);
    let client_proof = m1.finalize().to_vec();

    let mut m2 = Sha256::new();
    m2.update(a_pub);
    m2.update(&client_proof);
    m2.update(&session_key);
    let expected_server_proof = m2.finalize().to_vec();

    Ok(SrpExchange {
        client_proof,
        expected_server_proof,
        session_key,
    })
}

/// Check the server's counter-proof; a mismatch means the server never knew
/// the verifier and no credential may be produced.
fn verify_server_proof(expected: &[u8], received: &[u8]) -> Result<()> {
    if expected != received {
        return Err(Error::SessionVerification);
    }
    Ok(())
}

/// `H(secret)` (re-hex-encoded first for `s2k_fo`), then PBKDF2-HMAC-SHA256
/// to 32 bytes. Must be bit-exact with the server's expectation.
fn derive_password_key(
    password: &str,
    salt: &[u8],
    iterations: u32,
    variant: KdfVariant,
) -> [u8; 32] {
    let hashed_password = Sha256::digest(password.as_bytes());
    let password_bytes = match variant {
        KdfVariant::S2k => hashed_password.to_vec(),
        KdfVariant::S2kFo => hex::encode(hashed_password).into_bytes(),
    };

    pbkdf2::pbkdf2_hmac_array::<Sha256, 32>(&password_bytes, salt, iterations)
}

/// Key and IV for the secure payload are both HMAC-SHA256 of the shared
/// secret under fixed labels; the IV is truncated to the block size.
fn session_subkey(session_key: &[u8], label: &str) -> [u8; 32] {
    let mut mac = Hmac::<Sha256>::new_from_slice(session_key)
        .expect("HMAC accepts keys of any length");
    mac.update(label.as_bytes());
    mac.finalize().into_bytes().into()
}

/// Decrypt the server's secure payload: AES-256-CBC with PKCS#7 padding.
fn decrypt_secure_payload(session_key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};

    let key = session_subkey(session_key, "extra data key:");
    let iv = session_subkey(session_key, "extra data iv:");

    Aes256CbcDec::new(key.as_slice().into(), iv[..16].into())
        .decrypt_padded_vec_mut::<Pkcs7>(data)
        .map_err(|_| protocol_error("complete", "secure payload padding invalid"))
}

/// The decrypted secure payload is a bare XML dictionary fragment; wrap it
/// so the plist parser accepts it.
fn parse_secure_payload(bytes: &[u8]) -> Result<Dictionary> {
    let mut wrapped = Vec::with_capacity(bytes.len() + 16);
    wrapped.extend_from_slice(b"<plist>");
    wrapped.extend_from_slice(bytes);
    wrapped.extend_from_slice(b"</plist>");

    let value: Value = plist::from_bytes(&wrapped)?;
    value
        .into_dictionary()
        .ok_or(Error::MalformedAuthPayload("secure payload dictionary"))
}

/// Read a payload field as text, base64-encoding binary values at this
/// boundary only.
fn payload_text(payload: &Dictionary, key: &'static str) -> Result<String> {
    match payload.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Data(d)) => Ok(b64.encode(d)),
        _ => Err(Error::MalformedAuthPayload(key)),
    }
}

/// Fail if the response's `Status` dictionary reports a non-zero error
/// code.
fn check_status(operation: &'static str, response: &Dictionary) -> Result<()> {
    let status = response
        .get("Status")
        .and_then(Value::as_dictionary)
        .ok_or_else(|| protocol_error(operation, "response carries no Status"))?;

    let ec = status
        .get("ec")
        .and_then(Value::as_signed_integer)
        .unwrap_or(0);
    if ec != 0 {
        let em = status
            .get("em")
            .and_then(Value::as_string)
            .unwrap_or("unknown error");
        return Err(protocol_error(operation, &format!("server error {ec}: {em}")));
    }

    Ok(())
}

/// Whether the server's status names one of the second-factor markers.
fn requires_second_factor(response: &Dictionary) -> bool {
    response
        .get("Status")
        .and_then(Value::as_dictionary)
        .and_then(|s| s.get("au"))
        .and_then(Value::as_string)
        .is_some_and(|au| matches!(au, "trustedDeviceSecondaryAuth" | "secondaryAuth"))
}

fn protocol_error(operation: &'static str, detail: &str) -> Error {
    Error::Protocol {
        operation,
        detail: detail.to_string(),
    }
}

fn dict_data<'a>(
    dict: &'a Dictionary,
    key: &str,
    operation: &'static str,
) -> Result<&'a [u8]> {
    dict.get(key)
        .and_then(Value::as_data)
        .ok_or_else(|| protocol_error(operation, &format!("missing data field {key:?}")))
}

fn dict_string<'a>(
    dict: &'a Dictionary,
    key: &str,
    operation: &'static str,
) -> Result<&'a str> {
    dict.get(key)
        .and_then(Value::as_string)
        .ok_or_else(|| protocol_error(operation, &format!("missing string field {key:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_exchange() -> (Vec<u8>, Vec<u8>, SrpExchange) {
        let a = [7u8; 64];
        let b = [9u8; 64];
        let salt = [0x5au8; 32];
        let password_key = [0xabu8; 32];

        // a server that actually holds the verifier for this password key
        let identity_hash = SrpClient::<Sha256>::compute_identity_hash(
            b"user@example.com",
            &password_key,
        );
        let x = SrpClient::<Sha256>::compute_x(identity_hash.as_slice(), &salt);
        let verifier = G_2048.g.modpow(&x, &G_2048.n);
        let k = compute_k::<Sha256>(&G_2048);
        let b_pub = ((&k * &verifier) % &G_2048.n
            + G_2048.g.modpow(&BigUint::from_bytes_be(&b), &G_2048.n))
            % &G_2048.n;
        let b_pub = b_pub.to_bytes_be();

        let a_pub = client_ephemeral(&a);
        let exchange =
            srp_exchange("user@example.com", &password_key, &salt, &a, &a_pub, &b_pub)
                .unwrap();

        (a_pub, b_pub, exchange)
    }

    #[test]
    fn test_srp_exchange_agrees_with_verifier_holding_server() {
        let (a_pub, b_pub, exchange) = sample_exchange();

        let b = [9u8; 64];
        let salt = [0x5au8; 32];
        let password_key = [0xabu8; 32];
        let n = &G_2048.n;

        let identity_hash = SrpClient::<Sha256>::compute_identity_hash(
            b"user@example.com",
            &password_key,
        );
        let x = SrpClient::<Sha256>::compute_x(identity_hash.as_slice(), &salt);
        let verifier = G_2048.g.modpow(&x, n);

        // server side: S = (A * v^u)^b, K = H(S), M2 = H(A ‖ M1 ‖ K)
        let u = compute_u::<Sha256>(&a_pub, &b_pub);
        let premaster = ((BigUint::from_bytes_be(&a_pub) % n) * verifier.modpow(&u, n) % n)
            .modpow(&BigUint::from_bytes_be(&b), n);
        let server_key = Sha256::digest(premaster.to_bytes_be()).to_vec();
        assert_eq!(server_key, exchange.session_key);

        let mut m2 = Sha256::new();
        m2.update(&a_pub);
        m2.update(&exchange.client_proof);
        m2.update(&server_key);
        assert_eq!(m2.finalize().to_vec(), exchange.expected_server_proof);
    }

    #[test]
    fn test_client_proof_is_not_a_bare_transcript_hash() {
        let (a_pub, b_pub, exchange) = sample_exchange();
        let a = [7u8; 64];
        let salt = [0x5au8; 32];
        let password_key = [0xabu8; 32];

        // H(A ‖ B ‖ K) omits the group hash, identity, and salt
        let mut naive = Sha256::new();
        naive.update(&a_pub);
        naive.update(&b_pub);
        naive.update(&exchange.session_key);
        assert_ne!(exchange.client_proof, naive.finalize().to_vec());

        let other_salt =
            srp_exchange("user@example.com", &password_key, &[0x11u8; 32], &a, &a_pub, &b_pub)
                .unwrap();
        assert_ne!(other_salt.client_proof, exchange.client_proof);

        let other_user =
            srp_exchange("other@example.com", &password_key, &salt, &a, &a_pub, &b_pub)
                .unwrap();
        assert_ne!(other_user.client_proof, exchange.client_proof);
    }

    #[test]
    fn test_session_key_is_hashed_premaster_not_raw_secret() {
        let (_, _, exchange) = sample_exchange();

        // K is one SHA-256 output, never the raw premaster integer
        assert_eq!(exchange.session_key.len(), 32);
    }

    #[test]
    fn test_zero_server_ephemeral_is_rejected() {
        let a = [7u8; 64];
        let a_pub = client_ephemeral(&a);
        let b_pub = G_2048.n.to_bytes_be(); // B ≡ 0 mod N

        assert!(matches!(
            srp_exchange("user@example.com", &[0xabu8; 32], &[0x5au8; 32], &a, &a_pub, &b_pub),
            Err(Error::ProofGeneration)
        ));
    }

    #[test]
    fn test_server_proof_mismatch_fails_verification() {
        let (_, _, exchange) = sample_exchange();

        let mut forged = exchange.expected_server_proof.clone();
        forged[0] ^= 0x01;

        assert!(matches!(
            verify_server_proof(&exchange.expected_server_proof, &forged),
            Err(Error::SessionVerification)
        ));
        assert!(verify_server_proof(
            &exchange.expected_server_proof,
            &exchange.expected_server_proof
        )
        .is_ok());
    }

    #[test]
    fn test_handshake_transitions_are_ordered() {
        let mut state = HandshakeState::Init;

        assert!(state.advance(HandshakeState::ChallengeVerified).is_err());
        assert!(state.advance(HandshakeState::Complete).is_err());

        state.advance(HandshakeState::ChallengeSent).unwrap();
        state.advance(HandshakeState::ChallengeVerified).unwrap();
        state.advance(HandshakeState::Complete).unwrap();

        assert!(state.advance(HandshakeState::SecondFactorPending).is_err());
    }

    #[test]
    fn test_kdf_variant_negotiation() {
        assert_eq!(KdfVariant::try_from("s2k").unwrap(), KdfVariant::S2k);
        assert_eq!(KdfVariant::try_from("s2k_fo").unwrap(), KdfVariant::S2kFo);
        assert!(matches!(
            KdfVariant::try_from("srp_rfc"),
            Err(Error::UnsupportedVariant(v)) if v == "srp_rfc"
        ));
    }

    #[test]
    fn test_password_key_is_deterministic_but_variant_sensitive() {
        let salt = [7u8; 32];

        let s2k = derive_password_key("hunter2", &salt, 100, KdfVariant::S2k);
        let s2k_again = derive_password_key("hunter2", &salt, 100, KdfVariant::S2k);
        let s2k_fo = derive_password_key("hunter2", &salt, 100, KdfVariant::S2kFo);

        assert_eq!(s2k, s2k_again);
        assert_ne!(s2k, s2k_fo);
    }

    #[test]
    fn test_secure_payload_roundtrip() {
        use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
        type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

        let session_key = [0x42u8; 32];
        let plaintext = b"<dict><key>adsid</key><string>001-23-456</string></dict>";

        let key = session_subkey(&session_key, "extra data key:");
        let iv = session_subkey(&session_key, "extra data iv:");
        let ciphertext = Aes256CbcEnc::new(key.as_slice().into(), iv[..16].into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let decrypted = decrypt_secure_payload(&session_key, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);

        let payload = parse_secure_payload(&decrypted).unwrap();
        assert_eq!(payload.get("adsid").unwrap().as_string(), Some("001-23-456"));
    }

    #[test]
    fn test_corrupted_secure_payload_never_yields_plaintext() {
        use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
        type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

        let session_key = [0x42u8; 32];
        let plaintext = b"<dict><key>adsid</key><string>001-23-456</string></dict>";

        let key = session_subkey(&session_key, "extra data key:");
        let iv = session_subkey(&session_key, "extra data iv:");
        let mut ciphertext = Aes256CbcEnc::new(key.as_slice().into(), iv[..16].into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        ciphertext[0] ^= 0x01;

        match decrypt_secure_payload(&session_key, &ciphertext) {
            Err(Error::Protocol { .. }) => (),
            Ok(decrypted) => assert_ne!(decrypted, plaintext.to_vec()),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_payload_text_encodes_binary_fields() {
        let mut payload = Dictionary::new();
        payload.insert(
            "GsIdmsToken".to_string(),
            Value::Data(vec![0x01, 0x02, 0x03]),
        );
        payload.insert("adsid".to_string(), Value::String("001-23-456".to_string()));

        assert_eq!(payload_text(&payload, "GsIdmsToken").unwrap(), "AQID");
        assert_eq!(payload_text(&payload, "adsid").unwrap(), "001-23-456");
        assert!(matches!(
            payload_text(&payload, "absent"),
            Err(Error::MalformedAuthPayload("absent"))
        ));
    }

    #[test]
    fn test_check_status_surfaces_server_error() {
        let mut status = Dictionary::new();
        status.insert("ec".to_string(), Value::Integer(5000i64.into()));
        status.insert(
            "em".to_string(),
            Value::String("bad credentials".to_string()),
        );
        let mut response = Dictionary::new();
        response.insert("Status".to_string(), Value::Dictionary(status));

        let result = check_status("init", &response);
        assert!(
            matches!(result, Err(Error::Protocol { operation: "init", ref detail }) if detail.contains("bad credentials"))
        );
    }

    #[test]
    fn test_check_status_accepts_clean_response() {
        let mut status = Dictionary::new();
        status.insert("ec".to_string(), Value::Integer(0i64.into()));
        let mut response = Dictionary::new();
        response.insert("Status".to_string(), Value::Dictionary(status));

        assert!(check_status("complete", &response).is_ok());
    }

    #[test]
    fn test_requires_second_factor_markers() {
        for (au, expected) in [
            ("trustedDeviceSecondaryAuth", true),
            ("secondaryAuth", true),
            ("somethingElse", false),
        ] {
            let mut status = Dictionary::new();
            status.insert("au".to_string(), Value::String(au.to_string()));
            let mut response = Dictionary::new();
            response.insert("Status".to_string(), Value::Dictionary(status));

            assert_eq!(requires_second_factor(&response), expected, "au = {au}");
        }

        assert!(!requires_second_factor(&Dictionary::new()));
    }

    #[test]
    fn test_derive_session_extracts_token_path() {
        let mut tokens = Dictionary::new();
        tokens.insert(
            "searchPartyToken".to_string(),
            Value::String("token-value".to_string()),
        );
        let mut service_data = Dictionary::new();
        service_data.insert("tokens".to_string(), Value::Dictionary(tokens));
        let mut mobileme = Dictionary::new();
        mobileme.insert("service-data".to_string(), Value::Dictionary(service_data));
        let mut delegates = Dictionary::new();
        delegates.insert("com.apple.mobileme".to_string(), Value::Dictionary(mobileme));

        let mut payload = Dictionary::new();
        payload.insert("dsid".to_string(), Value::String("12345".to_string()));
        payload.insert("delegates".to_string(), Value::Dictionary(delegates));

        let session = derive_session(&payload).unwrap();
        assert_eq!(session.dsid, "12345");
        assert_eq!(session.search_party_token, "token-value");
    }

    #[test]
    fn test_derive_session_rejects_missing_path() {
        let mut payload = Dictionary::new();
        payload.insert("dsid".to_string(), Value::String("12345".to_string()));

        assert!(matches!(
            derive_session(&payload),
            Err(Error::MalformedAuthPayload("searchPartyToken"))
        ));
    }
}
