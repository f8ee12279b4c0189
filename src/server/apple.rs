use std::time::Duration;

use chrono::Utc;
use p224::SecretKey;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{
    accessory::AccessoryKey,
    error::{Error, Result},
    owner::OwnerDevice,
    protocol::{EncryptedReportPayload, LocationReport},
};

use super::{anisette::RemoteAnisetteProvider, session::SessionCredential};

/// Client of the report-fetch endpoint: time-windowed search by hashed
/// public key, authorized with a [`SessionCredential`].
pub struct AppleReportsServer {
    client: Client,
    anisette: RemoteAnisetteProvider,
}

impl AppleReportsServer {
    const ENDPOINT_REPORTS_FETCH: &'static str =
        "https://gateway.icloud.com/acsnservice/fetch";

    /// Create a client. `timeout` bounds every network call.
    pub fn new(anisette: RemoteAnisetteProvider, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            anisette,
        })
    }

    /// Fetch the raw reports published for `ids` within the last
    /// `window_hours` hours, without decrypting them.
    ///
    /// Authorization failures (401/403) surface as [`Error::Http`]; the
    /// credential is never refreshed or retried here.
    pub async fn fetch_raw_reports(
        &self,
        session: &SessionCredential,
        ids: &[String],
        window_hours: u32,
    ) -> Result<Vec<AppleReportResponse>> {
        let end = Utc::now().timestamp();
        let start = end - i64::from(window_hours) * 3600;

        let fetch_request = ReportFetchRequest {
            search: vec![ReportSearch {
                start_date: start * 1000,
                end_date: end * 1000,
                ids: ids.to_vec(),
            }],
        };

        let headers = self.anisette.get_header_map().await?;

        let response = self
            .client
            .post(Self::ENDPOINT_REPORTS_FETCH)
            .headers(headers)
            .basic_auth(&session.dsid, Some(&session.search_party_token))
            .json(&fetch_request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Http {
                operation: "fetch reports",
                status: status.as_u16(),
            });
        }

        #[derive(Deserialize)]
        struct Response {
            results: Vec<AppleReportResponse>,
        }

        let body: Response = response.json().await?;
        tracing::info!(count = body.results.len(), "reports received");

        Ok(body.results)
    }

    /// Fetch and decrypt the reports for one accessory key, sorted
    /// ascending by observation time.
    pub async fn fetch_location_reports(
        &self,
        session: &SessionCredential,
        key: &AccessoryKey,
        window_hours: u32,
    ) -> Result<Vec<LocationReport>> {
        let hashed_public_key = key.hashed_public_key_base64();
        let raw_reports = self
            .fetch_raw_reports(session, &[hashed_public_key.clone()], window_hours)
            .await?;

        Ok(decrypt_reports(
            key.secret_key(),
            &hashed_public_key,
            &raw_reports,
        ))
    }
}

/// Decrypt a batch of raw reports with one accessory private key.
///
/// Reports that fail to parse or authenticate are dropped with a warning;
/// the rest of the batch is unaffected. The result is sorted ascending by
/// observation time regardless of the order the server returned.
pub fn decrypt_reports(
    accessory_private_key: &SecretKey,
    hashed_public_key: &str,
    raw_reports: &[AppleReportResponse],
) -> Vec<LocationReport> {
    let owner_device = OwnerDevice();

    let mut reports: Vec<LocationReport> = raw_reports
        .iter()
        .filter_map(|raw_report| {
            let decrypted = raw_report.encrypted_payload().and_then(|payload| {
                let location = owner_device.decrypt_report(accessory_private_key, &payload)?;
                Ok(LocationReport::new(
                    location,
                    payload.timestamp,
                    hashed_public_key.to_string(),
                ))
            });

            match decrypted {
                Ok(report) => Some(report),
                Err(error) => {
                    tracing::warn!(id = %raw_report.id, %error, "dropping undecryptable report");
                    None
                }
            }
        })
        .collect();

    reports.sort_by_key(|report| report.timestamp);
    reports
}

/// One raw report record as returned by the fetch endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppleReportResponse {
    /// Server-side publication time, epoch milliseconds.
    #[serde(rename = "datePublished")]
    pub date_published: u64,
    /// Base64 of the serialized encrypted report payload.
    pub payload: String,
    /// Free-form description, usually "found".
    #[serde(default)]
    pub description: String,
    /// Base64 hashed public key this report was filed under.
    pub id: String,
    /// Server-side status code for the record.
    #[serde(rename = "statusCode", default)]
    pub status_code: u8,
}

impl AppleReportResponse {
    /// Decode the base64 payload into its parsed wire form.
    pub fn encrypted_payload(&self) -> Result<EncryptedReportPayload> {
        EncryptedReportPayload::from_base64(&self.payload)
    }
}

/// Body of a report search request.
#[derive(Serialize, Deserialize)]
struct ReportFetchRequest {
    search: Vec<ReportSearch>,
}

/// One search clause: an epoch-millisecond window and the hashed keys to
/// look up.
#[derive(Serialize, Deserialize)]
struct ReportSearch {
    #[serde(rename = "startDate")]
    start_date: i64,
    #[serde(rename = "endDate")]
    end_date: i64,
    ids: Vec<String>,
}
