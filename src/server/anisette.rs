use std::collections::HashMap;

use reqwest::{
    header::{HeaderMap, HeaderName},
    Client,
};

use crate::error::{Error, Result};

/// Fetches device-identity attestation headers from an anisette v3 server.
///
/// The headers are opaque to this crate; they are merged into every
/// identity-service request and re-requested before each use because they
/// embed a timestamp. No identity-service request proceeds without them.
pub struct RemoteAnisetteProvider {
    endpoint: String,
    client: Client,
}

impl RemoteAnisetteProvider {
    /// Client string the identity service expects alongside the attestation
    /// headers.
    pub const CLIENT: &'static str = "<MacBookPro18,3> <Mac OS X;13.4.1;22F8> <com.apple.AOSKit/282 (com.apple.dt.Xcode/3594.4.19)>";

    /// Create a provider for the anisette server at `endpoint`.
    pub fn new(endpoint: &str, client: Client) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            client,
        }
    }

    /// Fetch a fresh snapshot of attestation headers.
    pub async fn get_headers(&self) -> Result<HashMap<String, String>> {
        let response = self
            .client
            .get(&self.endpoint)
            .send()
            .await
            .map_err(Error::ProviderUnavailable)?;

        let body: serde_json::Map<String, serde_json::Value> =
            response.json().await.map_err(Error::ProviderUnavailable)?;

        Ok(body
            .into_iter()
            .filter_map(|(k, v)| Some((k, v.as_str()?.to_string())))
            .collect())
    }

    /// Fetch attestation headers and render them as HTTP headers.
    pub async fn get_header_map(&self) -> Result<HeaderMap> {
        Self::header_map_from(&self.get_headers().await?)
    }

    /// Render an attestation snapshot as HTTP headers.
    pub fn header_map_from(data: &HashMap<String, String>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::with_capacity(data.len());
        for (k, v) in data {
            let name = k
                .parse::<HeaderName>()
                .map_err(|e| Error::Decode(format!("anisette header name {k:?}: {e}")))?;
            let value = v
                .parse()
                .map_err(|e| Error::Decode(format!("anisette header value for {k:?}: {e}")))?;
            headers.insert(name, value);
        }

        Ok(headers)
    }

    /// Build the `cpd` client-provided-data dictionary of a GSA request
    /// from an attestation snapshot: fixed capability flags plus the
    /// attestation fields, minus the client-info header which travels as a
    /// real HTTP header instead.
    pub fn cpd_from(data: &HashMap<String, String>) -> plist::Dictionary {
        let mut cpd = plist::Dictionary::new();
        cpd.insert("bootstrap".to_string(), plist::Value::Boolean(true));
        cpd.insert("icscrec".to_string(), plist::Value::Boolean(true));
        cpd.insert("pbe".to_string(), plist::Value::Boolean(false));
        cpd.insert("prkgen".to_string(), plist::Value::Boolean(true));
        cpd.insert(
            "svct".to_string(),
            plist::Value::String("iCloud".to_string()),
        );
        if let Some(locale) = data.get("X-Apple-Locale") {
            cpd.insert("loc".to_string(), plist::Value::String(locale.clone()));
        }

        for (k, v) in data {
            if k == "X-Mme-Client-Info" {
                continue;
            }
            cpd.insert(k.clone(), plist::Value::String(v.clone()));
        }

        cpd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> HashMap<String, String> {
        HashMap::from([
            ("X-Apple-Locale".to_string(), "en_US".to_string()),
            ("X-Apple-I-MD".to_string(), "AAAABQ==".to_string()),
            (
                "X-Mme-Client-Info".to_string(),
                RemoteAnisetteProvider::CLIENT.to_string(),
            ),
        ])
    }

    #[test]
    fn test_cpd_includes_locale_and_capability_flags() {
        let cpd = RemoteAnisetteProvider::cpd_from(&snapshot());

        assert_eq!(cpd.get("loc").unwrap().as_string(), Some("en_US"));
        assert_eq!(cpd.get("svct").unwrap().as_string(), Some("iCloud"));
        assert_eq!(cpd.get("bootstrap").unwrap().as_boolean(), Some(true));
        assert_eq!(
            cpd.get("X-Apple-I-MD").unwrap().as_string(),
            Some("AAAABQ==")
        );
    }

    #[test]
    fn test_cpd_excludes_client_info_header() {
        let cpd = RemoteAnisetteProvider::cpd_from(&snapshot());
        assert!(cpd.get("X-Mme-Client-Info").is_none());
    }

    #[test]
    fn test_header_map_from_snapshot() {
        let headers = RemoteAnisetteProvider::header_map_from(&snapshot()).unwrap();

        assert_eq!(headers.get("X-Apple-Locale").unwrap(), "en_US");
        assert_eq!(headers.len(), 3);
    }
}
