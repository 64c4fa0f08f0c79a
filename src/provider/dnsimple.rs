//! DNSimple (v2 API) DNS-01 provider.

use std::collections::HashMap;

use parking_lot::Mutex;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{challenge_record_name, DnsChallengeProvider, ProviderError};

pub const DEFAULT_BASE_URL: &str = "https://api.dnsimple.com";

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const RECORD_TTL: u32 = 120;
const ZONES_PER_PAGE: u32 = 100;

/// Builder for [`DnsimpleProvider`].
pub struct DnsimpleBuilder {
    token: String,
    account_id: Option<String>,
    base_url: String,
    user_agent: String,
    client: Option<Client>,
}

impl DnsimpleBuilder {
    /// Use a fixed account instead of looking it up with `whoami`.
    pub fn account_id(mut self, account_id: String) -> Self {
        self.account_id = Some(account_id);
        self
    }

    /// Account from the `--user` flag. Older releases took the DNSimple login
    /// e-mail there; an address is ignored and the account is looked up with
    /// `whoami` instead.
    pub fn user(self, user: &str) -> Self {
        if user.contains('@') {
            debug!(user = %user, "DNSimple user is an e-mail address, resolving account from token");
            return self;
        }
        self.account_id(user.to_string())
    }

    /// Talk to a different API endpoint, e.g. the DNSimple sandbox.
    pub fn base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Use a custom [`reqwest::blocking::Client`].
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn build(self) -> Result<DnsimpleProvider, ProviderError> {
        let client = match self.client {
            Some(client) => client,
            None => Client::builder().user_agent(self.user_agent).build()?,
        };

        Ok(DnsimpleProvider {
            client,
            token: self.token,
            base_url: self.base_url,
            account_id: Mutex::new(self.account_id),
            records: Mutex::new(HashMap::new()),
        })
    }
}

/// A TXT record this provider created and must remove again.
#[derive(Debug, Clone)]
struct CreatedRecord {
    zone: String,
    id: u64,
}

pub struct DnsimpleProvider {
    client: Client,
    token: String,
    base_url: String,
    account_id: Mutex<Option<String>>,
    records: Mutex<HashMap<(String, String), CreatedRecord>>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct Whoami {
    account: Option<WhoamiAccount>,
}

#[derive(Deserialize)]
struct WhoamiAccount {
    id: u64,
}

#[derive(Deserialize)]
struct Zone {
    name: String,
}

#[derive(Deserialize)]
struct Page<T> {
    data: Vec<T>,
    pagination: Option<Pagination>,
}

#[derive(Deserialize)]
struct Pagination {
    total_pages: u32,
}

#[derive(Serialize)]
struct NewRecord<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    content: &'a str,
    ttl: u32,
}

#[derive(Deserialize)]
struct Record {
    id: u64,
}

#[derive(Deserialize)]
struct ApiMessage {
    message: String,
}

impl DnsimpleProvider {
    pub fn builder(token: String) -> DnsimpleBuilder {
        DnsimpleBuilder {
            token,
            account_id: None,
            base_url: DEFAULT_BASE_URL.to_string(),
            user_agent: USER_AGENT.to_string(),
            client: None,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}/v2/{}", self.base_url, path))
            .bearer_auth(&self.token)
    }

    fn account_id(&self) -> Result<String, ProviderError> {
        let mut account_id = self.account_id.lock();
        if let Some(id) = account_id.as_ref() {
            return Ok(id.clone());
        }

        let whoami: Envelope<Whoami> = parse(self.get("whoami").send()?)?;
        let id = whoami
            .data
            .account
            .ok_or_else(|| ProviderError::Api {
                status: 200,
                message: "token is not bound to an account".to_string(),
            })?
            .id
            .to_string();

        debug!(account = %id, "Resolved DNSimple account");
        *account_id = Some(id.clone());
        Ok(id)
    }

    /// The longest hosted zone that `fqdn` falls under.
    fn find_zone(&self, account: &str, fqdn: &str) -> Result<String, ProviderError> {
        let mut best: Option<String> = None;
        let mut page = 1;
        loop {
            let zones: Page<Zone> = parse(
                self.get(&format!("{}/zones", account))
                    .query(&[("page", page), ("per_page", ZONES_PER_PAGE)])
                    .send()?,
            )?;

            for zone in zones.data {
                let name = zone.name.to_ascii_lowercase();
                let contains = fqdn == name || fqdn.ends_with(&format!(".{}", name));
                if contains && best.as_ref().map_or(true, |b| name.len() > b.len()) {
                    best = Some(name);
                }
            }

            match zones.pagination {
                Some(p) if page < p.total_pages => page += 1,
                _ => break,
            }
        }

        best.ok_or_else(|| ProviderError::ZoneNotFound(fqdn.to_string()))
    }
}

/// Record name relative to its zone; empty for the apex.
fn relative_name(fqdn: &str, zone: &str) -> String {
    fqdn.strip_suffix(zone)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fqdn)
        .to_string()
}

fn parse<T: DeserializeOwned>(response: Response) -> Result<T, ProviderError> {
    let response = check(response)?;
    Ok(response.json()?)
}

fn check(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().unwrap_or_default();
    let message = serde_json::from_str::<ApiMessage>(&text)
        .map(|m| m.message)
        .unwrap_or(text);
    Err(ProviderError::Api {
        status: status.as_u16(),
        message,
    })
}

impl DnsChallengeProvider for DnsimpleProvider {
    fn present(&self, domain: &str, value: &str) -> Result<(), ProviderError> {
        let fqdn = challenge_record_name(domain);
        let account = self.account_id()?;
        let zone = self.find_zone(&account, &fqdn)?;
        let name = relative_name(&fqdn, &zone);

        let response = self
            .client
            .post(format!("{}/v2/{}/zones/{}/records", self.base_url, account, zone))
            .bearer_auth(&self.token)
            .json(&NewRecord {
                name: &name,
                kind: "TXT",
                content: value,
                ttl: RECORD_TTL,
            })
            .send()?;
        let record: Envelope<Record> = parse(response)?;

        info!(record = %fqdn, zone = %zone, id = record.data.id, "Created DNSimple TXT record");
        self.records.lock().insert(
            (domain.to_string(), value.to_string()),
            CreatedRecord {
                zone,
                id: record.data.id,
            },
        );
        Ok(())
    }

    fn cleanup(&self, domain: &str, value: &str) -> Result<(), ProviderError> {
        let record = self
            .records
            .lock()
            .remove(&(domain.to_string(), value.to_string()))
            .ok_or_else(|| ProviderError::UnknownRecord(challenge_record_name(domain)))?;
        let account = self.account_id()?;

        let response = self
            .client
            .delete(format!(
                "{}/v2/{}/zones/{}/records/{}",
                self.base_url, account, record.zone, record.id
            ))
            .bearer_auth(&self.token)
            .send()?;
        check(response)?;

        debug!(zone = %record.zone, id = record.id, "Deleted DNSimple TXT record");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn provider(server: &Server) -> DnsimpleProvider {
        DnsimpleProvider::builder("token".into())
            .base_url(server.url())
            .build()
            .unwrap()
    }

    fn zones_mock(server: &mut Server) -> mockito::Mock {
        server
            .mock("GET", "/v2/1385/zones")
            .match_query(Matcher::Any)
            .match_header("authorization", "Bearer token")
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "data": [{"name": "example.com"}, {"name": "sub.example.com"}, {"name": "other.org"}],
                    "pagination": {"current_page": 1, "per_page": 100, "total_entries": 3, "total_pages": 1}
                })
                .to_string(),
            )
            .create()
    }

    #[test]
    fn relative_names() {
        assert_eq!(relative_name("_acme-challenge.www.example.com", "example.com"), "_acme-challenge.www");
        assert_eq!(relative_name("_acme-challenge.example.com", "example.com"), "_acme-challenge");
        assert_eq!(relative_name("example.com", "example.com"), "");
    }

    #[test]
    fn present_and_cleanup_round_trip() {
        let mut server = Server::new();
        let whoami = server
            .mock("GET", "/v2/whoami")
            .match_header("authorization", "Bearer token")
            .with_header("content-type", "application/json")
            .with_body(json!({"data": {"user": null, "account": {"id": 1385}}}).to_string())
            .expect(1)
            .create();
        let zones = zones_mock(&mut server);
        let create = server
            .mock("POST", "/v2/1385/zones/sub.example.com/records")
            .match_body(Matcher::Json(json!({
                "name": "_acme-challenge.www",
                "type": "TXT",
                "content": "proof",
                "ttl": 120
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(json!({"data": {"id": 42, "name": "_acme-challenge.www"}}).to_string())
            .create();
        let delete = server
            .mock("DELETE", "/v2/1385/zones/sub.example.com/records/42")
            .with_status(204)
            .create();

        let provider = provider(&server);
        provider.present("www.sub.example.com", "proof").unwrap();
        provider.cleanup("www.sub.example.com", "proof").unwrap();

        whoami.assert();
        zones.assert();
        create.assert();
        delete.assert();
    }

    #[test]
    fn configured_account_skips_whoami() {
        let mut server = Server::new();
        let whoami = server.mock("GET", "/v2/whoami").expect(0).create();
        let zones = zones_mock(&mut server);
        let _create = server
            .mock("POST", "/v2/1385/zones/example.com/records")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(json!({"data": {"id": 7}}).to_string())
            .create();

        let provider = DnsimpleProvider::builder("token".into())
            .account_id("1385".into())
            .base_url(server.url())
            .build()
            .unwrap();
        provider.present("*.example.com", "proof").unwrap();

        whoami.assert();
        zones.assert();
    }

    #[test]
    fn api_errors_surface_message() {
        let mut server = Server::new();
        let _whoami = server
            .mock("GET", "/v2/whoami")
            .with_status(401)
            .with_header("content-type", "application/json")
            .with_body(json!({"message": "Authentication failed"}).to_string())
            .create();

        let err = provider(&server).present("example.com", "proof").unwrap_err();
        match err {
            ProviderError::Api { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Authentication failed");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn missing_zone_is_reported() {
        let mut server = Server::new();
        let _zones = zones_mock(&mut server);

        let provider = DnsimpleProvider::builder("token".into())
            .account_id("1385".into())
            .base_url(server.url())
            .build()
            .unwrap();
        let err = provider.present("example.net", "proof").unwrap_err();
        assert!(matches!(err, ProviderError::ZoneNotFound(_)));
    }

    #[test]
    fn email_user_resolves_account_with_whoami() {
        let mut server = Server::new();
        let whoami = server
            .mock("GET", "/v2/whoami")
            .with_header("content-type", "application/json")
            .with_body(json!({"data": {"user": null, "account": {"id": 1385}}}).to_string())
            .expect(1)
            .create();
        let zones = zones_mock(&mut server);
        let _create = server
            .mock("POST", "/v2/1385/zones/example.com/records")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(json!({"data": {"id": 7}}).to_string())
            .create();

        let provider = DnsimpleProvider::builder("token".into())
            .user("ops@example.org")
            .base_url(server.url())
            .build()
            .unwrap();
        provider.present("example.com", "proof").unwrap();

        whoami.assert();
        zones.assert();
    }

    #[test]
    fn invalid_user_agent_fails_build() {
        let result = DnsimpleProvider::builder("token".into())
            .user_agent("bad\nagent".into())
            .build();
        assert!(matches!(result, Err(ProviderError::Http(_))));
    }

    #[test]
    fn cleanup_without_present_fails() {
        let server = Server::new();
        let err = provider(&server).cleanup("example.com", "proof").unwrap_err();
        assert!(matches!(err, ProviderError::UnknownRecord(_)));
    }
}
