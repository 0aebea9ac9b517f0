use crate::error::{Result, TelephonyError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, ACCEPT};
use reqwest::{Client, Url};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("call-ingest/", env!("CARGO_PKG_VERSION"));

/// Fully buffered HTTP response as seen by the retry loop.
#[derive(Debug, Clone)]
pub struct HttpResponse {
	pub status: u16,
	pub headers: HeaderMap,
	pub body: Bytes,
}

impl HttpResponse {
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(name).and_then(|value| value.to_str().ok())
	}

	pub const fn is_success(&self) -> bool {
		self.status >= 200 && self.status < 300
	}
}

/// One way of performing an authenticated GET against the provider.
///
/// Implementations return `Ok` for every HTTP response, error statuses
/// included, and reserve `Err` for "no usable response" so the client can
/// move on to the next strategy.
#[async_trait]
pub trait FetchStrategy: Send + Sync {
	fn name(&self) -> &'static str;

	/// Whether `get` attaches the bearer token for `url`. A 401 only warrants a
	/// token refresh when it did.
	fn sends_credentials(&self, _url: &str) -> bool {
		true
	}

	async fn get(&self, url: &str, bearer: &str) -> Result<HttpResponse>;
}

async fn buffer(response: reqwest::Response) -> Result<HttpResponse> {
	let status = response.status().as_u16();
	let headers = response.headers().clone();
	let body = response.bytes().await?;

	Ok(HttpResponse { status, headers, body })
}

fn registrable_domain(host: &str) -> String {
	let labels: Vec<&str> = host.rsplit('.').take(2).collect();
	labels.into_iter().rev().collect::<Vec<_>>().join(".")
}

fn is_ip_literal(host: &str) -> bool {
	host.starts_with('[') || host.parse::<IpAddr>().is_ok()
}

/// True when `target` lives on the provider's domain. IP hosts must match exactly.
fn same_provider(base: &Url, target: &Url) -> bool {
	match (base.host_str(), target.host_str()) {
		(Some(base_host), Some(target_host)) if is_ip_literal(base_host) || is_ip_literal(target_host) => base_host == target_host,
		(Some(base_host), Some(target_host)) => registrable_domain(target_host) == registrable_domain(base_host),
		_ => false,
	}
}

fn parse_base(server_url: &str) -> Result<Url> {
	Url::parse(server_url).map_err(|e| TelephonyError::Config(format!("invalid server url {server_url}: {e}")))
}

/// Calls through the long-lived platform session.
///
/// Accepts content URIs relative to the platform base URL as well as absolute
/// URLs on any host of the provider's domain (`media.` and `platform.` share it).
pub struct PlatformSession {
	http: Client,
	base: Url,
}

impl PlatformSession {
	pub fn new(server_url: &str, timeout: Duration) -> Result<Self> {
		let base = parse_base(server_url)?;
		let http = Client::builder().timeout(timeout).user_agent(USER_AGENT).build()?;

		Ok(Self { http, base })
	}

	fn resolve(&self, url: &str) -> Result<Url> {
		let target = self.base.join(url).map_err(|e| TelephonyError::Transport(format!("unresolvable url {url}: {e}")))?;

		if same_provider(&self.base, &target) {
			Ok(target)
		} else {
			Err(TelephonyError::Transport(format!("{url} is not served by the platform session")))
		}
	}
}

#[async_trait]
impl FetchStrategy for PlatformSession {
	fn name(&self) -> &'static str {
		"platform"
	}

	async fn get(&self, url: &str, bearer: &str) -> Result<HttpResponse> {
		let target = self.resolve(url)?;
		debug!(url = %target, "GET via platform session");

		let response = self.http.get(target).bearer_auth(bearer).header(ACCEPT, "*/*").send().await?;
		buffer(response).await
	}
}

/// Plain GET with no session reuse.
///
/// The bearer header is only attached for hosts on the provider's domain;
/// anything else is fetched anonymously.
pub struct DirectHttp {
	http: Client,
	base: Url,
}

impl DirectHttp {
	pub fn new(server_url: &str, timeout: Duration) -> Result<Self> {
		let base = parse_base(server_url)?;
		let http = Client::builder().timeout(timeout).user_agent(USER_AGENT).pool_max_idle_per_host(0).build()?;
		Ok(Self { http, base })
	}

	fn authorizes(&self, target: &Url) -> bool {
		same_provider(&self.base, target)
	}
}

#[async_trait]
impl FetchStrategy for DirectHttp {
	fn name(&self) -> &'static str {
		"direct"
	}

	fn sends_credentials(&self, url: &str) -> bool {
		Url::parse(url).is_ok_and(|target| self.authorizes(&target))
	}

	async fn get(&self, url: &str, bearer: &str) -> Result<HttpResponse> {
		let target = Url::parse(url).map_err(|e| TelephonyError::Transport(format!("unparsable url {url}: {e}")))?;
		let authorized = self.authorizes(&target);
		debug!(url, authorized, "GET via direct http");

		let request = self.http.get(target);
		let request = if authorized { request.bearer_auth(bearer) } else { request };
		buffer(request.send().await?).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener;
	use tokio::task::JoinHandle;

	/// Answers one request with a tiny WAV body and hands back the lowercased request head.
	async fn serve_once() -> (String, JoinHandle<String>) {
		let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
		let addr = listener.local_addr().unwrap();

		let handle = tokio::spawn(async move {
			let (mut socket, _) = listener.accept().await.unwrap();
			let mut head = Vec::new();
			let mut buf = [0_u8; 1024];
			while !head.windows(4).any(|w| w == b"\r\n\r\n") {
				let read = socket.read(&mut buf).await.unwrap();
				if read == 0 {
					break;
				}
				head.extend_from_slice(&buf[..read]);
			}
			socket
				.write_all(b"HTTP/1.1 200 OK\r\ncontent-type: audio/wav\r\ncontent-length: 4\r\nconnection: close\r\n\r\nRIFF")
				.await
				.unwrap();
			String::from_utf8_lossy(&head).to_lowercase()
		});

		(format!("http://{addr}/recording.wav"), handle)
	}

	fn session() -> PlatformSession {
		PlatformSession::new("https://platform.ringcentral.com", Duration::from_secs(5)).unwrap()
	}

	#[test]
	fn test_relative_content_uri_resolves_against_platform() {
		let target = session().resolve("/restapi/v1.0/account/~/recording/42/content").unwrap();
		assert_eq!(target.as_str(), "https://platform.ringcentral.com/restapi/v1.0/account/~/recording/42/content");
	}

	#[test]
	fn test_media_host_shares_platform_domain() {
		let target = session().resolve("https://media.ringcentral.com/restapi/v1.0/account/~/recording/42/content").unwrap();
		assert_eq!(target.host_str(), Some("media.ringcentral.com"));
	}

	#[test]
	fn test_foreign_host_is_not_usable() {
		let result = session().resolve("https://cdn.example.com/a.mp3");
		assert!(matches!(result, Err(TelephonyError::Transport(_))));
	}

	#[tokio::test]
	async fn test_direct_fetch_to_foreign_host_omits_bearer() {
		let (url, server) = serve_once().await;
		let direct = DirectHttp::new("https://platform.ringcentral.com", Duration::from_secs(5)).unwrap();

		assert!(!direct.sends_credentials(&url));
		let response = direct.get(&url, "provider-token").await.unwrap();
		let head = server.await.unwrap();

		assert_eq!(response.status, 200);
		assert_eq!(response.body, Bytes::from_static(b"RIFF"));
		assert!(!head.contains("authorization"), "{head}");
		assert!(!head.contains("provider-token"), "{head}");
	}

	#[tokio::test]
	async fn test_direct_fetch_to_provider_host_sends_bearer() {
		let (url, server) = serve_once().await;
		let direct = DirectHttp::new("http://127.0.0.1", Duration::from_secs(5)).unwrap();

		assert!(direct.sends_credentials(&url));
		direct.get(&url, "provider-token").await.unwrap();
		let head = server.await.unwrap();

		assert!(head.contains("authorization: bearer provider-token"), "{head}");
	}

	#[test]
	fn test_ip_hosts_must_match_exactly() {
		let base = Url::parse("http://10.0.0.1").unwrap();
		assert!(same_provider(&base, &Url::parse("http://10.0.0.1:8080/a").unwrap()));
		assert!(!same_provider(&base, &Url::parse("http://192.168.0.1/a").unwrap()));
		assert!(!same_provider(&Url::parse("https://platform.ringcentral.com").unwrap(), &Url::parse("http://127.0.0.1/a").unwrap()));
	}

	#[test]
	fn test_invalid_server_url_is_config_error() {
		assert!(matches!(PlatformSession::new("not a url", Duration::from_secs(5)), Err(TelephonyError::Config(_))));
	}
}
