use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::{Rgb, RgbImage};
use pixelswap_contracts::params::GenerationRequest;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::AUTHORIZATION;
use reqwest::Url;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::HeaderValue;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};

const DRYRUN_IMAGE_SIDE: u32 = 64;
const REALTIME_RESULT_TIMEOUT: Duration = Duration::from_secs(60);
const REALTIME_READ_TIMEOUT: Duration = Duration::from_millis(500);

/// A finished generation, keyed by the request id it answers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub request_id: String,
    pub image_url: String,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

/// Providers available to the CLI. `dryrun` writes its placeholders under `out_dir`.
pub fn default_provider_registry(out_dir: &Path) -> ImageProviderRegistry {
    let mut providers = ImageProviderRegistry::new();
    providers.register(DryrunProvider::new(out_dir.join("generated")));
    providers.register(FalProvider::new());
    providers.register(FalRealtimeProvider::new());
    providers
}

/// Offline provider: paints a solid square whose colour is derived from the
/// prompt and source, and answers with its `file://` URL.
pub struct DryrunProvider {
    out_dir: PathBuf,
}

impl DryrunProvider {
    pub fn new(out_dir: impl Into<PathBuf>) -> Self {
        Self {
            out_dir: out_dir.into(),
        }
    }
}

impl ImageProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let digest = request_digest(&request.prompt, &request.request_id);
        let path = self
            .out_dir
            .join(format!("generated-{}.png", hex::encode(&digest[..6])));
        fs::create_dir_all(&self.out_dir)
            .with_context(|| format!("failed to create {}", self.out_dir.display()))?;

        let mut image = RgbImage::new(DRYRUN_IMAGE_SIDE, DRYRUN_IMAGE_SIDE);
        for pixel in image.pixels_mut() {
            *pixel = Rgb([digest[0], digest[1], digest[2]]);
        }
        image
            .save(&path)
            .with_context(|| format!("failed to save {}", path.display()))?;

        let absolute = fs::canonicalize(&path)
            .with_context(|| format!("failed to resolve {}", path.display()))?;
        let url = Url::from_file_path(&absolute)
            .map_err(|_| anyhow::anyhow!("not a file URL path: {}", absolute.display()))?;
        Ok(GenerationResult {
            request_id: request.request_id.clone(),
            image_url: url.to_string(),
        })
    }
}

/// Synchronous fal HTTP endpoint (`POST {FAL_API_BASE}/{model}`).
pub struct FalProvider {
    api_base: String,
    http: HttpClient,
}

impl FalProvider {
    pub fn new() -> Self {
        Self {
            api_base: env::var("FAL_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://fal.run".to_string()),
            http: HttpClient::new(),
        }
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/{}", self.api_base, model.trim().trim_start_matches('/'))
    }
}

impl Default for FalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProvider for FalProvider {
    fn name(&self) -> &str {
        "fal"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let Some(api_key) = fal_api_key() else {
            bail!("FAL_KEY (or FAL_API_KEY) not set");
        };

        let endpoint = self.endpoint(&request.model);
        let mut payload = request.payload()?;
        payload.insert(
            "image_url".to_string(),
            Value::String(inline_local_source(&request.image_url)?),
        );

        let response = self
            .http
            .post(&endpoint)
            .header(AUTHORIZATION, format!("Key {api_key}"))
            .json(&Value::Object(payload))
            .send()
            .with_context(|| format!("Fal request failed ({endpoint})"))?;
        let response_payload = response_json_or_error("Fal", response)?;

        let mut urls = Vec::new();
        extract_urls(&response_payload, &mut urls);
        let Some(image_url) = urls.into_iter().next() else {
            bail!("Fal response returned no image URLs");
        };
        Ok(GenerationResult {
            request_id: request.request_id.clone(),
            image_url,
        })
    }
}

/// fal realtime websocket (`{FAL_REALTIME_BASE}/{model}/ws`). One JSON text
/// frame per request; frames are read until the one answering our
/// `request_id` arrives. The socket is opened lazily and dropped on any
/// transport error so the next request reconnects.
pub struct FalRealtimeProvider {
    ws_base: String,
    socket: Mutex<Option<WebSocket<MaybeTlsStream<TcpStream>>>>,
}

impl FalRealtimeProvider {
    pub fn new() -> Self {
        Self {
            ws_base: env::var("FAL_REALTIME_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "wss://ws.fal.run".to_string()),
            socket: Mutex::new(None),
        }
    }

    fn ws_url(&self, model: &str) -> String {
        format!("{}/{}/ws", self.ws_base, model.trim().trim_matches('/'))
    }

    fn open(&self, model: &str, api_key: &str) -> Result<WebSocket<MaybeTlsStream<TcpStream>>> {
        let mut request = self
            .ws_url(model)
            .as_str()
            .into_client_request()
            .context("invalid fal realtime websocket request")?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Key {api_key}"))
                .context("invalid fal realtime auth header")?,
        );
        let (mut ws, _) =
            websocket_connect(request).context("failed to connect fal realtime websocket")?;
        set_socket_read_timeout(&mut ws, Some(REALTIME_READ_TIMEOUT));
        Ok(ws)
    }

    fn exchange(
        ws: &mut WebSocket<MaybeTlsStream<TcpStream>>,
        request: &GenerationRequest,
    ) -> Result<GenerationResult> {
        let mut payload = request.payload()?;
        payload.insert(
            "image_url".to_string(),
            Value::String(inline_local_source(&request.image_url)?),
        );
        let raw = serde_json::to_string(&Value::Object(payload))
            .context("failed to serialize fal realtime payload")?;
        ws.send(WsMessage::Text(raw.into()))
            .context("failed to send fal realtime payload")?;

        let started = Instant::now();
        while started.elapsed() <= REALTIME_RESULT_TIMEOUT {
            let message = match ws.read() {
                Ok(message) => message,
                Err(tungstenite::Error::Io(err))
                    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) =>
                {
                    continue;
                }
                Err(err) => return Err(err).context("fal realtime read failed"),
            };
            let raw = match message {
                WsMessage::Text(text) => text.to_string(),
                WsMessage::Binary(bytes) => String::from_utf8_lossy(&bytes).to_string(),
                WsMessage::Close(_) => bail!("fal realtime socket closed"),
                _ => continue,
            };
            let Ok(parsed) = serde_json::from_str::<Value>(&raw) else {
                continue;
            };
            let request_id = parsed.get("request_id").and_then(Value::as_str);
            if request_id != Some(request.request_id.as_str()) {
                continue;
            }
            if let Some(error) = parsed.get("error").or_else(|| parsed.get("detail")) {
                bail!(
                    "fal realtime generation failed: {}",
                    truncate_text(&error.to_string(), 512)
                );
            }
            let mut urls = Vec::new();
            extract_urls(&parsed, &mut urls);
            let Some(image_url) = urls.into_iter().next() else {
                bail!("fal realtime response returned no image URLs");
            };
            return Ok(GenerationResult {
                request_id: request.request_id.clone(),
                image_url,
            });
        }
        bail!(
            "fal realtime result timed out after {}s",
            REALTIME_RESULT_TIMEOUT.as_secs()
        )
    }
}

impl Default for FalRealtimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageProvider for FalRealtimeProvider {
    fn name(&self) -> &str {
        "fal-realtime"
    }

    fn generate(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let Some(api_key) = fal_api_key() else {
            bail!("FAL_KEY (or FAL_API_KEY) not set");
        };
        let mut socket = self
            .socket
            .lock()
            .map_err(|_| anyhow::anyhow!("fal realtime socket lock poisoned"))?;
        if socket.is_none() {
            *socket = Some(self.open(&request.model, &api_key)?);
        }
        let Some(ws) = socket.as_mut() else {
            bail!("fal realtime socket unavailable");
        };
        let result = Self::exchange(ws, request);
        if result.is_err() {
            if let Some(mut ws) = socket.take() {
                let _ = ws.close(None);
            }
        }
        result
    }
}

fn fal_api_key() -> Option<String> {
    non_empty_env("FAL_KEY").or_else(|| non_empty_env("FAL_API_KEY"))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn request_digest(prompt: &str, request_id: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(b"\n");
    hasher.update(request_id.as_bytes());
    hasher.finalize().to_vec()
}

/// Remote services cannot read `file://` sources, so those are sent inline
/// as data URLs. Anything else passes through untouched.
fn inline_local_source(image_url: &str) -> Result<String> {
    let Ok(url) = Url::parse(image_url) else {
        return Ok(image_url.to_string());
    };
    if url.scheme() != "file" {
        return Ok(image_url.to_string());
    }
    let path = url
        .to_file_path()
        .map_err(|_| anyhow::anyhow!("invalid file URL: {image_url}"))?;
    let bytes = fs::read(&path).with_context(|| format!("failed reading {}", path.display()))?;
    let mime = mime_for_path(&path).unwrap_or("image/png");
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

fn extract_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if !trimmed.is_empty()
                && trimmed.starts_with("http")
                && !out.iter().any(|existing| existing == trimmed)
            {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_urls(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["url", "images", "image", "output"] {
                if let Some(nested) = obj.get(key) {
                    extract_urls(nested, out);
                }
            }
        }
        _ => {}
    }
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn set_socket_read_timeout(
    ws: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    timeout: Option<Duration>,
) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use pixelswap_contracts::messages::ImageJob;
    use pixelswap_contracts::params::{GenerationRequest, ModelParams, DEFAULT_MODEL};
    use reqwest::Url;
    use serde_json::json;

    use super::{
        default_provider_registry, extract_urls, inline_local_source, DryrunProvider,
        FalRealtimeProvider, ImageProvider,
    };

    fn request_for(url: &str) -> GenerationRequest {
        let job = ImageJob::for_url(url);
        GenerationRequest::for_job(&job, "", DEFAULT_MODEL, &ModelParams::default())
    }

    #[test]
    fn default_registry_lists_dryrun_and_fal_providers() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let registry = default_provider_registry(temp.path());
        assert_eq!(registry.names(), vec!["dryrun", "fal", "fal-realtime"]);
        assert!(registry.get("missing").is_none());
        Ok(())
    }

    #[test]
    fn dryrun_is_deterministic_per_source() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let provider = DryrunProvider::new(temp.path().join("generated"));

        let first = provider.generate(&request_for("https://a.test/a.jpg"))?;
        let again = provider.generate(&request_for("https://a.test/a.jpg"))?;
        let other = provider.generate(&request_for("https://a.test/b.jpg"))?;

        assert_eq!(first.request_id, "https://a.test/a.jpg");
        assert_eq!(first, again);
        assert_ne!(first.image_url, other.image_url);

        let path = Url::parse(&first.image_url)?
            .to_file_path()
            .map_err(|_| anyhow::anyhow!("dryrun returned a non-file URL"))?;
        let decoded = image::open(path)?;
        assert_eq!(decoded.width(), 64);
        Ok(())
    }

    #[test]
    fn local_sources_are_inlined_as_data_urls() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let provider = DryrunProvider::new(temp.path());
        let generated = provider.generate(&request_for("https://a.test/a.jpg"))?;

        let inlined = inline_local_source(&generated.image_url)?;
        assert!(inlined.starts_with("data:image/png;base64,"));
        assert_eq!(inline_local_source("https://a.test/a.jpg")?, "https://a.test/a.jpg");
        Ok(())
    }

    #[test]
    fn response_urls_come_from_image_rows() {
        let mut urls = Vec::new();
        extract_urls(
            &json!({
                "request_id": "https://a.test/a.jpg",
                "images": [{"url": "https://fal.media/files/out.png", "width": 512}],
                "seed": 42,
            }),
            &mut urls,
        );
        assert_eq!(urls, vec!["https://fal.media/files/out.png"]);
    }

    #[test]
    fn realtime_url_targets_model_socket() {
        let provider = FalRealtimeProvider::new();
        assert!(provider.ws_url("/fal-ai/lcm/").ends_with("/fal-ai/lcm/ws"));
    }
}
