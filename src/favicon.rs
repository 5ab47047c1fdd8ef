//! Favicon downloads: fetch, classify as SVG or raster, store under
//! `favicons/`.

use tracing::info;
use url::Url;

use crate::error::{PolicyError, Result};
use crate::net;
use crate::storage::Storage;

pub const FAVICON_DIR: &str = "favicons";

const MAX_NAME_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IconKind {
    Svg,
    Raster(&'static str),
}

impl IconKind {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Svg => "svg",
            Self::Raster(ext) => ext,
        }
    }
}

/// SVG when declared as `image/svg+xml` or when the body starts like XML;
/// otherwise a raster format sniffed from magic bytes.
pub fn classify(content_type: Option<&str>, body: &[u8]) -> IconKind {
    let declared_svg = content_type.is_some_and(|ct| ct.to_ascii_lowercase().contains("svg"));
    let head = String::from_utf8_lossy(&body[..body.len().min(256)]).to_ascii_lowercase();
    let head = head.trim_start_matches('\u{feff}').trim_start();
    if declared_svg || head.starts_with("<svg") || head.starts_with("<?xml") {
        return IconKind::Svg;
    }

    let ext = match body {
        [0x89, b'P', b'N', b'G', ..] => "png",
        [0x00, 0x00, 0x01, 0x00, ..] => "ico",
        [0xFF, 0xD8, 0xFF, ..] => "jpg",
        [b'G', b'I', b'F', b'8', ..] => "gif",
        [b'R', b'I', b'F', b'F', _, _, _, _, b'W', b'E', b'B', b'P', ..] => "webp",
        _ => "img",
    };
    IconKind::Raster(ext)
}

/// Storage name for an icon: host and path flattened to a safe filename.
pub fn icon_name(url: &Url, kind: IconKind) -> String {
    let raw = format!("{}{}", url.host_str().unwrap_or("local"), url.path());
    let mut stem: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .take(MAX_NAME_CHARS)
        .collect();
    stem = stem.trim_matches(['.', '_']).to_owned();
    if stem.is_empty() {
        stem.push_str("favicon");
    }
    format!("{FAVICON_DIR}/{stem}.{}", kind.extension())
}

/// Downloads one icon and returns its storage name.
pub async fn download_favicon(
    client: &reqwest::Client,
    storage: &Storage,
    url: &str,
) -> Result<String> {
    let parsed = Url::parse(url).map_err(|e| PolicyError::Rejected(format!("invalid favicon url {url}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(PolicyError::Rejected(format!(
            "unsupported favicon scheme {}",
            parsed.scheme()
        )));
    }

    let fetched = net::fetch(client, url).await?;
    let kind = classify(fetched.content_type.as_deref(), &fetched.body);
    let name = icon_name(&parsed, kind);
    storage.write_bytes(&name, &fetched.body)?;
    info!(url, name = %name, "Favicon saved");
    Ok(name)
}
