//! OpenAPI-schema-driven materialization of file-shaped input/output values.
//!
//! Inputs whose schema marks them `format: "uri"` may arrive as `data:`
//! URIs (decoded straight to a temp file) or `http(s)://` URLs (downloaded
//! with retry). Outputs shaped the same way are turned back into `data:`
//! URLs, or uploaded and replaced with the upload response's `Location`
//! header, depending on whether an upload URL was configured.

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine;
use serde_json::Value;

const DOWNLOAD_RETRIES: u32 = 3;
const DOWNLOAD_RETRY_BASE: Duration = Duration::from_millis(200);

#[derive(thiserror::Error, Debug)]
pub enum PathHandlerError {
    #[error("failed to decode data URI: {0}")]
    DataUri(String),
    #[error("download failed: {0}")]
    Download(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("upload failed with status {0}")]
    UploadStatus(u16),
}

/// Property names in an OpenAPI schema object whose values are file-shaped
/// (`format: "uri"`), including those nested one level inside an array.
fn uri_properties(schema: &Value) -> Vec<String> {
    let mut result = Vec::new();
    let Some(properties) = schema
        .get("components")
        .and_then(|c| c.get("schemas"))
        .and_then(|s| s.get("Input"))
        .and_then(|i| i.get("properties"))
        .and_then(|p| p.as_object())
    else {
        return result;
    };

    for (name, prop) in properties {
        if is_uri_shaped(prop) {
            result.push(name.clone());
        }
    }
    result
}

fn is_uri_shaped(prop: &Value) -> bool {
    if prop.get("format").and_then(|f| f.as_str()) == Some("uri") {
        return true;
    }
    if prop.get("type").and_then(|t| t.as_str()) == Some("array") {
        if let Some(items) = prop.get("items") {
            return items.get("format").and_then(|f| f.as_str()) == Some("uri");
        }
    }
    false
}

/// Walks `input` replacing any value at a uri-shaped property with a
/// materialized local path (as a `file://` URL string), downloading or
/// decoding as needed. Returns the updated input plus the list of temp
/// files created, so callers can register them for later cleanup.
pub async fn materialize_input(
    schema: &Value,
    input: &Value,
    tmp_dir: &Path,
) -> Result<(Value, Vec<PathBuf>), PathHandlerError> {
    let mut created = Vec::new();
    let mut input = input.clone();
    let Some(obj) = input.as_object_mut() else {
        return Ok((input, created));
    };

    let client = reqwest::Client::new();
    for name in uri_properties(schema) {
        let Some(value) = obj.get_mut(&name) else { continue };
        match value {
            Value::String(s) => {
                let path = materialize_one(&client, s, tmp_dir).await?;
                *value = Value::String(format!("file://{}", path.display()));
                created.push(path);
            }
            Value::Array(items) => {
                for item in items.iter_mut() {
                    if let Value::String(s) = item {
                        let path = materialize_one(&client, s, tmp_dir).await?;
                        *item = Value::String(format!("file://{}", path.display()));
                        created.push(path);
                    }
                }
            }
            _ => {}
        }
    }

    Ok((input, created))
}

async fn materialize_one(
    client: &reqwest::Client,
    uri: &str,
    tmp_dir: &Path,
) -> Result<PathBuf, PathHandlerError> {
    if let Some(rest) = uri.strip_prefix("data:") {
        return decode_data_uri(rest, tmp_dir);
    }
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return download_with_retry(client, uri, tmp_dir).await;
    }
    // Not a uri-shaped value we know how to materialize (e.g. already a
    // local path); leave it alone.
    Ok(PathBuf::from(uri))
}

fn decode_data_uri(rest: &str, tmp_dir: &Path) -> Result<PathBuf, PathHandlerError> {
    let (meta, data) = rest
        .split_once(',')
        .ok_or_else(|| PathHandlerError::DataUri("missing comma".into()))?;
    let mime = meta.split(';').next().unwrap_or("application/octet-stream");
    let is_base64 = meta.contains(";base64");

    let bytes = if is_base64 {
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map_err(|e| PathHandlerError::DataUri(e.to_string()))?
    } else {
        urlencoding_decode(data).into_bytes()
    };

    let ext = mime_guess::get_mime_extensions_str(mime)
        .and_then(|exts| exts.first())
        .copied()
        .unwrap_or("bin");
    let path = tmp_dir.join(format!("{}.{}", crate::id::generate(), ext));

    std::fs::write(&path, &bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;
    }

    Ok(path)
}

/// Minimal percent-decoding for the rare non-base64 data URI.
fn urlencoding_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                out.push(byte as char);
                continue;
            }
        }
        out.push(c);
    }
    out
}

async fn download_with_retry(
    client: &reqwest::Client,
    url: &str,
    tmp_dir: &Path,
) -> Result<PathBuf, PathHandlerError> {
    let mut attempt = 0;
    loop {
        match client.get(url).send().await {
            Ok(response) if response.status().is_success() => {
                let ext = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|ct| mime_guess::get_mime_extensions_str(ct))
                    .and_then(|exts| exts.first())
                    .copied()
                    .unwrap_or("bin");
                let bytes = response.bytes().await?;
                let path = tmp_dir.join(format!("{}.{}", crate::id::generate(), ext));
                std::fs::write(&path, &bytes)?;
                return Ok(path);
            }
            Ok(response) => {
                attempt += 1;
                if attempt >= DOWNLOAD_RETRIES {
                    return Err(PathHandlerError::UploadStatus(response.status().as_u16()));
                }
                tokio::time::sleep(DOWNLOAD_RETRY_BASE * attempt).await;
            }
            Err(e) => {
                attempt += 1;
                if attempt >= DOWNLOAD_RETRIES {
                    return Err(PathHandlerError::Download(e));
                }
                tokio::time::sleep(DOWNLOAD_RETRY_BASE * attempt).await;
            }
        }
    }
}

/// Walks `output`, turning any `file://` value into either a `data:` URL
/// or an uploaded location, depending on `upload_url`.
pub async fn process_output(
    output: &Value,
    upload_url: Option<&str>,
) -> Result<Value, PathHandlerError> {
    match output {
        Value::String(s) if s.starts_with("file://") => {
            let path = PathBuf::from(s.trim_start_matches("file://"));
            encode_or_upload(&path, upload_url).await
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(Box::pin(process_output(item, upload_url)).await?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(obj) => {
            let mut out = serde_json::Map::with_capacity(obj.len());
            for (k, v) in obj {
                out.insert(k.clone(), Box::pin(process_output(v, upload_url)).await?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

async fn encode_or_upload(path: &Path, upload_url: Option<&str>) -> Result<Value, PathHandlerError> {
    let bytes = tokio::fs::read(path).await?;
    let mime = mime_guess::from_path(path)
        .first_or_octet_stream()
        .to_string();

    match upload_url {
        Some(url) => {
            let client = reqwest::Client::new();
            let response = client
                .put(url)
                .header(reqwest::header::CONTENT_TYPE, &mime)
                .body(bytes)
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(PathHandlerError::UploadStatus(response.status().as_u16()));
            }
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or(url)
                .to_string();
            Ok(Value::String(location))
        }
        None => {
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            Ok(Value::String(format!("data:{mime};base64,{encoded}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_properties_finds_format_uri() {
        let schema = serde_json::json!({
            "components": {
                "schemas": {
                    "Input": {
                        "properties": {
                            "image": {"type": "string", "format": "uri"},
                            "prompt": {"type": "string"},
                            "images": {"type": "array", "items": {"type": "string", "format": "uri"}}
                        }
                    }
                }
            }
        });
        let mut props = uri_properties(&schema);
        props.sort();
        assert_eq!(props, vec!["image".to_string(), "images".to_string()]);
    }

    #[tokio::test]
    async fn materialize_input_decodes_data_uri() {
        let schema = serde_json::json!({
            "components": {"schemas": {"Input": {"properties": {
                "image": {"type": "string", "format": "uri"}
            }}}}
        });
        let input = serde_json::json!({"image": "data:text/plain;base64,aGVsbG8="});
        let dir = tempfile::tempdir().unwrap();
        let (updated, created) = materialize_input(&schema, &input, dir.path()).await.unwrap();
        assert_eq!(created.len(), 1);
        let contents = std::fs::read_to_string(&created[0]).unwrap();
        assert_eq!(contents, "hello");
        assert!(updated["image"].as_str().unwrap().starts_with("file://"));
    }

    #[tokio::test]
    async fn process_output_encodes_file_as_data_url_without_upload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, b"result").unwrap();
        let output = Value::String(format!("file://{}", path.display()));
        let processed = process_output(&output, None).await.unwrap();
        let s = processed.as_str().unwrap();
        assert!(s.starts_with("data:"));
        assert!(s.contains("base64,"));
    }

    #[tokio::test]
    async fn process_output_passes_through_non_file_values() {
        let output = serde_json::json!({"score": 0.9, "label": "cat"});
        let processed = process_output(&output, None).await.unwrap();
        assert_eq!(processed, output);
    }
}
