//! HTTP transport for unary calls.

use crate::codec::{self, HeadCodec, WireCodec};
use crate::config::{ClientConfig, ProtocolConfig};
use crate::error::{Result, RpcError, TetherError};
use crate::protocol::RpcHead;
use encoding_rs::{Encoding, UTF_8};
use flate2::read::GzDecoder;
use regex::Regex;
use reqwest::header::{self, HeaderMap};
use reqwest::Client;
use serde::de::DeserializeOwned;
use std::io::Read;
use std::sync::{Arc, LazyLock};
use tracing::debug;
use url::Url;

static META_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<meta(.+?)/?>").expect("meta tag regex must compile"));
static CHARSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)charset\s*=\s*["']?([A-Za-z0-9_.:-]+)"#).expect("charset regex must compile")
});

/// A successful response whose body has not been read yet.
#[derive(Debug)]
pub struct RpcResponse {
    pub status: u16,
    /// `ez_seqid` response header, 0 when absent.
    pub sequence_id: i32,
    /// `ez_code` response header, 0 when absent.
    pub event_code: i32,
    gzip: bool,
    response: reqwest::Response,
}

impl RpcResponse {
    pub fn is_empty(&self) -> bool {
        self.status == 204
    }

    /// Read the full body, decompressing it if needed.
    pub async fn into_bytes(self) -> Result<Vec<u8>> {
        let gzip = self.gzip;
        let raw = self.response.bytes().await?;
        if gzip {
            gunzip(&raw)
        } else {
            Ok(raw.to_vec())
        }
    }
}

/// Posts requests to the service URL.
pub struct InvocationTransport {
    client: Client,
    service_url: Url,
    codec: Arc<dyn WireCodec>,
    head_codec: Arc<dyn HeadCodec>,
}

impl InvocationTransport {
    pub fn new(
        config: &ClientConfig,
        codec: Arc<dyn WireCodec>,
        head_codec: Arc<dyn HeadCodec>,
    ) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(config.rpc_timeout)
            .user_agent(ProtocolConfig::USER_AGENT)
            .danger_accept_invalid_certs(config.accept_invalid_certs);
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(reqwest::Proxy::http(proxy)?);
        }
        Ok(Self {
            client: builder.build()?,
            service_url: config.service_url.clone(),
            codec,
            head_codec,
        })
    }

    /// Post one call and classify the response.
    pub async fn send(&self, head: &RpcHead, body: Vec<u8>) -> Result<RpcResponse> {
        let meta = self.head_codec.encode_head(head)?;
        debug!(
            "POST {} {}.{} ({} bytes)",
            self.service_url,
            head.interface_name(),
            head.method_name,
            body.len()
        );
        let response = self
            .client
            .post(self.service_url.clone())
            .header(ProtocolConfig::META_HEADER, meta)
            .header(header::ACCEPT_ENCODING, "gzip")
            .body(body)
            .send()
            .await
            .map_err(|e| TetherError::Transport {
                message: format!("failed to reach {}: {}", self.service_url, e),
                source: Some(e),
            })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let gzip = is_gzip(&headers);
        match status {
            200 | 204 => Ok(RpcResponse {
                status,
                sequence_id: int_header(&headers, ProtocolConfig::SEQUENCE_HEADER),
                event_code: int_header(&headers, ProtocolConfig::EVENT_CODE_HEADER),
                gzip,
                response,
            }),
            401 | 500 => {
                let body = read_body(response, gzip).await?;
                match self.decode_error(&body) {
                    Some(detail) => Err(TetherError::Remote { status, detail }),
                    None => Err(TetherError::Http {
                        status,
                        content: decode_text(&body, content_type(&headers)),
                    }),
                }
            }
            _ => {
                let body = read_body(response, gzip).await?;
                Err(TetherError::Http {
                    status,
                    content: decode_text(&body, content_type(&headers)),
                })
            }
        }
    }

    /// GET a JSON document relative to the service URL.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self
            .service_url
            .join(path)
            .map_err(|e| TetherError::Other(format!("invalid path {}: {}", path, e)))?;
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        if status != 200 {
            let content = response.text().await.unwrap_or_default();
            return Err(TetherError::Http { status, content });
        }
        response.json::<T>().await.map_err(|e| TetherError::ResponseDecode {
            message: e.to_string(),
            source: None,
        })
    }

    fn decode_error(&self, body: &[u8]) -> Option<RpcError> {
        let value = self.codec.decode(body).ok()?;
        codec::from_value(value).ok()
    }
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("gzip"))
}

fn int_header(headers: &HeaderMap, name: &str) -> i32 {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0)
}

fn content_type(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
}

async fn read_body(response: reqwest::Response, gzip: bool) -> Result<Vec<u8>> {
    let raw = response.bytes().await?;
    if gzip {
        gunzip(&raw)
    } else {
        Ok(raw.to_vec())
    }
}

fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut plain = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut plain)
        .map_err(|e| TetherError::Transport {
            message: format!("failed to decompress response: {}", e),
            source: None,
        })?;
    Ok(plain)
}

/// Decode a diagnostic body as text.
///
/// The charset comes from the `Content-Type` header, else from a `<meta>`
/// tag inside the body. Unknown or missing labels read as UTF-8, lossily.
pub fn decode_text(body: &[u8], content_type: Option<&str>) -> String {
    let utf8 = String::from_utf8_lossy(body);
    let encoding = content_type
        .and_then(|ct| CHARSET.captures(ct))
        .or_else(|| {
            META_TAG
                .captures_iter(&utf8)
                .map(|m| m.get(1).map_or("", |g| g.as_str()))
                .filter(|meta| meta.to_ascii_lowercase().contains("content-type"))
                .find_map(|meta| CHARSET.captures(meta))
        })
        .and_then(|caps| caps.get(1))
        .and_then(|label| Encoding::for_label(label.as_str().as_bytes()));

    match encoding {
        Some(encoding) if encoding != UTF_8 => {
            encoding.decode_without_bom_handling(body).0.into_owned()
        }
        _ => utf8.into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_text_utf8_default() {
        assert_eq!(decode_text("héllo".as_bytes(), None), "héllo");
    }

    #[test]
    fn test_decode_text_latin1_from_header() {
        let body = [b'c', b'a', b'f', 0xE9];
        assert_eq!(decode_text(&body, Some("text/html; charset=ISO-8859-1")), "café");
    }

    #[test]
    fn test_decode_text_latin1_from_meta_tag() {
        let mut body = br#"<html><meta http-equiv="Content-Type" content="text/html; charset=iso-8859-1" /><p>"#.to_vec();
        body.push(0xE9);
        let text = decode_text(&body, None);
        assert!(text.ends_with("<p>é"));
    }

    #[test]
    fn test_decode_text_gb2312_from_meta_tag() {
        let mut body = br#"<meta http-equiv="Content-Type" content="text/html; charset=gb2312" /><p>"#.to_vec();
        body.extend_from_slice(&[0xD6, 0xD0, 0xCE, 0xC4]);
        assert!(decode_text(&body, None).ends_with("<p>中文"));
    }

    #[test]
    fn test_decode_text_gbk_from_header() {
        let body = [0xD6, 0xD0, 0xCE, 0xC4];
        assert_eq!(decode_text(&body, Some("text/plain; charset=GBK")), "中文");
    }

    #[test]
    fn test_decode_text_windows_1252_upper_range() {
        assert_eq!(decode_text(&[0x80], Some("text/html; charset=windows-1252")), "€");
        assert_eq!(decode_text(&[0x93, b'x', 0x94], Some("text/html; charset=cp1252")), "\u{201c}x\u{201d}");
    }

    #[test]
    fn test_decode_text_unknown_charset_falls_back() {
        let body = br#"<meta http-equiv="Content-Type" content="text/html; charset=x-made-up" />ok"#;
        assert!(decode_text(body, None).ends_with("ok"));
    }

    #[test]
    fn test_int_header_defaults_to_zero() {
        let mut headers = HeaderMap::new();
        assert_eq!(int_header(&headers, ProtocolConfig::SEQUENCE_HEADER), 0);
        headers.insert(ProtocolConfig::SEQUENCE_HEADER, "42".parse().unwrap());
        assert_eq!(int_header(&headers, ProtocolConfig::SEQUENCE_HEADER), 42);
    }

    #[test]
    fn test_gunzip() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"payload").unwrap();
        let compressed = encoder.finish().unwrap();
        assert_eq!(gunzip(&compressed).unwrap(), b"payload");
    }
}
