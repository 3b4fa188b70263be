// Client authentication key extraction.
//
// Clients can present their key three ways; the first non-empty source wins:
// the `/translate/<key>` path segment (POST only), the `x-goog-api-key`
// header, or the `Authorization` header with an optional Bearer prefix.
// Validation against the auth-secret set happens in the credential pool.

use http::{HeaderMap, Method, header};

pub fn extract_client_key(method: &Method, path: &str, headers: &HeaderMap) -> Option<String> {
    if method == Method::POST {
        if let Some(rest) = path.strip_prefix("/translate/") {
            let key = rest.split('/').next().unwrap_or("").trim();
            if !key.is_empty() {
                return Some(key.to_string());
            }
        }
    }

    if let Some(value) = header_str(headers, "x-goog-api-key") {
        return Some(value);
    }

    if let Some(raw) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let raw = raw.trim();
        let key = match raw.get(..7) {
            Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => raw[7..].trim(),
            _ => raw,
        };
        if !key.is_empty() {
            return Some(key.to_string());
        }
    }

    None
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    let value = headers.get(name)?.to_str().ok()?.trim();
    (!value.is_empty()).then(|| value.to_string())
}

// ── Tests ───────────────────────────────────────────────────────────────
