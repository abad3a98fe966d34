//! Structural request signatures.
//!
//! Two requests share a signature when they hit the same method, host and
//! normalized path with the same set of meaningful parameter names. Identifier
//! segments (`/user/123`, UUIDs, long hex tokens) and cache-busting parameter
//! names are normalized away so one endpoint collapses into one family.

use once_cell::sync::Lazy;
use regex::Regex;

static INT_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+$").unwrap());
static UUID_SEGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
        .unwrap()
});
static HEX_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{16,}$").unwrap());

/// Parameter names that carry no structural meaning.
const NOISE_PARAMS: &[&str] = &[
    "_", "_t", "t", "ts", "_ts", "timestamp", "_timestamp", "time", "_time", "rand", "_rand",
    "random", "rnd", "r", "nonce", "cb", "_cb", "cachebust", "cachebuster", "cache_buster",
    "_dc", "__rnd", "v", "ver",
];

/// Replaces identifier-like path segments with placeholders.
pub fn normalize_path(path: &str) -> String {
    let path = path.split(['?', '#']).next().unwrap_or("");
    path.split('/')
        .map(|segment| {
            if INT_SEGMENT.is_match(segment) {
                "{int}"
            } else if UUID_SEGMENT.is_match(segment) {
                "{uuid}"
            } else if HEX_SEGMENT.is_match(segment) {
                "{hex}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn is_noise_param(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    if NOISE_PARAMS.contains(&lower.as_str()) {
        return true;
    }
    // epoch seconds/millis used as a bare key, e.g. `/?1764049379072`
    if lower.len() >= 10 && lower.bytes().all(|b| b.is_ascii_digit()) {
        return true;
    }
    HEX_SEGMENT.is_match(&lower) && lower.bytes().any(|b| b.is_ascii_digit())
}

/// Drops timestamp-like and random-looking parameter names.
pub fn filter_noise_params<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    names
        .iter()
        .map(|n| n.as_ref())
        .filter(|n| !n.is_empty() && !is_noise_param(n))
        .map(str::to_string)
        .collect()
}

/// Builds the `method|host|normalizedPath|sortedParamNames` key.
pub fn generate<S: AsRef<str>>(method: &str, host: &str, path: &str, param_names: &[S]) -> String {
    let mut names = filter_noise_params(param_names);
    names.sort();
    names.dedup();
    format!(
        "{}|{}|{}|{}",
        method.to_ascii_uppercase(),
        host.to_ascii_lowercase(),
        normalize_path(path),
        names.join(",")
    )
}

/// Extracts the bare host from a service identifier such as
/// `https://Example.com:8443` or `example.com:80/path`.
pub fn extract_host(service: &str) -> String {
    let rest = match service.find("://") {
        Some(pos) => &service[pos + 3..],
        None => service,
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    let host = if let Some(stripped) = authority.strip_prefix('[') {
        // IPv6 literal
        stripped.split(']').next().unwrap_or(stripped)
    } else {
        match authority.rfind(':') {
            Some(pos) if authority[pos + 1..].bytes().all(|b| b.is_ascii_digit()) => {
                &authority[..pos]
            }
            _ => authority,
        }
    };
    host.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_segments_collapse() {
        let a = generate("GET", "example.com", "/user/123", &["id"]);
        let b = generate("GET", "example.com", "/user/456", &["id"]);
        let c = generate("GET", "example.com", "/product/123", &["id"]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, "GET|example.com|/user/{int}|id");
    }

    #[test]
    fn test_param_order_is_irrelevant() {
        let a = generate("POST", "example.com", "/api", &["b", "a"]);
        let b = generate("post", "EXAMPLE.com", "/api", &["a", "b"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_param_set_matters() {
        let a = generate("GET", "example.com", "/api", &["a"]);
        let b = generate("GET", "example.com", "/api", &["a", "b"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_normalize_uuid_and_hex() {
        assert_eq!(
            normalize_path("/orders/550e8400-e29b-41d4-a716-446655440000/items"),
            "/orders/{uuid}/items"
        );
        assert_eq!(normalize_path("/blob/deadbeefcafebabe1234"), "/blob/{hex}");
        assert_eq!(normalize_path("/blob/cafe"), "/blob/cafe");
        assert_eq!(normalize_path("/v2/users/42?x=1"), "/v2/users/{int}");
    }

    #[test]
    fn test_noise_params_removed() {
        let names = ["id", "_", "timestamp", "1764049379072", "callback"];
        assert_eq!(filter_noise_params(&names), vec!["id", "callback"]);

        let a = generate("GET", "example.com", "/s", &["q", "_"]);
        let b = generate("GET", "example.com", "/s", &["q", "cb"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_extract_host() {
        assert_eq!(extract_host("https://Example.com:8443"), "example.com");
        assert_eq!(extract_host("http://example.com"), "example.com");
        assert_eq!(extract_host("example.com:80/path?q=1"), "example.com");
        assert_eq!(extract_host("http://[::1]:8080/"), "::1");
        assert_eq!(extract_host("http://user:pw@api.example.com:443"), "api.example.com");
    }
}
