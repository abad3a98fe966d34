use crate::http::{BodyType, HttpRequest};
use once_cell::sync::Lazy;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use regex::Regex;
use reqwest::header::{HeaderValue, CONTENT_LENGTH};
use serde_json::Value;

/// Characters left unescaped when a payload is written into a query or form value.
const VALUE_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Leaf XML element: `<name attr="x">text</name>`. Closing tag checked in code.
static XML_LEAF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<([A-Za-z_][\w\-.:]*)(?:\s[^<>]*)?>([^<]*)</([A-Za-z_][\w\-.:]*)\s*>").unwrap()
});

/// Where a parameter lives in the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamLocation {
    Query,
    Form,
    Json,
    Xml,
}

/// One injectable parameter. Its position in the list returned by
/// [`extract_parameters`] is its identity for mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub value: String,
    pub location: ParamLocation,
    /// JSON string values; plain query/form values are always textual.
    pub quoted: bool,
}

impl Parameter {
    fn new(name: impl Into<String>, value: impl Into<String>, location: ParamLocation) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            location,
            quoted: false,
        }
    }
}

/// Body type with sniffing for requests that carry no usable Content-Type.
pub fn effective_body_type(req: &HttpRequest) -> BodyType {
    match req.body_type {
        BodyType::Raw | BodyType::None if !req.body.trim().is_empty() => {
            let trimmed = req.body.trim();
            if (trimmed.starts_with('{') || trimmed.starts_with('['))
                && serde_json::from_str::<Value>(trimmed).is_ok()
            {
                BodyType::Json
            } else if trimmed.starts_with('<') {
                BodyType::Xml
            } else if trimmed.contains('=') && !trimmed.contains(char::is_whitespace) {
                BodyType::FormUrlEncoded
            } else {
                req.body_type.clone()
            }
        }
        ref other => other.clone(),
    }
}

fn decode_component(raw: &str) -> String {
    percent_decode_str(&raw.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, VALUE_ENCODE_SET).to_string()
}

/// Splits `a=1&b&c=3` into decoded (name, value) pairs, keeping bare keys.
fn parse_pairs(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (decode_component(k), decode_component(v)),
            None => (decode_component(pair), String::new()),
        })
        .collect()
}

fn json_scalar_text(value: &Value) -> (String, bool) {
    match value {
        Value::String(s) => (s.clone(), true),
        Value::Null => ("null".to_string(), false),
        other => (other.to_string(), false),
    }
}

/// Recursively traverses a JSON value and collects every leaf as a parameter.
fn extract_json_recursive(value: &Value, current_path: &str, out: &mut Vec<Parameter>) {
    match value {
        Value::Object(map) => {
            for (key, val) in map {
                let new_path = if current_path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", current_path, key)
                };
                extract_json_recursive(val, &new_path, out);
            }
        }
        Value::Array(arr) => {
            for (index, val) in arr.iter().enumerate() {
                let new_path = format!("{}[{}]", current_path, index);
                extract_json_recursive(val, &new_path, out);
            }
        }
        scalar => {
            if !current_path.is_empty() {
                let (text, quoted) = json_scalar_text(scalar);
                let mut param = Parameter::new(current_path, text, ParamLocation::Json);
                param.quoted = quoted;
                out.push(param);
            }
        }
    }
}

/// Leaf elements as (name, value byte range).
fn xml_leaves(body: &str) -> Vec<(String, std::ops::Range<usize>)> {
    XML_LEAF
        .captures_iter(body)
        .filter_map(|caps| {
            let open = caps.get(1)?;
            let close = caps.get(3)?;
            if open.as_str() != close.as_str() {
                return None;
            }
            let text = caps.get(2)?;
            Some((open.as_str().to_string(), text.range()))
        })
        .collect()
}

pub fn extract_query_parameters(req: &HttpRequest) -> Vec<Parameter> {
    req.url
        .query()
        .map(parse_pairs)
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| Parameter::new(k, v, ParamLocation::Query))
        .collect()
}

pub fn extract_form_parameters(req: &HttpRequest) -> Vec<Parameter> {
    if effective_body_type(req) != BodyType::FormUrlEncoded {
        return Vec::new();
    }
    parse_pairs(req.body.trim())
        .into_iter()
        .map(|(k, v)| Parameter::new(k, v, ParamLocation::Form))
        .collect()
}

pub fn extract_json_parameters(req: &HttpRequest) -> Vec<Parameter> {
    if effective_body_type(req) != BodyType::Json {
        return Vec::new();
    }
    let mut out = Vec::new();
    if let Ok(json) = serde_json::from_str::<Value>(&req.body) {
        extract_json_recursive(&json, "", &mut out);
    }
    out
}

pub fn extract_xml_parameters(req: &HttpRequest) -> Vec<Parameter> {
    if effective_body_type(req) != BodyType::Xml {
        return Vec::new();
    }
    xml_leaves(&req.body)
        .into_iter()
        .map(|(name, range)| Parameter::new(name, &xml_unescape(&req.body[range]), ParamLocation::Xml))
        .collect()
}

/// Extracts the full, ordered parameter list of a request: query parameters,
/// then form fields, then JSON leaves, then XML leaf elements.
pub fn extract_parameters(req: &HttpRequest) -> Vec<Parameter> {
    let mut params = extract_query_parameters(req);
    params.extend(extract_form_parameters(req));
    params.extend(extract_json_parameters(req));
    params.extend(extract_xml_parameters(req));
    params
}

/// Rewrites the `ordinal`-th pair of a raw `k=v&k=v` string.
fn replace_pair(raw: &str, ordinal: usize, value: &str) -> String {
    let mut seen = 0;
    raw.split('&')
        .map(|pair| {
            if pair.is_empty() {
                return pair.to_string();
            }
            let current = seen;
            seen += 1;
            if current != ordinal {
                return pair.to_string();
            }
            match pair.split_once('=') {
                Some((key, _)) => format!("{}={}", key, encode_component(value)),
                None => format!("{}={}", pair, encode_component(value)),
            }
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn inject_into_json(value: &mut Value, path: &str, payload: &str) -> bool {
    let mut current = value;
    for segment in split_json_path(path) {
        let next = match segment {
            JsonSegment::Key(key) => current.get_mut(key),
            JsonSegment::Index(i) => current.get_mut(i),
        };
        current = match next {
            Some(v) => v,
            None => return false,
        };
    }
    *current = Value::String(payload.to_string());
    true
}

enum JsonSegment<'a> {
    Key(&'a str),
    Index(usize),
}

fn split_json_path(path: &str) -> Vec<JsonSegment<'_>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(pos) => (&part[..pos], &part[pos..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            segments.push(JsonSegment::Key(key));
        }
        while let Some(end) = rest.find(']') {
            if let Ok(i) = rest[1..end].parse::<usize>() {
                segments.push(JsonSegment::Index(i));
            }
            rest = &rest[end + 1..];
        }
    }
    segments
}

/// Decodes the predefined entities; `&amp;` last so `&amp;lt;` stays `&lt;`.
fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Creates a mutated copy of `req` in which only the parameter at `index` of
/// `params` (the request's original full list) carries `value`.
///
/// Returns `None` when the index is out of range or the body no longer parses.
pub fn mutate_request(
    req: &HttpRequest,
    params: &[Parameter],
    index: usize,
    value: &str,
) -> Option<HttpRequest> {
    let target = params.get(index)?;
    let ordinal = params[..index]
        .iter()
        .filter(|p| p.location == target.location)
        .count();

    let mut new_request = req.clone();
    match target.location {
        ParamLocation::Query => {
            let query = req.url.query().unwrap_or("");
            let rewritten = replace_pair(query, ordinal, value);
            new_request.url.set_query(Some(&rewritten));
        }
        ParamLocation::Form => {
            new_request.body = replace_pair(req.body.trim(), ordinal, value);
        }
        ParamLocation::Json => {
            let mut json: Value = serde_json::from_str(&req.body).ok()?;
            if !inject_into_json(&mut json, &target.name, value) {
                return None;
            }
            new_request.body = serde_json::to_string(&json).ok()?;
        }
        ParamLocation::Xml => {
            let (_, range) = xml_leaves(&req.body).into_iter().nth(ordinal)?;
            new_request.body = format!(
                "{}{}{}",
                &req.body[..range.start],
                xml_escape(value),
                &req.body[range.end..]
            );
        }
    }

    update_content_length(&mut new_request);
    Some(new_request)
}

/// Updates the Content-Length header based on the current body size
fn update_content_length(req: &mut HttpRequest) {
    if req.body.is_empty() && !req.headers.contains_key(CONTENT_LENGTH) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&req.body.len().to_string()) {
        req.headers.insert(CONTENT_LENGTH, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
    use reqwest::Method;
    use url::Url;

    fn create_test_request_json() -> HttpRequest {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let url = Url::parse("https://example.com/api?id=123&name=test").unwrap();
        let body = r#"{"user":{"name":"john","age":25},"active":true}"#.to_string();

        HttpRequest::new(Method::POST, url, headers, body)
    }

    fn create_test_request_form() -> HttpRequest {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );

        let url = Url::parse("https://example.com/login").unwrap();
        let body = "username=admin&password=se%20cret&remember=true".to_string();

        HttpRequest::new(Method::POST, url, headers, body)
    }

    #[test]
    fn test_extract_order_and_locations() {
        let req = create_test_request_json();
        let params = extract_parameters(&req);
        let names: Vec<&str> = params.iter().map(|p| p.name.as_str()).collect();

        assert_eq!(names[..2], ["id", "name"]);
        assert!(names.contains(&"user.name"));
        assert!(names.contains(&"user.age"));
        assert!(names.contains(&"active"));
        assert_eq!(params[0].location, ParamLocation::Query);

        let name = params.iter().find(|p| p.name == "user.name").unwrap();
        assert!(name.quoted);
        let age = params.iter().find(|p| p.name == "user.age").unwrap();
        assert_eq!(age.value, "25");
        assert!(!age.quoted);
    }

    #[test]
    fn test_extract_form_params_decoded() {
        let req = create_test_request_form();
        let params = extract_parameters(&req);
        assert_eq!(params.len(), 3);
        assert_eq!(params[1].name, "password");
        assert_eq!(params[1].value, "se cret");
        assert!(params.iter().all(|p| p.location == ParamLocation::Form));
    }

    #[test]
    fn test_bare_query_key() {
        let req = HttpRequest::get(Url::parse("http://example.com/?1764049379072").unwrap());
        let params = extract_parameters(&req);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].name, "1764049379072");
        assert_eq!(params[0].value, "");
    }

    #[test]
    fn test_mutate_only_targeted_duplicate() {
        let req = HttpRequest::get(Url::parse("http://example.com/s?id=1&id=2&q=x%20y").unwrap());
        let params = extract_parameters(&req);
        let mutated = mutate_request(&req, &params, 1, "2'").unwrap();
        assert_eq!(mutated.url.query(), Some("id=1&id=2%27&q=x%20y"));
    }

    #[test]
    fn test_mutate_form_param() {
        let req = create_test_request_form();
        let params = extract_parameters(&req);
        let mutated = mutate_request(&req, &params, 0, "admin' AND '1'='1").unwrap();

        assert!(mutated.body.starts_with("username=admin%27%20AND%20%271%27%3D%271&"));
        assert!(mutated.body.ends_with("&password=se%20cret&remember=true"));
    }

    #[test]
    fn test_mutate_json_field() {
        let req = create_test_request_json();
        let params = extract_parameters(&req);
        let index = params.iter().position(|p| p.name == "user.name").unwrap();
        let mutated = mutate_request(&req, &params, index, "john'").unwrap();

        let json: Value = serde_json::from_str(&mutated.body).unwrap();
        assert_eq!(json["user"]["name"], "john'");
        assert_eq!(json["user"]["age"], 25);
        assert_eq!(mutated.url, req.url);
    }

    #[test]
    fn test_json_array_paths() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let url = Url::parse("https://example.com/api").unwrap();
        let body = r#"{"users":[{"name":"alice"},{"name":"bob"}]}"#.to_string();
        let req = HttpRequest::new(Method::POST, url, headers, body);

        let params = extract_parameters(&req);
        assert_eq!(params[1].name, "users[1].name");

        let mutated = mutate_request(&req, &params, 1, "bob'").unwrap();
        let json: Value = serde_json::from_str(&mutated.body).unwrap();
        assert_eq!(json["users"][1]["name"], "bob'");
        assert_eq!(json["users"][0]["name"], "alice");
    }

    #[test]
    fn test_xml_leaves_and_mutation() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
        let url = Url::parse("https://example.com/soap").unwrap();
        let body = "<req><id type=\"n\">7</id><name>bob</name></req>".to_string();
        let req = HttpRequest::new(Method::POST, url, headers, body);

        let params = extract_parameters(&req);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].name, "id");
        assert_eq!(params[0].value, "7");

        let mutated = mutate_request(&req, &params, 1, "b<'").unwrap();
        assert_eq!(mutated.body, "<req><id type=\"n\">7</id><name>b&lt;'</name></req>");
    }

    #[test]
    fn test_xml_entities_round_trip() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/xml"));
        let url = Url::parse("https://example.com/soap").unwrap();
        let body = "<r><q>fish &amp; chips</q><t>a &lt;b&gt; &amp;lt;</t></r>".to_string();
        let req = HttpRequest::new(Method::POST, url, headers, body.clone());

        let params = extract_parameters(&req);
        assert_eq!(params[0].value, "fish & chips");
        assert_eq!(params[1].value, "a <b> &lt;");

        for (i, param) in params.iter().enumerate() {
            let same = mutate_request(&req, &params, i, &param.value).unwrap();
            assert_eq!(same.body, body);
        }
        let control = mutate_request(&req, &params, 0, &format!("{}''", params[0].value)).unwrap();
        assert_eq!(control.body, "<r><q>fish &amp; chips''</q><t>a &lt;b&gt; &amp;lt;</t></r>");
    }

    #[test]
    fn test_sniffed_json_without_content_type() {
        let url = Url::parse("https://example.com/api").unwrap();
        let req = HttpRequest::new(Method::PUT, url, HeaderMap::new(), r#"{"a":"1"}"#.into());
        assert_eq!(effective_body_type(&req), BodyType::Json);
        assert_eq!(extract_parameters(&req).len(), 1);
    }

    #[test]
    fn test_content_length_updated() {
        let req = create_test_request_json();
        let params = extract_parameters(&req);
        let index = params.iter().position(|p| p.name == "user.name").unwrap();
        let mutated = mutate_request(&req, &params, index, "a_much_longer_value").unwrap();

        let new_len: usize = mutated
            .headers
            .get(CONTENT_LENGTH)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(mutated.body.len(), new_len);
    }

    #[test]
    fn test_out_of_range_index() {
        let req = create_test_request_form();
        let params = extract_parameters(&req);
        assert!(mutate_request(&req, &params, 99, "x").is_none());
    }
}
