use axum::http::{header, HeaderMap, HeaderValue};

/// Extract the session token, preferring the `Authorization: Bearer` header and
/// falling back to the session cookie set at login.
pub fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<String> {
    extract_bearer_token(headers).or_else(|| read_cookie(headers, cookie_name))
}

/// Extract JWT token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    let auth_header = headers.get(header::AUTHORIZATION)?;
    let auth_str = auth_header.to_str().ok()?;

    auth_str
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// `Set-Cookie` value for an HttpOnly cookie scoped to the whole site.
pub fn build_cookie(name: &str, value: &str, max_age_seconds: Option<u64>, secure: bool) -> HeaderValue {
    let mut cookie = format!("{}={}; Path=/; HttpOnly; SameSite=Lax", name, value);
    if let Some(max_age) = max_age_seconds {
        cookie.push_str(&format!("; Max-Age={}", max_age));
    }
    if secure {
        cookie.push_str("; Secure");
    }
    // Values are base64/JWT/ascii only
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static(""))
}

pub fn clear_cookie(name: &str) -> HeaderValue {
    build_cookie(name, "", Some(0), false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_header_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        headers.insert(header::COOKIE, HeaderValue::from_static("vhc_session=zzz"));
        assert_eq!(extract_token(&headers, "vhc_session").as_deref(), Some("abc.def"));
    }

    #[test]
    fn cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; vhc_session=tok123; lang=hi"),
        );
        assert_eq!(extract_token(&headers, "vhc_session").as_deref(), Some("tok123"));
        assert_eq!(read_cookie(&headers, "lang").as_deref(), Some("hi"));
        assert_eq!(read_cookie(&headers, "missing"), None);
    }

    #[test]
    fn non_bearer_schemes_are_ignored() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwdw=="));
        assert_eq!(extract_bearer_token(&headers), None);
    }

    #[test]
    fn cookie_attributes() {
        let cookie = build_cookie("vhc_session", "tok", Some(3600), true);
        let text = cookie.to_str().unwrap();
        assert!(text.starts_with("vhc_session=tok; Path=/; HttpOnly"));
        assert!(text.contains("Max-Age=3600"));
        assert!(text.ends_with("; Secure"));
        assert!(clear_cookie("vhc_session").to_str().unwrap().contains("Max-Age=0"));
    }
}
