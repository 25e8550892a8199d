//! Client address resolution from proxy headers.

use http::HeaderMap;

/// Resolve the originating client address.
///
/// Precedence: the first comma-separated token of `X-Forwarded-For`, then
/// `X-Real-IP`, then the transport-level `fallback` address. Values are
/// trimmed and empty ones skipped; the function always returns a string.
pub fn remote_addr(headers: &HeaderMap, fallback: &str) -> String {
    if let Some(forwarded) = non_empty_header(headers, "x-forwarded-for") {
        let first = forwarded.split(',').next().unwrap_or("").trim();
        if !first.is_empty() {
            return first.to_owned();
        }
    }
    if let Some(real_ip) = non_empty_header(headers, "x-real-ip") {
        return real_ip.to_owned();
    }
    fallback.to_owned()
}

fn non_empty_header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn forwarded_for_wins_and_is_trimmed() {
        let headers = headers(&[("x-forwarded-for", " 1.2.3.4 , 5.6.7.8")]);
        assert_eq!(remote_addr(&headers, "9.9.9.9:1234"), "1.2.3.4");
    }

    #[test]
    fn forwarded_for_beats_real_ip() {
        let headers = headers(&[("x-forwarded-for", "1.2.3.4"), ("x-real-ip", "5.6.7.8")]);
        assert_eq!(remote_addr(&headers, "9.9.9.9:1234"), "1.2.3.4");
    }

    #[test]
    fn real_ip_used_when_forwarded_for_blank() {
        let headers = headers(&[("x-forwarded-for", "   "), ("x-real-ip", " 7.7.7.7 ")]);
        assert_eq!(remote_addr(&headers, "9.9.9.9:1234"), "7.7.7.7");
    }

    #[test]
    fn falls_back_to_transport_address() {
        assert_eq!(remote_addr(&HeaderMap::new(), "9.9.9.9:1234"), "9.9.9.9:1234");
    }

    #[test]
    fn comma_only_forwarded_for_falls_through() {
        let headers = headers(&[("x-forwarded-for", " , 5.6.7.8")]);
        assert_eq!(remote_addr(&headers, "9.9.9.9:1234"), "9.9.9.9:1234");
    }
}
