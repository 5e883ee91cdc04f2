//! Proxy header injection for the public ingress.

/// Inject standard proxy headers before the request is forwarded to
/// the tunnel client as an `HTTPRequestMessage`.
pub fn inject_proxy_headers(headers: &mut Vec<(String, String)>, client_ip: &str, host: &str) {
    upsert(headers, "X-Forwarded-For", client_ip);
    upsert(headers, "X-Forwarded-Proto", "https");
    upsert(headers, "X-Forwarded-Host", host);
}

/// Insert or update a header
fn upsert(headers: &mut Vec<(String, String)>, key: &str, value: &str) {
    if let Some(h) = headers.iter_mut().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
        h.1 = value.to_string();
    } else {
        headers.push((key.to_string(), value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_forwarded_headers() {
        let mut h = vec![("Host".into(), "example.com".into())];
        inject_proxy_headers(&mut h, "1.2.3.4", "myapp.example.com");
        assert!(h.iter().any(|(k, v)| k == "X-Forwarded-For" && v == "1.2.3.4"));
        assert!(h.iter().any(|(k, v)| k == "X-Forwarded-Proto" && v == "https"));
        assert!(h.iter().any(|(k, v)| k == "X-Forwarded-Host" && v == "myapp.example.com"));
    }

    #[test]
    fn upsert_overwrites_existing_header() {
        let mut h = vec![("X-Forwarded-For".into(), "9.9.9.9".into())];
        inject_proxy_headers(&mut h, "1.2.3.4", "example.com");
        let matches: Vec<_> = h.iter().filter(|(k, _)| k == "X-Forwarded-For").collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].1, "1.2.3.4");
    }
}
