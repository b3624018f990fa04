//! Client IP extraction shared by rate limiting and request logging.
//!
//! `X-Real-IP` wins when present (the value a single trusted reverse proxy
//! writes), then the first entry of `X-Forwarded-For`, then the fallback
//! key. These headers are client-controlled unless a reverse proxy in front
//! of the service overwrites them, so per-IP limiting must only be relied
//! on behind such a proxy.

use std::borrow::Cow;

use axum::http::Request;

/// Fallback key when no client IP can be determined.
///
/// All requests without identifiable IPs share this key: they are
/// collectively rate limited, which beats not limiting them at all.
pub const UNKNOWN_IP: &str = "unknown";

/// Extract the client IP from request headers.
///
/// Returns a borrowed `Cow` for the fallback so the common in-cluster case
/// allocates nothing.
pub fn client_ip<B>(req: &Request<B>) -> Cow<'static, str> {
    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && !value.trim().is_empty()
    {
        return Cow::Owned(value.trim().to_string());
    }

    // X-Forwarded-For is "client, proxy1, proxy2"; the first entry is the
    // original client.
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first) = value.split(',').next()
        && !first.trim().is_empty()
    {
        return Cow::Owned(first.trim().to_string());
    }

    Cow::Borrowed(UNKNOWN_IP)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_real_ip_wins() {
        let req = Request::builder()
            .header("x-real-ip", "203.0.113.7")
            .header("x-forwarded-for", "10.0.0.1, 10.0.0.2")
            .body(Body::empty())
            .unwrap();

        assert_eq!(client_ip(&req), "203.0.113.7");
    }

    #[test]
    fn test_forwarded_for_first_entry() {
        let req = Request::builder()
            .header("x-forwarded-for", " 192.168.1.1 , 10.0.0.1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(client_ip(&req), "192.168.1.1");
    }

    #[test]
    fn test_ipv6_passthrough() {
        let req = Request::builder()
            .header("x-real-ip", "2001:db8::1")
            .body(Body::empty())
            .unwrap();

        assert_eq!(client_ip(&req), "2001:db8::1");
    }

    #[test]
    fn test_unknown_fallback_is_borrowed() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let ip = client_ip(&req);
        assert_eq!(ip, UNKNOWN_IP);
        assert!(matches!(ip, Cow::Borrowed(_)));
    }

    #[test]
    fn test_empty_headers_fall_through() {
        let req = Request::builder()
            .header("x-real-ip", "  ")
            .header("x-forwarded-for", "198.51.100.4")
            .body(Body::empty())
            .unwrap();

        assert_eq!(client_ip(&req), "198.51.100.4");
    }
}
