//! Header scrubbing for mediated requests and responses

use std::collections::HashMap;

use rand::seq::SliceRandom;

/// Request headers that reveal the caller's address
pub const IDENTIFYING_REQUEST_HEADERS: &[&str] = &[
    "x-forwarded-for",
    "forwarded-for",
    "forwarded",
    "x-forwarded",
    "x-real-ip",
    "x-client-ip",
    "client-ip",
    "true-client-ip",
    "x-originating-ip",
    "x-remote-ip",
    "x-remote-addr",
    "remote-addr",
    "x-cluster-client-ip",
    "cluster-client-ip",
];

/// Response headers that reveal server software or versions
pub const IDENTIFYING_RESPONSE_HEADERS: &[&str] = &[
    "server",
    "x-powered-by",
    "x-aspnet-version",
    "x-aspnetmvc-version",
    "x-generator",
    "x-runtime",
    "x-version",
    "x-backend-server",
];

/// Browser user agents injected when the caller sends none
pub const USER_AGENTS: &[&str] = &[
    // Chrome on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    // Chrome on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Firefox
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0",
    // Safari on Mac
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
    // Edge on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
];

/// Pick a browser user agent at random
pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

fn is_listed(name: &str, deny: &[&str]) -> bool {
    deny.iter().any(|d| d.eq_ignore_ascii_case(name))
}

/// Drop identifying request headers and make sure a user agent is present.
/// Everything else passes through untouched.
pub fn sanitize_request_headers(headers: HashMap<String, String>) -> HashMap<String, String> {
    let mut headers: HashMap<String, String> = headers
        .into_iter()
        .filter(|(name, _)| !is_listed(name, IDENTIFYING_REQUEST_HEADERS))
        .collect();

    if !headers.keys().any(|k| k.eq_ignore_ascii_case("user-agent")) {
        headers.insert("User-Agent".to_string(), random_user_agent().to_string());
    }

    headers
}

/// Drop server-identifying response headers
pub fn sanitize_response_headers(headers: HashMap<String, String>) -> HashMap<String, String> {
    headers
        .into_iter()
        .filter(|(name, _)| !is_listed(name, IDENTIFYING_RESPONSE_HEADERS))
        .collect()
}
