//! Random selection over healthy pool entries

use std::collections::HashMap;

use rand::seq::SliceRandom;

use crate::models::{AnonymityLevel, ProxyConfig, ProxyKind, DIRECT_PROXY_NAME, TOR_PROXY_NAME};

/// Healthy entries, optionally restricted to one kind and excluding one name
pub(crate) fn healthy_candidates<'a>(
    proxies: &'a HashMap<String, ProxyConfig>,
    kind: Option<ProxyKind>,
    exclude: Option<&str>,
) -> Vec<&'a ProxyConfig> {
    let mut candidates: Vec<&ProxyConfig> = proxies
        .values()
        .filter(|p| p.is_healthy)
        .filter(|p| kind.map_or(true, |k| p.kind == k))
        .filter(|p| exclude.map_or(true, |name| p.name != name))
        .collect();

    // HashMap order is arbitrary; sort so only the rng decides.
    candidates.sort_by(|a, b| a.name.cmp(&b.name));
    candidates
}

/// Uniform pick among candidates
pub(crate) fn choose_random(candidates: &[&ProxyConfig]) -> Option<String> {
    let mut rng = rand::thread_rng();
    candidates.choose(&mut rng).map(|p| p.name.clone())
}

/// Uniform pick preferring high-anonymity entries when any exist
pub(crate) fn choose_preferring_high(candidates: &[&ProxyConfig]) -> Option<String> {
    let high: Vec<&ProxyConfig> = candidates
        .iter()
        .copied()
        .filter(|p| p.anonymity_level == AnonymityLevel::High)
        .collect();

    if high.is_empty() {
        choose_random(candidates)
    } else {
        choose_random(&high)
    }
}

/// Active entry after (re)seeding: the anonymity network if healthy, else
/// any healthy non-direct entry, else direct
pub(crate) fn seed_active(proxies: &HashMap<String, ProxyConfig>) -> String {
    if proxies.get(TOR_PROXY_NAME).is_some_and(|p| p.is_healthy) {
        return TOR_PROXY_NAME.to_string();
    }

    let others = healthy_candidates(proxies, None, Some(DIRECT_PROXY_NAME));
    choose_random(&others).unwrap_or_else(|| DIRECT_PROXY_NAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(entries: Vec<ProxyConfig>) -> HashMap<String, ProxyConfig> {
        entries.into_iter().map(|p| (p.name.clone(), p)).collect()
    }

    fn entry(name: &str, kind: ProxyKind, healthy: bool) -> ProxyConfig {
        let mut p = ProxyConfig::new(
            name,
            format!("http://{}.internal:3128", name),
            kind,
            kind.default_anonymity_level(),
        );
        p.is_healthy = healthy;
        p
    }

    #[test]
    fn test_candidates_filter_health_kind_and_exclusion() {
        let proxies = pool(vec![
            ProxyConfig::direct(),
            entry("vpn-a", ProxyKind::Vpn, true),
            entry("vpn-b", ProxyKind::Vpn, false),
            entry("http-a", ProxyKind::Http, true),
        ]);

        let names = |c: Vec<&ProxyConfig>| c.iter().map(|p| p.name.clone()).collect::<Vec<_>>();

        assert_eq!(
            names(healthy_candidates(&proxies, None, None)),
            vec!["direct", "http-a", "vpn-a"]
        );
        assert_eq!(
            names(healthy_candidates(&proxies, Some(ProxyKind::Vpn), None)),
            vec!["vpn-a"]
        );
        assert_eq!(
            names(healthy_candidates(&proxies, None, Some("direct"))),
            vec!["http-a", "vpn-a"]
        );
    }

    #[test]
    fn test_choose_from_empty_is_none() {
        assert!(choose_random(&[]).is_none());
        assert!(choose_preferring_high(&[]).is_none());
    }

    #[test]
    fn test_high_anonymity_preferred() {
        let proxies = pool(vec![
            ProxyConfig::direct(),
            entry("vpn-a", ProxyKind::Vpn, true),
            ProxyConfig::tor("127.0.0.1:9050"),
        ]);
        let candidates = healthy_candidates(&proxies, None, None);

        for _ in 0..20 {
            assert_eq!(choose_preferring_high(&candidates).as_deref(), Some("tor"));
        }
    }

    #[test]
    fn test_seed_active_order() {
        let mut proxies = pool(vec![
            ProxyConfig::direct(),
            entry("vpn-a", ProxyKind::Vpn, true),
            ProxyConfig::tor("127.0.0.1:9050"),
        ]);
        assert_eq!(seed_active(&proxies), "tor");

        proxies.get_mut("tor").unwrap().is_healthy = false;
        assert_eq!(seed_active(&proxies), "vpn-a");

        proxies.get_mut("vpn-a").unwrap().is_healthy = false;
        assert_eq!(seed_active(&proxies), "direct");
    }
}
