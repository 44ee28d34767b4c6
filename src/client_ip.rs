/// Picks the actor address from a connection and its forwarded chain.
///
/// With `proxy_depth` trusted proxies in front of the service, the client is
/// the entry `proxy_depth` positions from the right end of the chain. Depths
/// past the start of the chain clamp to the leftmost entry. Without a chain,
/// or with `proxy_depth == 0`, the connected peer address is used.
pub fn resolve(remote_addr: &str, forwarded_for: Option<&str>, proxy_depth: usize) -> String {
    let chain: Vec<&str> = match forwarded_for {
        Some(raw) if proxy_depth > 0 => raw
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .collect(),
        _ => Vec::new(),
    };

    if chain.is_empty() {
        return remote_addr.to_owned();
    }
    let index = chain.len().saturating_sub(1 + proxy_depth);
    chain[index].to_owned()
}

#[cfg(test)]
mod tests {
    use super::resolve;

    const CHAIN: &str = "4.5.6.7, 3.4.5.6, 2.3.4.5, 1.2.3.4";

    #[test]
    fn no_chain_uses_remote_addr() {
        assert_eq!(resolve("1.2.3.4", None, 0), "1.2.3.4");
        assert_eq!(resolve("1.2.3.4", None, 1), "1.2.3.4");
    }

    #[test]
    fn zero_depth_ignores_chain() {
        assert_eq!(resolve("9.9.9.9", Some(CHAIN), 0), "9.9.9.9");
    }

    #[test]
    fn depth_counts_from_the_right() {
        assert_eq!(resolve("1.2.3.4", Some(CHAIN), 1), "2.3.4.5");
        assert_eq!(resolve("1.2.3.4", Some(CHAIN), 3), "4.5.6.7");
    }

    #[test]
    fn depth_past_chain_clamps_to_leftmost() {
        assert_eq!(resolve("1.2.3.4", Some(CHAIN), 10), "4.5.6.7");
    }

    #[test]
    fn tolerates_irregular_spacing() {
        assert_eq!(resolve("1.2.3.4", Some("a ,b,  c"), 1), "b");
        assert_eq!(resolve("1.2.3.4", Some(" , "), 1), "1.2.3.4");
    }
}
