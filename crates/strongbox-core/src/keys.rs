//! Well-known keys under which the unsealing workflow keeps its material.

/// Key holding the initial root token.
pub const ROOT_TOKEN: &str = "vault-root";

/// Common prefix of all unseal key shares.
pub const UNSEAL_PREFIX: &str = "vault-unseal-";

/// Key holding the `index`-th unseal key share.
pub fn unseal_key(index: usize) -> String {
    format!("{UNSEAL_PREFIX}{index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseal_keys_share_the_prefix() {
        assert_eq!(unseal_key(0), "vault-unseal-0");
        assert!(unseal_key(4).starts_with(UNSEAL_PREFIX));
    }
}
