//! Resource key hashing.

/// sdbm hash of `data`, continuing from `seed`.
#[must_use]
pub fn sdbm(seed: u64, data: &[u8]) -> u64 {
    data.iter().fold(seed, |hash, &c| {
        u64::from(c)
            .wrapping_add(hash << 6)
            .wrapping_add(hash << 16)
            .wrapping_sub(hash)
    })
}

/// Key identifying a resource loaded from `path` under `name`.
///
/// Loading the same `(path, name)` pair always yields the same key. A zero
/// byte separates the two so `("ab", "c")` and `("a", "bc")` differ.
#[must_use]
pub fn resource_key(path: &str, name: &str) -> u64 {
    sdbm(sdbm(sdbm(0, path.as_bytes()), &[0]), name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sdbm_known_values() {
        assert_eq!(sdbm(0, b""), 0);
        assert_eq!(sdbm(0, b"a"), 97);
        // 98 + (97 << 6) + (97 << 16) - 97
        assert_eq!(sdbm(0, b"ab"), 98 + 6208 + 6_356_992 - 97);
    }

    #[test]
    fn key_hashes_path_separator_and_name() {
        assert_eq!(resource_key("a.ktx2", "tex1"), sdbm(0, b"a.ktx2\0tex1"));
    }

    #[test]
    fn shifted_split_gives_distinct_keys() {
        assert_ne!(resource_key("ab", "c"), resource_key("a", "bc"));
        assert_ne!(resource_key("", "abc"), resource_key("abc", ""));
    }

    #[test]
    fn distinct_names_give_distinct_keys() {
        assert_ne!(resource_key("a.ktx2", "tex1"), resource_key("a.ktx2", "tex2"));
        assert_ne!(resource_key("a.ktx2", "tex1"), resource_key("b.ktx2", "tex1"));
    }
}
