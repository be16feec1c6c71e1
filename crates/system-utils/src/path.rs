use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = home_dir() {
            return home;
        }
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}

/// Reduces a display name to characters safe inside a file name.
pub fn safe_file_stem(name: &str) -> String {
    name.chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_')
        .collect()
}

/// File-name-safe form of `name` that keeps distinct names distinct: safe characters
/// pass through, every other UTF-8 byte becomes `%XX`.
pub fn encoded_file_stem(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaves_plain_paths_alone() {
        assert_eq!(expand_tilde("/var/lib/wp"), PathBuf::from("/var/lib/wp"));
        assert_eq!(expand_tilde("data/~x"), PathBuf::from("data/~x"));
    }

    #[test]
    fn expands_home_prefix() {
        if let Some(home) = home_dir() {
            assert_eq!(expand_tilde("~/.wireproxy"), home.join(".wireproxy"));
            assert_eq!(expand_tilde("~"), home);
        }
    }

    #[test]
    fn safe_file_stem_drops_separators() {
        assert_eq!(safe_file_stem("../us east#1"), "useast1");
        assert_eq!(safe_file_stem("nl-ams_02"), "nl-ams_02");
    }

    #[test]
    fn encoded_file_stem_keeps_names_apart() {
        assert_eq!(encoded_file_stem("nl-ams_02"), "nl-ams_02");
        assert_eq!(encoded_file_stem("US East"), "US%20East");
        assert_eq!(encoded_file_stem("../a"), "%2E%2E%2Fa");
        assert_ne!(encoded_file_stem("US East"), encoded_file_stem("USEast"));
        assert_ne!(encoded_file_stem("a%20b"), encoded_file_stem("a b"));
    }
}
