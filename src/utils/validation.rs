use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

static MATRIX_ROOM_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^![a-zA-Z0-9]+:[a-z0-9.-]+\.[a-z]{2,}(:[0-9]{1,5})?$").expect("valid room id regex")
});

static MATRIX_USER_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^@[a-z0-9._=/+-]+:[a-z0-9.-]+\.[a-z]{2,}(:[0-9]{1,5})?$")
        .expect("valid user id regex")
});

pub fn is_valid_matrix_room_id(room_id: &str) -> bool {
    MATRIX_ROOM_ID.is_match(room_id)
}

pub fn is_valid_matrix_user_id(user_id: &str) -> bool {
    MATRIX_USER_ID.is_match(user_id)
}

pub fn is_valid_http_url(value: &str) -> bool {
    Url::parse(value)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
        .unwrap_or(false)
}

pub fn is_https_url(value: &str) -> bool {
    Url::parse(value)
        .map(|url| url.scheme() == "https" && url.host_str().is_some())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("!abc123:example.org", true)]
    #[test_case("!abc123:matrix.example.org:8448", true)]
    #[test_case("abc123:example.org", false)]
    #[test_case("!abc 123:example.org", false)]
    #[test_case("!abc123", false)]
    fn room_ids(input: &str, expected: bool) {
        assert_eq!(is_valid_matrix_room_id(input), expected);
    }

    #[test_case("@alice:example.org", true)]
    #[test_case("@viber_123:bridge.example.org", true)]
    #[test_case("alice:example.org", false)]
    #[test_case("@Alice:example.org", false)]
    fn user_ids(input: &str, expected: bool) {
        assert_eq!(is_valid_matrix_user_id(input), expected);
    }

    #[test]
    fn url_checks() {
        assert!(is_https_url("https://bridge.example.org/webhook"));
        assert!(!is_https_url("http://bridge.example.org/webhook"));
        assert!(is_valid_http_url("http://localhost:8008"));
        assert!(!is_valid_http_url("ftp://example.org"));
        assert!(!is_valid_http_url("not a url"));
    }
}
