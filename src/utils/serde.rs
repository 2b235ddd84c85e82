/*!
 * Serde utilities for configuration values that arrive in mixed shapes.
 *
 * Values layered from files and environment variables may be numbers,
 * numeric strings, or sentinels such as `"none"`. These helpers normalize
 * them consistently.
 */

use serde::{Deserialize, Deserializer};

/// Deserialize an optional length limit that may be a number, a numeric
/// string, or a sentinel disabling the limit.
///
/// ```toml
/// stream_max_len = 100       # Some(100)
/// stream_max_len = "100"     # Some(100)
/// stream_max_len = "none"    # None
/// stream_max_len = 0         # None, a zero limit disables trimming
/// ```
///
/// ```rust
/// use serde::Deserialize;
/// use firehose_turbo::utils::serde::deserialize_optional_len;
///
/// #[derive(Deserialize)]
/// struct Retention {
///     #[serde(default, deserialize_with = "deserialize_optional_len")]
///     max_len: Option<usize>,
/// }
/// ```
pub fn deserialize_optional_len<'de, D>(deserializer: D) -> std::result::Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    let value: Option<serde_json::Value> = Option::deserialize(deserializer)?;
    match value {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::Number(n)) => match n.as_u64() {
            Some(0) => Ok(None),
            Some(len) => Ok(Some(len as usize)),
            None => Err(D::Error::custom(format!(
                "Length must be a non-negative integer, found: {n}"
            ))),
        },
        Some(serde_json::Value::String(s)) => {
            let trimmed = s.trim();
            if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none") {
                return Ok(None);
            }
            trimmed
                .parse::<usize>()
                .map(|len| if len == 0 { None } else { Some(len) })
                .map_err(|_| D::Error::custom(format!("Cannot parse '{s}' as a length")))
        }
        Some(other) => Err(D::Error::custom(format!(
            "Expected length value, found: {other:?}"
        ))),
    }
}
