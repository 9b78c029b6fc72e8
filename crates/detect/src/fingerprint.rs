//! Stable incident fingerprints.
//!
//! The fingerprint groups recurrences of "the same kind of failure": the
//! log message is reduced to a template by replacing variable fragments
//! (numbers, uuids, durations, quoted strings, hex ids) with typed
//! placeholders, then hashed together with the level and service.

use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use platform::LogLevel;

/// Fingerprint length in hex characters.
const FINGERPRINT_LEN: usize = 16;

fn rules() -> &'static [(Regex, &'static str)] {
    static RULES: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    RULES
        .get_or_init(|| {
            vec![
                // Order matters: uuids before bare hex before numbers.
                (
                    Regex::new(
                        r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
                    )
                    .expect("uuid regex"),
                    "<uuid>",
                ),
                (
                    Regex::new(r"\b[0-9a-fA-F]{12,64}\b").expect("hex regex"),
                    "<hex>",
                ),
                (
                    Regex::new(r"\b\d+(\.\d+)?\s?(ns|us|µs|ms|s|m|h)\b").expect("duration regex"),
                    "<dur>",
                ),
                (
                    Regex::new(r#""[^"]*"|'[^']*'"#).expect("quoted string regex"),
                    "<str>",
                ),
                (
                    Regex::new(r"\b\d+(\.\d+)?\b").expect("number regex"),
                    "<num>",
                ),
            ]
        })
        .as_slice()
}

/// Reduce a log message to its template form.
#[must_use]
pub fn normalize_template(message: &str) -> String {
    let mut template = message.trim().to_string();
    for (pattern, placeholder) in rules() {
        template = pattern.replace_all(&template, *placeholder).into_owned();
    }
    template
}

/// Deterministic fingerprint over `(template, level, service_id)`.
#[must_use]
pub fn fingerprint(message: &str, level: LogLevel, service_id: &str) -> String {
    let template = normalize_template(message);

    let mut hasher = Sha256::new();
    hasher.update(template.as_bytes());
    hasher.update([0]);
    hasher.update(level.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(service_id.as_bytes());

    let digest = hasher.finalize();
    hex::encode(digest)[..FINGERPRINT_LEN].to_string()
}
