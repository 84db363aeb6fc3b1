//! Bulgarian IBAN validation: syntactic checks followed by the ISO 7064
//! MOD 97-10 checksum, with a best-effort 1 h KV cache of the verdict.

use crate::kv::KvStore;
use std::sync::Arc;
use std::time::Duration;

pub const IBAN_LENGTH: usize = 22;
const COUNTRY_PREFIX: &str = "BG";

/// Fixed-size chunk for the piece-wise mod-97 fold; keeps every intermediate
/// below `96 * 10^7 + 10^7`, comfortably inside u64.
const MOD97_CHUNK: usize = 7;

const VALID_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Why an IBAN was rejected, in check order; the first failure wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IbanFault {
    Empty,
    WrongCountry,
    WrongLength,
    CheckDigitsNotNumeric,
    InvalidCharacters,
    Checksum,
}

impl IbanFault {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Empty => "null or empty",
            Self::WrongCountry => "must start with BG",
            Self::WrongLength => "must be exactly 22 characters",
            Self::CheckDigitsNotNumeric => "check digits must be numeric",
            Self::InvalidCharacters => "invalid characters",
            Self::Checksum => "Invalid IBAN checksum",
        }
    }
}

/// Trim, uppercase, and strip all whitespace.
pub fn normalize(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Validate a raw IBAN, returning the normalized form on success.
pub fn validate(raw: &str) -> Result<String, IbanFault> {
    let normalized = normalize(raw);
    if normalized.is_empty() {
        return Err(IbanFault::Empty);
    }
    if !normalized.starts_with(COUNTRY_PREFIX) {
        return Err(IbanFault::WrongCountry);
    }
    if normalized.len() != IBAN_LENGTH {
        return Err(IbanFault::WrongLength);
    }
    // Byte-wise checks: multi-byte input cannot panic a char-boundary slice.
    let bytes = normalized.as_bytes();
    if !bytes[2..4].iter().all(|b| b.is_ascii_digit()) {
        return Err(IbanFault::CheckDigitsNotNumeric);
    }
    if !bytes[4..]
        .iter()
        .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
    {
        return Err(IbanFault::InvalidCharacters);
    }
    if mod97(&normalized) != 1 {
        return Err(IbanFault::Checksum);
    }
    Ok(normalized)
}

/// ISO 7064 MOD 97-10 over the rearranged IBAN: move the first four
/// characters to the end, substitute letters by ordinal + 9, then fold the
/// digit string chunk-wise so the running value never leaves u64 range.
fn mod97(normalized: &str) -> u64 {
    let rearranged: String = normalized
        .chars()
        .skip(4)
        .chain(normalized.chars().take(4))
        .collect();

    let mut digits = String::with_capacity(rearranged.len() * 2);
    for c in rearranged.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            let ordinal = (c as u8 - b'A') as u32 + 10;
            digits.push_str(&ordinal.to_string());
        }
    }

    let mut remainder: u64 = 0;
    for chunk in digits.as_bytes().chunks(MOD97_CHUNK) {
        let mut value: u64 = 0;
        for digit in chunk {
            value = value * 10 + u64::from(digit - b'0');
        }
        remainder = (remainder * 10u64.pow(chunk.len() as u32) + value) % 97;
    }
    remainder
}

/// Validator front-end that caches the boolean verdict under
/// `iban:valid:<normalized>`. Cache reads and writes are best-effort; a KV
/// failure never changes the returned result.
pub struct CachedIbanValidator {
    kv: Arc<dyn KvStore>,
}

impl CachedIbanValidator {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn check(&self, raw: &str) -> Result<String, IbanFault> {
        let normalized = normalize(raw);
        if normalized.is_empty() {
            return Err(IbanFault::Empty);
        }

        let cache_key = format!("iban:valid:{normalized}");
        match self.kv.get(&cache_key).await {
            Ok(Some(cached)) if cached == "true" => return Ok(normalized),
            Ok(Some(_)) => {
                // Cached negative: the verdict is known, the reason is
                // recomputed locally since validation is pure.
                return validate(raw);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(%err, "iban verdict cache read failed, validating locally");
            }
        }

        let verdict = validate(raw);
        let cached_value = if verdict.is_ok() { "true" } else { "false" };
        if let Err(err) = self.kv.set_ex(&cache_key, cached_value, VALID_CACHE_TTL).await {
            tracing::debug!(%err, "iban verdict cache write failed");
        }
        verdict
    }
}
