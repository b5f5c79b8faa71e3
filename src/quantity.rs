//! # Quantity Parsing
//!
//! Kubernetes memory quantities (`4Gi`, `10G`, ...) and the JVM heap
//! derivation. OpenSearch wants half the container memory as heap, capped at
//! 31Gi to stay below the compressed-oops threshold.

use crate::error::{Error, Result};

const KI: u64 = 1024;
const MAX_HEAP_BYTES: u64 = 31 * KI * KI * KI;

/// Parses a quantity of the form `(\d+)(Ei|Pi|Ti|Gi|Mi|Ki|E|P|T|G|M|K)?`
/// into bytes. Binary suffixes are powers of 1024, decimal ones powers of
/// 1000, no suffix means bytes.
pub fn parse_memory(quantity: &str) -> Result<u64> {
    let quantity = quantity.trim();
    let split = quantity
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(quantity.len());
    let (digits, suffix) = quantity.split_at(split);

    let value: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidQuantity(quantity.into()))?;

    let multiplier = match suffix {
        "" => 1,
        "Ki" => KI,
        "Mi" => KI.pow(2),
        "Gi" => KI.pow(3),
        "Ti" => KI.pow(4),
        "Pi" => KI.pow(5),
        "Ei" => KI.pow(6),
        "K" => 1000,
        "M" => 1000u64.pow(2),
        "G" => 1000u64.pow(3),
        "T" => 1000u64.pow(4),
        "P" => 1000u64.pow(5),
        "E" => 1000u64.pow(6),
        _ => return Err(Error::InvalidQuantity(quantity.into())),
    };

    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::InvalidQuantity(quantity.into()))
}

/// JVM heap for a given memory limit: `min(limit / 2, 31Gi)`, expressed in
/// whole megabytes as the JVM flag expects (`-Xmx2048m`).
pub fn jvm_heap_megabytes(memory_limit: &str) -> Result<u64> {
    let bytes = parse_memory(memory_limit)?;
    let heap = (bytes / 2).min(MAX_HEAP_BYTES);
    Ok(heap / (KI * KI))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binary_suffixes() {
        assert_eq!(parse_memory("10Ki").unwrap(), 10 * 1024);
        assert_eq!(parse_memory("10Mi").unwrap(), 10 * 1024 * 1024);
        assert_eq!(parse_memory("10Gi").unwrap(), 10 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1Ti").unwrap(), 1024u64.pow(4));
        assert_eq!(parse_memory("1Pi").unwrap(), 1024u64.pow(5));
        assert_eq!(parse_memory("1Ei").unwrap(), 1024u64.pow(6));
    }

    #[test]
    fn test_parse_decimal_suffixes() {
        assert_eq!(parse_memory("10K").unwrap(), 10_000);
        assert_eq!(parse_memory("10M").unwrap(), 10_000_000);
        assert_eq!(parse_memory("10G").unwrap(), 10_000_000_000);
        assert_eq!(parse_memory("1T").unwrap(), 1000u64.pow(4));
    }

    #[test]
    fn test_parse_bare_bytes() {
        assert_eq!(parse_memory("4096").unwrap(), 4096);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_memory("").is_err());
        assert!(parse_memory("Gi").is_err());
        assert!(parse_memory("10Qi").is_err());
        assert!(parse_memory("10 Gi").is_err());
        assert!(parse_memory("-1Gi").is_err());
    }

    #[test]
    fn test_heap_is_half_of_limit() {
        assert_eq!(jvm_heap_megabytes("4Gi").unwrap(), 2048);
        assert_eq!(jvm_heap_megabytes("8Gi").unwrap(), 4096);
        assert_eq!(jvm_heap_megabytes("6G").unwrap(), 2861);
    }

    #[test]
    fn test_heap_caps_at_31_gib() {
        assert_eq!(jvm_heap_megabytes("64Gi").unwrap(), 31744);
        assert_eq!(jvm_heap_megabytes("128Gi").unwrap(), 31744);
        assert_eq!(jvm_heap_megabytes("1Ti").unwrap(), 31744);
        // 62Gi / 2 lands exactly on the cap
        assert_eq!(jvm_heap_megabytes("62Gi").unwrap(), 31744);
    }

    #[test]
    fn test_heap_never_exceeds_cap_for_any_suffix() {
        for quantity in ["1Ei", "1E", "500Ti", "900P"] {
            let heap = jvm_heap_megabytes(quantity).unwrap();
            assert!(heap * 1024 * 1024 <= 31 * 1024u64.pow(3), "{quantity}");
        }
    }
}
