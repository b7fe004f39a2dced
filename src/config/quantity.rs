use crate::error::ConfigError;

/// Converts a memory/storage quantity string (e.g. "2G", "512M", "1Gi")
/// to whole MB. Bare numbers are treated as bytes. Empty input maps to 0
/// so callers can distinguish "unset".
pub fn parse_quantity_mb(quantity: &str) -> Result<u64, ConfigError> {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return Ok(0);
    }

    let split = quantity
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(quantity.len());
    let (number, unit) = quantity.split_at(split);

    let value: f64 = number.parse().map_err(|_| ConfigError::InvalidQuantity {
        value: quantity.to_string(),
        reason: "not a number".to_string(),
    })?;

    let mb = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => value / (1024.0 * 1024.0),
        "K" | "KB" | "KI" | "KIB" => value / 1024.0,
        "M" | "MB" | "MI" | "MIB" => value,
        "G" | "GB" | "GI" | "GIB" => value * 1024.0,
        "T" | "TB" | "TI" | "TIB" => value * 1024.0 * 1024.0,
        other => {
            return Err(ConfigError::InvalidQuantity {
                value: quantity.to_string(),
                reason: format!("unknown unit {other:?}"),
            })
        }
    };

    Ok(mb as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_units() {
        assert_eq!(parse_quantity_mb("2G").unwrap(), 2048);
        assert_eq!(parse_quantity_mb("10G").unwrap(), 10240);
        assert_eq!(parse_quantity_mb("512M").unwrap(), 512);
        assert_eq!(parse_quantity_mb("1.5G").unwrap(), 1536);
        assert_eq!(parse_quantity_mb("2048Ki").unwrap(), 2);
        assert_eq!(parse_quantity_mb("1T").unwrap(), 1024 * 1024);
    }

    #[test]
    fn test_bare_number_is_bytes() {
        assert_eq!(parse_quantity_mb("2097152").unwrap(), 2);
    }

    #[test]
    fn test_empty_is_zero() {
        assert_eq!(parse_quantity_mb("").unwrap(), 0);
        assert_eq!(parse_quantity_mb("  ").unwrap(), 0);
    }

    #[test]
    fn test_case_and_whitespace() {
        assert_eq!(parse_quantity_mb(" 2g ").unwrap(), 2048);
        assert_eq!(parse_quantity_mb("512mb").unwrap(), 512);
    }

    #[test]
    fn test_invalid_values() {
        assert!(parse_quantity_mb("lots").is_err());
        assert!(parse_quantity_mb("2X").is_err());
    }
}
