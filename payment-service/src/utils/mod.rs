//! Input normalization for the payment initiation path.
//!
//! Everything here runs before any network call; failures reject the
//! request without touching the gateway.

use anyhow::{anyhow, Result};

/// Kenyan country code the gateway requires subscriber numbers to carry.
const COUNTRY_CODE: &str = "254";

/// Digits in a canonical international MSISDN (254 + 9 subscriber digits).
const MSISDN_LEN: usize = 12;

/// Normalize a subscriber number to the canonical digits-only international
/// form.
///
/// Accepts local (`07xxxxxxxx`), `+254...`, bare `254...`, and national
/// forms with whitespace or separators. Rejects anything that does not come
/// out at exactly 12 digits.
pub fn normalize_msisdn(raw: &str) -> Result<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    if digits.is_empty() {
        return Err(anyhow!("phone number contains no digits"));
    }

    let normalized = if let Some(rest) = digits.strip_prefix('0') {
        format!("{}{}", COUNTRY_CODE, rest)
    } else if digits.starts_with(COUNTRY_CODE) {
        digits
    } else {
        format!("{}{}", COUNTRY_CODE, digits)
    };

    if normalized.len() != MSISDN_LEN {
        return Err(anyhow!(
            "phone number normalizes to {} digits, expected {}",
            normalized.len(),
            MSISDN_LEN
        ));
    }

    Ok(normalized)
}

/// Round a requested amount up to whole currency units.
///
/// The gateway accepts no fractional units; partial units always round
/// toward the merchant.
pub fn ceil_amount(amount: f64) -> Result<u64> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(anyhow!("amount must be a positive number"));
    }

    Ok(amount.ceil() as u64)
}
