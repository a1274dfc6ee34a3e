//! Phone number normalization for pair-mode requests.

use crate::error::PairgateError;
use phonenumber::Mode;

const VALIDATION_HINT: &str = "Invalid phone number. Please enter your full international number \
     (e.g., 15551234567 for US, 447911123456 for UK, 84987654321 for Vietnam, etc.) \
     without + or spaces.";

/// Normalize user input to canonical international digits without a leading `+`.
///
/// Non-digit characters are stripped first, so `+1 (555) 123-4567` and
/// `15551234567` normalize to the same key.
pub fn normalize_phone(raw: &str) -> Result<String, PairgateError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    // E.164 allows at most 15 digits including the country code.
    if digits.len() < 7 || digits.len() > 15 || digits.starts_with('0') {
        return Err(PairgateError::Validation(VALIDATION_HINT.to_string()));
    }

    let parsed = phonenumber::parse(None, format!("+{digits}"))
        .map_err(|_| PairgateError::Validation(VALIDATION_HINT.to_string()))?;

    let e164 = parsed.format().mode(Mode::E164).to_string();
    Ok(e164.trim_start_matches('+').to_string())
}
