//! Input validation shared by every workflow operation.
//!
//! All functions here are pure. Monetary values are handled as integer cents.
use crate::error::{FieldError, TaxIdError, WorkflowError};

/// Validate a CPF style tax id. Returns the bare 11 digits on success.
pub fn validate_tax_id(raw: &str) -> Result<String, TaxIdError> {
    let digits: Vec<u32> = raw.chars().filter_map(|c| c.to_digit(10)).collect();

    if digits.len() != 11 {
        return Err(TaxIdError::WrongLength(digits.len()));
    }
    if digits.iter().all(|d| *d == digits[0]) {
        return Err(TaxIdError::RepeatedDigits);
    }

    let first = check_digit(&digits[..9]);
    let second = check_digit(&digits[..10]);

    if digits[9] != first || digits[10] != second {
        return Err(TaxIdError::ChecksumMismatch);
    }

    Ok(digits.iter().map(|d| char::from_digit(*d, 10).unwrap_or('0')).collect())
}

// weights run from len+1 down to 2
fn check_digit(digits: &[u32]) -> u32 {
    let weight_start = digits.len() as u32 + 1;
    let sum: u32 = digits
        .iter()
        .enumerate()
        .map(|(i, d)| d * (weight_start - i as u32))
        .sum();

    let rest = (sum * 10) % 11;
    if rest >= 10 { 0 } else { rest }
}

/// Parse a money string such as `1.234,56`, `50,00` or `50.00` into cents.
///
/// A comma marks the decimal part and dots are thousands separators. Without a comma, a
/// single dot followed by one or two digits is read as the decimal point. Anything that
/// does not parse, including blank input and negative amounts, is rejected.
pub fn parse_money(field: &str, raw: &str) -> Result<u64, WorkflowError> {
    let trimmed = raw.trim().trim_start_matches("R$").trim();
    if trimmed.is_empty() {
        return Err(WorkflowError::field(field, "amount is required"));
    }

    let normalised = if trimmed.contains(',') {
        trimmed.replace('.', "").replacen(',', ".", 1)
    } else {
        match trimmed.rsplit_once('.') {
            Some((int, frac))
                if !int.contains('.') && (1..=2).contains(&frac.len()) =>
            {
                trimmed.to_string()
            }
            _ => trimmed.replace('.', ""),
        }
    };

    let (int, frac) = normalised.split_once('.').unwrap_or((&normalised, ""));
    let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());

    if int.is_empty() || !all_digits(int) || !all_digits(frac) || frac.len() > 2 {
        return Err(WorkflowError::field(
            field,
            format!("'{raw}' is not a valid amount"),
        ));
    }

    let units: u64 = int
        .parse()
        .map_err(|_| WorkflowError::field(field, "amount is too large"))?;
    let cents: u64 = match frac.len() {
        0 => 0,
        1 => frac.parse::<u64>().unwrap_or(0) * 10,
        _ => frac.parse::<u64>().unwrap_or(0),
    };

    units
        .checked_mul(100)
        .and_then(|v| v.checked_add(cents))
        .ok_or_else(|| WorkflowError::field(field, "amount is too large"))
}

/// Every listed field must be present and non blank.
pub fn validate_required(fields: &[(&str, Option<&str>)]) -> Vec<FieldError> {
    fields
        .iter()
        .filter(|(_, value)| value.is_none_or(|v| v.trim().is_empty()))
        .map(|(name, _)| FieldError::new(*name, "is required"))
        .collect()
}

/// Turns a list of field errors into a result.
pub fn ensure_valid(errors: Vec<FieldError>) -> Result<(), WorkflowError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(WorkflowError::Validation(errors))
    }
}
