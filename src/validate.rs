//! Input checks shared by signup, catalog and review writes.

use crate::limits::*;

pub fn non_empty(field: &'static str, value: &str, max: usize) -> Result<(), String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(format!("{field} cannot be empty"));
    }
    if value.len() > max {
        return Err(format!("{field} is too long (max {max} bytes)"));
    }
    Ok(())
}

pub fn email(value: &str) -> Result<(), String> {
    if value.len() > MAX_EMAIL_LEN {
        return Err("email is too long".into());
    }
    let Some((local, domain)) = value.split_once('@') else {
        return Err("email must be valid".into());
    };
    let valid = !local.is_empty()
        && !domain.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !value.chars().any(char::is_whitespace);
    if valid {
        Ok(())
    } else {
        Err("email must be valid".into())
    }
}

/// At least 8 characters with a lowercase, an uppercase, a digit and a symbol.
pub fn strong_password(value: &str) -> Result<(), String> {
    let long_enough = value.chars().count() >= MIN_PASSWORD_LEN && value.len() <= MAX_PASSWORD_LEN;
    let lower = value.chars().any(|c| c.is_lowercase());
    let upper = value.chars().any(|c| c.is_uppercase());
    let digit = value.chars().any(|c| c.is_ascii_digit());
    let symbol = value.chars().any(|c| !c.is_alphanumeric() && !c.is_whitespace());
    if long_enough && lower && upper && digit && symbol {
        Ok(())
    } else {
        Err(
            "password must be at least 8 characters and have an uppercase, a lowercase, a number and a symbol"
                .into(),
        )
    }
}

/// Digits with an optional leading `+`, 8 to 15 digits long.
pub fn phone_number(value: &str) -> Result<(), String> {
    let digits = value.strip_prefix('+').unwrap_or(value);
    if (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err("phone number must be in valid format".into())
    }
}

pub fn rating(value: i64) -> Result<u8, String> {
    if (1..=5).contains(&value) {
        Ok(value as u8)
    } else {
        Err("rating must be between 1 and 5".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emails() {
        assert!(email("budi@example.com").is_ok());
        assert!(email("a.b+c@mail.co.id").is_ok());
        assert!(email("nope").is_err());
        assert!(email("@example.com").is_err());
        assert!(email("budi@").is_err());
        assert!(email("budi@localhost").is_err());
        assert!(email("bu di@example.com").is_err());
        assert!(email("a@b@c.com").is_err());
    }

    #[test]
    fn passwords() {
        assert!(strong_password("Secr3t!pass").is_ok());
        assert!(strong_password("short1!A").is_ok());
        assert!(strong_password("Sh0rt!").is_err());
        assert!(strong_password("alllowercase1!").is_err());
        assert!(strong_password("ALLUPPERCASE1!").is_err());
        assert!(strong_password("NoDigitsHere!").is_err());
        assert!(strong_password("NoSymbols123").is_err());
    }

    #[test]
    fn phones() {
        assert!(phone_number("081234567890").is_ok());
        assert!(phone_number("+6281234567890").is_ok());
        assert!(phone_number("12345").is_err());
        assert!(phone_number("0812-3456-7890").is_err());
    }

    #[test]
    fn text_fields() {
        assert!(non_empty("name", "Villa Sunset", MAX_NAME_LEN).is_ok());
        assert!(non_empty("name", "   ", MAX_NAME_LEN).is_err());
        assert!(non_empty("name", &"x".repeat(MAX_NAME_LEN + 1), MAX_NAME_LEN).is_err());
    }

    #[test]
    fn ratings() {
        assert_eq!(rating(5), Ok(5));
        assert!(rating(0).is_err());
        assert!(rating(6).is_err());
    }
}
